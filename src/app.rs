//! Wires the store, journal, tree and worker pool together from a
//! [`Config`].

use std::sync::Arc;

use crate::{
   Result,
   broadcast::{Broadcaster, BufferedBroadcaster, LogBroadcaster},
   config::Config,
   instance::{InstanceRegistry, Role},
   jobs::{Jobs, Services},
   journal::Journal,
   media::{MediaIndex, PassthroughProcessor},
   store::{JsonStore, Store},
   task::WorkerPool,
   tree::FileTree,
};

/// A fully assembled server. Dropping it without [`App::shutdown`] loses
/// buffered journal actions only if the final flush fails.
pub struct App {
   pub config:      Config,
   pub store:       Arc<dyn Store>,
   pub instances:   Arc<InstanceRegistry>,
   pub journal:     Arc<Journal>,
   pub media:       Arc<MediaIndex>,
   pub tree:        Arc<FileTree>,
   pub workers:     Arc<WorkerPool>,
   pub jobs:        Jobs,
   broadcaster:     Arc<BufferedBroadcaster>,
}

impl std::fmt::Debug for App {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("App")
         .field("tree", &self.tree)
         .field("role", &self.instances.role())
         .finish()
   }
}

impl App {
   /// Opens the data directory and restores journal and media state. The
   /// tree is empty until [`App::load_tree`].
   pub fn open(config: Config) -> Result<Self> {
      let store: Arc<dyn Store> = Arc::new(JsonStore::open(&config.data_dir)?);
      let instances = Arc::new(InstanceRegistry::open(Arc::clone(&store), &config.server_name)?);
      let local = instances.local();
      tracing::info!(id = %local.id, role = %local.role, "opening server");

      let journal = Arc::new(Journal::new(
         &local.id,
         Arc::clone(&store),
         config.journal_flush_threshold,
      ));
      journal.load()?;
      journal.set_ignore_local(matches!(local.role, Role::Backup | Role::Restore));
      journal.spawn_flusher(config.journal_flush_interval())?;

      let media = Arc::new(MediaIndex::new(Arc::clone(&store)));
      media.load()?;

      let broadcaster =
         BufferedBroadcaster::spawn(Arc::new(LogBroadcaster), config.broadcast_flush_interval())?;
      let sink: Arc<dyn Broadcaster> = broadcaster.clone();

      let tree = Arc::new(
         FileTree::new(
            &config.media_root,
            &config.root_alias,
            Arc::clone(&journal),
            Arc::clone(&media),
            Arc::clone(&sink),
         )?
         .with_ignore(config.ignore_filenames.clone()),
      );

      let workers = WorkerPool::new(config.workers(), config.retry_drain_interval(), sink);
      workers.run()?;

      let services = Arc::new(Services::new(
         Arc::clone(&tree),
         Arc::clone(&journal),
         Arc::clone(&media),
         Arc::clone(&store),
         Arc::clone(&instances),
         Arc::new(PassthroughProcessor),
         config.cache_dir.clone(),
         config.upload_chunk_timeout(),
      ));
      let jobs = Jobs::register(Arc::clone(&workers), services);

      Ok(Self { config, store, instances, journal, media, tree, workers, jobs, broadcaster })
   }

   /// Loads the media root from disk. Returns the number of nodes loaded.
   pub fn load_tree(&self) -> Result<usize> {
      self.tree.load_from_disk()
   }

   /// Stops the workers and flushes journal and broadcasts.
   pub fn shutdown(&self) -> Result<()> {
      self.workers.close();
      self.journal.stop_flusher();
      self.broadcaster.close();
      self.journal.flush()
   }
}
