#![allow(dead_code)]

use std::{
   fs,
   path::{Path, PathBuf},
   sync::Arc,
   time::{Duration, Instant},
};

use strata::{
   broadcast::{Broadcaster, RecordingBroadcaster},
   instance::{InstanceRegistry, Role},
   jobs::{Jobs, Services},
   journal::Journal,
   media::{MediaIndex, MediaProcessor, PassthroughProcessor},
   store::{MemoryStore, Store},
   task::{Task, WorkerPool},
   tree::{FileTree, Node},
};
use tempfile::TempDir;

pub const ALIAS: &str = "MEDIA";

/// A tree, journal and worker pool over a scratch media root.
pub struct Harness {
   pub dir:         TempDir,
   pub store:       Arc<MemoryStore>,
   pub journal:     Arc<Journal>,
   pub media:       Arc<MediaIndex>,
   pub broadcaster: Arc<RecordingBroadcaster>,
   pub tree:        Arc<FileTree>,
   pub instances:   Arc<InstanceRegistry>,
   pub workers:     Arc<WorkerPool>,
   pub jobs:        Jobs,
}

impl Harness {
   pub fn new() -> Self {
      Self::build(Role::Core, Arc::new(PassthroughProcessor), 2)
   }

   pub fn with_role(role: Role) -> Self {
      Self::build(role, Arc::new(PassthroughProcessor), 2)
   }

   pub fn with_processor(processor: Arc<dyn MediaProcessor>) -> Self {
      Self::build(Role::Core, processor, 2)
   }

   pub fn build(role: Role, processor: Arc<dyn MediaProcessor>, workers: usize) -> Self {
      let dir = TempDir::new().expect("temp dir");
      let store = Arc::new(MemoryStore::new());
      let dyn_store: Arc<dyn Store> = store.clone();

      let instances =
         Arc::new(InstanceRegistry::open(Arc::clone(&dyn_store), "test").expect("instances"));
      match role {
         Role::Core => {
            instances.init_core("test", Some("secret".to_string())).expect("init core");
         },
         Role::Backup => {
            instances.init_backup("test").expect("init backup");
         },
         Role::Restore | Role::Uninitialized => {},
      }

      let journal = Arc::new(Journal::new(&instances.local_id(), Arc::clone(&dyn_store), 1000));
      journal.set_ignore_local(role == Role::Backup);
      let media = Arc::new(MediaIndex::new(Arc::clone(&dyn_store)));
      let broadcaster = Arc::new(RecordingBroadcaster::new());
      let sink: Arc<dyn Broadcaster> = broadcaster.clone();

      let tree = Arc::new(
         FileTree::new(
            dir.path().join("media"),
            ALIAS,
            Arc::clone(&journal),
            Arc::clone(&media),
            Arc::clone(&sink),
         )
         .expect("tree"),
      );

      let pool = WorkerPool::new(workers, Duration::from_millis(20), sink);
      pool.run().expect("workers");

      let services = Arc::new(Services::new(
         Arc::clone(&tree),
         Arc::clone(&journal),
         Arc::clone(&media),
         dyn_store,
         Arc::clone(&instances),
         processor,
         dir.path().join("cache"),
         Duration::from_secs(2),
      ));
      let jobs = Jobs::register(Arc::clone(&pool), services);

      Self { dir, store, journal, media, broadcaster, tree, instances, workers: pool, jobs }
   }

   pub fn root(&self) -> &Path {
      self.tree.root_path()
   }

   /// Directory `name` directly below the root, i.e. a user home.
   pub fn home(&self, name: &str) -> Arc<Node> {
      self.tree.mkdir_or_get(&self.tree.root(), name, None).expect("home dir")
   }

   pub fn mkdir(&self, parent: &Arc<Node>, name: &str) -> Arc<Node> {
      self.tree.mkdir(parent, name, None).expect("mkdir")
   }

   /// Writes `bytes` to disk, then registers the file in the tree.
   pub fn file(&self, parent: &Arc<Node>, name: &str, bytes: &[u8]) -> Arc<Node> {
      let path = self.tree.abs_path(parent).join(name);
      fs::write(&path, bytes).expect("write file");
      self.tree.touch(parent, name, None).expect("touch")
   }

   pub fn abs(&self, node: &Node) -> PathBuf {
      self.tree.abs_path(node)
   }
}

impl Drop for Harness {
   fn drop(&mut self) {
      self.workers.close();
   }
}

/// Waits for `task` and fails the test if it takes longer than `secs`.
pub fn wait_for(task: &Arc<Task>, secs: u64) {
   assert!(task.wait_timeout(Duration::from_secs(secs)), "task {} did not finish", task.id());
}

/// Polls `f` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
   let deadline = Instant::now() + timeout;
   while Instant::now() < deadline {
      if f() {
         return true;
      }
      std::thread::sleep(Duration::from_millis(5));
   }
   f()
}
