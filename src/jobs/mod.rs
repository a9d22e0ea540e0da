//! Job handlers and their entry points.
//!
//! Each job kind is a plain function over [`Services`] and the running task.
//! [`Jobs`] registers them with a [`WorkerPool`] and exposes one typed entry
//! point per kind that returns the dispatched [`Task`].

mod backup;
mod files;
mod restore;
mod scan;
mod stats;
mod upload;
mod zip;

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub(crate) use self::backup::apply_lifetime;
pub use self::{
   stats::ExtensionSize,
   upload::{ContentRange, parse_content_range},
   zip::takeout_id,
};
use crate::{
   Result,
   error::{ReplicationError, TaskError},
   instance::InstanceRegistry,
   journal::Journal,
   media::{MediaIndex, MediaProcessor},
   replication::{CoreClient, HttpCoreClient},
   store::Store,
   task::{ChunkStream, Handler, Task, TaskKind, TaskMeta, TaskPool, WorkerPool},
   tree::{FileId, FileTree},
};

/// Everything a job handler needs, shared by all handlers.
pub struct Services {
   pub tree:          Arc<FileTree>,
   pub journal:       Arc<Journal>,
   pub media:         Arc<MediaIndex>,
   pub store:         Arc<dyn Store>,
   pub instances:     Arc<InstanceRegistry>,
   pub processor:     Arc<dyn MediaProcessor>,
   pub cache_dir:     PathBuf,
   pub chunk_timeout: Duration,
   core_clients:      RwLock<HashMap<String, Arc<dyn CoreClient>>>,
}

impl std::fmt::Debug for Services {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Services")
         .field("tree", &self.tree)
         .field("cache_dir", &self.cache_dir)
         .finish()
   }
}

impl Services {
   #[allow(clippy::too_many_arguments, reason = "plain dependency bundle")]
   pub fn new(
      tree: Arc<FileTree>,
      journal: Arc<Journal>,
      media: Arc<MediaIndex>,
      store: Arc<dyn Store>,
      instances: Arc<InstanceRegistry>,
      processor: Arc<dyn MediaProcessor>,
      cache_dir: PathBuf,
      chunk_timeout: Duration,
   ) -> Self {
      Self {
         tree,
         journal,
         media,
         store,
         instances,
         processor,
         cache_dir,
         chunk_timeout,
         core_clients: RwLock::new(HashMap::new()),
      }
   }

   /// Overrides the client used to reach the core `remote_id`.
   pub fn set_core_client(&self, remote_id: &str, client: Arc<dyn CoreClient>) {
      self.core_clients.write().insert(remote_id.to_string(), client);
   }

   /// The client for `remote_id`, built from its instance record on first
   /// use.
   pub fn core_client(&self, remote_id: &str) -> Result<Arc<dyn CoreClient>> {
      if let Some(client) = self.core_clients.read().get(remote_id) {
         return Ok(Arc::clone(client));
      }
      let remote = self
         .instances
         .remote(remote_id)
         .ok_or_else(|| ReplicationError::UnknownRemote(remote_id.to_string()))?;
      let address = remote
         .core_address
         .as_deref()
         .ok_or_else(|| ReplicationError::NoAddress(remote_id.to_string()))?;
      let client: Arc<dyn CoreClient> =
         Arc::new(HttpCoreClient::new(address, remote.api_key.as_deref().unwrap_or_default())?);
      self.set_core_client(remote_id, Arc::clone(&client));
      Ok(client)
   }
}

/// Result of a batch operation where items fail independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
   /// Ids of the affected files after the operation.
   pub succeeded: Vec<FileId>,
   pub failed:    Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
   pub id:     FileId,
   pub reason: String,
}

impl BatchOutcome {
   fn record<T>(&mut self, id: &str, result: Result<T>, succeeded_id: impl FnOnce(T) -> FileId) {
      match result {
         Ok(v) => self.succeeded.push(succeeded_id(v)),
         Err(e) => {
            tracing::warn!(file_id = id, "batch item failed: {e}");
            self.failed.push(BatchFailure { id: id.to_string(), reason: e.to_string() });
         },
      }
   }

   /// An error when every item failed; partial success is still success.
   fn into_result(self, task: &Task) -> Result<()> {
      let (failed, total) = (self.failed.len(), self.failed.len() + self.succeeded.len());
      task.set_result("outcome", &self);
      if failed > 0 && failed == total {
         return Err(TaskError::Subtasks { failed, total }.into());
      }
      Ok(())
   }
}

fn bad_meta(task: &Task) -> crate::Error {
   TaskError::BadMeta(task.kind().as_str()).into()
}

fn handler(services: &Arc<Services>, f: fn(&Services, &Arc<Task>) -> Result<()>) -> Handler {
   let services = Arc::clone(services);
   Arc::new(move |task: &Arc<Task>| f(&services, task))
}

/// Typed entry points over a worker pool with every job registered.
#[derive(Debug, Clone)]
pub struct Jobs {
   workers:  Arc<WorkerPool>,
   services: Arc<Services>,
}

impl Jobs {
   pub fn register(workers: Arc<WorkerPool>, services: Arc<Services>) -> Self {
      let table: [(TaskKind, fn(&Services, &Arc<Task>) -> Result<()>); 11] = [
         (TaskKind::ScanDirectory, scan::scan_directory),
         (TaskKind::ScanFile, scan::scan_file),
         (TaskKind::WriteFile, upload::write_to_file),
         (TaskKind::MoveFile, files::move_files),
         (TaskKind::DeleteFiles, files::delete_files),
         (TaskKind::CreateZip, zip::create_zip),
         (TaskKind::GatherFsStats, stats::gather_fs_stats),
         (TaskKind::HashFile, scan::hash_file),
         (TaskKind::Backup, backup::backup),
         (TaskKind::CopyFileFromCore, backup::copy_file_from_core),
         (TaskKind::RestoreCore, restore::restore_core),
      ];
      for (kind, f) in table {
         workers.register_job(kind, handler(&services, f));
      }
      Self { workers, services }
   }

   pub fn workers(&self) -> &Arc<WorkerPool> {
      &self.workers
   }

   pub fn services(&self) -> &Arc<Services> {
      &self.services
   }

   pub fn scan_directory(&self, dir_id: &str, pool: Option<&Arc<TaskPool>>) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::ScanDirectory { dir_id: dir_id.to_string() }, pool)
   }

   pub fn scan_file(&self, file_id: &str, pool: Option<&Arc<TaskPool>>) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::ScanFile { file_id: file_id.to_string() }, pool)
   }

   /// Starts an upload into `root_id` fed by `stream`. Repeating an
   /// `upload_id` restarts the upload.
   pub fn write_to_file(
      &self,
      upload_id: &str,
      root_id: &str,
      stream: ChunkStream,
   ) -> Result<Arc<Task>> {
      self.services.instances.require_not_backup("upload")?;
      self.workers.dispatch_job(
         TaskMeta::WriteFile {
            upload_id: upload_id.to_string(),
            root_id: root_id.to_string(),
            stream,
         },
         None,
      )
   }

   pub fn move_files(
      &self,
      file_ids: Vec<FileId>,
      dest_id: &str,
      new_name: Option<String>,
   ) -> Result<Arc<Task>> {
      self.services.instances.require_not_backup("move")?;
      self.workers.dispatch_job(
         TaskMeta::MoveFile { file_ids, dest_id: dest_id.to_string(), new_name },
         None,
      )
   }

   pub fn delete_files(&self, file_ids: Vec<FileId>) -> Result<Arc<Task>> {
      self.services.instances.require_not_backup("delete")?;
      self.workers.dispatch_job(TaskMeta::DeleteFiles { file_ids }, None)
   }

   /// Archives the files; the finished task stays addressable so a repeated
   /// request returns the same archive.
   pub fn create_zip(&self, file_ids: Vec<FileId>) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::CreateZip { file_ids }, None)
   }

   pub fn gather_fs_stats(&self, dir_id: &str) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::GatherFsStats { dir_id: dir_id.to_string() }, None)
   }

   pub fn hash_file(&self, file_id: &str, pool: Option<&Arc<TaskPool>>) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::HashFile { file_id: file_id.to_string() }, pool)
   }

   pub fn backup(&self, remote_id: &str) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::Backup { remote_id: remote_id.to_string() }, None)
   }

   /// Pushes everything this backup holds of the core `remote_id` to the
   /// fresh server reachable through that core's client.
   pub fn restore_core(&self, remote_id: &str) -> Result<Arc<Task>> {
      self.workers.dispatch_job(TaskMeta::RestoreCore { remote_id: remote_id.to_string() }, None)
   }

   pub fn copy_file_from_core(
      &self,
      file_id: &str,
      remote_id: &str,
      pool: Option<&Arc<TaskPool>>,
   ) -> Result<Arc<Task>> {
      self.workers.dispatch_job(
         TaskMeta::CopyFileFromCore {
            file_id:   file_id.to_string(),
            remote_id: remote_id.to_string(),
         },
         pool,
      )
   }
}
