use std::{
   fs::{self, File},
   io::{self, Read},
   sync::Arc,
};

use chrono::{DateTime, Utc};

use super::{ActionRecord, CoreClient, FileRecord, PairRequest, PairResponse, RestoreRequest};
use crate::{
   Result,
   error::ReplicationError,
   instance::{Instance, InstanceRegistry, Role},
   jobs::apply_lifetime,
   journal::{Journal, Lifetime},
   tree::FileTree,
   util::hash_reader,
};

/// Core-side handlers for the replication routes. Every call checks the
/// bearer key against the local core key first.
///
/// The restore routes run on a fresh server instead: `restore_init` needs no
/// key and turns it into a restore target, the rest need the key it adopted.
pub struct CoreEndpoint {
   tree:      Arc<FileTree>,
   journal:   Arc<Journal>,
   instances: Arc<InstanceRegistry>,
}

impl std::fmt::Debug for CoreEndpoint {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("CoreEndpoint").field("tree", &self.tree).finish()
   }
}

impl CoreEndpoint {
   pub fn new(tree: Arc<FileTree>, journal: Arc<Journal>, instances: Arc<InstanceRegistry>) -> Self {
      Self { tree, journal, instances }
   }

   pub fn authorize(&self, key: Option<&str>) -> Result<()> {
      self.instances.require_role("serve replication", Role::Core)?;
      self.check_key(key)
   }

   fn authorize_restore(&self, key: Option<&str>) -> Result<()> {
      self.instances.require_role("receive restore", Role::Restore)?;
      self.check_key(key)
   }

   fn check_key(&self, key: Option<&str>) -> Result<()> {
      match key {
         Some(key) if self.instances.check_key(key) => Ok(()),
         _ => Err(ReplicationError::Unauthorized.into()),
      }
   }

   /// `POST /remote`: records the calling backup and describes this core.
   pub fn pair(&self, key: Option<&str>, request: &PairRequest) -> Result<PairResponse> {
      self.authorize(key)?;
      self.instances.add_remote(Instance {
         id:           request.id.clone(),
         name:         request.name.clone(),
         role:         Role::Backup,
         api_key:      None,
         core_address: None,
         is_local:     false,
         last_backup:  None,
      })?;
      let local = self.instances.local();
      tracing::info!(backup = %request.id, name = %request.name, "paired backup");
      Ok(PairResponse { id: local.id, name: local.name, alias: self.tree.alias().to_string() })
   }

   /// `GET /history/since/:timestamp`
   pub fn history_since(&self, key: Option<&str>, since: DateTime<Utc>) -> Result<Vec<ActionRecord>> {
      self.authorize(key)?;
      Ok(self.journal.actions_since(since))
   }

   /// `GET /files?dir=:id`
   pub fn list_files(&self, key: Option<&str>, dir_id: &str) -> Result<Vec<FileRecord>> {
      self.authorize(key)?;
      let dir = self
         .tree
         .get(dir_id)
         .ok_or_else(|| ReplicationError::Missing(dir_id.to_string()))?;
      Ok(dir.children().iter().map(|c| c.format_info()).collect())
   }

   /// `GET /file/:id`
   pub fn file_info(&self, key: Option<&str>, file_id: &str) -> Result<FileRecord> {
      self.authorize(key)?;
      let node = self
         .tree
         .get(file_id)
         .ok_or_else(|| ReplicationError::Missing(file_id.to_string()))?;
      Ok(node.format_info())
   }

   /// `GET /file/:id/content`
   pub fn open_file(&self, key: Option<&str>, file_id: &str) -> Result<File> {
      self.authorize(key)?;
      let node = self
         .tree
         .get(file_id)
         .filter(|n| !n.is_dir())
         .ok_or_else(|| ReplicationError::Missing(file_id.to_string()))?;
      Ok(File::open(self.tree.abs_path(&node))?)
   }

   /// `GET /media/:id/content`: bytes of any file carrying the content id.
   pub fn open_media(&self, key: Option<&str>, content_id: &str) -> Result<File> {
      self.authorize(key)?;
      let node = self
         .tree
         .media()
         .get(content_id)
         .and_then(|r| r.file_ids.iter().find_map(|id| self.tree.get(id)))
         .ok_or_else(|| ReplicationError::Missing(content_id.to_string()))?;
      Ok(File::open(self.tree.abs_path(&node))?)
   }

   /// `POST /restore/init`: takes over the identity of the core being
   /// restored and records the sending backup.
   pub fn restore_init(&self, request: &RestoreRequest) -> Result<()> {
      self
         .instances
         .init_restore(&request.core_id, &request.name, &request.api_key)?;
      self.journal.adopt_server_id(&request.core_id);
      self.journal.set_ignore_local(true);
      self.instances.add_remote(Instance {
         id:           request.backup_id.clone(),
         name:         request.backup_name.clone(),
         role:         Role::Backup,
         api_key:      None,
         core_address: None,
         is_local:     false,
         last_backup:  None,
      })?;
      tracing::info!(core = %request.core_id, backup = %request.backup_id, "restore started");
      Ok(())
   }

   /// `POST /restore/history`: imports the actions and recreates the live
   /// directories. Files appear as their bytes arrive.
   pub fn restore_history(&self, key: Option<&str>, lifetimes: &[Lifetime]) -> Result<usize> {
      self.authorize_restore(key)?;
      let actions: Vec<ActionRecord> =
         lifetimes.iter().flat_map(|l| l.actions.iter().cloned()).collect();
      let imported = self.journal.import(actions)?;
      for lifetime in lifetimes.iter().filter(|l| l.is_dir && l.is_live()) {
         apply_lifetime(&self.tree, lifetime, None)?;
      }
      tracing::debug!(lifetimes = lifetimes.len(), imported, "restored history");
      Ok(imported)
   }

   /// `POST /restore/file?fileId=:lifetime_id`: writes the bytes of the
   /// lifetime's live file at its final path.
   pub fn restore_file(
      &self,
      key: Option<&str>,
      lifetime_id: &str,
      content: &mut dyn Read,
   ) -> Result<FileRecord> {
      self.authorize_restore(key)?;
      let lifetime = self
         .journal
         .get_lifetime(lifetime_id)
         .filter(|l| l.is_live() && !l.is_dir)
         .ok_or_else(|| ReplicationError::Missing(lifetime_id.to_string()))?;
      let node = apply_lifetime(&self.tree, &lifetime, None)?
         .ok_or_else(|| ReplicationError::Missing(lifetime_id.to_string()))?;

      let abs = self.tree.abs_path(&node);
      let part = abs.with_file_name(format!("{}.part", node.name()));
      let written = (|| -> Result<()> {
         let mut out = File::create(&part)?;
         io::copy(content, &mut out)?;
         out.sync_all()?;
         Ok(())
      })();
      if let Err(e) = written {
         let _ = fs::remove_file(&part);
         return Err(e);
      }
      fs::rename(&part, &abs)?;

      self.tree.record_write(&node, None)?;
      let (content_id, _) = hash_reader(File::open(&abs)?)?;
      self.tree.set_content_id(&node, &content_id)?;
      Ok(node.format_info())
   }

   /// `POST /restore/complete`: persists the restored history and starts
   /// serving as the core.
   pub fn restore_complete(&self, key: Option<&str>) -> Result<()> {
      self.authorize_restore(key)?;
      self.journal.flush()?;
      self.instances.complete_restore()?;
      self.journal.set_ignore_local(false);
      Ok(())
   }
}

/// [`CoreClient`] calling a [`CoreEndpoint`] in the same process.
#[derive(Debug)]
pub struct LocalCoreClient {
   endpoint: Arc<CoreEndpoint>,
   api_key:  String,
}

impl LocalCoreClient {
   pub fn new(endpoint: Arc<CoreEndpoint>, api_key: impl Into<String>) -> Self {
      Self { endpoint, api_key: api_key.into() }
   }

   fn key(&self) -> Option<&str> {
      Some(&self.api_key)
   }
}

impl CoreClient for LocalCoreClient {
   fn pair(&self, request: &PairRequest) -> Result<PairResponse> {
      self.endpoint.pair(self.key(), request)
   }

   fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<ActionRecord>> {
      self.endpoint.history_since(self.key(), since)
   }

   fn list_files(&self, dir_id: &str) -> Result<Vec<FileRecord>> {
      self.endpoint.list_files(self.key(), dir_id)
   }

   fn file_info(&self, file_id: &str) -> Result<FileRecord> {
      self.endpoint.file_info(self.key(), file_id)
   }

   fn file_content(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
      Ok(Box::new(self.endpoint.open_file(self.key(), file_id)?))
   }

   fn media_content(&self, content_id: &str) -> Result<Box<dyn Read + Send>> {
      Ok(Box::new(self.endpoint.open_media(self.key(), content_id)?))
   }

   fn restore_init(&self, request: &RestoreRequest) -> Result<()> {
      self.endpoint.restore_init(request)
   }

   fn restore_history(&self, lifetimes: &[Lifetime]) -> Result<usize> {
      self.endpoint.restore_history(self.key(), lifetimes)
   }

   fn restore_file(
      &self,
      lifetime_id: &str,
      mut content: Box<dyn Read + Send>,
   ) -> Result<FileRecord> {
      self.endpoint.restore_file(self.key(), lifetime_id, &mut content)
   }

   fn restore_complete(&self) -> Result<()> {
      self.endpoint.restore_complete(self.key())
   }
}
