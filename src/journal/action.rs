use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tree::{FileId, Node, PortablePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
   #[serde(rename = "fileCreate")]
   Create,
   #[serde(rename = "fileMove")]
   Move,
   #[serde(rename = "fileDelete")]
   Delete,
   #[serde(rename = "fileWrite")]
   Write,
   #[serde(rename = "backup")]
   Backup,
}

/// One entry in the mutation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
   pub action_type:      ActionType,
   pub origin_id:        Option<FileId>,
   pub origin_path:      Option<PortablePath>,
   pub destination_id:   Option<FileId>,
   pub destination_path: Option<PortablePath>,
   pub timestamp:        DateTime<Utc>,
   /// Per-server sequence number; orders actions with equal timestamps.
   pub seq:              u64,
   pub event_id:         String,
   pub server_id:        String,
   /// Set when the journal assigns the action to a lifetime.
   pub lifetime_id:      Option<String>,
   pub is_dir:           bool,
   pub size:             i64,
   pub content_id:       Option<String>,
}

impl FileAction {
   /// Id of the file after this action, or before it for deletes.
   pub fn subject_id(&self) -> Option<&FileId> {
      self.destination_id.as_ref().or(self.origin_id.as_ref())
   }

   /// Path of the file after this action, or before it for deletes.
   pub fn subject_path(&self) -> Option<&PortablePath> {
      self.destination_path.as_ref().or(self.origin_path.as_ref())
   }

   pub fn sort_key(&self) -> (DateTime<Utc>, u64) {
      (self.timestamp, self.seq)
   }
}

/// Batch of actions produced by one high-level operation.
#[derive(Debug)]
pub struct FileEvent {
   id:        String,
   server_id: String,
   seq:       Arc<AtomicU64>,
   actions:   Mutex<Vec<FileAction>>,
}

impl FileEvent {
   pub(crate) fn new(server_id: String, seq: Arc<AtomicU64>) -> Self {
      Self { id: uuid::Uuid::new_v4().to_string(), server_id, seq, actions: Mutex::new(Vec::new()) }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn len(&self) -> usize {
      self.actions.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   pub fn actions(&self) -> Vec<FileAction> {
      self.actions.lock().clone()
   }

   pub(crate) fn take_actions(&self) -> Vec<FileAction> {
      std::mem::take(&mut *self.actions.lock())
   }

   fn push(
      &self,
      action_type: ActionType,
      origin: Option<(FileId, PortablePath)>,
      node: &Node,
      keep_destination: bool,
   ) {
      let (origin_id, origin_path) = origin.unzip();
      let (destination_id, destination_path) = if keep_destination {
         (Some(node.id()), Some(node.portable_path()))
      } else {
         (None, None)
      };
      let action = FileAction {
         action_type,
         origin_id,
         origin_path,
         destination_id,
         destination_path,
         timestamp: Utc::now(),
         seq: self.seq.fetch_add(1, Ordering::AcqRel),
         event_id: self.id.clone(),
         server_id: self.server_id.clone(),
         lifetime_id: None,
         is_dir: node.is_dir(),
         size: node.size(),
         content_id: node.content_id(),
      };
      self.actions.lock().push(action);
   }

   pub fn new_create_action(&self, node: &Node) {
      self.push(ActionType::Create, None, node, true);
   }

   pub fn new_move_action(&self, old_id: &str, old_path: &PortablePath, node: &Node) {
      self.push(ActionType::Move, Some((old_id.to_string(), old_path.clone())), node, true);
   }

   pub fn new_delete_action(&self, node: &Node) {
      self.push(ActionType::Delete, Some((node.id(), node.portable_path())), node, false);
   }

   pub fn new_write_action(&self, node: &Node) {
      self.push(ActionType::Write, Some((node.id(), node.portable_path())), node, true);
   }

   pub fn new_backup_action(&self, node: &Node) {
      self.push(ActionType::Backup, Some((node.id(), node.portable_path())), node, true);
   }
}
