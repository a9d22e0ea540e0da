//! Durable state behind the journal, media index, trash and instance
//! registry.

mod json;
mod memory;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
pub use json::JsonStore;
pub use memory::MemoryStore;
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   instance::Instance,
   journal::FileAction,
   tree::{FileId, PortablePath},
};

/// Where a trashed file came from, so it can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashEntry {
   pub file_id:       FileId,
   pub original_path: PortablePath,
   pub trash_path:    PortablePath,
   pub owner:         String,
   pub timestamp:     DateTime<Utc>,
}

/// Content id to the ids of the files carrying that content.
pub type MediaMap = BTreeMap<String, Vec<FileId>>;

pub trait Store: Send + Sync {
   /// Appends journal actions. Either the whole batch is durable or an error
   /// is returned.
   fn append_actions(&self, actions: &[FileAction]) -> Result<()>;

   fn load_actions(&self) -> Result<Vec<FileAction>>;

   fn add_media_file(&self, content_id: &str, file_id: &str) -> Result<()>;

   fn remove_media_file(&self, content_id: &str, file_id: &str) -> Result<()>;

   fn load_media(&self) -> Result<MediaMap>;

   fn create_trash_entry(&self, entry: &TrashEntry) -> Result<()>;

   fn delete_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>>;

   fn get_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>>;

   fn save_instance(&self, instance: &Instance) -> Result<()>;

   /// Drops the record `id`; a missing record is not an error.
   fn delete_instance(&self, id: &str) -> Result<()>;

   fn load_instances(&self) -> Result<Vec<Instance>>;
}

/// Adds `file_id` under `content_id`, keeping the list sorted and unique.
fn media_insert(media: &mut MediaMap, content_id: &str, file_id: &str) {
   let ids = media.entry(content_id.to_string()).or_default();
   if let Err(pos) = ids.binary_search_by(|id| id.as_str().cmp(file_id)) {
      ids.insert(pos, file_id.to_string());
   }
}

/// Drops `file_id` from `content_id`, removing the entry once empty.
fn media_remove(media: &mut MediaMap, content_id: &str, file_id: &str) {
   if let Some(ids) = media.get_mut(content_id) {
      ids.retain(|id| id != file_id);
      if ids.is_empty() {
         media.remove(content_id);
      }
   }
}
