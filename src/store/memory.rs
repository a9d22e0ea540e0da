use std::{
   collections::HashMap,
   io,
   sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use super::{MediaMap, Store, TrashEntry, media_insert, media_remove};
use crate::{Result, instance::Instance, journal::FileAction};

#[derive(Debug, Default)]
struct State {
   actions:   Vec<FileAction>,
   media:     MediaMap,
   trash:     HashMap<String, TrashEntry>,
   instances: HashMap<String, Instance>,
}

/// Volatile store. Appends can be made to fail to exercise flush retries.
#[derive(Debug, Default)]
pub struct MemoryStore {
   state:        Mutex<State>,
   fail_appends: AtomicBool,
}

impl MemoryStore {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn set_fail_appends(&self, fail: bool) {
      self.fail_appends.store(fail, Ordering::Release);
   }

   /// Every action appended so far, in append order.
   pub fn appended(&self) -> Vec<FileAction> {
      self.state.lock().actions.clone()
   }
}

impl Store for MemoryStore {
   fn append_actions(&self, actions: &[FileAction]) -> Result<()> {
      if self.fail_appends.load(Ordering::Acquire) {
         return Err(io::Error::other("append rejected").into());
      }
      self.state.lock().actions.extend_from_slice(actions);
      Ok(())
   }

   fn load_actions(&self) -> Result<Vec<FileAction>> {
      Ok(self.appended())
   }

   fn add_media_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      media_insert(&mut self.state.lock().media, content_id, file_id);
      Ok(())
   }

   fn remove_media_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      media_remove(&mut self.state.lock().media, content_id, file_id);
      Ok(())
   }

   fn load_media(&self) -> Result<MediaMap> {
      Ok(self.state.lock().media.clone())
   }

   fn create_trash_entry(&self, entry: &TrashEntry) -> Result<()> {
      self.state.lock().trash.insert(entry.file_id.clone(), entry.clone());
      Ok(())
   }

   fn delete_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>> {
      Ok(self.state.lock().trash.remove(file_id))
   }

   fn get_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>> {
      Ok(self.state.lock().trash.get(file_id).cloned())
   }

   fn save_instance(&self, instance: &Instance) -> Result<()> {
      self.state.lock().instances.insert(instance.id.clone(), instance.clone());
      Ok(())
   }

   fn delete_instance(&self, id: &str) -> Result<()> {
      self.state.lock().instances.remove(id);
      Ok(())
   }

   fn load_instances(&self) -> Result<Vec<Instance>> {
      let mut out: Vec<Instance> = self.state.lock().instances.values().cloned().collect();
      out.sort_by(|a, b| a.id.cmp(&b.id));
      Ok(out)
   }
}
