use std::{
   collections::HashMap,
   fs::{self, File, OpenOptions},
   io::{BufRead, BufReader, ErrorKind, Write},
   path::{Path, PathBuf},
};

use fs4::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::{MediaMap, Store, TrashEntry, media_insert, media_remove};
use crate::{Error, Result, instance::Instance, journal::FileAction, util::write_json_atomic};

const LOCK_FILE: &str = "store.lock";
const JOURNAL_FILE: &str = "journal.jsonl";
const MEDIA_FILE: &str = "media.json";
const TRASH_FILE: &str = "trash.json";
const INSTANCES_FILE: &str = "instances.json";

/// File-backed store under one data directory.
///
/// The journal is a JSON-lines file appended and synced per batch. Media,
/// trash and instance records are whole JSON documents rewritten atomically
/// on every change. An exclusive lock file keeps a second process out;
/// opening a locked store fails instead of waiting.
pub struct JsonStore {
   dir:       PathBuf,
   lock:      File,
   journal:   Mutex<File>,
   media:     Mutex<MediaMap>,
   trash:     Mutex<HashMap<String, TrashEntry>>,
   instances: Mutex<HashMap<String, Instance>>,
}

impl std::fmt::Debug for JsonStore {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("JsonStore").field("dir", &self.dir).finish()
   }
}

impl JsonStore {
   pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
      let dir = dir.into();
      fs::create_dir_all(&dir)?;

      let lock = OpenOptions::new()
         .create(true)
         .read(true)
         .write(true)
         .truncate(false)
         .open(dir.join(LOCK_FILE))?;
      if lock.try_lock_exclusive().is_err() {
         return Err(Error::Server {
            op:     "open store",
            reason: format!("{} is in use by another process", dir.display()),
         });
      }

      let journal = OpenOptions::new()
         .create(true)
         .append(true)
         .open(dir.join(JOURNAL_FILE))?;

      let media: MediaMap = read_doc(&dir.join(MEDIA_FILE))?;
      let trash: HashMap<String, TrashEntry> = read_doc(&dir.join(TRASH_FILE))?;
      let instances: HashMap<String, Instance> = read_doc(&dir.join(INSTANCES_FILE))?;

      tracing::debug!(dir = %dir.display(), "opened store");
      Ok(Self {
         dir,
         lock,
         journal: Mutex::new(journal),
         media: Mutex::new(media),
         trash: Mutex::new(trash),
         instances: Mutex::new(instances),
      })
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }
}

impl Drop for JsonStore {
   fn drop(&mut self) {
      let _ = self.lock.unlock();
   }
}

/// Reads a JSON document, treating a missing file as empty.
fn read_doc<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
   match fs::read(path) {
      Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
      Err(e) => Err(e.into()),
   }
}

impl Store for JsonStore {
   fn append_actions(&self, actions: &[FileAction]) -> Result<()> {
      let mut buf = Vec::new();
      for action in actions {
         serde_json::to_writer(&mut buf, action)?;
         buf.push(b'\n');
      }
      let mut file = self.journal.lock();
      file.write_all(&buf)?;
      file.sync_data()?;
      Ok(())
   }

   fn load_actions(&self) -> Result<Vec<FileAction>> {
      let file = File::open(self.dir.join(JOURNAL_FILE))?;
      let mut out = Vec::new();
      for (lineno, line) in BufReader::new(file).lines().enumerate() {
         let line = line?;
         if line.trim().is_empty() {
            continue;
         }
         match serde_json::from_str::<FileAction>(&line) {
            Ok(action) => out.push(action),
            // A torn final line after a crash is expected; anything else is
            // still skipped so one bad record does not lose the history.
            Err(e) => tracing::warn!(line = lineno + 1, "skipping unreadable journal line: {e}"),
         }
      }
      Ok(out)
   }

   fn add_media_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      let mut media = self.media.lock();
      media_insert(&mut media, content_id, file_id);
      write_json_atomic(&self.dir.join(MEDIA_FILE), &*media)
   }

   fn remove_media_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      let mut media = self.media.lock();
      media_remove(&mut media, content_id, file_id);
      write_json_atomic(&self.dir.join(MEDIA_FILE), &*media)
   }

   fn load_media(&self) -> Result<MediaMap> {
      Ok(self.media.lock().clone())
   }

   fn create_trash_entry(&self, entry: &TrashEntry) -> Result<()> {
      let mut trash = self.trash.lock();
      trash.insert(entry.file_id.clone(), entry.clone());
      write_json_atomic(&self.dir.join(TRASH_FILE), &*trash)
   }

   fn delete_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>> {
      let mut trash = self.trash.lock();
      let removed = trash.remove(file_id);
      if removed.is_some() {
         write_json_atomic(&self.dir.join(TRASH_FILE), &*trash)?;
      }
      Ok(removed)
   }

   fn get_trash_entry(&self, file_id: &str) -> Result<Option<TrashEntry>> {
      Ok(self.trash.lock().get(file_id).cloned())
   }

   fn save_instance(&self, instance: &Instance) -> Result<()> {
      let mut instances = self.instances.lock();
      instances.insert(instance.id.clone(), instance.clone());
      write_json_atomic(&self.dir.join(INSTANCES_FILE), &*instances)
   }

   fn delete_instance(&self, id: &str) -> Result<()> {
      let mut instances = self.instances.lock();
      if instances.remove(id).is_none() {
         return Ok(());
      }
      write_json_atomic(&self.dir.join(INSTANCES_FILE), &*instances)
   }

   fn load_instances(&self) -> Result<Vec<Instance>> {
      let mut out: Vec<Instance> = self.instances.lock().values().cloned().collect();
      out.sort_by(|a, b| a.id.cmp(&b.id));
      Ok(out)
   }
}
