//! Content-addressed media registry.
//!
//! Files with identical bytes share one content id and so one media record.
//! Thumbnails and metadata extraction live behind [`MediaProcessor`].

use std::{
   collections::{BTreeSet, HashMap},
   path::Path,
   sync::Arc,
};

use parking_lot::RwLock;
use serde::Serialize;

use crate::{Result, store::Store, tree::FileId};

/// Extensions treated as displayable media.
const DISPLAYABLE: &[&str] = &[
   "jpg", "jpeg", "png", "gif", "webp", "heic", "tif", "tiff", "bmp", "dng", "cr2", "nef", "arw",
   "raw", "mp4", "mov", "m4v", "avi", "mkv", "webm",
];

/// True when the file name has a media extension.
pub fn is_displayable(name: &str) -> bool {
   Path::new(name)
      .extension()
      .and_then(|e| e.to_str())
      .is_some_and(|ext| DISPLAYABLE.iter().any(|d| d.eq_ignore_ascii_case(ext)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaRecord {
   pub content_id: String,
   pub file_ids:   BTreeSet<FileId>,
   /// Set once a processor has produced derived data for the content.
   pub imported:   bool,
}

/// Produces derived data (thumbnails, exif, ...) for a newly seen content id.
pub trait MediaProcessor: Send + Sync {
   fn process(&self, content_id: &str, path: &Path) -> Result<()>;
}

/// Processor that only records the content as imported.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

impl MediaProcessor for PassthroughProcessor {
   fn process(&self, content_id: &str, path: &Path) -> Result<()> {
      tracing::trace!(content_id, path = %path.display(), "no media processing configured");
      Ok(())
   }
}

pub struct MediaIndex {
   records: RwLock<HashMap<String, MediaRecord>>,
   store:   Arc<dyn Store>,
}

impl std::fmt::Debug for MediaIndex {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MediaIndex").field("records", &self.records.read().len()).finish()
   }
}

impl MediaIndex {
   pub fn new(store: Arc<dyn Store>) -> Self {
      Self { records: RwLock::new(HashMap::new()), store }
   }

   /// Loads content-to-file associations from the store. Loaded records
   /// count as imported.
   pub fn load(&self) -> Result<usize> {
      let media = self.store.load_media()?;
      let mut records = self.records.write();
      records.clear();
      for (content_id, file_ids) in media {
         records.insert(content_id.clone(), MediaRecord {
            content_id,
            file_ids: file_ids.into_iter().collect(),
            imported: true,
         });
      }
      Ok(records.len())
   }

   pub fn add_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      self.store.add_media_file(content_id, file_id)?;
      self
         .records
         .write()
         .entry(content_id.to_string())
         .or_insert_with(|| MediaRecord { content_id: content_id.to_string(), ..Default::default() })
         .file_ids
         .insert(file_id.to_string());
      Ok(())
   }

   /// Detaches `file_id`. The record goes away with its last file.
   pub fn remove_file(&self, content_id: &str, file_id: &str) -> Result<()> {
      self.store.remove_media_file(content_id, file_id)?;
      let mut records = self.records.write();
      if let Some(record) = records.get_mut(content_id) {
         record.file_ids.remove(file_id);
         if record.file_ids.is_empty() {
            records.remove(content_id);
         }
      }
      Ok(())
   }

   pub fn get(&self, content_id: &str) -> Option<MediaRecord> {
      self.records.read().get(content_id).cloned()
   }

   pub fn is_imported(&self, content_id: &str) -> bool {
      self.records.read().get(content_id).is_some_and(|r| r.imported)
   }

   pub fn mark_imported(&self, content_id: &str) {
      if let Some(record) = self.records.write().get_mut(content_id) {
         record.imported = true;
      }
   }

   pub fn len(&self) -> usize {
      self.records.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}
