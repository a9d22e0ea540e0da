use std::{
   collections::{BTreeSet, HashMap},
   fs::{File, OpenOptions},
   io::{Seek, SeekFrom, Write},
   sync::Arc,
   time::Instant,
};

use crossbeam_channel::RecvTimeoutError;

use super::{Services, bad_meta, scan::hash_node};
use crate::{
   Result,
   error::{TaskError, TreeError},
   task::{StreamItem, Task, TaskMeta},
   tree::{FileId, Node},
};

/// Parsed `min-max/total` content range. A total of `-1` cancels the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
   pub min:   u64,
   pub max:   u64,
   pub total: i64,
}

impl ContentRange {
   /// The `0-0/<size>` form announcing a new file.
   pub const fn is_announcement(&self) -> bool {
      self.min == 0 && self.max == 0
   }

   pub const fn is_cancel(&self) -> bool {
      self.total < 0
   }
}

pub fn parse_content_range(range: &str) -> Result<ContentRange> {
   let bad = || TaskError::BadChunk(format!("bad content range {range:?}"));
   let (span, total) = range.split_once('/').ok_or_else(bad)?;
   let (min, max) = span.split_once('-').ok_or_else(bad)?;
   let parsed = ContentRange {
      min:   min.trim().parse().map_err(|_| bad())?,
      max:   max.trim().parse().map_err(|_| bad())?,
      total: total.trim().parse().map_err(|_| bad())?,
   };
   if parsed.max < parsed.min {
      return Err(bad().into());
   }
   Ok(parsed)
}

struct OpenUpload {
   node:     Arc<Node>,
   file:     File,
   expected: u64,
   written:  u64,
}

/// Receives chunks from the task's stream and writes them into already
/// created files. A file completes once its announced size is written; the
/// upload completes once the stream is closed and every announced file is
/// complete. Each wait for the next chunk is bounded by the chunk timeout.
pub(super) fn write_to_file(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::WriteFile { upload_id, root_id, stream } = task.meta() else {
      return Err(bad_meta(task));
   };
   s.instances.require_not_backup("upload")?;
   let root = s.tree.get_or_err(root_id)?;

   let mut open: HashMap<FileId, OpenUpload> = HashMap::new();
   let mut parents: BTreeSet<FileId> = BTreeSet::new();
   let mut closed = false;
   let mut completed = 0usize;

   while !(closed && open.is_empty()) {
      task.check_exit()?;
      task.set_timeout(Instant::now() + s.chunk_timeout);
      let item = match stream.recv_timeout(s.chunk_timeout) {
         Ok(item) => item,
         Err(RecvTimeoutError::Timeout) => {
            task.check_exit()?;
            return Err(TaskError::Timeout.into());
         },
         Err(RecvTimeoutError::Disconnected) => StreamItem::Close,
      };
      task.clear_timeout();

      let chunk = match item {
         StreamItem::Close => {
            closed = true;
            continue;
         },
         StreamItem::Chunk(chunk) => chunk,
      };
      let range = parse_content_range(&chunk.content_range)?;
      if range.is_cancel() {
         tracing::debug!(%upload_id, "upload cancelled by client");
         return Err(TaskError::Cancelled.into());
      }

      if range.is_announcement() && chunk.data.is_empty() {
         let node = s.tree.get_or_err(&chunk.file_id)?;
         if node.is_dir() || !root.is_ancestor_of(&node) {
            return Err(TaskError::BadChunk(format!(
               "{} is not a file below {}",
               node.portable_path(),
               root.portable_path()
            ))
            .into());
         }
         if node.is_read_only() {
            return Err(TreeError::ReadOnly(node.portable_path().to_string()).into());
         }
         s.tree.add_task(&node, task);
         let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(s.tree.abs_path(&node))?;
         let expected = u64::try_from(range.total).unwrap_or_default();
         open.insert(node.id(), OpenUpload { node, file, expected, written: 0 });
      } else {
         let upload = open.get_mut(&chunk.file_id).ok_or_else(|| {
            TaskError::BadChunk(format!("chunk for unannounced file {}", chunk.file_id))
         })?;
         let len = range.max - range.min + 1;
         if len != chunk.data.len() as u64 {
            return Err(TaskError::BadChunk(format!(
               "range {} does not match {} bytes",
               chunk.content_range,
               chunk.data.len()
            ))
            .into());
         }
         upload.file.seek(SeekFrom::Start(range.min))?;
         upload.file.write_all(&chunk.data)?;
         upload.written += len;
      }

      let done = open
         .get(&chunk.file_id)
         .is_some_and(|u| u.written >= u.expected);
      if done && let Some(upload) = open.remove(&chunk.file_id) {
         finish_file(s, task, upload, &mut parents)?;
         completed += 1;
      }
   }

   let workers = task.worker_pool()?;
   for dir_id in &parents {
      if let Err(e) = workers.dispatch_job(TaskMeta::ScanDirectory { dir_id: dir_id.clone() }, None) {
         tracing::warn!(%dir_id, "failed to queue scan after upload: {e}");
      }
   }
   task.set_result("files_written", completed);
   tracing::debug!(%upload_id, files = completed, "upload finished");
   Ok(())
}

fn finish_file(
   s: &Services,
   task: &Task,
   upload: OpenUpload,
   parents: &mut BTreeSet<FileId>,
) -> Result<()> {
   let OpenUpload { node, file, .. } = upload;
   file.sync_all()?;
   drop(file);
   s.tree.record_write(&node, None)?;
   hash_node(s, &node)?;
   s.tree.remove_task(&node, task);
   if let Some(parent) = node.parent() {
      parents.insert(parent.id());
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn parses_ranges() {
      let r = parse_content_range("0-99/1000").expect("range");
      assert_eq!(r, ContentRange { min: 0, max: 99, total: 1000 });
      assert!(!r.is_announcement());

      assert!(parse_content_range("0-0/512").expect("range").is_announcement());
      assert!(parse_content_range("0-0/-1").expect("range").is_cancel());
   }

   #[test]
   fn rejects_malformed_ranges() {
      for bad in ["", "5", "0-9", "9-0/10", "a-b/c"] {
         assert!(parse_content_range(bad).is_err(), "{bad}");
      }
   }
}
