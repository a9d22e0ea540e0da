//! Typed task parameters and the chunk stream feeding uploads.

use std::fmt;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::{tree::FileId, util::short_hash};

/// Job type tag. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
   ScanDirectory,
   ScanFile,
   WriteFile,
   MoveFile,
   DeleteFiles,
   CreateZip,
   GatherFsStats,
   HashFile,
   Backup,
   CopyFileFromCore,
   RestoreCore,
}

impl TaskKind {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::ScanDirectory => "scan_directory",
         Self::ScanFile => "scan_file",
         Self::WriteFile => "write_file",
         Self::MoveFile => "move_file",
         Self::DeleteFiles => "delete_files",
         Self::CreateZip => "create_zip",
         Self::GatherFsStats => "gather_fs_stats",
         Self::HashFile => "hash_file",
         Self::Backup => "backup",
         Self::CopyFileFromCore => "copy_file_from_core",
         Self::RestoreCore => "restore_core",
      }
   }
}

impl fmt::Display for TaskKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Parameters of a task. Two tasks with equal metadata share an id, so a
/// repeated request returns the task already in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskMeta {
   ScanDirectory {
      dir_id: FileId,
   },
   ScanFile {
      file_id: FileId,
   },
   WriteFile {
      upload_id: String,
      root_id:   FileId,
      #[serde(skip)]
      stream:    ChunkStream,
   },
   MoveFile {
      file_ids: Vec<FileId>,
      dest_id:  FileId,
      new_name: Option<String>,
   },
   DeleteFiles {
      file_ids: Vec<FileId>,
   },
   CreateZip {
      file_ids: Vec<FileId>,
   },
   GatherFsStats {
      dir_id: FileId,
   },
   HashFile {
      file_id: FileId,
   },
   Backup {
      remote_id: String,
   },
   CopyFileFromCore {
      file_id:   FileId,
      remote_id: String,
   },
   RestoreCore {
      remote_id: String,
   },
}

impl TaskMeta {
   pub const fn kind(&self) -> TaskKind {
      match self {
         Self::ScanDirectory { .. } => TaskKind::ScanDirectory,
         Self::ScanFile { .. } => TaskKind::ScanFile,
         Self::WriteFile { .. } => TaskKind::WriteFile,
         Self::MoveFile { .. } => TaskKind::MoveFile,
         Self::DeleteFiles { .. } => TaskKind::DeleteFiles,
         Self::CreateZip { .. } => TaskKind::CreateZip,
         Self::GatherFsStats { .. } => TaskKind::GatherFsStats,
         Self::HashFile { .. } => TaskKind::HashFile,
         Self::Backup { .. } => TaskKind::Backup,
         Self::CopyFileFromCore { .. } => TaskKind::CopyFileFromCore,
         Self::RestoreCore { .. } => TaskKind::RestoreCore,
      }
   }

   /// Deterministic id derived from the kind and the serialized parameters.
   pub fn task_id(&self) -> String {
      let mut meta = self.clone();
      if let Self::CreateZip { file_ids } = &mut meta {
         file_ids.sort();
      }
      let encoded = serde_json::to_string(&meta).unwrap_or_default();
      short_hash(format!("{}:{encoded}", self.kind()).as_bytes(), 16)
   }
}

/// One piece of an upload. A range of `0-0/<size>` with no data announces a
/// new file; a total of `-1` cancels the upload.
#[derive(Debug, Clone)]
pub struct FileChunk {
   pub file_id:       FileId,
   pub content_range: String,
   pub data:          Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum StreamItem {
   Chunk(FileChunk),
   Close,
}

/// Multi-producer channel of upload chunks shared between the transport and
/// the upload task.
#[derive(Debug, Clone)]
pub struct ChunkStream {
   tx: Sender<StreamItem>,
   rx: Receiver<StreamItem>,
}

impl Default for ChunkStream {
   fn default() -> Self {
      Self::new()
   }
}

impl ChunkStream {
   pub fn new() -> Self {
      let (tx, rx) = crossbeam_channel::unbounded();
      Self { tx, rx }
   }

   /// Announces a file of `size` bytes that subsequent chunks will fill.
   pub fn new_file_in_stream(&self, file_id: &str, size: i64) {
      let _ = self.tx.send(StreamItem::Chunk(FileChunk {
         file_id:       file_id.to_string(),
         content_range: format!("0-0/{size}"),
         data:          Vec::new(),
      }));
   }

   pub fn add_chunk_to_stream(&self, file_id: &str, content_range: &str, data: Vec<u8>) {
      let _ = self.tx.send(StreamItem::Chunk(FileChunk {
         file_id: file_id.to_string(),
         content_range: content_range.to_string(),
         data,
      }));
   }

   /// Marks that no further files will be announced.
   pub fn close(&self) {
      let _ = self.tx.send(StreamItem::Close);
   }

   pub(crate) fn recv_timeout(
      &self,
      timeout: std::time::Duration,
   ) -> Result<StreamItem, RecvTimeoutError> {
      self.rx.recv_timeout(timeout)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn zip_ids_are_order_independent() {
      let a = TaskMeta::CreateZip { file_ids: vec!["b".into(), "a".into()] };
      let b = TaskMeta::CreateZip { file_ids: vec!["a".into(), "b".into()] };
      assert_eq!(a.task_id(), b.task_id());
   }

   #[test]
   fn kinds_separate_ids() {
      let scan = TaskMeta::ScanFile { file_id: "x".into() };
      let hash = TaskMeta::HashFile { file_id: "x".into() };
      assert_ne!(scan.task_id(), hash.task_id());

      let backup = TaskMeta::Backup { remote_id: "core".into() };
      let restore = TaskMeta::RestoreCore { remote_id: "core".into() };
      assert_ne!(backup.task_id(), restore.task_id());
   }
}
