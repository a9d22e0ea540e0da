//! Core to backup replication.
//!
//! A backup pairs with a core once, then periodically pulls every action
//! since its newest core action, replays them into its own journal and tree,
//! and copies the bytes of files whose content it lacks. The core side is
//! [`CoreEndpoint`]; [`HttpCoreClient`] reaches it over HTTP and
//! [`LocalCoreClient`] in-process.
//!
//! The same client also drives a restore: a backup primes a fresh server
//! with the lost core's identity, pushes the core's lifetimes and file bytes
//! to it and tells it to take over as the core.

mod daemon;
mod endpoint;
mod http;

use std::io::Read;

use chrono::{DateTime, Utc};
pub use daemon::BackupDaemon;
pub use endpoint::{CoreEndpoint, LocalCoreClient};
pub use http::HttpCoreClient;
use serde::{Deserialize, Serialize};

use crate::{
   Result,
   journal::{FileAction, Lifetime},
   tree::FileInfo,
};

/// Journal action as sent on the wire.
pub type ActionRecord = FileAction;

/// File metadata as sent on the wire.
pub type FileRecord = FileInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
   pub id:   String,
   pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
   pub id:    String,
   pub name:  String,
   /// Root alias of the core tree; the backup tree must use the same one.
   pub alias: String,
}

/// Primes a fresh server to receive the core `core_id` from a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
   pub core_id:     String,
   pub name:        String,
   /// Key the backup presents, kept as the restored core's key.
   pub api_key:     String,
   pub backup_id:   String,
   pub backup_name: String,
}

/// Requests a backup makes of its core.
pub trait CoreClient: Send + Sync {
   fn pair(&self, request: &PairRequest) -> Result<PairResponse>;

   /// Actions at or after `since`, oldest first.
   fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<ActionRecord>>;

   /// Children of the directory `dir_id`.
   fn list_files(&self, dir_id: &str) -> Result<Vec<FileRecord>>;

   fn file_info(&self, file_id: &str) -> Result<FileRecord>;

   fn file_content(&self, file_id: &str) -> Result<Box<dyn Read + Send>>;

   fn media_content(&self, content_id: &str) -> Result<Box<dyn Read + Send>>;

   fn restore_init(&self, request: &RestoreRequest) -> Result<()>;

   /// Imports the lifetimes' actions. Returns how many were new.
   fn restore_history(&self, lifetimes: &[Lifetime]) -> Result<usize>;

   /// Uploads the bytes of the live file of `lifetime_id`.
   fn restore_file(&self, lifetime_id: &str, content: Box<dyn Read + Send>) -> Result<FileRecord>;

   fn restore_complete(&self) -> Result<()>;
}
