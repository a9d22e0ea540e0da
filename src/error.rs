use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::instance::Role;

/// Main error type for strata.
///
/// Structural tree errors, task failures, journal bookkeeping problems and
/// replication faults each have their own sub-enum so callers can match on
/// the category without string inspection.
#[derive(Debug, Error)]
pub enum Error {
   /// Shared error, used where one failure is stored on a task and read by
   /// many observers.
   #[error(transparent)]
   Shared(#[from] Arc<Self>),

   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// Structural error raised synchronously by a file tree operation.
   #[error("tree error: {0}")]
   Tree(#[from] TreeError),

   /// Task scheduling or execution error.
   #[error("task error: {0}")]
   Task(#[from] TaskError),

   /// Journal bookkeeping error.
   #[error("journal error: {0}")]
   Journal(#[from] JournalError),

   /// Core/backup replication error.
   #[error("replication error: {0}")]
   Replication(#[from] ReplicationError),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML serialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::ser::Error),

   /// Configuration could not be extracted.
   #[error("config error: {0}")]
   Config(#[from] Box<figment::Error>),

   /// HTTP request or response error occurred.
   #[error("http error: {0}")]
   Http(#[from] reqwest::Error),

   /// The local instance role does not permit the operation.
   #[error("{op} is not permitted on a {role} instance")]
   Role { op: &'static str, role: Role },

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::Shared(inner) => inner.exit_code(),
         Self::Task(TaskError::Timeout) => 11,
         Self::Task(TaskError::Cancelled) => 12,
         Self::Role { .. } => 13,
         Self::Replication(ReplicationError::Unauthorized) => 14,
         _ => 1,
      }
   }

   /// True when the error only records that the task was asked to stop.
   pub fn is_cancellation(&self) -> bool {
      match self {
         Self::Task(TaskError::Cancelled) => true,
         Self::Shared(inner) => inner.is_cancellation(),
         _ => false,
      }
   }
}

/// Structural errors returned by file tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
   /// A node with the same id is already registered.
   #[error("id collision: {0}")]
   IdCollision(String),

   /// The target name already exists in the destination directory.
   #[error("already exists: {0}")]
   AlreadyExists(String),

   /// The operation requires a directory.
   #[error("not a directory: {0}")]
   NotADirectory(String),

   /// No node matches the id or path.
   #[error("file not found: {0}")]
   NotFound(String),

   /// Fewer bytes were read or written than expected.
   #[error("short read on {path}: expected {expected} bytes, got {got}", path = path.display())]
   ShortRead { path: PathBuf, expected: u64, got: u64 },

   /// The move violates an ownership or hierarchy rule.
   #[error("illegal move: {0}")]
   IllegalMove(String),

   /// The root node cannot be moved or removed.
   #[error("the root node cannot be {0}")]
   Root(&'static str),

   /// A path could not be mapped into the tree.
   #[error("bad path: {0}")]
   BadPath(String),

   /// The node or one of its ancestors is read-only.
   #[error("read-only: {0}")]
   ReadOnly(String),
}

/// Errors raised by the task engine.
#[derive(Debug, Error)]
pub enum TaskError {
   /// The task observed a cancellation request at a yield point.
   #[error("task cancelled")]
   Cancelled,

   /// The task deadline passed before it was cleared.
   #[error("task timed out")]
   Timeout,

   /// The task panicked; the worker recovered.
   #[error("task panicked: {0}")]
   Panic(String),

   /// A task was queued after `signal_all_queued`.
   #[error("pool {0} is no longer accepting tasks")]
   AllQueued(String),

   /// The worker pool was closed or dropped.
   #[error("worker pool is closed")]
   ClosedPool,

   /// No handler is registered for the task kind.
   #[error("no handler registered for {0}")]
   NoHandler(&'static str),

   /// The task metadata does not match the handler.
   #[error("unexpected metadata for {0}")]
   BadMeta(&'static str),

   /// One or more subtasks failed.
   #[error("{failed} of {total} subtasks failed")]
   Subtasks { failed: usize, total: usize },

   /// An upload chunk was malformed.
   #[error("bad upload chunk: {0}")]
   BadChunk(String),
}

/// Errors raised while applying actions to the journal.
#[derive(Debug, Error)]
pub enum JournalError {
   /// A create action targeted an identity that already has a live lifetime.
   #[error("lifetime already exists for {0}")]
   LifetimeExists(String),

   /// A non-create action targeted an identity with no live lifetime.
   #[error("no lifetime for {0}")]
   NoLifetime(String),

   /// The durable store rejected a flush.
   #[error("flush failed: {0}")]
   Flush(String),
}

/// Errors raised by core/backup replication.
#[derive(Debug, Error)]
pub enum ReplicationError {
   /// The bearer key was missing or did not match.
   #[error("unauthorized")]
   Unauthorized,

   /// The remote answered with a non-success status.
   #[error("{op} returned HTTP {status}")]
   Status { op: &'static str, status: u16 },

   /// The remote instance is not registered locally.
   #[error("unknown remote {0}")]
   UnknownRemote(String),

   /// The remote has no address to connect to.
   #[error("remote {0} has no core address")]
   NoAddress(String),

   /// The remote does not have the requested record.
   #[error("remote is missing {0}")]
   Missing(String),
}

impl From<figment::Error> for Error {
   fn from(e: figment::Error) -> Self {
      Self::Config(Box::new(e))
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
