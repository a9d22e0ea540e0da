//! Journaled file tree, task engine and core/backup replication for a
//! self-hosted media server.

pub mod app;
pub mod broadcast;
pub mod cmd;
pub mod config;
pub mod error;
pub mod instance;
pub mod jobs;
pub mod journal;
pub mod media;
pub mod replication;
pub mod store;
pub mod task;
pub mod tree;
pub mod util;

pub use error::{Error, Result};
