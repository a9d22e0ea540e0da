//! CLI command implementations for strata.
//!
//! Each module corresponds to one subcommand. Commands assemble an
//! [`crate::app::App`] from the global configuration and drive it; anything
//! that blocks (file I/O, worker waits, the blocking HTTP client) runs on the
//! tokio blocking pool.

pub mod backup;
pub mod config;
pub mod history;
pub mod init;
pub mod restore;
pub mod serve;
pub mod stats;

use std::sync::Arc;

use crate::{
   Error, Result,
   error::TreeError,
   tree::{FileTree, Node, PortablePath},
};

/// Runs `f` on the blocking pool.
pub(crate) async fn blocking<T, F>(op: &'static str, f: F) -> Result<T>
where
   T: Send + 'static,
   F: FnOnce() -> Result<T> + Send + 'static,
{
   tokio::task::spawn_blocking(f)
      .await
      .map_err(|e| Error::Server { op, reason: e.to_string() })?
}

/// Portable path for a root-relative path typed by the user.
pub(crate) fn portable(alias: &str, rel: &str, is_dir: bool) -> Result<PortablePath> {
   let mut rel = rel.trim_matches('/').to_string();
   if is_dir && !rel.is_empty() {
      rel.push('/');
   }
   Ok(format!("{alias}:{rel}").parse::<PortablePath>()?)
}

/// Walks `rel` down from the root of `tree`.
pub(crate) fn resolve(tree: &FileTree, rel: Option<&str>) -> Result<Arc<Node>> {
   let mut node = tree.root();
   for part in rel.unwrap_or_default().split('/').filter(|p| !p.is_empty()) {
      node = node
         .child(part)
         .ok_or_else(|| TreeError::NotFound(format!("{}:{}", tree.alias(), rel.unwrap_or_default())))?;
   }
   Ok(node)
}
