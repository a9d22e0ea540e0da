//! Long-running server command.
//!
//! Loads the media root, keeps the worker pool and journal flusher running
//! and, on a backup, replicates every paired core on an interval until
//! interrupted.

use std::sync::Arc;

use console::style;
use tokio::signal;

use super::blocking;
use crate::{
   Result,
   app::App,
   config,
   instance::Role,
   replication::BackupDaemon,
   tree::ROOT_ID,
};

/// Executes the serve command.
pub async fn execute(scan: bool) -> Result<()> {
   let cfg = config::get().clone();
   let app = Arc::new(blocking("open", move || App::open(cfg)).await?);

   let loader = Arc::clone(&app);
   let nodes = blocking("load", move || loader.load_tree()).await?;

   let local = app.instances.local();
   println!("{}", style("Starting strata server...").green().bold());
   println!("Root: {}", style(app.tree.root_path().display()).dim());
   println!("Instance: {} ({})", style(&local.id).cyan(), local.role);
   println!("Files: {nodes}");

   if scan && local.role != Role::Backup {
      let task = app.jobs.scan_directory(ROOT_ID, None)?;
      tracing::info!(task_id = %task.id(), "initial scan queued");
   }

   let daemon = (local.role == Role::Backup)
      .then(|| BackupDaemon::new(app.jobs.clone(), app.config.backup_interval()));
   let handle = daemon.clone().map(|d| tokio::spawn(d.run()));

   signal::ctrl_c().await?;
   println!("{}", style("Shutting down...").yellow());

   if let Some(daemon) = &daemon {
      daemon.stop();
   }
   if let Some(handle) = handle
      && let Err(e) = handle.await
   {
      tracing::warn!("backup daemon ended abnormally: {e}");
   }

   let closer = Arc::clone(&app);
   blocking("shutdown", move || closer.shutdown()).await
}
