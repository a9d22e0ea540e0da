use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Result, jobs::Jobs, task::TaskState};

/// Runs a backup of every paired core on a fixed interval.
#[derive(Debug, Clone)]
pub struct BackupDaemon {
   jobs:     Jobs,
   interval: Duration,
   token:    CancellationToken,
}

impl BackupDaemon {
   pub fn new(jobs: Jobs, interval: Duration) -> Self {
      Self { jobs, interval, token: CancellationToken::new() }
   }

   pub fn cancellation(&self) -> CancellationToken {
      self.token.clone()
   }

   pub fn stop(&self) {
      self.token.cancel();
   }

   /// Backs up every core once, in turn. Returns the final state of each
   /// backup task by remote id.
   pub fn run_once(&self) -> Vec<(String, Result<TaskState>)> {
      let cores = self.jobs.services().instances.cores();
      let mut out = Vec::with_capacity(cores.len());
      for core in cores {
         if self.token.is_cancelled() {
            break;
         }
         let result = self.jobs.backup(&core.id).map(|task| {
            task.wait();
            if let Some(err) = task.read_error() {
               tracing::warn!(remote = %core.id, "backup failed: {err}");
            }
            task.state()
         });
         out.push((core.id, result));
      }
      out
   }

   /// Loops [`BackupDaemon::run_once`] until stopped. Backups block, so each
   /// cycle runs on the blocking pool.
   pub async fn run(self) {
      tracing::info!(interval = ?self.interval, "backup daemon started");
      loop {
         let me = self.clone();
         match tokio::task::spawn_blocking(move || me.run_once()).await {
            Ok(results) => tracing::debug!(cores = results.len(), "backup cycle done"),
            Err(e) => tracing::error!("backup cycle panicked: {e}"),
         }
         tokio::select! {
            () = self.token.cancelled() => break,
            () = tokio::time::sleep(self.interval) => {},
         }
      }
      tracing::info!("backup daemon stopped");
   }
}
