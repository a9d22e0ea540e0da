//! One-shot backup of every paired core.

use console::style;

use super::blocking;
use crate::{Error, Result, app::App, config, replication::BackupDaemon, task::TaskState};

pub async fn execute() -> Result<()> {
   let cfg = config::get().clone();
   let results = blocking("backup", move || {
      let app = App::open(cfg)?;
      app.load_tree()?;
      let daemon = BackupDaemon::new(app.jobs.clone(), app.config.backup_interval());
      let results = daemon.run_once();
      app.shutdown()?;
      Ok(results)
   })
   .await?;

   if results.is_empty() {
      println!("{}", style("No cores paired").dim());
      return Ok(());
   }

   let mut failed = 0usize;
   for (remote, result) in &results {
      match result {
         Ok(TaskState::Success) => println!("  {} {remote}", style("●").green()),
         Ok(state) => {
            failed += 1;
            println!("  {} {remote} {}", style("●").yellow(), style(format!("({state:?})")).dim());
         },
         Err(e) => {
            failed += 1;
            println!("  {} {remote} {}", style("●").red(), style(e).dim());
         },
      }
   }

   if failed > 0 {
      return Err(Error::Server {
         op:     "backup",
         reason: format!("{failed} of {} backups did not succeed", results.len()),
      });
   }
   Ok(())
}
