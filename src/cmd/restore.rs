//! Rebuilds a lost core from this backup.

use std::sync::Arc;

use console::style;

use super::blocking;
use crate::{
   Error, Result,
   app::App,
   config,
   error::ReplicationError,
   replication::{CoreClient, HttpCoreClient},
   task::TaskState,
};

pub async fn execute(core: String, to: Option<String>) -> Result<()> {
   let cfg = config::get().clone();
   let (state, restored) = blocking("restore", move || {
      let app = App::open(cfg)?;
      app.load_tree()?;
      if let Some(address) = to {
         let remote = app
            .instances
            .remote(&core)
            .ok_or_else(|| ReplicationError::UnknownRemote(core.clone()))?;
         let client: Arc<dyn CoreClient> = Arc::new(HttpCoreClient::new(
            &address,
            remote.api_key.as_deref().unwrap_or_default(),
         )?);
         app.jobs.services().set_core_client(&core, client);
      }

      let task = app.jobs.restore_core(&core)?;
      task.wait();
      let state = task.exit_status().unwrap_or(TaskState::Error);
      let restored = task.get_result("files_restored").and_then(|v| v.as_u64()).unwrap_or(0);
      let err = task.read_error();
      app.shutdown()?;
      match err {
         Some(e) if state == TaskState::Error => {
            Err(Error::Server { op: "restore", reason: e.to_string() })
         },
         _ => Ok((state, restored)),
      }
   })
   .await?;

   if state != TaskState::Success {
      return Err(Error::Server { op: "restore", reason: format!("restore ended {state:?}") });
   }
   println!("{} restored {restored} files", style("●").green());
   Ok(())
}
