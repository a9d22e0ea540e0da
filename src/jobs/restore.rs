use std::{fs::File, sync::Arc};

use chrono::{DateTime, Utc};

use super::{Services, bad_meta};
use crate::{
   Result,
   error::ReplicationError,
   instance::Role,
   journal::Lifetime,
   replication::RestoreRequest,
   task::{Task, TaskMeta},
};

/// Rebuilds the core `remote_id` on the fresh server its client points at.
///
/// The target first takes over the core's identity, then receives every
/// lifetime that core created and the bytes of each live file, and finally
/// becomes a core.
pub(super) fn restore_core(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::RestoreCore { remote_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   s.instances.require_role("restore core", Role::Backup)?;
   let remote = s
      .instances
      .remote(remote_id)
      .filter(|r| r.role == Role::Core)
      .ok_or_else(|| ReplicationError::UnknownRemote(remote_id.to_string()))?;
   let client = s.core_client(remote_id)?;

   let local = s.instances.local();
   client.restore_init(&RestoreRequest {
      core_id:     remote.id.clone(),
      name:        remote.name.clone(),
      api_key:     remote.api_key.clone().unwrap_or_default(),
      backup_id:   local.id,
      backup_name: local.name,
   })?;
   task.sw_lap("init");

   let lifetimes: Vec<Lifetime> = s
      .journal
      .lifetimes_since(DateTime::<Utc>::UNIX_EPOCH)
      .into_iter()
      .filter(|l| l.actions.first().is_some_and(|a| a.server_id == *remote_id))
      .collect();
   let imported = client.restore_history(&lifetimes)?;
   task.sw_lap("history");
   task.set_result("lifetimes_sent", lifetimes.len());
   task.set_result("actions_imported", imported);
   task.check_exit()?;

   let files: Vec<&Lifetime> = lifetimes.iter().filter(|l| l.is_live() && !l.is_dir).collect();
   task.set_result("files_total", files.len());
   let mut restored = 0usize;
   for lifetime in files {
      task.check_exit()?;
      let Some(node) = lifetime.live_file_id.as_deref().and_then(|id| s.tree.get(id)) else {
         tracing::warn!(lifetime = %lifetime.id, "no local copy to restore");
         continue;
      };
      s.tree.add_task(&node, task);
      let content = File::open(s.tree.abs_path(&node))?;
      client.restore_file(&lifetime.id, Box::new(content))?;
      s.tree.remove_task(&node, task);
      restored += 1;
      task.set_result("files_restored", restored);
   }
   task.sw_lap("files");
   task.set_result("files_restored", restored);

   client.restore_complete()?;
   tracing::info!(%remote_id, lifetimes = lifetimes.len(), restored, "restored core");
   Ok(())
}
