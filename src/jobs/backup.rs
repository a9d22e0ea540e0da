use std::{
   fs::{self, File},
   io,
   sync::Arc,
};

use chrono::{DateTime, Utc};

use super::{Services, bad_meta, scan::hash_node};
use crate::{
   Result,
   error::{TaskError, TreeError},
   instance::Role,
   journal::Lifetime,
   task::{Task, TaskMeta, TaskPool, WorkerPool},
   tree::{FileTree, Node, PortablePath},
};

/// One replication cycle against the core `remote_id`.
///
/// Pulls every action at or after the newest one already imported from that
/// core, imports them, then brings the local tree in line with each touched
/// lifetime: deleted files are removed, moved files are moved, new files are
/// created, and files whose content differs are copied from the core on a
/// child pool.
pub(super) fn backup(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::Backup { remote_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   s.instances.require_role("backup", Role::Backup)?;
   let client = s.core_client(remote_id)?;

   let since = s
      .journal
      .latest_action_from(remote_id)
      .map_or(DateTime::<Utc>::UNIX_EPOCH, |a| a.timestamp);
   tracing::debug!(%remote_id, %since, "starting backup");

   let actions = client.history_since(since)?;
   task.sw_lap("history");
   let fetched = actions.len();
   let imported = match s.journal.import(actions) {
      Ok(n) => n,
      Err(e) => {
         tracing::warn!(%remote_id, "some core actions did not apply: {e}");
         0
      },
   };
   task.check_exit()?;

   // Replaying in the order the changes happened keeps a file moved away
   // from a path out of the way of a newer file created there.
   let mut lifetimes = s.journal.lifetimes_since(since);
   lifetimes.sort_by_cached_key(|l| {
      l.actions
         .iter()
         .find(|a| a.timestamp >= since)
         .map(|a| a.sort_key())
   });

   let workers = task.worker_pool()?;
   let pool = workers.new_task_pool(false, Some(task));
   let mut copies = 0usize;
   let reconciled = (|| -> Result<()> {
      for lifetime in &lifetimes {
         task.check_exit()?;
         if reconcile(s, task, lifetime, remote_id, &workers, &pool)? {
            copies += 1;
         }
      }
      Ok(())
   })();
   pool.signal_all_queued();
   pool.wait(true);
   reconciled?;
   task.check_exit()?;

   task.set_result("actions_fetched", fetched);
   task.set_result("actions_imported", imported);
   task.set_result("files_copied", copies);

   let failed = pool.errors().len();
   if failed > 0 {
      return Err(TaskError::Subtasks { failed, total: copies }.into());
   }
   s.instances.set_last_backup(remote_id, Utc::now())?;
   tracing::info!(%remote_id, imported, copies, "backup complete");
   Ok(())
}

/// Brings the local tree in line with one lifetime and queues a content copy
/// when the file's bytes differ from the core's. Returns whether a copy was
/// queued.
fn reconcile(
   s: &Services,
   task: &Arc<Task>,
   lifetime: &Lifetime,
   remote_id: &str,
   workers: &Arc<WorkerPool>,
   pool: &Arc<TaskPool>,
) -> Result<bool> {
   let Some(node) = apply_lifetime(&s.tree, lifetime, Some(task))? else {
      return Ok(false);
   };
   if node.is_dir() || (node.content_id().is_some() && node.content_id() == lifetime.content_id) {
      return Ok(false);
   }
   workers.dispatch_job(
      TaskMeta::CopyFileFromCore { file_id: node.id(), remote_id: remote_id.to_string() },
      Some(pool),
   )?;
   Ok(true)
}

/// Applies one lifetime's final state to `tree`: a deleted file is removed,
/// a moved one is moved, a missing one is created at its final path. Returns
/// the live node, or `None` when the lifetime ended in a delete.
pub(crate) fn apply_lifetime(
   tree: &FileTree,
   lifetime: &Lifetime,
   by: Option<&Arc<Task>>,
) -> Result<Option<Arc<Node>>> {
   let state = lifetime.replay();
   let existing = lifetime
      .actions
      .iter()
      .rev()
      .flat_map(|a| [a.destination_id.as_ref(), a.origin_id.as_ref()])
      .flatten()
      .find_map(|id| tree.get(id))
      .filter(|n| n.parent().is_some());

   if !state.live {
      if let Some(node) = existing {
         tree.remove(&node, None, by)?;
      }
      return Ok(None);
   }
   let (Some(path), Some(file_id)) = (state.path, state.file_id) else {
      return Ok(None);
   };
   let parent_path = path
      .parent()
      .ok_or_else(|| TreeError::BadPath(path.to_string()))?;

   let node = match existing {
      Some(node) if node.id() == file_id => node,
      Some(node) => {
         let parent = ensure_dirs(tree, &parent_path)?;
         tree.move_node(&node, &parent, Some(path.filename()), true, None, by)?
      },
      None => {
         let parent = ensure_dirs(tree, &parent_path)?;
         if lifetime.is_dir {
            tree.mkdir_or_get(&parent, path.filename(), None)?
         } else {
            tree.touch(&parent, path.filename(), None)?
         }
      },
   };
   Ok(Some(node))
}

/// Returns the directory at `path`, creating missing directories on the way.
fn ensure_dirs(tree: &FileTree, path: &PortablePath) -> Result<Arc<Node>> {
   let mut dir = tree.root();
   for name in path.components() {
      dir = tree.mkdir_or_get(&dir, name, None)?;
   }
   Ok(dir)
}

/// Downloads one file's bytes from the core, replacing the local content.
pub(super) fn copy_file_from_core(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::CopyFileFromCore { file_id, remote_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   let node = s.tree.get_or_err(file_id)?;
   s.tree.add_task(&node, task);
   let client = s.core_client(remote_id)?;
   let info = client.file_info(file_id)?;

   let abs = s.tree.abs_path(&node);
   let part = abs.with_file_name(format!("{}.part", node.name()));
   let copied = (|| -> Result<u64> {
      let mut reader = client.file_content(file_id)?;
      let mut out = File::create(&part)?;
      let n = io::copy(&mut reader, &mut out)?;
      out.sync_all()?;
      Ok(n)
   })();
   let copied = match copied {
      Ok(n) => n,
      Err(e) => {
         let _ = fs::remove_file(&part);
         return Err(e);
      },
   };
   task.check_exit()?;
   fs::rename(&part, &abs)?;

   s.tree.record_write(&node, None)?;
   let content_id = hash_node(s, &node)?;
   if let Some(expected) = &info.content_id
      && expected != &content_id
   {
      tracing::warn!(
         file = %node.portable_path(),
         %expected,
         got = %content_id,
         "copied content differs from core"
      );
   }

   let event = s.journal.new_event();
   event.new_backup_action(&node);
   s.journal.log_event(&event)?;
   s.tree.remove_task(&node, task);
   task.set_result("bytes", copied);
   Ok(())
}
