use std::{path::Path, sync::Arc};

use chrono::Utc;

use super::{BatchOutcome, Services, bad_meta};
use crate::{
   Result,
   error::TreeError,
   journal::FileEvent,
   store::TrashEntry,
   task::{Task, TaskMeta},
   tree::{Node, TRASH_DIR_NAME},
};

/// True for a user's trash directory, which lives directly in their home.
fn is_trash(dir: &Node) -> bool {
   dir.is_dir()
      && dir.name() == TRASH_DIR_NAME
      && dir.parent().is_some_and(|home| home.parent().is_some_and(|root| root.parent().is_none()))
}

/// `name` if free in `dir`, else `stem (n).ext` for the first free `n`.
fn unique_name(dir: &Node, name: &str) -> String {
   if dir.child(name).is_none() {
      return name.to_string();
   }
   let path = Path::new(name);
   let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
   let ext = path.extension().and_then(|e| e.to_str());
   (1u32..)
      .map(|n| match ext {
         Some(ext) => format!("{stem} ({n}).{ext}"),
         None => format!("{stem} ({n})"),
      })
      .find(|candidate| dir.child(candidate).is_none())
      .unwrap_or_else(|| name.to_string())
}

/// Moves every file into the destination. Moving into a trash directory
/// records a trash entry under a collision-free name; moving out of one
/// drops the entry. Files fail independently.
pub(super) fn move_files(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::MoveFile { file_ids, dest_id, new_name } = task.meta() else {
      return Err(bad_meta(task));
   };
   s.instances.require_not_backup("move")?;
   let dest = s.tree.get_or_err(dest_id)?;
   if dest.is_read_only() {
      return Err(TreeError::ReadOnly(dest.portable_path().to_string()).into());
   }
   // A rename only makes sense for a single file.
   let new_name = new_name.as_deref().filter(|_| file_ids.len() == 1);

   let event = s.journal.new_event();
   let mut outcome = BatchOutcome::default();
   for id in file_ids {
      if task.check_exit().is_err() {
         break;
      }
      let result = move_one(s, task, &event, id, &dest, new_name);
      outcome.record(id, result, |n| n.id());
   }
   if let Err(e) = s.journal.log_event(&event) {
      tracing::warn!(task_id = %task.id(), "failed to journal move: {e}");
   }
   task.check_exit()?;
   outcome.into_result(task)
}

fn move_one(
   s: &Services,
   task: &Arc<Task>,
   event: &FileEvent,
   id: &str,
   dest: &Arc<Node>,
   new_name: Option<&str>,
) -> Result<Arc<Node>> {
   let node = s.tree.get_or_err(id)?;
   if node.is_read_only() {
      return Err(TreeError::ReadOnly(node.portable_path().to_string()).into());
   }
   let from_trash = node.parent().is_some_and(|p| is_trash(&p));
   let old_id = node.id();
   let old_path = node.portable_path();

   if is_trash(dest) && !from_trash {
      let name = unique_name(dest, new_name.unwrap_or(&node.name()));
      let moved = s.tree.move_node(&node, dest, Some(&name), false, Some(event), Some(task))?;
      s.store.create_trash_entry(&TrashEntry {
         file_id:       moved.id(),
         original_path: old_path,
         trash_path:    moved.portable_path(),
         owner:         moved.owner().to_string(),
         timestamp:     Utc::now(),
      })?;
      return Ok(moved);
   }

   let moved = s.tree.move_node(&node, dest, new_name, false, Some(event), Some(task))?;
   if from_trash && !is_trash(dest) {
      s.store.delete_trash_entry(&old_id)?;
   }
   Ok(moved)
}

/// Permanently removes every file. Files fail independently.
pub(super) fn delete_files(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::DeleteFiles { file_ids } = task.meta() else {
      return Err(bad_meta(task));
   };
   s.instances.require_not_backup("delete")?;

   let event = s.journal.new_event();
   let mut outcome = BatchOutcome::default();
   for id in file_ids {
      if task.check_exit().is_err() {
         break;
      }
      let result = delete_one(s, task, &event, id);
      outcome.record(id, result, |()| id.clone());
   }
   if let Err(e) = s.journal.log_event(&event) {
      tracing::warn!(task_id = %task.id(), "failed to journal delete: {e}");
   }
   task.check_exit()?;
   outcome.into_result(task)
}

fn delete_one(s: &Services, task: &Arc<Task>, event: &FileEvent, id: &str) -> Result<()> {
   let node = s.tree.get_or_err(id)?;
   if node.is_read_only() {
      return Err(TreeError::ReadOnly(node.portable_path().to_string()).into());
   }
   let in_trash = node.parent().is_some_and(|p| is_trash(&p));
   s.tree.remove(&node, Some(event), Some(task))?;
   if in_trash {
      s.store.delete_trash_entry(id)?;
   }
   Ok(())
}
