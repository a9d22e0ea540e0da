use std::{fs::File, sync::Arc};

use super::{Services, bad_meta};
use crate::{
   Result,
   error::{TaskError, TreeError},
   instance::Role,
   media::is_displayable,
   task::{Task, TaskMeta},
   tree::{Node, collect_subtree},
   util::hash_reader,
};

/// Queues a file scan for every displayable file below the directory whose
/// content is not imported yet, then waits for all of them.
pub(super) fn scan_directory(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::ScanDirectory { dir_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   if s.instances.role() == Role::Backup {
      tracing::debug!(%dir_id, "skipping directory scan on backup");
      return Ok(());
   }
   let dir = s.tree.get_or_err(dir_id)?;
   if !dir.is_dir() {
      return Err(TreeError::NotADirectory(dir.portable_path().to_string()).into());
   }
   s.tree.add_task(&dir, task);

   let workers = task.worker_pool()?;
   let pool = workers.new_task_pool(false, Some(task));

   let mut queued = 0usize;
   let mut queue_all = || -> Result<()> {
      for node in collect_subtree(&dir) {
         task.check_exit()?;
         if node.is_dir() || !is_displayable(&node.name()) {
            continue;
         }
         if node.content_id().is_some_and(|c| s.media.is_imported(&c)) {
            continue;
         }
         workers.dispatch_job(TaskMeta::ScanFile { file_id: node.id() }, Some(&pool))?;
         queued += 1;
      }
      Ok(())
   };
   let queued_result = queue_all();

   // Subtasks already queued finish either way; the pool must be sealed
   // before waiting or the wait never ends.
   pool.signal_all_queued();
   pool.wait(true);
   s.tree.remove_task(&dir, task);

   if let Err(e) = queued_result {
      task.check_exit()?;
      return Err(e);
   }
   task.check_exit()?;

   s.tree.resize_down(&dir);
   let failed = pool.errors().len();
   task.set_result("files_queued", queued);
   tracing::debug!(dir = %dir.portable_path(), queued, failed, "directory scan done");
   if failed > 0 {
      return Err(TaskError::Subtasks { failed, total: queued }.into());
   }
   Ok(())
}

/// Hashes the file if needed and hands new content to the media processor.
pub(super) fn scan_file(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::ScanFile { file_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   let node = s.tree.get_or_err(file_id)?;
   if node.is_dir() {
      return Ok(());
   }
   s.tree.add_task(&node, task);
   task.check_exit()?;

   let content_id = match node.content_id() {
      Some(cid) => cid,
      None => hash_node(s, &node)?,
   };
   task.sw_lap("hash");
   task.check_exit()?;

   if !s.media.is_imported(&content_id) {
      s.processor.process(&content_id, &s.tree.abs_path(&node))?;
      s.media.mark_imported(&content_id);
      task.sw_lap("process");
   }
   s.tree.remove_task(&node, task);
   task.set_result("content_id", &content_id);
   Ok(())
}

/// Recomputes the content id of one file.
pub(super) fn hash_file(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::HashFile { file_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   let node = s.tree.get_or_err(file_id)?;
   if node.is_dir() {
      return Err(TreeError::BadPath(format!("{} is a directory", node.portable_path())).into());
   }
   s.tree.add_task(&node, task);
   let content_id = hash_node(s, &node)?;
   s.tree.remove_task(&node, task);
   task.set_result("content_id", &content_id);
   Ok(())
}

/// Hashes the file's bytes and attaches the resulting content id.
pub(super) fn hash_node(s: &Services, node: &Arc<Node>) -> Result<String> {
   let path = s.tree.abs_path(node);
   let file = File::open(&path)?;
   let expected = file.metadata()?.len();
   let (content_id, got) = hash_reader(file)?;
   if got < expected {
      return Err(TreeError::ShortRead { path, expected, got }.into());
   }
   s.tree.set_content_id(node, &content_id)?;
   Ok(content_id)
}
