use std::{
   fs::{self, File},
   io::BufReader,
   path::{Path, PathBuf},
   sync::Arc,
};

use tar::{Builder, Header};

use super::{Services, bad_meta};
use crate::{
   Result,
   broadcast::{TaskEvent, TaskUpdate},
   task::{Task, TaskMeta},
   tree::{FileId, Node, collect_subtree},
   util::short_hash,
};

/// Stable archive id for a set of files, independent of their order.
pub fn takeout_id(file_ids: &[FileId]) -> String {
   let mut ids = file_ids.to_vec();
   ids.sort();
   ids.dedup();
   short_hash(ids.join(",").as_bytes(), 16)
}

/// Archives the selected files and directories under the cache directory.
/// An archive already built for the same selection is reused.
pub(super) fn create_zip(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::CreateZip { file_ids } = task.meta() else {
      return Err(bad_meta(task));
   };
   task.set_persistent(true);

   let takeout = takeout_id(file_ids);
   let dir = s.cache_dir.join("takeout");
   fs::create_dir_all(&dir)?;
   let out = dir.join(format!("{takeout}.tar"));
   task.set_result("takeout_id", &takeout);
   task.set_result("path", out.display().to_string());

   if out.exists() {
      tracing::debug!(takeout, "reusing existing archive");
      task.set_result("reused", true);
      return Ok(());
   }

   let roots = file_ids
      .iter()
      .map(|id| s.tree.get_or_err(id))
      .collect::<Result<Vec<_>>>()?;

   let tmp = out.with_extension("tar.part");
   let built = build_archive(s, task, &roots, &tmp);
   if let Err(e) = built {
      let _ = fs::remove_file(&tmp);
      return Err(e);
   }
   fs::rename(&tmp, &out)?;
   Ok(())
}

fn build_archive(s: &Services, task: &Arc<Task>, roots: &[Arc<Node>], tmp: &Path) -> Result<()> {
   let entries: Vec<(Arc<Node>, PathBuf)> = roots
      .iter()
      .flat_map(|root| {
         let base = root
            .parent()
            .map_or_else(|| s.tree.root_path().to_path_buf(), |p| s.tree.abs_path(&p));
         collect_subtree(root).into_iter().map(move |n| (n, base.clone()))
      })
      .collect();
   let total = entries.len() as i64;
   let workers = task.worker_pool()?;

   let mut builder = Builder::new(File::create(tmp)?);
   for (done, (node, base)) in entries.iter().enumerate() {
      task.check_exit()?;
      let abs = s.tree.abs_path(node);
      let name = abs.strip_prefix(base).unwrap_or(&abs).to_path_buf();
      let metadata = fs::metadata(&abs)?;
      let mut header = Header::new_gnu();
      header.set_metadata(&metadata);
      if node.is_dir() {
         header.set_size(0);
         builder.append_data(&mut header, &name, std::io::empty())?;
      } else {
         header.set_size(metadata.len());
         builder.append_data(&mut header, &name, BufReader::new(File::open(&abs)?))?;
      }

      let done = done as i64 + 1;
      task.set_result("progress", done * 100 / total.max(1));
      workers
         .broadcaster()
         .push_task_update(TaskUpdate::for_task(task, TaskEvent::Progress, total - done, total));
   }
   builder.into_inner()?.sync_all()?;
   Ok(())
}
