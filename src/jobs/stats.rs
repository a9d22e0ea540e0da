use std::{collections::HashMap, path::Path, sync::Arc};

use rayon::prelude::*;
use serde::Serialize;

use super::{Services, bad_meta};
use crate::{
   Result,
   error::TreeError,
   task::{Task, TaskMeta},
   tree::collect_subtree,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionSize {
   pub name: String,
   pub size: i64,
}

/// Sums file sizes below a directory per lowercase extension, largest first.
pub(super) fn gather_fs_stats(s: &Services, task: &Arc<Task>) -> Result<()> {
   let TaskMeta::GatherFsStats { dir_id } = task.meta() else {
      return Err(bad_meta(task));
   };
   let dir = s.tree.get_or_err(dir_id)?;
   if !dir.is_dir() {
      return Err(TreeError::NotADirectory(dir.portable_path().to_string()).into());
   }

   let files: Vec<(String, i64)> = collect_subtree(&dir)
      .into_iter()
      .filter(|n| !n.is_dir())
      .map(|n| (n.name(), n.size().max(0)))
      .collect();
   task.check_exit()?;

   let by_ext = files
      .par_iter()
      .fold(HashMap::<String, i64>::new, |mut acc, (name, size)| {
         *acc.entry(extension_of(name)).or_default() += size;
         acc
      })
      .reduce(HashMap::new, |mut a, b| {
         for (ext, size) in b {
            *a.entry(ext).or_default() += size;
         }
         a
      });

   let mut sizes: Vec<ExtensionSize> = by_ext
      .into_iter()
      .map(|(name, size)| ExtensionSize { name, size })
      .collect();
   sizes.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));

   let total: i64 = sizes.iter().map(|e| e.size).sum();
   let free = fs4::available_space(s.tree.root_path())?;

   task.set_result("sizes_by_extension", &sizes);
   task.set_result("total_size", total);
   task.set_result("free_space", free);
   Ok(())
}

fn extension_of(name: &str) -> String {
   Path::new(name)
      .extension()
      .and_then(|e| e.to_str())
      .map_or_else(|| "other".to_string(), str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn extensions_fold_case() {
      assert_eq!(extension_of("A.JPG"), "jpg");
      assert_eq!(extension_of("Makefile"), "other");
   }
}
