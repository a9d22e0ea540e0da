//! Disk usage by extension below a directory.

use console::style;
use serde_json::Value;

use super::{blocking, resolve};
use crate::{Error, Result, app::App, config, util::format_size};

pub async fn execute(path: Option<String>, json: bool) -> Result<()> {
   let cfg = config::get().clone();
   let results = blocking("stats", move || {
      let app = App::open(cfg)?;
      app.load_tree()?;
      let dir = resolve(&app.tree, path.as_deref())?;
      let task = app.jobs.gather_fs_stats(&dir.id())?;
      task.wait();
      let results = task.results();
      let err = task.read_error();
      app.shutdown()?;
      match err {
         Some(err) => Err(Error::Shared(err)),
         None => Ok(results),
      }
   })
   .await?;

   if json {
      println!("{}", serde_json::to_string_pretty(&results)?);
      return Ok(());
   }

   let bytes = |key: &str| results.get(key).and_then(Value::as_u64).unwrap_or(0);
   if let Some(Value::Array(sizes)) = results.get("sizes_by_extension") {
      for entry in sizes {
         let name = entry.get("name").and_then(Value::as_str).unwrap_or("?");
         let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
         println!("  {:<10} {}", name, style(format_size(size)).cyan());
      }
   }
   println!("{} {}", style("Total:").bold(), format_size(bytes("total_size")));
   println!("{} {}", style("Free:").bold(), format_size(bytes("free_space")));
   Ok(())
}
