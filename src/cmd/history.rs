//! Journal queries: the history of one file, or a directory as it was at a
//! past moment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use console::style;

use super::{blocking, portable};
use crate::{
   Result, config,
   journal::{FileAction, Journal, PastFile},
   store::{JsonStore, Store},
};

enum Report {
   Actions(Vec<FileAction>),
   Folder(Vec<PastFile>),
}

/// Prints the history of `path`, or with `at` the contents of the directory
/// `path` at that time.
pub async fn execute(path: String, at: Option<DateTime<Utc>>, json: bool) -> Result<()> {
   let cfg = config::get().clone();
   let report = blocking("history", move || {
      let store: Arc<dyn Store> = Arc::new(JsonStore::open(&cfg.data_dir)?);
      // Read-only: nothing is logged, so the server id is irrelevant.
      let journal = Journal::new("", store, usize::MAX);
      journal.load()?;
      match at {
         Some(t) => {
            let dir = portable(&cfg.root_alias, &path, true)?;
            Ok(Report::Folder(journal.get_past_folder_info(&dir, t)))
         },
         None => {
            let file = portable(&cfg.root_alias, &path, false)?;
            let mut actions = journal.get_file_history(&file);
            if actions.is_empty() {
               let dir = portable(&cfg.root_alias, &path, true)?;
               actions = journal.get_file_history(&dir);
            }
            Ok(Report::Actions(actions))
         },
      }
   })
   .await?;

   match report {
      Report::Actions(actions) if json => println!("{}", serde_json::to_string_pretty(&actions)?),
      Report::Folder(files) if json => println!("{}", serde_json::to_string_pretty(&files)?),
      Report::Actions(actions) => {
         if actions.is_empty() {
            println!("{}", style("No history").dim());
         }
         for a in actions {
            let path = a.subject_path().map(ToString::to_string).unwrap_or_default();
            println!(
               "{} {:<11} {path}",
               style(a.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
               format!("{:?}", a.action_type),
            );
         }
      },
      Report::Folder(files) => {
         if files.is_empty() {
            println!("{}", style("Empty").dim());
         }
         for f in files {
            let name = if f.is_dir { style(f.name).blue().bold() } else { style(f.name) };
            println!("  {name}");
         }
      },
   }
   Ok(())
}
