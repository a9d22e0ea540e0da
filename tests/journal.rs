mod support;

use std::{sync::Arc, thread, time::Duration};

use chrono::{DateTime, Utc};
use strata::{
   Error,
   error::JournalError,
   journal::{ActionType, Journal},
   store::{MemoryStore, Store},
   tree::PortablePath,
};
use support::Harness;

fn path(s: &str) -> PortablePath {
   s.parse().expect("portable path")
}

/// A timestamp strictly between whatever happened before and after it.
fn pause() -> DateTime<Utc> {
   thread::sleep(Duration::from_millis(15));
   let t = Utc::now();
   thread::sleep(Duration::from_millis(15));
   t
}

#[test]
fn rename_keeps_one_history_and_answers_past_folder_queries() {
   let h = Harness::new();
   let a = h.home("a");
   let file = h.file(&a, "b.txt", b"hello");
   let before_rename = pause();
   h.tree.move_node(&file, &a, Some("c.txt"), false, None, None).expect("rename");
   let after_rename = pause();

   let history = h.journal.get_file_history(&path("MEDIA:a/c.txt"));
   let kinds: Vec<ActionType> = history.iter().map(|x| x.action_type).collect();
   assert_eq!(kinds, vec![ActionType::Create, ActionType::Move]);
   assert_eq!(history[0].destination_path, Some(path("MEDIA:a/b.txt")));
   assert_eq!(history[1].origin_path, Some(path("MEDIA:a/b.txt")));
   assert_eq!(history[1].destination_path, Some(path("MEDIA:a/c.txt")));

   // The old path resolves to the same lifetime.
   assert_eq!(h.journal.get_file_history(&path("MEDIA:a/b.txt")), history);

   let then = h.journal.get_past_folder_info(&path("MEDIA:a/"), before_rename);
   assert_eq!(then.len(), 1);
   assert_eq!(then[0].name, "b.txt");
   assert_eq!(then[0].size, 5);

   let now = h.journal.get_past_folder_info(&path("MEDIA:a/"), after_rename);
   assert_eq!(now.len(), 1);
   assert_eq!(now[0].name, "c.txt");
   assert_eq!(now[0].id, file.id());
   assert_eq!(then[0].lifetime_id, now[0].lifetime_id);

   let by_path = h.journal.get_actions_by_path(&path("MEDIA:a/b.txt"));
   assert_eq!(by_path.len(), 2);
}

#[test]
fn deleted_files_stay_in_past_listings() {
   let h = Harness::new();
   let a = h.home("a");
   let file = h.file(&a, "gone.jpg", b"x");
   let before_delete = pause();
   h.tree.remove(&file, None, None).expect("remove");
   let after_delete = pause();

   let then = h.journal.get_past_folder_info(&path("MEDIA:a/"), before_delete);
   assert_eq!(then.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["gone.jpg"]);
   assert!(h.journal.get_past_folder_info(&path("MEDIA:a/"), after_delete).is_empty());

   let history = h.journal.get_file_history(&path("MEDIA:a/gone.jpg"));
   assert_eq!(history.last().map(|x| x.action_type), Some(ActionType::Delete));
}

#[test]
fn past_listing_before_creation_is_empty() {
   let h = Harness::new();
   let a = h.home("a");
   let t = pause();
   h.file(&a, "new.jpg", b"x");
   assert!(h.journal.get_past_folder_info(&path("MEDIA:a/"), t).is_empty());
}

#[test]
fn replaying_a_lifetime_reconstructs_the_live_node() {
   let h = Harness::new();
   let a = h.home("a");
   let inner = h.mkdir(&a, "inner");
   let dest = h.mkdir(&a, "dest");
   let file = h.file(&inner, "x.jpg", b"abc");
   h.tree.move_node(&inner, &dest, None, false, None, None).expect("move dir");
   h.tree.move_node(&file, &a, Some("y.jpg"), false, None, None).expect("move file");

   let lifetime = h.journal.lifetime_for_file(&file.id()).expect("lifetime");
   let state = lifetime.replay();
   assert!(state.live);
   assert_eq!(state.file_id, Some(file.id()));
   assert_eq!(state.path, Some(path("MEDIA:a/y.jpg")));
   assert_eq!(state.size, 3);
   assert_eq!(lifetime.actions.len(), 3);

   // Order of the input does not matter.
   let mut shuffled = lifetime.actions.clone();
   shuffled.reverse();
   assert_eq!(strata::journal::replay(&shuffled), state);
}

#[test]
fn duplicate_create_is_rejected() {
   let h = Harness::new();
   let a = h.home("a");
   let file = h.file(&a, "x.jpg", b"abc");

   let event = h.journal.new_event();
   event.new_create_action(&file);
   let err = h.journal.log_event(&event).expect_err("lifetime exists");
   assert!(matches!(err, Error::Journal(JournalError::LifetimeExists(_))));
}

#[test]
fn buffered_actions_flush_at_threshold() {
   let store = Arc::new(MemoryStore::new());
   let h = Harness::new();
   let journal = Journal::new("server", store.clone(), 3);
   let a = h.home("a");

   let event = journal.new_event();
   event.new_create_action(&a);
   journal.log_event(&event).expect("log");
   assert_eq!(journal.pending_len(), 1);
   assert!(store.appended().is_empty());

   let event = journal.new_event();
   let b = h.file(&a, "b.jpg", b"b");
   let c = h.file(&a, "c.jpg", b"c");
   event.new_create_action(&b);
   event.new_create_action(&c);
   journal.log_event(&event).expect("log");
   assert_eq!(journal.pending_len(), 0);
   assert_eq!(store.appended().len(), 3);
}

#[test]
fn failed_flush_keeps_the_batch_for_the_next_attempt() {
   let store = Arc::new(MemoryStore::new());
   let h = Harness::new();
   let journal = Journal::new("server", store.clone(), 1);
   let a = h.home("a");

   store.set_fail_appends(true);
   let event = journal.new_event();
   event.new_create_action(&a);
   journal.log_event(&event).expect("apply succeeds even if the flush fails");
   assert_eq!(journal.pending_len(), 1);
   assert!(matches!(journal.flush(), Err(Error::Journal(JournalError::Flush(_)))));
   assert_eq!(journal.pending_len(), 1);

   store.set_fail_appends(false);
   journal.flush().expect("flush");
   assert_eq!(journal.pending_len(), 0);
   assert_eq!(store.appended().len(), 1);
}

#[test]
fn periodic_flusher_drains_the_buffer() {
   let store = Arc::new(MemoryStore::new());
   let h = Harness::new();
   let journal = Arc::new(Journal::new("server", store.clone(), 1000));
   journal.spawn_flusher(Duration::from_millis(20)).expect("flusher");
   let a = h.home("a");

   let event = journal.new_event();
   event.new_create_action(&a);
   journal.log_event(&event).expect("log");
   assert!(support::eventually(Duration::from_secs(5), || store.appended().len() == 1));
   journal.stop_flusher();
}

#[test]
fn reload_from_store_restores_lifetimes_and_sequence() {
   let h = Harness::new();
   let a = h.home("a");
   let file = h.file(&a, "x.jpg", b"abc");
   h.tree.move_node(&file, &a, Some("y.jpg"), false, None, None).expect("move");
   h.journal.flush().expect("flush");

   let store: Arc<dyn Store> = h.store.clone();
   let reloaded = Journal::new(&h.journal.server_id(), store, 1000);
   let count = reloaded.load().expect("load");
   assert_eq!(count, h.store.appended().len());

   let original = h.journal.lifetime_for_file(&file.id()).expect("original");
   let restored = reloaded.lifetime_for_file(&file.id()).expect("restored");
   assert_eq!(original.id, restored.id);
   assert_eq!(original.actions, restored.actions);

   let max_seq = original.actions.iter().map(|x| x.seq).max().unwrap_or(0);
   let event = reloaded.new_event();
   event.new_write_action(&file);
   let next = event.actions()[0].seq;
   assert!(next > max_seq, "sequence continues after reload");
}

#[test]
fn import_is_idempotent() {
   let source = Harness::new();
   let a = source.home("a");
   source.file(&a, "x.jpg", b"abc");

   let target = Journal::new("backup", Arc::new(MemoryStore::new()), 1000);
   let actions = source.journal.actions_since(DateTime::<Utc>::UNIX_EPOCH);
   assert_eq!(actions.len(), 2);
   assert_eq!(target.import(actions.clone()).expect("import"), 2);
   assert_eq!(target.import(actions).expect("re-import"), 0);
   assert_eq!(target.active_lifetimes().len(), 2);
   assert_eq!(
      target.latest_action_from(&source.journal.server_id()).map(|x| x.seq),
      source.journal.latest_action().map(|x| x.seq)
   );
}

#[test]
fn adopted_server_id_numbers_after_imported_actions() {
   let source = Harness::new();
   let a = source.home("a");
   let file = source.file(&a, "x.jpg", b"abc");

   let target = Journal::new("fresh", Arc::new(MemoryStore::new()), 1000);
   target.adopt_server_id(&source.journal.server_id());
   target
      .import(source.journal.actions_since(DateTime::<Utc>::UNIX_EPOCH))
      .expect("import");

   let imported_max = source.journal.latest_action().map_or(0, |x| x.seq);
   let event = target.new_event();
   event.new_write_action(&file);
   let action = &event.actions()[0];
   assert_eq!(action.server_id, source.journal.server_id());
   assert!(action.seq > imported_max, "own sequence continues after import");
   target.log_event(&event).expect("log");
   assert_eq!(target.lifetime_for_file(&file.id()).map(|l| l.actions.len()), Some(2));
}

#[test]
fn ignore_local_keeps_only_backup_records() {
   let h = Harness::new();
   let a = h.home("a");
   let file = h.file(&a, "x.jpg", b"abc");
   let journal = Journal::new("backup", Arc::new(MemoryStore::new()), 1000);
   journal.import(h.journal.actions_since(DateTime::<Utc>::UNIX_EPOCH)).expect("import");
   journal.set_ignore_local(true);

   let event = journal.new_event();
   event.new_write_action(&file);
   event.new_backup_action(&file);
   journal.log_event(&event).expect("log");

   let actions = journal.lifetime_for_file(&file.id()).expect("lifetime").actions;
   let kinds: Vec<ActionType> = actions.iter().map(|x| x.action_type).collect();
   assert_eq!(kinds, vec![ActionType::Create, ActionType::Backup]);
}

#[test]
fn since_queries_are_inclusive_and_ordered() {
   let h = Harness::new();
   let a = h.home("a");
   let t = pause();
   let x = h.file(&a, "x.jpg", b"x");
   h.file(&a, "y.jpg", b"y");

   let since = h.journal.actions_since(t);
   assert_eq!(since.len(), 2);
   assert!(since.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));

   let exact = h.journal.actions_since(since[0].timestamp);
   assert_eq!(exact.len(), 2, "an action at exactly `since` is included");

   let lifetimes = h.journal.lifetimes_since(t);
   assert_eq!(lifetimes.len(), 2);
   assert_eq!(lifetimes[0].live_file_id, Some(x.id()));
}
