mod support;

use std::{
   fs::File,
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   thread,
   time::Duration,
};

use serde_json::json;
use strata::{
   Error, Result,
   error::{TaskError, TreeError},
   instance::Role,
   jobs::BatchOutcome,
   media::MediaProcessor,
   store::Store,
   task::{Task, TaskKind, TaskState},
   tree::TRASH_DIR_NAME,
};
use support::{Harness, eventually, wait_for};

/// Blocks every `process` call until opened.
#[derive(Default)]
struct Gate {
   open:    AtomicBool,
   entered: AtomicUsize,
}

impl MediaProcessor for Gate {
   fn process(&self, _content_id: &str, _path: &Path) -> Result<()> {
      self.entered.fetch_add(1, Ordering::AcqRel);
      while !self.open.load(Ordering::Acquire) {
         thread::sleep(Duration::from_millis(2));
      }
      Ok(())
   }
}

/// Cancels the scan it is handed as soon as the first file reaches it.
#[derive(Default)]
struct CancelOnFirst {
   scan:    parking_lot::Mutex<Option<Arc<Task>>>,
   entered: AtomicUsize,
}

impl MediaProcessor for CancelOnFirst {
   fn process(&self, _content_id: &str, _path: &Path) -> Result<()> {
      if self.entered.fetch_add(1, Ordering::AcqRel) == 0 {
         loop {
            if let Some(scan) = self.scan.lock().as_ref() {
               scan.cancel();
               break;
            }
            thread::sleep(Duration::from_millis(1));
         }
      }
      Ok(())
   }
}

fn outcome(task: &strata::task::Task) -> BatchOutcome {
   serde_json::from_value(task.get_result("outcome").expect("outcome")).expect("outcome json")
}

#[test]
fn scan_imports_displayable_files_once() {
   let h = Harness::new();
   let home = h.home("alice");
   let album = h.mkdir(&home, "album");
   for i in 0..5 {
      h.file(&album, &format!("{i}.jpg"), format!("image {i}").as_bytes());
   }
   h.file(&album, "notes.txt", b"not media");

   let scan = h.jobs.scan_directory(&home.id(), None).expect("scan");
   wait_for(&scan, 10);
   assert_eq!(scan.exit_status(), Some(TaskState::Success));
   assert_eq!(scan.get_result("files_queued"), Some(json!(5)));

   let jpg = album.child("0.jpg").expect("0.jpg");
   let content_id = jpg.content_id().expect("hashed");
   assert!(h.media.is_imported(&content_id));
   assert!(album.child("notes.txt").expect("notes").content_id().is_none());

   let again = h.jobs.scan_directory(&home.id(), None).expect("rescan");
   wait_for(&again, 10);
   assert_eq!(again.get_result("files_queued"), Some(json!(0)));
}

#[test]
fn cancelled_scan_waits_for_its_subtasks() {
   let gate = Arc::new(Gate::default());
   let h = Harness::with_processor(gate.clone());
   let home = h.home("alice");
   for i in 0..5 {
      h.file(&home, &format!("{i}.jpg"), format!("image {i}").as_bytes());
   }

   let scan = h.jobs.scan_directory(&home.id(), None).expect("scan");
   assert!(eventually(Duration::from_secs(5), || gate.entered.load(Ordering::Acquire) > 0));
   scan.cancel();
   assert_eq!(scan.state(), TaskState::Cancelled);
   gate.open.store(true, Ordering::Release);

   wait_for(&scan, 10);
   assert_eq!(scan.exit_status(), Some(TaskState::Cancelled));
}

#[test]
fn scan_cancelled_before_queueing_still_settles() {
   let h = Harness::new();
   let home = h.home("alice");
   let file = h.file(&home, "a.jpg", b"a");

   // Hold the directory claim so the scan is cancelled before it queues.
   let release = Arc::new(AtomicBool::new(false));
   {
      let (tree, release) = (Arc::clone(&h.tree), Arc::clone(&release));
      let dir = Arc::clone(&home);
      h.workers.register_job(
         TaskKind::GatherFsStats,
         Arc::new(move |task: &Arc<Task>| -> Result<()> {
            tree.add_task(&dir, task);
            while !release.load(Ordering::Acquire) {
               thread::sleep(Duration::from_millis(2));
            }
            Ok(())
         }),
      );
   }
   let holder = h.jobs.gather_fs_stats(&home.id()).expect("holder");
   assert!(eventually(Duration::from_secs(5), || home.claimant().is_some()));

   let scan = h.jobs.scan_directory(&home.id(), None).expect("scan");
   assert!(eventually(Duration::from_secs(5), || scan.state() == TaskState::Running));
   scan.cancel();
   release.store(true, Ordering::Release);

   wait_for(&holder, 5);
   wait_for(&scan, 5);
   assert_eq!(scan.exit_status(), Some(TaskState::Cancelled));
   assert_eq!(scan.get_result("files_queued"), None);
   let pool = scan.child_pool().expect("child pool");
   assert!(pool.is_done());
   assert_eq!(pool.total(), 0);
   assert!(file.content_id().is_none());
   assert!(home.claimant().is_none());
}

#[test]
fn scan_cancelled_while_queueing_waits_for_queued_files() {
   let processor = Arc::new(CancelOnFirst::default());
   let h = Harness::with_processor(processor.clone());
   let home = h.home("alice");
   for i in 0..300 {
      h.file(&home, &format!("{i}.jpg"), format!("image {i}").as_bytes());
   }

   let scan = h.jobs.scan_directory(&home.id(), None).expect("scan");
   *processor.scan.lock() = Some(Arc::clone(&scan));

   wait_for(&scan, 30);
   assert_eq!(scan.exit_status(), Some(TaskState::Cancelled));
   let pool = scan.child_pool().expect("child pool");
   assert!(pool.is_all_queued());
   assert!(pool.is_done());
   let queued = pool.tasks();
   assert_eq!(queued.len() as i64, pool.total());
   assert!(!queued.is_empty());
   assert!(queued.iter().all(|t| t.exit_status().is_some()), "queued files settle before the scan");
   assert!(home.claimant().is_none());
}

#[test]
fn backups_do_not_scan_or_mutate() {
   let h = Harness::with_role(Role::Backup);
   let home = h.home("alice");
   let file = h.file(&home, "a.jpg", b"a");

   let scan = h.jobs.scan_directory(&home.id(), None).expect("scan");
   wait_for(&scan, 5);
   assert_eq!(scan.exit_status(), Some(TaskState::Success));
   assert!(file.content_id().is_none());

   let refused = |r: Result<Arc<strata::task::Task>>| {
      matches!(r, Err(Error::Role { role: Role::Backup, .. }))
   };
   assert!(refused(h.jobs.move_files(vec![file.id()], &home.id(), None)));
   assert!(refused(h.jobs.delete_files(vec![file.id()])));
   assert!(refused(h.jobs.write_to_file("u1", &home.id(), Default::default())));
}

#[test]
fn move_files_reports_partial_failures() {
   let h = Harness::new();
   let home = h.home("alice");
   let dest = h.mkdir(&home, "dest");
   let a = h.file(&home, "a.jpg", b"a");

   let task = h.jobs.move_files(vec![a.id(), "missing".into()], &dest.id(), None).expect("move");
   wait_for(&task, 5);
   assert_eq!(task.exit_status(), Some(TaskState::Success));
   let result = outcome(&task);
   assert_eq!(result.succeeded, vec![a.id()]);
   assert_eq!(result.failed.len(), 1);
   assert_eq!(result.failed[0].id, "missing");
   assert!(h.abs(&a).ends_with("alice/dest/a.jpg"));
   assert!(h.abs(&a).exists());

   let all_bad = h.jobs.move_files(vec!["nope".into()], &dest.id(), None).expect("move");
   wait_for(&all_bad, 5);
   assert_eq!(all_bad.exit_status(), Some(TaskState::Error));
   let err = all_bad.read_error().expect("error");
   assert!(matches!(*err, Error::Task(TaskError::Subtasks { failed: 1, total: 1 })));
}

#[test]
fn single_move_can_rename() {
   let h = Harness::new();
   let home = h.home("alice");
   let a = h.file(&home, "a.jpg", b"a");

   let task = h.jobs.move_files(vec![a.id()], &home.id(), Some("b.jpg".into())).expect("move");
   wait_for(&task, 5);
   assert_eq!(a.name(), "b.jpg");
   assert!(home.child("a.jpg").is_none());
}

#[test]
fn trash_round_trip_keeps_entries_in_the_store() {
   let h = Harness::new();
   let home = h.home("alice");
   let trash = h.mkdir(&home, TRASH_DIR_NAME);
   let photos = h.mkdir(&home, "photos");
   let first = h.file(&home, "x.jpg", b"1");
   let second = h.file(&photos, "x.jpg", b"2");

   let task = h.jobs.move_files(vec![first.id()], &trash.id(), None).expect("trash");
   wait_for(&task, 5);
   let task = h.jobs.move_files(vec![second.id()], &trash.id(), None).expect("trash");
   wait_for(&task, 5);

   assert_eq!(first.name(), "x.jpg");
   assert_eq!(second.name(), "x (1).jpg");
   let entry = h.store.get_trash_entry(&second.id()).expect("store").expect("entry");
   assert_eq!(entry.original_path.to_string(), "MEDIA:alice/photos/x.jpg");
   assert_eq!(entry.owner, "alice");

   // Restoring drops the entry.
   let trashed_id = first.id();
   let task = h
      .jobs
      .move_files(vec![first.id()], &photos.id(), Some("y.jpg".into()))
      .expect("restore");
   wait_for(&task, 5);
   assert_eq!(task.exit_status(), Some(TaskState::Success));
   assert!(h.store.get_trash_entry(&trashed_id).expect("store").is_none());

   // Deleting from the trash drops it too.
   let trashed_id = second.id();
   let task = h.jobs.delete_files(vec![second.id()]).expect("delete");
   wait_for(&task, 5);
   assert!(h.store.get_trash_entry(&trashed_id).expect("store").is_none());
   assert!(h.tree.get(&trashed_id).is_none());
}

#[test]
fn delete_files_removes_from_disk_and_tree() {
   let h = Harness::new();
   let home = h.home("alice");
   let dir = h.mkdir(&home, "old");
   let file = h.file(&dir, "a.jpg", b"abc");
   let path = h.abs(&dir);

   let task = h.jobs.delete_files(vec![dir.id()]).expect("delete");
   wait_for(&task, 5);
   assert_eq!(task.exit_status(), Some(TaskState::Success));
   assert!(!path.exists());
   assert!(h.tree.get(&file.id()).is_none());
   assert_eq!(home.size(), 0);
}

#[test]
fn read_only_files_are_not_deleted() {
   let h = Harness::new();
   let home = h.home("alice");
   let file = h.file(&home, "a.jpg", b"abc");
   h.tree.set_read_only(&file, true);

   let task = h.jobs.delete_files(vec![file.id()]).expect("delete");
   wait_for(&task, 5);
   assert_eq!(task.exit_status(), Some(TaskState::Error));
   assert!(h.abs(&file).exists());
   assert!(outcome(&task).failed[0].reason.contains("read-only"));
}

fn archive_entries(path: &Path) -> Vec<PathBuf> {
   let mut archive = tar::Archive::new(File::open(path).expect("open archive"));
   let mut names: Vec<PathBuf> = archive
      .entries()
      .expect("entries")
      .map(|e| e.expect("entry").path().expect("path").into_owned())
      .collect();
   names.sort();
   names
}

#[test]
fn create_zip_archives_the_selection_and_is_reused() {
   let h = Harness::new();
   let home = h.home("alice");
   let album = h.mkdir(&home, "album");
   h.file(&album, "a.jpg", b"aaaa");
   let loose = h.file(&home, "b.jpg", b"bb");

   let ids = vec![album.id(), loose.id()];
   let task = h.jobs.create_zip(ids.clone()).expect("zip");
   wait_for(&task, 10);
   assert_eq!(task.exit_status(), Some(TaskState::Success));
   let path = task.get_result("path").and_then(|v| v.as_str().map(PathBuf::from)).expect("path");
   assert!(path.starts_with(h.dir.path().join("cache")));
   assert_eq!(archive_entries(&path), vec![
      PathBuf::from("album"),
      PathBuf::from("album/a.jpg"),
      PathBuf::from("b.jpg"),
   ]);
   assert_eq!(task.get_result("progress"), Some(json!(100)));

   let reversed: Vec<_> = ids.into_iter().rev().collect();
   let again = h.jobs.create_zip(reversed).expect("zip again");
   assert!(Arc::ptr_eq(&task, &again), "persistent archive task is reused");
}

#[test]
fn gather_fs_stats_groups_by_extension() {
   let h = Harness::new();
   let home = h.home("alice");
   let sub = h.mkdir(&home, "sub");
   h.file(&home, "a.jpg", b"abc");
   h.file(&sub, "b.JPG", b"de");
   h.file(&sub, "c.png", b"fghi");
   h.file(&home, "README", b"x");

   let task = h.jobs.gather_fs_stats(&home.id()).expect("stats");
   wait_for(&task, 5);
   assert_eq!(task.get_result("sizes_by_extension"), Some(json!([
      { "name": "jpg", "size": 5 },
      { "name": "png", "size": 4 },
      { "name": "other", "size": 1 },
   ])));
   assert_eq!(task.get_result("total_size"), Some(json!(10)));
   assert!(task.get_result("free_space").is_some_and(|v| v.as_u64().is_some()));

   let file = home.child("a.jpg").expect("a.jpg");
   let not_dir = h.jobs.gather_fs_stats(&file.id()).expect("stats");
   wait_for(&not_dir, 5);
   let err = not_dir.read_error().expect("error");
   assert!(matches!(*err, Error::Tree(TreeError::NotADirectory(_))));
}

#[test]
fn identical_bytes_share_one_media_record() {
   let h = Harness::new();
   let home = h.home("alice");
   let a = h.file(&home, "a.jpg", b"same bytes");
   let b = h.file(&home, "b.jpg", b"same bytes");
   let c = h.file(&home, "c.jpg", b"other bytes");

   let tasks: Vec<_> = [&a, &b, &c]
      .iter()
      .map(|n| h.jobs.hash_file(&n.id(), None).expect("hash"))
      .collect();
   for task in &tasks {
      wait_for(task, 5);
      assert_eq!(task.exit_status(), Some(TaskState::Success));
   }

   let cid = a.content_id().expect("content id");
   assert_eq!(b.content_id().as_deref(), Some(cid.as_str()));
   assert_ne!(c.content_id().as_deref(), Some(cid.as_str()));
   assert_eq!(tasks[0].get_result("content_id"), Some(json!(cid)));

   let record = h.media.get(&cid).expect("record");
   assert!(record.file_ids.contains(&a.id()));
   assert!(record.file_ids.contains(&b.id()));

   // The association follows the file across a rename.
   let old_id = a.id();
   h.tree.move_node(&a, &home, Some("renamed.jpg"), false, None, None).expect("rename");
   let record = h.media.get(&cid).expect("record");
   assert!(record.file_ids.contains(&a.id()));
   assert!(!record.file_ids.contains(&old_id));
}

#[test]
fn hashing_a_directory_fails() {
   let h = Harness::new();
   let home = h.home("alice");
   let task = h.jobs.hash_file(&home.id(), None).expect("hash");
   wait_for(&task, 5);
   assert_eq!(task.exit_status(), Some(TaskState::Error));
}
