mod support;

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   thread,
   time::{Duration, Instant},
};

use strata::{
   Error, Result,
   broadcast::{Message, RecordingBroadcaster, TaskEvent},
   error::{TaskError, TreeError},
   task::{Handler, Task, TaskKind, TaskMeta, TaskState, WorkerPool},
};
use support::{eventually, wait_for};

fn pool(workers: usize) -> (Arc<WorkerPool>, Arc<RecordingBroadcaster>) {
   let broadcaster = Arc::new(RecordingBroadcaster::new());
   let pool = WorkerPool::new(workers, Duration::from_millis(20), broadcaster.clone());
   pool.run().expect("run workers");
   (pool, broadcaster)
}

fn handler(f: impl Fn(&Arc<Task>) -> Result<()> + Send + Sync + 'static) -> Handler {
   Arc::new(f)
}

fn job(name: &str) -> TaskMeta {
   TaskMeta::HashFile { file_id: name.to_string() }
}

fn file_id(task: &Task) -> String {
   match task.meta() {
      TaskMeta::HashFile { file_id } => file_id.clone(),
      _ => String::new(),
   }
}

/// Handler that spins on `gate` for tasks named `block*`.
fn gated(workers: &WorkerPool, gate: &Arc<AtomicBool>) {
   let gate = Arc::clone(gate);
   workers.register_job(
      TaskKind::HashFile,
      handler(move |task: &Arc<Task>| {
         if file_id(task).starts_with("block") {
            while !gate.load(Ordering::Acquire) {
               task.check_exit()?;
               thread::sleep(Duration::from_millis(2));
            }
         }
         Ok(())
      }),
   );
}

#[test]
fn successful_task_records_result_and_broadcasts_completion() {
   let (workers, broadcaster) = pool(2);
   workers.register_job(
      TaskKind::HashFile,
      handler(|task: &Arc<Task>| {
         task.sw_lap("start");
         task.set_result("answer", 42);
         Ok(())
      }),
   );

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);

   assert_eq!(task.state(), TaskState::Success);
   assert_eq!(task.exit_status(), Some(TaskState::Success));
   assert_eq!(task.get_result("answer"), Some(serde_json::json!(42)));
   assert_eq!(task.laps().len(), 1);
   let completes = broadcaster.count(|m| {
      matches!(m, Message::Task(u) if u.task_id == task.id() && u.event == TaskEvent::Complete)
   });
   assert_eq!(completes, 1);
   workers.close();
}

#[test]
fn cancel_after_completion_is_a_noop() {
   let (workers, broadcaster) = pool(1);
   workers.register_job(TaskKind::HashFile, handler(|_: &Arc<Task>| Ok(())));

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   task.cancel();
   task.cancel();

   assert_eq!(task.state(), TaskState::Success);
   let cancels = broadcaster.count(|m| matches!(m, Message::Task(u) if u.event == TaskEvent::Cancel));
   assert_eq!(cancels, 0);
   workers.close();
}

#[test]
fn cancel_while_queued_finishes_without_running() {
   let (workers, broadcaster) = pool(1);
   let gate = Arc::new(AtomicBool::new(false));
   let ran = Arc::new(AtomicUsize::new(0));
   {
      let gate = Arc::clone(&gate);
      let ran = Arc::clone(&ran);
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            if file_id(task) == "block" {
               while !gate.load(Ordering::Acquire) {
                  thread::sleep(Duration::from_millis(2));
               }
            } else {
               ran.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
         }),
      );
   }

   let blocker = workers.dispatch_job(job("block"), None).expect("dispatch blocker");
   let queued = workers.dispatch_job(job("queued"), None).expect("dispatch queued");
   assert_eq!(queued.state(), TaskState::Queued);

   queued.cancel();
   assert_eq!(queued.state(), TaskState::Cancelled);
   assert!(queued.wait_timeout(Duration::from_millis(200)), "cancelled task must not block wait");

   gate.store(true, Ordering::Release);
   wait_for(&blocker, 5);
   thread::sleep(Duration::from_millis(50));
   assert_eq!(ran.load(Ordering::Acquire), 0);
   assert_eq!(queued.state(), TaskState::Cancelled);
   let events = |event: TaskEvent| {
      broadcaster.count(|m| matches!(m, Message::Task(u) if u.task_id == queued.id() && u.event == event))
   };
   assert_eq!(events(TaskEvent::Cancel), 1);
   assert_eq!(events(TaskEvent::Complete), 0, "a task that never ran does not complete");
   workers.close();
}

#[test]
fn cancel_while_running_stops_at_next_yield_point() {
   let (workers, _) = pool(1);
   let started = Arc::new(AtomicBool::new(false));
   {
      let started = Arc::clone(&started);
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            started.store(true, Ordering::Release);
            loop {
               task.check_exit()?;
               thread::sleep(Duration::from_millis(2));
            }
         }),
      );
   }

   let task = workers.dispatch_job(job("spin"), None).expect("dispatch");
   assert!(eventually(Duration::from_secs(5), || started.load(Ordering::Acquire)));
   task.cancel();
   wait_for(&task, 5);

   assert_eq!(task.state(), TaskState::Cancelled);
   assert!(task.read_error().is_none());
   workers.close();
}

#[test]
fn error_wins_over_later_cancel() {
   let (workers, _) = pool(1);
   let cleanups = Arc::new(AtomicUsize::new(0));
   {
      let cleanups = Arc::clone(&cleanups);
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            let cleanups = Arc::clone(&cleanups);
            task.set_error_cleanup(move |_, _| {
               cleanups.fetch_add(1, Ordering::AcqRel);
            });
            Err(TreeError::NotFound("missing".to_string()).into())
         }),
      );
   }

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   task.cancel();
   task.error(TaskError::Timeout);

   assert_eq!(task.state(), TaskState::Error);
   let err = task.read_error().expect("error recorded");
   assert!(matches!(&*err, Error::Tree(TreeError::NotFound(_))));
   assert_eq!(cleanups.load(Ordering::Acquire), 1);
   workers.close();
}

#[test]
fn deadline_errors_and_cancels_the_task() {
   let (workers, _) = pool(1);
   workers.register_job(
      TaskKind::HashFile,
      handler(|task: &Arc<Task>| {
         task.set_timeout(Instant::now() + Duration::from_millis(50));
         loop {
            task.check_exit()?;
            thread::sleep(Duration::from_millis(5));
         }
      }),
   );

   let task = workers.dispatch_job(job("slow"), None).expect("dispatch");
   wait_for(&task, 5);

   assert_eq!(task.state(), TaskState::Error);
   let err = task.read_error().expect("timeout recorded");
   assert!(matches!(&*err, Error::Task(TaskError::Timeout)));
   workers.close();
}

#[test]
fn cleared_deadline_does_not_fire() {
   let (workers, _) = pool(1);
   workers.register_job(
      TaskKind::HashFile,
      handler(|task: &Arc<Task>| {
         task.set_timeout(Instant::now() + Duration::from_millis(20));
         task.clear_timeout();
         thread::sleep(Duration::from_millis(80));
         task.check_exit()
      }),
   );

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   assert_eq!(task.state(), TaskState::Success);
   workers.close();
}

#[test]
fn panics_are_recovered_as_errors() {
   let (workers, _) = pool(1);
   workers.register_job(
      TaskKind::HashFile,
      handler(|task: &Arc<Task>| {
         if file_id(task) == "boom" {
            panic!("handler exploded");
         }
         Ok(())
      }),
   );

   let boom = workers.dispatch_job(job("boom"), None).expect("dispatch");
   wait_for(&boom, 5);
   assert_eq!(boom.state(), TaskState::Error);
   let err = boom.read_error().expect("panic recorded");
   assert!(matches!(&*err, Error::Task(TaskError::Panic(msg)) if msg.contains("exploded")));

   // The worker survived.
   let after = workers.dispatch_job(job("after"), None).expect("dispatch");
   wait_for(&after, 5);
   assert_eq!(after.state(), TaskState::Success);
   workers.close();
}

#[test]
fn missing_handler_fails_the_task() {
   let (workers, _) = pool(1);
   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   let err = task.read_error().expect("error recorded");
   assert!(matches!(&*err, Error::Task(TaskError::NoHandler("hash_file"))));
   workers.close();
}

#[test]
fn identical_metadata_returns_the_task_in_flight() {
   let (workers, _) = pool(1);
   let gate = Arc::new(AtomicBool::new(false));
   gated(&workers, &gate);

   let first = workers.dispatch_job(job("block"), None).expect("dispatch");
   let second = workers.dispatch_job(job("block"), None).expect("dispatch again");
   assert!(Arc::ptr_eq(&first, &second));

   gate.store(true, Ordering::Release);
   wait_for(&first, 5);
   workers.close();
}

#[test]
fn persistent_tasks_stay_addressable() {
   let (workers, _) = pool(1);
   workers.register_job(
      TaskKind::HashFile,
      handler(|task: &Arc<Task>| {
         task.set_persistent(file_id(task) == "keep");
         Ok(())
      }),
   );

   let keep = workers.dispatch_job(job("keep"), None).expect("dispatch");
   let transient = workers.dispatch_job(job("drop"), None).expect("dispatch");
   wait_for(&keep, 5);
   wait_for(&transient, 5);

   assert!(workers.get_task(keep.id()).is_some());
   assert!(workers.get_task(transient.id()).is_none());
   let again = workers.dispatch_job(job("keep"), None).expect("dispatch again");
   assert!(Arc::ptr_eq(&keep, &again));
   workers.close();
}

#[test]
fn post_action_runs_once_after_success() {
   let (workers, _) = pool(1);
   workers.register_job(TaskKind::HashFile, handler(|_: &Arc<Task>| Ok(())));

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);

   let ran = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&ran);
   task.set_post_action(move |_| {
      counter.fetch_add(1, Ordering::AcqRel);
   });
   assert_eq!(ran.load(Ordering::Acquire), 1);
   workers.close();
}

#[test]
fn clear_and_recompute_runs_the_handler_again() {
   let (workers, _) = pool(1);
   let runs = Arc::new(AtomicUsize::new(0));
   {
      let runs = Arc::clone(&runs);
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            let n = runs.fetch_add(1, Ordering::AcqRel) + 1;
            task.set_result("run", n);
            Ok(())
         }),
      );
   }

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   assert_eq!(task.get_result("run"), Some(serde_json::json!(1)));

   task.clear_and_recompute().expect("recompute");
   wait_for(&task, 5);
   assert_eq!(task.state(), TaskState::Success);
   assert_eq!(task.get_result("run"), Some(serde_json::json!(2)));
   workers.close();
}

#[test]
fn recomputing_a_queued_task_runs_it_once() {
   let (workers, broadcaster) = pool(2);
   let gate = Arc::new(AtomicBool::new(false));
   let runs = Arc::new(AtomicUsize::new(0));
   let running = Arc::new(AtomicUsize::new(0));
   let max_running = Arc::new(AtomicUsize::new(0));
   {
      let (gate, runs) = (Arc::clone(&gate), Arc::clone(&runs));
      let (running, max_running) = (Arc::clone(&running), Arc::clone(&max_running));
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            if file_id(task).starts_with("block") {
               while !gate.load(Ordering::Acquire) {
                  thread::sleep(Duration::from_millis(2));
               }
               return Ok(());
            }
            runs.fetch_add(1, Ordering::AcqRel);
            let now = running.fetch_add(1, Ordering::AcqRel) + 1;
            max_running.fetch_max(now, Ordering::AcqRel);
            thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::AcqRel);
            Ok(())
         }),
      );
   }

   let blockers = [
      workers.dispatch_job(job("block-1"), None).expect("dispatch"),
      workers.dispatch_job(job("block-2"), None).expect("dispatch"),
   ];
   let pool = workers.new_task_pool(false, None);
   let target = workers.dispatch_job(job("target"), Some(&pool)).expect("dispatch target");
   assert_eq!(target.state(), TaskState::Queued);

   target.clear_and_recompute().expect("recompute");
   pool.signal_all_queued();
   gate.store(true, Ordering::Release);
   for blocker in &blockers {
      wait_for(blocker, 5);
   }
   wait_for(&target, 5);
   assert!(eventually(Duration::from_secs(5), || pool.is_done()), "both queue entries settle");
   thread::sleep(Duration::from_millis(50));

   assert_eq!(target.state(), TaskState::Success);
   assert_eq!(runs.load(Ordering::Acquire), 1);
   assert_eq!(max_running.load(Ordering::Acquire), 1);
   assert_eq!(pool.status().total, 2);
   let completes = broadcaster.count(|m| {
      matches!(m, Message::Task(u) if u.task_id == target.id() && u.event == TaskEvent::Complete)
   });
   assert_eq!(completes, 1);
   workers.close();
}

#[test]
fn recomputed_task_stays_addressable() {
   let (workers, _) = pool(1);
   let gate = Arc::new(AtomicBool::new(false));
   gated(&workers, &gate);

   let task = workers.dispatch_job(job("block"), None).expect("dispatch");
   assert!(eventually(Duration::from_secs(5), || task.state() == TaskState::Running));

   for _ in 0..2 {
      task.clear_and_recompute().expect("recompute");
      assert!(eventually(Duration::from_secs(5), || task.state() == TaskState::Running));
      let registered = workers.get_task(task.id()).expect("registered while running");
      assert!(Arc::ptr_eq(&registered, &task));
      let again = workers.dispatch_job(job("block"), None).expect("dispatch again");
      assert!(Arc::ptr_eq(&again, &task), "identical metadata finds the recomputed task");
   }

   gate.store(true, Ordering::Release);
   wait_for(&task, 5);
   assert_eq!(task.state(), TaskState::Success);
   workers.close();
}

#[test]
fn recomputed_task_can_arm_a_deadline() {
   let (workers, _) = pool(1);
   let runs = Arc::new(AtomicUsize::new(0));
   {
      let runs = Arc::clone(&runs);
      workers.register_job(
         TaskKind::HashFile,
         handler(move |task: &Arc<Task>| {
            if runs.fetch_add(1, Ordering::AcqRel) == 0 {
               return Ok(());
            }
            task.set_timeout(Instant::now() + Duration::from_millis(50));
            loop {
               task.check_exit()?;
               thread::sleep(Duration::from_millis(5));
            }
         }),
      );
   }

   let task = workers.dispatch_job(job("a"), None).expect("dispatch");
   wait_for(&task, 5);
   assert_eq!(task.state(), TaskState::Success);

   task.clear_and_recompute().expect("recompute");
   wait_for(&task, 5);
   assert_eq!(task.state(), TaskState::Error);
   let err = task.read_error().expect("timeout recorded");
   assert!(matches!(&*err, Error::Task(TaskError::Timeout)));
   workers.close();
}

#[test]
fn pool_wait_requires_signal_and_all_completed() {
   let (workers, _) = pool(2);
   workers.register_job(TaskKind::HashFile, handler(|_: &Arc<Task>| Ok(())));

   let pool = workers.new_task_pool(false, None);
   for name in ["a", "b", "c", "d"] {
      workers.dispatch_job(job(name), Some(&pool)).expect("dispatch");
   }
   assert!(eventually(Duration::from_secs(5), || pool.status().completed == 4));
   assert!(!pool.is_done(), "not done before signal_all_queued");

   let (tx, rx) = crossbeam_channel::bounded(1);
   let waiter = Arc::clone(&pool);
   thread::spawn(move || {
      waiter.wait(false);
      let _ = tx.send(());
   });
   assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "wait returned early");

   pool.signal_all_queued();
   assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
   assert!(pool.is_done());

   let err = workers.dispatch_job(job("late"), Some(&pool)).expect_err("pool is sealed");
   assert!(matches!(err, Error::Task(TaskError::AllQueued(_))));
   workers.close();
}

#[test]
fn wait_on_global_pool_returns_immediately() {
   let (workers, _) = pool(1);
   let gate = Arc::new(AtomicBool::new(false));
   gated(&workers, &gate);
   let task = workers.dispatch_job(job("block"), None).expect("dispatch");

   let started = Instant::now();
   workers.global_pool().wait(true);
   assert!(started.elapsed() < Duration::from_secs(1));

   gate.store(true, Ordering::Release);
   wait_for(&task, 5);
   workers.close();
}

#[test]
fn progress_is_completed_over_total() {
   let (workers, _) = pool(4);
   let gate = Arc::new(AtomicBool::new(false));
   gated(&workers, &gate);

   let pool = workers.new_task_pool(false, None);
   assert_eq!(pool.status().progress, 0.0);

   for name in ["a", "b", "block-1", "block-2"] {
      workers.dispatch_job(job(name), Some(&pool)).expect("dispatch");
   }
   pool.signal_all_queued();
   assert!(eventually(Duration::from_secs(5), || pool.status().completed == 2));
   let status = pool.status();
   assert_eq!((status.completed, status.total), (2, 4));
   assert_eq!(status.progress, 50.0);

   gate.store(true, Ordering::Release);
   pool.wait(false);
   assert_eq!(pool.status().progress, 100.0);
   workers.close();
}

#[test]
fn pool_cancel_cancels_and_waits_every_task() {
   let (workers, _) = pool(2);
   let gate = Arc::new(AtomicBool::new(false));
   gated(&workers, &gate);

   let pool = workers.new_task_pool(false, None);
   let tasks: Vec<_> = ["block-1", "block-2", "block-3"]
      .into_iter()
      .map(|n| workers.dispatch_job(job(n), Some(&pool)).expect("dispatch"))
      .collect();

   pool.cancel();
   for task in &tasks {
      assert_eq!(task.state(), TaskState::Cancelled);
   }
   // A task cancelled while queued still passes through a worker once.
   assert!(eventually(Duration::from_secs(5), || pool.is_done()));
   workers.close();
}

#[test]
fn waiting_on_children_from_a_worker_does_not_starve() {
   // One worker: the parent blocks on its children, which only run on the
   // replacement worker added for the wait.
   let (workers, _) = pool(1);
   workers.register_job(TaskKind::HashFile, handler(|_: &Arc<Task>| Ok(())));
   workers.register_job(
      TaskKind::GatherFsStats,
      handler(|task: &Arc<Task>| {
         let workers = task.worker_pool()?;
         let pool = workers.new_task_pool(false, Some(task));
         for i in 0..3 {
            workers.dispatch_job(job(&format!("child-{i}")), Some(&pool))?;
         }
         pool.signal_all_queued();
         pool.wait(true);
         task.set_result("children", pool.status().completed);
         Ok(())
      }),
   );

   let parent = workers
      .dispatch_job(TaskMeta::GatherFsStats { dir_id: "parent".to_string() }, None)
      .expect("dispatch");
   wait_for(&parent, 10);

   assert_eq!(parent.state(), TaskState::Success);
   assert_eq!(parent.get_result("children"), Some(serde_json::json!(3)));
   let child_pool = parent.child_pool().expect("child pool");
   assert!(child_pool.created_in_task().is_some_and(|t| Arc::ptr_eq(&t, &parent)));
   assert!(child_pool.is_root());
   workers.close();
}

#[test]
fn closed_pool_rejects_new_work() {
   let (workers, _) = pool(1);
   workers.close();
   let err = workers.dispatch_job(job("a"), None).expect_err("closed");
   assert!(matches!(err, Error::Task(TaskError::ClosedPool)));
   assert!(workers.is_closed());
}
