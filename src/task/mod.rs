//! Task execution engine.
//!
//! A [`Task`] is one schedulable unit of work with a sticky terminal state. Tasks
//! are grouped into [`TaskPool`]s, which may nest, and executed by the worker
//! threads of a [`WorkerPool`]. Cancellation is cooperative: handlers poll
//! [`Task::check_exit`] at natural yield points.

mod meta;
mod pool;
mod stopwatch;
mod workers;

use std::{
   collections::BTreeMap,
   fmt,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   time::{Duration, Instant},
};

pub use meta::{ChunkStream, FileChunk, TaskKind, TaskMeta};
pub(crate) use meta::StreamItem;
use parking_lot::{Condvar, Mutex};
pub use pool::{PoolStatus, TaskPool};
use serde::Serialize;
use serde_json::Value;
pub use stopwatch::{Lap, Stopwatch};
use tokio_util::sync::CancellationToken;
pub use workers::{Handler, WorkerPool, WorkerStatus, is_worker_thread};

use crate::{
   Result,
   broadcast::{TaskEvent, TaskUpdate},
   error::{Error, TaskError},
};

pub type TaskId = String;

type Callback = Box<dyn FnOnce(&Task) + Send>;
type ErrorCallback = Box<dyn FnOnce(&Task, &Error) + Send>;

/// Lifecycle of a task. `Success`, `Error` and `Cancelled` are terminal and
/// sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
   Created,
   Queued,
   Running,
   Success,
   Error,
   Cancelled,
}

impl TaskState {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Success | Self::Error | Self::Cancelled)
   }
}

#[derive(Debug)]
struct Status {
   state:    TaskState,
   /// Set once the worker has finished all bookkeeping for the task, or
   /// immediately when a task is cancelled before it ever ran.
   finished: bool,
   /// Bumped by every recompute. Queue entries from an older epoch are stale.
   epoch:    u64,
}

/// What a worker does with a dequeued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Begin {
   Run,
   /// Cancelled before it started; only the exit bookkeeping remains.
   Skip,
   /// Superseded by a recompute; only the pool accounting remains.
   Stale,
}

pub struct Task {
   id:         TaskId,
   meta:       TaskMeta,
   workers:    Weak<WorkerPool>,
   status:     Mutex<Status>,
   status_cv:  Condvar,
   cancel:     Mutex<CancellationToken>,
   result:     Mutex<BTreeMap<String, Value>>,
   err:        Mutex<Option<Arc<Error>>>,
   pool:       Mutex<Weak<TaskPool>>,
   child_pool: Mutex<Option<Arc<TaskPool>>>,

   error_cleanup: Mutex<Option<ErrorCallback>>,
   cleanups:      Mutex<Vec<Callback>>,
   post_action:   Mutex<Option<Callback>>,

   deadline:   Mutex<Option<Instant>>,
   stopwatch:  Mutex<Stopwatch>,
   persistent: AtomicBool,
}

impl fmt::Debug for Task {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Task")
         .field("id", &self.id)
         .field("kind", &self.kind())
         .field("state", &self.state())
         .finish()
   }
}

impl Task {
   pub(crate) fn new(id: TaskId, meta: TaskMeta, workers: Weak<WorkerPool>) -> Self {
      Self {
         id,
         meta,
         workers,
         status: Mutex::new(Status { state: TaskState::Created, finished: false, epoch: 0 }),
         status_cv: Condvar::new(),
         cancel: Mutex::new(CancellationToken::new()),
         result: Mutex::new(BTreeMap::new()),
         err: Mutex::new(None),
         pool: Mutex::new(Weak::new()),
         child_pool: Mutex::new(None),
         error_cleanup: Mutex::new(None),
         cleanups: Mutex::new(Vec::new()),
         post_action: Mutex::new(None),
         deadline: Mutex::new(None),
         stopwatch: Mutex::new(Stopwatch::new()),
         persistent: AtomicBool::new(false),
      }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub const fn kind(&self) -> TaskKind {
      self.meta.kind()
   }

   pub const fn meta(&self) -> &TaskMeta {
      &self.meta
   }

   pub fn state(&self) -> TaskState {
      self.status.lock().state
   }

   /// The terminal state, if the task has reached one.
   pub fn exit_status(&self) -> Option<TaskState> {
      let state = self.state();
      state.is_terminal().then_some(state)
   }

   /// Token cancelled when the task is asked to stop. Clone it into anything
   /// that needs to observe cancellation without holding the task.
   pub fn cancellation(&self) -> CancellationToken {
      self.cancel.lock().clone()
   }

   /// Yield point for handlers. Returns `Err(Cancelled)` once the task has been
   /// cancelled, errored or timed out.
   pub fn check_exit(&self) -> Result<()> {
      if self.cancel.lock().is_cancelled()
         || matches!(self.state(), TaskState::Cancelled | TaskState::Error)
      {
         return Err(TaskError::Cancelled.into());
      }
      Ok(())
   }

   /// Requests cancellation. Idempotent; the exit status only becomes
   /// `Cancelled` when no other terminal state is set yet.
   pub fn cancel(&self) {
      self.cancel.lock().cancel();

      let transitioned = {
         let mut st = self.status.lock();
         match st.state {
            s if s.is_terminal() => false,
            TaskState::Created | TaskState::Queued => {
               st.state = TaskState::Cancelled;
               st.finished = true;
               self.status_cv.notify_all();
               true
            },
            _ => {
               st.state = TaskState::Cancelled;
               true
            },
         }
      };

      // Nothing more will be queued by a cancelled parent.
      if let Some(child) = self.child_pool() {
         child.signal_all_queued();
      }

      if transitioned {
         tracing::debug!(task_id = %self.id, kind = %self.kind(), "task cancelled");
         self.push_update(TaskEvent::Cancel);
      }
   }

   /// Records a failure. Runs the error cleanup once; a no-op when the task
   /// already reached a terminal state.
   pub fn error(&self, err: impl Into<Error>) {
      let err = Arc::new(err.into());
      {
         let mut st = self.status.lock();
         if st.state.is_terminal() {
            return;
         }
         st.state = TaskState::Error;
         *self.err.lock() = Some(Arc::clone(&err));
      }

      tracing::warn!(task_id = %self.id, kind = %self.kind(), "task failed: {err}");
      let cleanup = self.error_cleanup.lock().take();
      if let Some(cleanup) = cleanup {
         cleanup(self, &err);
      }
      self.push_update(TaskEvent::Failure);
   }

   pub(crate) fn success(&self) {
      let mut st = self.status.lock();
      if !st.state.is_terminal() {
         st.state = TaskState::Success;
      }
   }

   pub fn read_error(&self) -> Option<Arc<Error>> {
      self.err.lock().clone()
   }

   /// Blocks until the task has finished, including cleanups.
   pub fn wait(&self) {
      let mut st = self.status.lock();
      while !st.finished {
         self.status_cv.wait(&mut st);
      }
   }

   /// Like [`Task::wait`] but gives up after `timeout`. Returns whether the
   /// task finished.
   pub fn wait_timeout(&self, timeout: Duration) -> bool {
      let deadline = Instant::now() + timeout;
      let mut st = self.status.lock();
      while !st.finished {
         if self.status_cv.wait_until(&mut st, deadline).timed_out() {
            return st.finished;
         }
      }
      true
   }

   pub fn set_result(&self, key: &str, value: impl Serialize) {
      match serde_json::to_value(value) {
         Ok(v) => {
            self.result.lock().insert(key.to_string(), v);
         },
         Err(e) => tracing::warn!(task_id = %self.id, "unserializable result {key}: {e}"),
      }
   }

   pub fn get_result(&self, key: &str) -> Option<Value> {
      self.result.lock().get(key).cloned()
   }

   pub fn results(&self) -> BTreeMap<String, Value> {
      self.result.lock().clone()
   }

   /// Arms a deadline with the worker pool's timeout sweep. When it passes
   /// before [`Task::clear_timeout`] the task errors with `Timeout` and is
   /// cancelled.
   pub fn set_timeout(&self, deadline: Instant) {
      *self.deadline.lock() = Some(deadline);
      if let (Some(workers), Some(me)) = (self.workers.upgrade(), self.self_ref()) {
         workers.register_timeout(deadline, &me);
      }
   }

   pub fn clear_timeout(&self) {
      *self.deadline.lock() = None;
   }

   pub fn deadline(&self) -> Option<Instant> {
      *self.deadline.lock()
   }

   pub fn sw_lap(&self, label: impl Into<String>) {
      self.stopwatch.lock().lap(label);
   }

   pub fn laps(&self) -> Vec<Lap> {
      self.stopwatch.lock().laps().to_vec()
   }

   /// Registers a callback run once after the task exits, whatever the outcome.
   pub fn set_cleanup(&self, f: impl FnOnce(&Task) + Send + 'static) {
      self.cleanups.lock().push(Box::new(f));
   }

   /// Registers the callback run once when the task errors.
   pub fn set_error_cleanup(&self, f: impl FnOnce(&Task, &Error) + Send + 'static) {
      *self.error_cleanup.lock() = Some(Box::new(f));
   }

   /// Registers a callback run after a successful exit. Runs immediately when
   /// the task already succeeded.
   pub fn set_post_action(&self, f: impl FnOnce(&Task) + Send + 'static) {
      if self.state() == TaskState::Success {
         f(self);
         return;
      }
      *self.post_action.lock() = Some(Box::new(f));
   }

   /// Keeps the task addressable after it exits, so an identical request
   /// returns the finished result instead of recomputing it.
   pub fn set_persistent(&self, persistent: bool) {
      self.persistent.store(persistent, Ordering::Release);
   }

   pub fn is_persistent(&self) -> bool {
      self.persistent.load(Ordering::Acquire)
   }

   pub fn task_pool(&self) -> Option<Arc<TaskPool>> {
      self.pool.lock().upgrade()
   }

   pub fn child_pool(&self) -> Option<Arc<TaskPool>> {
      self.child_pool.lock().clone()
   }

   pub fn worker_pool(&self) -> Result<Arc<WorkerPool>> {
      self.workers.upgrade().ok_or_else(|| TaskError::ClosedPool.into())
   }

   /// Cancels, waits, clears prior results and errors, then requeues on the
   /// same pool (or the global pool when that one no longer accepts work).
   ///
   /// A queue entry left behind by a run cancelled while queued is retired
   /// without running; the task is registered with the worker pool again.
   pub fn clear_and_recompute(self: &Arc<Self>) -> Result<()> {
      self.cancel();
      self.wait();
      let workers = self.worker_pool()?;

      // A run cancelled while queued has not run its cleanups yet.
      self.run_cleanups();
      self.result.lock().clear();
      *self.err.lock() = None;
      *self.deadline.lock() = None;
      *self.cancel.lock() = CancellationToken::new();
      self.stopwatch.lock().reset();
      workers.reregister(self);

      if let Some(pool) = self.task_pool() {
         match pool.queue_task(self) {
            Ok(()) => return Ok(()),
            Err(Error::Task(TaskError::AllQueued(_))) => {},
            Err(e) => return Err(e),
         }
      }
      workers.global_pool().queue_task(self)
   }

   pub(crate) fn self_ref(&self) -> Option<Arc<Self>> {
      self.workers.upgrade()?.get_task(&self.id)
   }

   pub(crate) fn epoch(&self) -> u64 {
      self.status.lock().epoch
   }

   /// Starts a new epoch in the `Created` state. Called with the worker
   /// pool's registry lock held.
   pub(crate) fn reset_epoch(&self) {
      let mut st = self.status.lock();
      st.epoch += 1;
      st.state = TaskState::Created;
      st.finished = false;
   }

   pub(crate) fn set_pool(&self, pool: Weak<TaskPool>) {
      *self.pool.lock() = pool;
   }

   pub(crate) fn set_child_pool(&self, pool: Arc<TaskPool>) {
      *self.child_pool.lock() = Some(pool);
   }

   pub(crate) fn mark_queued(&self) {
      let mut st = self.status.lock();
      if st.state == TaskState::Created {
         st.state = TaskState::Queued;
      }
   }

   /// Moves the task to running for the queue entry of `epoch`.
   pub(crate) fn begin(&self, epoch: u64) -> Begin {
      let mut st = self.status.lock();
      if st.epoch != epoch {
         return Begin::Stale;
      }
      if st.state.is_terminal() {
         return Begin::Skip;
      }
      st.state = TaskState::Running;
      Begin::Run
   }

   pub(crate) fn finish(&self, epoch: u64) {
      let mut st = self.status.lock();
      if st.epoch == epoch {
         st.finished = true;
         self.status_cv.notify_all();
      }
   }

   pub(crate) fn run_cleanups(&self) {
      let cleanups = std::mem::take(&mut *self.cleanups.lock());
      for cleanup in cleanups {
         cleanup(self);
      }
   }

   pub(crate) fn run_post_action(&self) {
      let action = self.post_action.lock().take();
      if let Some(action) = action {
         action(self);
      }
   }

   fn push_update(&self, event: TaskEvent) {
      if let Some(workers) = self.workers.upgrade() {
         workers.broadcaster().push_task_update(TaskUpdate::for_task(self, event, 0, 0));
      }
   }
}
