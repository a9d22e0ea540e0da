use std::{
   collections::HashMap,
   fmt,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicI64, Ordering},
   },
};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::{Task, TaskId, WorkerPool, is_worker_thread};
use crate::{Result, broadcast::PoolUpdate, error::TaskError};

type PoolCleanup = Box<dyn FnOnce(&TaskPool) + Send>;

/// Progress snapshot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStatus {
   pub completed: i64,
   pub total:     i64,
   /// `completed * 100 / total`, or 0 for an empty pool.
   pub progress:  f64,
}

/// A cancelable, waitable grouping of tasks.
///
/// Totals are counted on the pool and on its root, so waiting on a root pool
/// also covers work queued by its tasks into child pools.
pub struct TaskPool {
   id:         String,
   parent:     Option<Arc<TaskPool>>,
   workers:    Weak<WorkerPool>,
   created_by: Option<Weak<Task>>,
   global:     bool,

   total:      AtomicI64,
   completed:  AtomicI64,
   all_queued: AtomicBool,

   /// True once every queued task finished after `signal_all_queued`.
   done:    Mutex<bool>,
   done_cv: Condvar,

   pub(crate) exit_lock: Mutex<()>,

   tasks:    Mutex<HashMap<TaskId, Arc<Task>>>,
   errors:   Mutex<Vec<Arc<Task>>>,
   cleanups: Mutex<Vec<PoolCleanup>>,
}

impl fmt::Debug for TaskPool {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("TaskPool")
         .field("id", &self.id)
         .field("global", &self.global)
         .field("status", &self.status())
         .finish()
   }
}

impl TaskPool {
   pub(crate) fn new(
      workers: Weak<WorkerPool>,
      parent: Option<Arc<Self>>,
      created_by: Option<&Arc<Task>>,
      global: bool,
   ) -> Self {
      Self {
         id: uuid::Uuid::new_v4().to_string(),
         parent,
         workers,
         created_by: created_by.map(Arc::downgrade),
         global,
         total: AtomicI64::new(0),
         completed: AtomicI64::new(0),
         all_queued: AtomicBool::new(false),
         done: Mutex::new(false),
         done_cv: Condvar::new(),
         exit_lock: Mutex::new(()),
         tasks: Mutex::new(HashMap::new()),
         errors: Mutex::new(Vec::new()),
         cleanups: Mutex::new(Vec::new()),
      }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub const fn is_global(&self) -> bool {
      self.global
   }

   /// A pool is a root when it has no parent or its parent is the global pool.
   pub fn is_root(&self) -> bool {
      self.parent.as_ref().is_none_or(|p| p.global)
   }

   pub fn parent(&self) -> Option<&Arc<Self>> {
      self.parent.as_ref()
   }

   pub fn get_root_pool(self: &Arc<Self>) -> Arc<Self> {
      let mut pool = Arc::clone(self);
      while !pool.is_root() {
         let Some(parent) = pool.parent.clone() else {
            break;
         };
         pool = parent;
      }
      pool
   }

   /// The task that spawned this pool, if any.
   pub fn created_in_task(&self) -> Option<Arc<Task>> {
      self.created_by.as_ref().and_then(Weak::upgrade)
   }

   pub fn is_all_queued(&self) -> bool {
      self.all_queued.load(Ordering::Acquire)
   }

   pub fn is_done(&self) -> bool {
      *self.done.lock()
   }

   pub fn remaining(&self) -> i64 {
      self.total.load(Ordering::Acquire) - self.completed.load(Ordering::Acquire)
   }

   pub fn total(&self) -> i64 {
      self.total.load(Ordering::Acquire)
   }

   pub fn status(&self) -> PoolStatus {
      let completed = self.completed.load(Ordering::Acquire);
      let total = self.total.load(Ordering::Acquire);
      let progress = if total == 0 { 0.0 } else { (completed * 100) as f64 / total as f64 };
      PoolStatus { completed, total, progress }
   }

   pub fn tasks(&self) -> Vec<Arc<Task>> {
      self.tasks.lock().values().cloned().collect()
   }

   /// Tasks of this pool tree that ended in error.
   pub fn errors(&self) -> Vec<Arc<Task>> {
      self.errors.lock().clone()
   }

   pub(crate) fn add_error(&self, task: Arc<Task>) {
      self.errors.lock().push(task);
   }

   pub fn queue_task(self: &Arc<Self>, task: &Arc<Task>) -> Result<()> {
      if self.is_all_queued() {
         return Err(TaskError::AllQueued(self.id.clone()).into());
      }
      if task.state().is_terminal() {
         tracing::debug!(task_id = %task.id(), "not queueing finished task");
         return Ok(());
      }
      let workers = self.workers.upgrade().ok_or(TaskError::ClosedPool)?;
      if workers.is_closed() {
         return Err(TaskError::ClosedPool.into());
      }

      task.set_pool(Arc::downgrade(self));
      self.tasks.lock().insert(task.id().to_string(), Arc::clone(task));
      self.total.fetch_add(1, Ordering::AcqRel);
      let root = self.get_root_pool();
      if !Arc::ptr_eq(&root, self) {
         root.total.fetch_add(1, Ordering::AcqRel);
      }

      task.mark_queued();
      workers.add_task(Arc::clone(task), Arc::clone(self));
      Ok(())
   }

   /// Declares that no more tasks will be queued. Required before
   /// [`TaskPool::wait`] can observe completion.
   pub fn signal_all_queued(&self) {
      self.all_queued.store(true, Ordering::Release);
      self.try_complete();
   }

   /// Parks the caller until every queued task finished. With
   /// `supplement_worker` a temporary extra worker covers for the caller while
   /// it waits, so a task waiting on its own children does not starve the
   /// pool. Returns immediately for the global pool.
   pub fn wait(&self, supplement_worker: bool) {
      if self.global {
         tracing::warn!(pool_id = %self.id, "refusing to wait on the global pool");
         return;
      }
      if self.is_done() {
         return;
      }

      let workers = self.workers.upgrade();
      let on_worker = is_worker_thread();
      let supplement = supplement_worker.then_some(workers.as_ref()).flatten();
      if let Some(w) = supplement
         && let Err(e) = w.add_replacement_worker()
      {
         tracing::warn!("failed to add replacement worker: {e}");
      }
      if on_worker && let Some(w) = &workers {
         w.busy_delta(-1);
      }

      {
         let mut done = self.done.lock();
         while !*done {
            self.done_cv.wait(&mut done);
         }
      }

      if on_worker && let Some(w) = &workers {
         w.busy_delta(1);
      }
      if let Some(w) = supplement {
         w.remove_worker();
      }
   }

   /// Stops accepting work, cancels every task and waits for each to finish.
   pub fn cancel(&self) {
      self.all_queued.store(true, Ordering::Release);
      let tasks = self.tasks();
      for task in &tasks {
         task.cancel();
      }
      for task in &tasks {
         task.wait();
      }
      self.try_complete();
   }

   /// Registers a callback run once the pool completes. Runs immediately when
   /// the pool is already done.
   pub fn add_cleanup(&self, f: impl FnOnce(&Self) + Send + 'static) {
      if self.is_done() {
         f(self);
         return;
      }
      self.cleanups.lock().push(Box::new(f));
   }

   pub(crate) fn handle_task_exit(&self) {
      self.completed.fetch_add(1, Ordering::AcqRel);
      if let Some(workers) = self.workers.upgrade() {
         let status = self.status();
         workers.broadcaster().push_pool_update(PoolUpdate {
            pool_id:   self.id.clone(),
            completed: status.completed,
            total:     status.total,
            progress:  status.progress,
         });
      }
      self.try_complete();
   }

   pub(crate) fn forget(&self, task_id: &str) {
      self.tasks.lock().remove(task_id);
   }

   fn try_complete(&self) {
      if self.global {
         return;
      }
      {
         let mut done = self.done.lock();
         if *done || !self.is_all_queued() || self.remaining() > 0 {
            return;
         }
         *done = true;
         self.done_cv.notify_all();
      }

      let cleanups = std::mem::take(&mut *self.cleanups.lock());
      for cleanup in cleanups {
         cleanup(self);
      }
      if let Some(workers) = self.workers.upgrade() {
         workers.remove_pool(&self.id);
      }
   }
}
