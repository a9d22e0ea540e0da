use std::{
   cell::Cell,
   cmp::Reverse,
   collections::{BinaryHeap, HashMap},
   fmt,
   panic::{self, AssertUnwindSafe},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
   },
   thread,
   time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::{Begin, Task, TaskId, TaskKind, TaskMeta, TaskPool, TaskState};
use crate::{
   Result,
   broadcast::{Broadcaster, TaskEvent, TaskUpdate},
   error::TaskError,
};

/// Job body. Returning `Err(Cancelled)` marks the task cancelled; any other
/// error marks it failed.
pub type Handler = Arc<dyn Fn(&Arc<Task>) -> Result<()> + Send + Sync>;

/// How often an idle replacement worker re-checks whether it should retire.
const REPLACEMENT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on how long the timeout sweep sleeps with no deadlines armed.
const SWEEP_IDLE: Duration = Duration::from_secs(1);

thread_local! {
   static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on threads owned by a [`WorkerPool`].
pub fn is_worker_thread() -> bool {
   IS_WORKER.with(Cell::get)
}

enum WorkItem {
   Run(Entry),
   Exit,
}

/// One queued run of a task: the epoch it was queued in and the pool that
/// counted it.
struct Entry {
   task:  Arc<Task>,
   epoch: u64,
   pool:  Arc<TaskPool>,
}

/// Queue and worker counters reported by [`WorkerPool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
   pub queued:  usize,
   pub total:   i64,
   pub busy:    i64,
   pub alive:   i64,
   pub retries: usize,
}

/// Thread pool that executes queued tasks.
///
/// Workers pull from one shared queue. Replacement workers are added while a
/// worker blocks on its own children and retire once the live count exceeds
/// the target again. A sweep thread enforces task deadlines and a drainer
/// thread requeues tasks that replacement workers refused to start.
pub struct WorkerPool {
   queue_tx: Sender<WorkItem>,
   queue_rx: Receiver<WorkItem>,

   max_workers:     AtomicI64,
   current_workers: AtomicI64,
   busy:            AtomicI64,
   lifetime_queued: AtomicI64,
   worker_seq:      AtomicU64,
   exit:            AtomicBool,
   started:         AtomicBool,

   tasks:    Mutex<HashMap<TaskId, Arc<Task>>>,
   pools:    Mutex<HashMap<String, Arc<TaskPool>>>,
   global:   Arc<TaskPool>,
   handlers: RwLock<HashMap<TaskKind, Handler>>,

   retry_buffer:   Mutex<Vec<Entry>>,
   retry_interval: Duration,

   timeout_tx: Sender<(Instant, Weak<Task>)>,
   timeout_rx: Receiver<(Instant, Weak<Task>)>,
   stop_tx:    Mutex<Option<Sender<()>>>,
   stop_rx:    Receiver<()>,

   broadcaster: Arc<dyn Broadcaster>,
}

impl fmt::Debug for WorkerPool {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("WorkerPool").field("status", &self.status()).finish()
   }
}

impl WorkerPool {
   pub fn new(
      workers: usize,
      retry_interval: Duration,
      broadcaster: Arc<dyn Broadcaster>,
   ) -> Arc<Self> {
      let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
      let (timeout_tx, timeout_rx) = crossbeam_channel::unbounded();
      let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);

      Arc::new_cyclic(|me: &Weak<Self>| Self {
         queue_tx,
         queue_rx,
         max_workers: AtomicI64::new(workers.max(1) as i64),
         current_workers: AtomicI64::new(0),
         busy: AtomicI64::new(0),
         lifetime_queued: AtomicI64::new(0),
         worker_seq: AtomicU64::new(0),
         exit: AtomicBool::new(false),
         started: AtomicBool::new(false),
         tasks: Mutex::new(HashMap::new()),
         pools: Mutex::new(HashMap::new()),
         global: Arc::new(TaskPool::new(me.clone(), None, None, true)),
         handlers: RwLock::new(HashMap::new()),
         retry_buffer: Mutex::new(Vec::new()),
         retry_interval,
         timeout_tx,
         timeout_rx,
         stop_tx: Mutex::new(Some(stop_tx)),
         stop_rx,
         broadcaster,
      })
   }

   /// Starts the worker threads, the retry drainer and the timeout sweep.
   pub fn run(self: &Arc<Self>) -> Result<()> {
      if self.started.swap(true, Ordering::AcqRel) {
         return Ok(());
      }
      let count = self.max_workers.load(Ordering::Acquire);
      for _ in 0..count {
         self.spawn_worker(false)?;
      }

      let me = Arc::clone(self);
      thread::Builder::new()
         .name("strata-retry".to_string())
         .spawn(move || me.drain_retries())?;

      let me = Arc::clone(self);
      thread::Builder::new()
         .name("strata-sweep".to_string())
         .spawn(move || me.sweep_timeouts())?;

      tracing::debug!(workers = count, "worker pool started");
      Ok(())
   }

   pub fn register_job(&self, kind: TaskKind, handler: Handler) {
      self.handlers.write().insert(kind, handler);
   }

   pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
      &self.broadcaster
   }

   pub fn global_pool(&self) -> Arc<TaskPool> {
      Arc::clone(&self.global)
   }

   /// Creates a pool. When `created_by` is given the pool becomes that task's
   /// child pool and nests under the task's own pool; an existing child pool is
   /// returned unless `replace` is set.
   pub fn new_task_pool(
      self: &Arc<Self>,
      replace: bool,
      created_by: Option<&Arc<Task>>,
   ) -> Arc<TaskPool> {
      if let Some(task) = created_by
         && !replace
         && let Some(existing) = task.child_pool()
      {
         return existing;
      }

      let parent = created_by.and_then(|t| t.task_pool());
      let pool = Arc::new(TaskPool::new(Arc::downgrade(self), parent, created_by, false));
      if let Some(task) = created_by {
         task.set_child_pool(Arc::clone(&pool));
      }
      self.pools.lock().insert(pool.id().to_string(), Arc::clone(&pool));
      pool
   }

   pub fn get_task_pool(&self, id: &str) -> Option<Arc<TaskPool>> {
      self.pools.lock().get(id).cloned()
   }

   pub(crate) fn remove_pool(&self, id: &str) {
      self.pools.lock().remove(id);
   }

   pub fn get_task(&self, id: &str) -> Option<Arc<Task>> {
      self.tasks.lock().get(id).cloned()
   }

   /// Creates (or finds) the task for `meta` and queues it on `pool`, or on
   /// the global pool when none is given.
   ///
   /// An identical task already in flight is returned as is. A repeated upload
   /// is cleared and recomputed instead.
   pub fn dispatch_job(
      self: &Arc<Self>,
      meta: TaskMeta,
      pool: Option<&Arc<TaskPool>>,
   ) -> Result<Arc<Task>> {
      if self.is_closed() {
         return Err(TaskError::ClosedPool.into());
      }
      let id = meta.task_id();
      let (task, fresh) = {
         let mut tasks = self.tasks.lock();
         match tasks.get(&id) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
               let task = Arc::new(Task::new(id.clone(), meta, Arc::downgrade(self)));
               tasks.insert(id.clone(), Arc::clone(&task));
               (task, true)
            },
         }
      };

      if !fresh {
         if task.kind() == TaskKind::WriteFile {
            task.clear_and_recompute()?;
         }
         return Ok(task);
      }

      let pool = pool.cloned().unwrap_or_else(|| self.global_pool());
      if let Err(e) = pool.queue_task(&task) {
         self.tasks.lock().remove(&id);
         return Err(e);
      }
      Ok(task)
   }

   pub(crate) fn add_task(&self, task: Arc<Task>, pool: Arc<TaskPool>) {
      self.lifetime_queued.fetch_add(1, Ordering::AcqRel);
      let epoch = task.epoch();
      let _ = self.queue_tx.send(WorkItem::Run(Entry { task, epoch, pool }));
   }

   /// Starts a new epoch for `task` and makes it addressable again. Entries
   /// still queued from the old epoch become stale.
   pub(crate) fn reregister(&self, task: &Arc<Task>) {
      let mut tasks = self.tasks.lock();
      task.reset_epoch();
      tasks.insert(task.id().to_string(), Arc::clone(task));
   }

   pub(crate) fn register_timeout(&self, deadline: Instant, task: &Arc<Task>) {
      let _ = self.timeout_tx.send((deadline, Arc::downgrade(task)));
   }

   pub(crate) fn busy_delta(&self, delta: i64) {
      self.busy.fetch_add(delta, Ordering::AcqRel);
   }

   pub fn status(&self) -> WorkerStatus {
      WorkerStatus {
         queued:  self.queue_rx.len(),
         total:   self.lifetime_queued.load(Ordering::Acquire),
         busy:    self.busy.load(Ordering::Acquire),
         alive:   self.current_workers.load(Ordering::Acquire),
         retries: self.retry_buffer.lock().len(),
      }
   }

   pub fn is_closed(&self) -> bool {
      self.exit.load(Ordering::Acquire)
   }

   /// Raises the worker target by one and starts a replacement worker.
   pub fn add_replacement_worker(self: &Arc<Self>) -> Result<()> {
      self.max_workers.fetch_add(1, Ordering::AcqRel);
      if let Err(e) = self.spawn_worker(true) {
         self.max_workers.fetch_sub(1, Ordering::AcqRel);
         return Err(e);
      }
      Ok(())
   }

   /// Lowers the worker target by one. A replacement worker retires once it
   /// sees the live count above the target; in-flight tasks are never
   /// interrupted.
   pub fn remove_worker(&self) {
      self.max_workers.fetch_sub(1, Ordering::AcqRel);
   }

   /// Stops every worker after its current task and shuts down the service
   /// threads.
   pub fn close(&self) {
      if self.exit.swap(true, Ordering::AcqRel) {
         return;
      }
      self.stop_tx.lock().take();
      let alive = self.current_workers.load(Ordering::Acquire).max(0);
      for _ in 0..alive {
         let _ = self.queue_tx.send(WorkItem::Exit);
      }
      tracing::debug!(workers = alive, "worker pool closing");
   }

   fn spawn_worker(self: &Arc<Self>, replacement: bool) -> Result<()> {
      let n = self.worker_seq.fetch_add(1, Ordering::Relaxed);
      let name = if replacement {
         format!("strata-replacement-{n}")
      } else {
         format!("strata-worker-{n}")
      };
      self.current_workers.fetch_add(1, Ordering::AcqRel);
      let me = Arc::clone(self);
      if let Err(e) = thread::Builder::new()
         .name(name)
         .spawn(move || me.exec_worker(replacement))
      {
         self.current_workers.fetch_sub(1, Ordering::AcqRel);
         return Err(e.into());
      }
      Ok(())
   }

   fn should_retire(&self, replacement: bool) -> bool {
      self.is_closed()
         || (replacement
            && self.current_workers.load(Ordering::Acquire)
               > self.max_workers.load(Ordering::Acquire))
   }

   fn exec_worker(self: Arc<Self>, replacement: bool) {
      IS_WORKER.with(|w| w.set(true));

      loop {
         let item = if replacement {
            match self.queue_rx.recv_timeout(REPLACEMENT_POLL) {
               Ok(item) => item,
               Err(RecvTimeoutError::Timeout) => {
                  if self.should_retire(true) {
                     break;
                  }
                  continue;
               },
               Err(RecvTimeoutError::Disconnected) => break,
            }
         } else {
            match self.queue_rx.recv() {
               Ok(item) => item,
               Err(_) => break,
            }
         };

         match item {
            WorkItem::Exit => break,
            WorkItem::Run(entry) => {
               // A directory scan waits on children of its own; starting one on
               // a temporary worker would stack replacements.
               if replacement && entry.task.kind() == TaskKind::ScanDirectory {
                  self.retry_buffer.lock().push(entry);
                  continue;
               }
               self.busy.fetch_add(1, Ordering::AcqRel);
               let begin = self.execute(&entry);
               self.busy.fetch_sub(1, Ordering::AcqRel);
               self.finish_task(&entry, begin);
            },
         }

         if self.should_retire(replacement) {
            break;
         }
      }

      self.current_workers.fetch_sub(1, Ordering::AcqRel);
   }

   fn execute(&self, entry: &Entry) -> Begin {
      let task = &entry.task;
      let begin = task.begin(entry.epoch);
      if begin != Begin::Run {
         return begin;
      }
      let handler = self.handlers.read().get(&task.kind()).cloned();
      let Some(handler) = handler else {
         task.error(TaskError::NoHandler(task.kind().as_str()));
         return begin;
      };

      tracing::debug!(task_id = %task.id(), kind = %task.kind(), "task started");
      match panic::catch_unwind(AssertUnwindSafe(|| handler(task))) {
         Ok(Ok(())) => task.success(),
         Ok(Err(e)) if e.is_cancellation() => task.cancel(),
         Ok(Err(e)) => task.error(e),
         Err(payload) => {
            let msg = payload
               .downcast_ref::<&str>()
               .map(|s| (*s).to_string())
               .or_else(|| payload.downcast_ref::<String>().cloned())
               .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task_id = %task.id(), "recovered panic in worker: {msg}");
            task.error(TaskError::Panic(msg));
         },
      }
      begin
   }

   fn finish_task(&self, entry: &Entry, begin: Begin) {
      let Entry { task, epoch, pool } = entry;
      let root = pool.get_root_pool();
      if begin == Begin::Stale {
         tracing::debug!(task_id = %task.id(), "dropping superseded queue entry");
         Self::settle(pool, &root);
         return;
      }

      task.clear_timeout();
      if task.state() == TaskState::Success {
         task.run_post_action();
      }
      // A task cancelled while queued already announced itself.
      if begin == Begin::Run {
         self.broadcaster.push_task_update(TaskUpdate::for_task(
            task,
            TaskEvent::Complete,
            root.remaining() - 1,
            root.total(),
         ));
      }

      task.run_cleanups();
      if task.state() == TaskState::Error {
         root.add_error(Arc::clone(task));
      }
      {
         let mut tasks = self.tasks.lock();
         if task.epoch() == *epoch {
            if !task.is_persistent() {
               tasks.remove(task.id());
            }
            if pool.is_global() {
               pool.forget(task.id());
            }
         }
      }
      task.finish(*epoch);
      Self::settle(pool, &root);
   }

   /// Counts one exit on the pool and its root, root exit lock first.
   fn settle(pool: &Arc<TaskPool>, root: &Arc<TaskPool>) {
      let _root_exit = root.exit_lock.lock();
      if Arc::ptr_eq(pool, root) {
         pool.handle_task_exit();
      } else {
         let _pool_exit = pool.exit_lock.lock();
         pool.handle_task_exit();
         root.handle_task_exit();
      }
   }

   fn drain_retries(self: Arc<Self>) {
      loop {
         match self.stop_rx.recv_timeout(self.retry_interval) {
            Err(RecvTimeoutError::Timeout) => {},
            _ => break,
         }
         let retries = std::mem::take(&mut *self.retry_buffer.lock());
         if !retries.is_empty() {
            tracing::debug!(count = retries.len(), "requeueing deferred tasks");
         }
         for entry in retries {
            let _ = self.queue_tx.send(WorkItem::Run(entry));
         }
      }
   }

   fn sweep_timeouts(self: Arc<Self>) {
      let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
      let mut armed: HashMap<u64, Weak<Task>> = HashMap::new();
      let mut seq = 0u64;

      loop {
         let wait = heap
            .peek()
            .map_or(SWEEP_IDLE, |Reverse((at, _))| at.saturating_duration_since(Instant::now()));

         crossbeam_channel::select! {
            recv(self.timeout_rx) -> msg => match msg {
               Ok((at, task)) => {
                  seq += 1;
                  heap.push(Reverse((at, seq)));
                  armed.insert(seq, task);
               },
               Err(_) => break,
            },
            recv(self.stop_rx) -> _ => break,
            default(wait) => {},
         }

         let now = Instant::now();
         while let Some(Reverse((at, _))) = heap.peek() {
            if *at > now {
               break;
            }
            let Some(Reverse((at, id))) = heap.pop() else {
               break;
            };
            let Some(task) = armed.remove(&id).and_then(|t| t.upgrade()) else {
               continue;
            };
            // Re-armed or cleared deadlines no longer match.
            if task.deadline() == Some(at) && !task.state().is_terminal() {
               tracing::warn!(task_id = %task.id(), kind = %task.kind(), "task deadline passed");
               task.error(TaskError::Timeout);
               task.cancel();
            }
         }
      }
   }
}
