//! Pluggable notification sink for file and task events.
//!
//! The core never talks to a transport directly. It pushes [`Message`]s into a
//! [`Broadcaster`]; the transport layer supplies an implementation that
//! forwards them to connected clients.

use std::{
   collections::BTreeMap,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   thread,
   time::Duration,
};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::{
   Result,
   task::{Task, TaskState},
   tree::FileInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
   Complete,
   Failure,
   Cancel,
   Progress,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdate {
   pub event:           TaskEvent,
   pub task_id:         String,
   pub kind:            &'static str,
   pub exit_status:     Option<TaskState>,
   pub queue_remaining: i64,
   pub queue_total:     i64,
   pub result:          BTreeMap<String, Value>,
   pub error:           Option<String>,
}

impl TaskUpdate {
   pub fn for_task(task: &Task, event: TaskEvent, queue_remaining: i64, queue_total: i64) -> Self {
      Self {
         event,
         task_id: task.id().to_string(),
         kind: task.kind().as_str(),
         exit_status: task.exit_status(),
         queue_remaining,
         queue_total,
         result: task.results(),
         error: task.read_error().map(|e| e.to_string()),
      }
   }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolUpdate {
   pub pool_id:   String,
   pub completed: i64,
   pub total:     i64,
   pub progress:  f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Message {
   FileCreated { file: FileInfo },
   FileUpdated { file: FileInfo },
   FileMoved { old_id: String, file: FileInfo },
   FileDeleted { file: FileInfo },
   Task(TaskUpdate),
   Pool(PoolUpdate),
}

pub trait Broadcaster: Send + Sync {
   fn send(&self, msg: Message);

   /// Delivers anything buffered. Unbuffered sinks have nothing to do.
   fn flush(&self) {}

   fn push_file_create(&self, file: FileInfo) {
      self.send(Message::FileCreated { file });
   }

   fn push_file_update(&self, file: FileInfo) {
      self.send(Message::FileUpdated { file });
   }

   fn push_file_move(&self, old_id: &str, file: FileInfo) {
      self.send(Message::FileMoved { old_id: old_id.to_string(), file });
   }

   fn push_file_delete(&self, file: FileInfo) {
      self.send(Message::FileDeleted { file });
   }

   fn push_task_update(&self, update: TaskUpdate) {
      self.send(Message::Task(update));
   }

   fn push_pool_update(&self, update: PoolUpdate) {
      self.send(Message::Pool(update));
   }
}

#[derive(Debug, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
   fn send(&self, _msg: Message) {}
}

/// Emits every message as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
   fn send(&self, msg: Message) {
      match serde_json::to_string(&msg) {
         Ok(json) => tracing::info!(target: "strata::broadcast", "{json}"),
         Err(e) => tracing::warn!("unserializable broadcast: {e}"),
      }
   }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
   messages: Mutex<Vec<Message>>,
}

impl RecordingBroadcaster {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn messages(&self) -> Vec<Message> {
      self.messages.lock().clone()
   }

   pub fn count(&self, pred: impl Fn(&Message) -> bool) -> usize {
      self.messages.lock().iter().filter(|m| pred(m)).count()
   }

   pub fn clear(&self) {
      self.messages.lock().clear();
   }
}

impl Broadcaster for RecordingBroadcaster {
   fn send(&self, msg: Message) {
      self.messages.lock().push(msg);
   }
}

/// Collects messages and hands them to an inner sink in batches, either on a
/// timer or on explicit [`Broadcaster::flush`].
pub struct BufferedBroadcaster {
   inner:      Arc<dyn Broadcaster>,
   buffer:     Mutex<Vec<Message>>,
   auto_flush: AtomicBool,
   stop_tx:    Mutex<Option<Sender<()>>>,
}

impl BufferedBroadcaster {
   /// Starts the timer thread that flushes every `interval`.
   pub fn spawn(inner: Arc<dyn Broadcaster>, interval: Duration) -> Result<Arc<Self>> {
      let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
      let caster = Arc::new(Self {
         inner,
         buffer: Mutex::new(Vec::new()),
         auto_flush: AtomicBool::new(true),
         stop_tx: Mutex::new(Some(stop_tx)),
      });

      let weak = Arc::downgrade(&caster);
      thread::Builder::new()
         .name("strata-broadcast".to_string())
         .spawn(move || {
            loop {
               match stop_rx.recv_timeout(interval) {
                  Err(RecvTimeoutError::Timeout) => {},
                  _ => break,
               }
               let Some(caster) = weak.upgrade() else {
                  break;
               };
               if caster.auto_flush.load(Ordering::Acquire) {
                  caster.flush();
               }
            }
         })?;
      Ok(caster)
   }

   /// Holds messages until the next explicit flush.
   pub fn disable_auto_flush(&self) {
      self.auto_flush.store(false, Ordering::Release);
   }

   pub fn enable_auto_flush(&self) {
      self.auto_flush.store(true, Ordering::Release);
   }

   pub fn pending(&self) -> usize {
      self.buffer.lock().len()
   }

   /// Flushes what is buffered and stops the timer.
   pub fn close(&self) {
      self.stop_tx.lock().take();
      self.flush();
   }
}

impl Broadcaster for BufferedBroadcaster {
   fn send(&self, msg: Message) {
      self.buffer.lock().push(msg);
   }

   fn flush(&self) {
      let batch = std::mem::take(&mut *self.buffer.lock());
      for msg in batch {
         self.inner.send(msg);
      }
      self.inner.flush();
   }
}

impl Drop for BufferedBroadcaster {
   fn drop(&mut self) {
      self.stop_tx.lock().take();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn pool_msg(n: i64) -> Message {
      Message::Pool(PoolUpdate { pool_id: "p".into(), completed: n, total: 4, progress: 0.0 })
   }

   #[test]
   fn buffered_holds_until_flush() {
      let sink = Arc::new(RecordingBroadcaster::new());
      let caster =
         BufferedBroadcaster::spawn(sink.clone(), Duration::from_secs(3600)).expect("spawn");
      caster.disable_auto_flush();
      caster.send(pool_msg(1));
      caster.send(pool_msg(2));
      assert_eq!(sink.messages().len(), 0);
      assert_eq!(caster.pending(), 2);

      caster.flush();
      assert_eq!(sink.messages().len(), 2);
      assert_eq!(caster.pending(), 0);
   }

   #[test]
   fn timer_flushes() {
      let sink = Arc::new(RecordingBroadcaster::new());
      let caster = BufferedBroadcaster::spawn(sink.clone(), Duration::from_millis(10)).expect("spawn");
      caster.send(pool_msg(1));
      for _ in 0..200 {
         if !sink.messages().is_empty() {
            break;
         }
         thread::sleep(Duration::from_millis(5));
      }
      assert_eq!(sink.messages().len(), 1);
      caster.close();
   }
}
