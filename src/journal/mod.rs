//! Event-sourced history of the file tree.
//!
//! Tree mutations append [`FileAction`]s to a [`FileEvent`]. Logging an event
//! sorts its actions, folds them into per-file [`Lifetime`]s and buffers them
//! for the store. The buffer is flushed when it reaches a threshold, on a
//! timer, or on request. A failed flush keeps the batch for the next attempt,
//! so delivery is at-least-once and a crash can lose the unflushed tail.

mod action;
mod lifetime;

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   thread,
   time::Duration,
};

pub use action::{ActionType, FileAction, FileEvent};
use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
pub use lifetime::{Lifetime, ReplayState, replay};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
   Result,
   error::{Error, JournalError},
   store::Store,
   tree::{FileId, PortablePath},
};

#[derive(Debug, Default)]
struct History {
   lifetimes: HashMap<String, Lifetime>,
   /// Current file id to the lifetime it belongs to, live lifetimes only.
   by_file:   HashMap<FileId, String>,
   /// `(server_id, seq)` of every applied action, for idempotent imports.
   seen:      HashSet<(String, u64)>,
}

/// A file as it existed at some point in the past.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PastFile {
   pub id:          FileId,
   pub name:        String,
   pub path:        PortablePath,
   pub is_dir:      bool,
   pub size:        i64,
   pub content_id:  Option<String>,
   pub lifetime_id: String,
}

pub struct Journal {
   server_id:       RwLock<String>,
   store:           Arc<dyn Store>,
   history:         RwLock<History>,
   pending:         Mutex<Vec<FileAction>>,
   flush_lock:      Mutex<()>,
   seq:             Arc<AtomicU64>,
   flush_threshold: usize,
   ignore_local:    AtomicBool,
   flusher:         Mutex<Option<Sender<()>>>,
}

impl std::fmt::Debug for Journal {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Journal")
         .field("server_id", &*self.server_id.read())
         .field("pending", &self.pending_len())
         .finish()
   }
}

impl Journal {
   pub fn new(server_id: &str, store: Arc<dyn Store>, flush_threshold: usize) -> Self {
      Self {
         server_id: RwLock::new(server_id.to_string()),
         store,
         history: RwLock::new(History::default()),
         pending: Mutex::new(Vec::new()),
         flush_lock: Mutex::new(()),
         seq: Arc::new(AtomicU64::new(1)),
         flush_threshold: flush_threshold.max(1),
         ignore_local: AtomicBool::new(false),
         flusher: Mutex::new(None),
      }
   }

   pub fn server_id(&self) -> String {
      self.server_id.read().clone()
   }

   /// Originates further actions as `server_id`, numbering them after every
   /// action already applied from it.
   pub fn adopt_server_id(&self, server_id: &str) {
      *self.server_id.write() = server_id.to_string();
      self.advance_seq_past_own();
   }

   fn advance_seq_past_own(&self) {
      let server_id = self.server_id();
      let own_max = self
         .history
         .read()
         .seen
         .iter()
         .filter(|(id, _)| *id == server_id)
         .map(|(_, seq)| *seq)
         .max()
         .unwrap_or(0);
      self.seq.fetch_max(own_max + 1, Ordering::AcqRel);
   }

   /// Rebuilds lifetimes from the store. Returns the number of actions
   /// applied.
   pub fn load(&self) -> Result<usize> {
      let mut actions = self.store.load_actions()?;
      let server_id = self.server_id();
      let own_max = actions
         .iter()
         .filter(|a| a.server_id == server_id)
         .map(|a| a.seq)
         .max()
         .unwrap_or(0);
      self.seq.fetch_max(own_max + 1, Ordering::AcqRel);
      let count = actions.len();
      if let Err(e) = self.apply(&mut actions, false) {
         tracing::warn!("journal load skipped inconsistent actions: {e}");
      }
      tracing::info!(actions = count, "loaded journal");
      Ok(count)
   }

   /// On backups the local tree only mirrors the core, so only the core's
   /// actions (and local backup records) belong in the history.
   pub fn set_ignore_local(&self, ignore: bool) {
      self.ignore_local.store(ignore, Ordering::Release);
   }

   pub fn new_event(&self) -> FileEvent {
      FileEvent::new(self.server_id(), Arc::clone(&self.seq))
   }

   /// Applies the event's actions in time order and buffers them for the
   /// store. Flush failures are logged, not returned; apply failures are.
   pub fn log_event(&self, event: &FileEvent) -> Result<()> {
      let mut actions = event.take_actions();
      if self.ignore_local.load(Ordering::Acquire) {
         actions.retain(|a| a.action_type == ActionType::Backup);
      }
      if actions.is_empty() {
         return Ok(());
      }
      self.apply(&mut actions, true)
   }

   /// Applies actions received from another server. Actions already seen are
   /// skipped. Returns how many were new. Actions carrying this journal's own
   /// server id move its sequence past them.
   pub fn import(&self, actions: Vec<FileAction>) -> Result<usize> {
      let mut fresh: Vec<FileAction> = {
         let history = self.history.read();
         actions
            .into_iter()
            .filter(|a| !history.seen.contains(&(a.server_id.clone(), a.seq)))
            .collect()
      };
      let count = fresh.len();
      if count > 0 {
         let applied = self.apply(&mut fresh, true);
         self.advance_seq_past_own();
         applied?;
      }
      Ok(count)
   }

   fn apply(&self, actions: &mut [FileAction], persist: bool) -> Result<()> {
      actions.sort_by_key(FileAction::sort_key);

      let mut first_err: Option<Error> = None;
      let mut applied = Vec::with_capacity(actions.len());
      {
         let mut history = self.history.write();
         for action in actions.iter_mut() {
            match apply_one(&mut history, action) {
               Ok(()) => applied.push(action.clone()),
               Err(e) => {
                  tracing::warn!(seq = action.seq, "rejected journal action: {e}");
                  first_err.get_or_insert(e);
               },
            }
         }
      }

      if persist && !applied.is_empty() {
         let over_threshold = {
            let mut pending = self.pending.lock();
            pending.extend(applied);
            pending.len() >= self.flush_threshold
         };
         if over_threshold && let Err(e) = self.flush() {
            tracing::warn!("journal flush failed, will retry: {e}");
         }
      }

      first_err.map_or(Ok(()), Err)
   }

   /// Writes buffered actions to the store. On failure the batch is put back
   /// in front of anything buffered since.
   pub fn flush(&self) -> Result<()> {
      let _guard = self.flush_lock.lock();
      let batch = std::mem::take(&mut *self.pending.lock());
      if batch.is_empty() {
         return Ok(());
      }
      match self.store.append_actions(&batch) {
         Ok(()) => {
            tracing::debug!(actions = batch.len(), "journal flushed");
            Ok(())
         },
         Err(e) => {
            let mut pending = self.pending.lock();
            let newer = std::mem::replace(&mut *pending, batch);
            pending.extend(newer);
            Err(JournalError::Flush(e.to_string()).into())
         },
      }
   }

   pub fn pending_len(&self) -> usize {
      self.pending.lock().len()
   }

   /// Starts a thread flushing every `interval` until
   /// [`Journal::stop_flusher`] or drop.
   pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> Result<()> {
      let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
      let weak = Arc::downgrade(self);
      thread::Builder::new()
         .name("strata-journal".to_string())
         .spawn(move || {
            loop {
               let stop = !matches!(stop_rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout));
               let Some(journal) = weak.upgrade() else {
                  break;
               };
               if let Err(e) = journal.flush() {
                  tracing::warn!("periodic journal flush failed: {e}");
               }
               if stop {
                  break;
               }
            }
         })?;
      *self.flusher.lock() = Some(stop_tx);
      Ok(())
   }

   pub fn stop_flusher(&self) {
      self.flusher.lock().take();
   }

   pub fn has_live_lifetime(&self, file_id: &str) -> bool {
      self.history.read().by_file.contains_key(file_id)
   }

   pub fn lifetime_for_file(&self, file_id: &str) -> Option<Lifetime> {
      let history = self.history.read();
      let lid = history.by_file.get(file_id)?;
      history.lifetimes.get(lid).cloned()
   }

   pub fn get_lifetime(&self, lifetime_id: &str) -> Option<Lifetime> {
      self.history.read().lifetimes.get(lifetime_id).cloned()
   }

   pub fn active_lifetimes(&self) -> Vec<Lifetime> {
      let history = self.history.read();
      let mut out: Vec<Lifetime> =
         history.lifetimes.values().filter(|l| l.is_live()).cloned().collect();
      out.sort_by(|a, b| a.id.cmp(&b.id));
      out
   }

   /// Every action of the lifetime that currently (or most recently) lives
   /// at `path`, oldest first.
   pub fn get_file_history(&self, path: &PortablePath) -> Vec<FileAction> {
      let history = self.history.read();
      let live = history
         .lifetimes
         .values()
         .find(|l| l.is_live() && l.latest_action().and_then(FileAction::subject_path) == Some(path));
      let lifetime = live.or_else(|| {
         history
            .lifetimes
            .values()
            .filter(|l| l.touches_path(path))
            .max_by_key(|l| l.latest_action().map(FileAction::sort_key))
      });
      lifetime.map(|l| l.actions.clone()).unwrap_or_default()
   }

   /// Every action whose origin or destination is `path`, across lifetimes.
   pub fn get_actions_by_path(&self, path: &PortablePath) -> Vec<FileAction> {
      let history = self.history.read();
      let mut out: Vec<FileAction> = history
         .lifetimes
         .values()
         .flat_map(|l| l.actions.iter())
         .filter(|a| a.destination_path.as_ref() == Some(path) || a.origin_path.as_ref() == Some(path))
         .cloned()
         .collect();
      out.sort_by_key(FileAction::sort_key);
      out
   }

   /// Reconstructs the children of `dir` as they were at time `t`.
   ///
   /// For every lifetime the last action at or before `t` decides where the
   /// file was; it is listed if it was not deleted and its parent was `dir`.
   pub fn get_past_folder_info(&self, dir: &PortablePath, t: DateTime<Utc>) -> Vec<PastFile> {
      let history = self.history.read();
      let mut out: Vec<PastFile> = history
         .lifetimes
         .values()
         .filter_map(|l| {
            let action = l.latest_at(t)?;
            if action.action_type == ActionType::Delete {
               return None;
            }
            let path = action.destination_path.as_ref()?;
            if path.parent().as_ref() != Some(dir) {
               return None;
            }
            Some(PastFile {
               id:          action.destination_id.clone().unwrap_or_default(),
               name:        path.filename().to_string(),
               path:        path.clone(),
               is_dir:      action.is_dir,
               size:        action.size,
               content_id:  action.content_id.clone(),
               lifetime_id: l.id.clone(),
            })
         })
         .collect();
      out.sort_by(|a, b| a.name.cmp(&b.name));
      out
   }

   pub fn latest_action(&self) -> Option<FileAction> {
      let history = self.history.read();
      history
         .lifetimes
         .values()
         .filter_map(Lifetime::latest_action)
         .max_by_key(|a| a.sort_key())
         .cloned()
   }

   /// Newest action originating on `server_id`.
   pub fn latest_action_from(&self, server_id: &str) -> Option<FileAction> {
      let history = self.history.read();
      history
         .lifetimes
         .values()
         .flat_map(|l| l.actions.iter())
         .filter(|a| a.server_id == server_id)
         .max_by_key(|a| a.sort_key())
         .cloned()
   }

   /// Actions at or after `since`, oldest first. Inclusive so equal
   /// timestamps are never skipped; [`Journal::import`] drops repeats.
   pub fn actions_since(&self, since: DateTime<Utc>) -> Vec<FileAction> {
      let history = self.history.read();
      let mut out: Vec<FileAction> = history
         .lifetimes
         .values()
         .flat_map(|l| l.actions.iter())
         .filter(|a| a.timestamp >= since)
         .cloned()
         .collect();
      out.sort_by_key(FileAction::sort_key);
      out
   }

   /// Lifetimes with any action at or after `since`.
   pub fn lifetimes_since(&self, since: DateTime<Utc>) -> Vec<Lifetime> {
      let history = self.history.read();
      let mut out: Vec<Lifetime> = history
         .lifetimes
         .values()
         .filter(|l| l.actions.iter().any(|a| a.timestamp >= since))
         .cloned()
         .collect();
      out.sort_by_key(|l| l.actions.first().map(FileAction::sort_key));
      out
   }
}

impl Drop for Journal {
   fn drop(&mut self) {
      self.flusher.lock().take();
      if let Err(e) = self.flush() {
         tracing::warn!("final journal flush failed: {e}");
      }
   }
}

fn apply_one(history: &mut History, action: &mut FileAction) -> Result<()> {
   let key = (action.server_id.clone(), action.seq);
   match action.action_type {
      ActionType::Create => {
         let id = action
            .destination_id
            .clone()
            .ok_or_else(|| JournalError::NoLifetime("create without destination".to_string()))?;
         if history.by_file.contains_key(&id) {
            return Err(JournalError::LifetimeExists(id).into());
         }
         let lid = action
            .lifetime_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
         action.lifetime_id = Some(lid.clone());
         history.lifetimes.insert(lid.clone(), Lifetime::begin(lid.clone(), action.clone()));
         history.by_file.insert(id, lid);
      },
      ActionType::Move => {
         let origin = action.origin_id.clone().unwrap_or_default();
         let lid = history
            .by_file
            .remove(&origin)
            .ok_or_else(|| JournalError::NoLifetime(origin.clone()))?;
         action.lifetime_id = Some(lid.clone());
         if let Some(dest) = action.destination_id.clone() {
            history.by_file.insert(dest, lid.clone());
         }
         extend(history, &lid, action);
      },
      ActionType::Delete => {
         let origin = action.origin_id.clone().unwrap_or_default();
         let lid = history
            .by_file
            .remove(&origin)
            .ok_or_else(|| JournalError::NoLifetime(origin.clone()))?;
         action.lifetime_id = Some(lid.clone());
         extend(history, &lid, action);
      },
      ActionType::Write | ActionType::Backup => {
         let id = action.subject_id().cloned().unwrap_or_default();
         let lid = history
            .by_file
            .get(&id)
            .cloned()
            .ok_or_else(|| JournalError::NoLifetime(id.clone()))?;
         action.lifetime_id = Some(lid.clone());
         extend(history, &lid, action);
      },
   }
   history.seen.insert(key);
   Ok(())
}

fn extend(history: &mut History, lifetime_id: &str, action: &FileAction) {
   if let Some(lifetime) = history.lifetimes.get_mut(lifetime_id) {
      lifetime.extend(action.clone());
   }
}
