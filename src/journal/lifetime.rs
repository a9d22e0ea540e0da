use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActionType, FileAction};
use crate::tree::{FileId, PortablePath};

/// Ordered history of one logical file across moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
   pub id:           String,
   /// Current id of the file; `None` once deleted.
   pub live_file_id: Option<FileId>,
   pub is_dir:       bool,
   pub content_id:   Option<String>,
   pub actions:      Vec<FileAction>,
}

impl Lifetime {
   pub(crate) fn begin(id: String, create: FileAction) -> Self {
      Self {
         id,
         live_file_id: create.destination_id.clone(),
         is_dir: create.is_dir,
         content_id: create.content_id.clone(),
         actions: vec![create],
      }
   }

   pub fn is_live(&self) -> bool {
      self.live_file_id.is_some()
   }

   pub(crate) fn extend(&mut self, action: FileAction) {
      match action.action_type {
         ActionType::Delete => self.live_file_id = None,
         ActionType::Create | ActionType::Move => {
            self.live_file_id.clone_from(&action.destination_id);
         },
         ActionType::Write | ActionType::Backup => {},
      }
      if action.content_id.is_some() {
         self.content_id.clone_from(&action.content_id);
      }
      let pos = self
         .actions
         .partition_point(|a| a.sort_key() <= action.sort_key());
      self.actions.insert(pos, action);
   }

   pub fn latest_action(&self) -> Option<&FileAction> {
      self.actions.last()
   }

   /// The last action at or before `t`.
   pub fn latest_at(&self, t: DateTime<Utc>) -> Option<&FileAction> {
      self.actions.iter().rev().find(|a| a.timestamp <= t)
   }

   pub fn touches_path(&self, path: &PortablePath) -> bool {
      self.actions.iter().any(|a| {
         a.destination_path.as_ref() == Some(path) || a.origin_path.as_ref() == Some(path)
      })
   }

   pub fn replay(&self) -> ReplayState {
      replay(&self.actions)
   }
}

/// Where a lifetime ends up after folding its actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
   pub file_id:    Option<FileId>,
   pub path:       Option<PortablePath>,
   pub live:       bool,
   pub size:       i64,
   pub content_id: Option<String>,
}

/// Folds actions in order into the final identity, path and content.
pub fn replay(actions: &[FileAction]) -> ReplayState {
   let mut ordered: Vec<&FileAction> = actions.iter().collect();
   ordered.sort_by_key(|a| a.sort_key());

   let mut state = ReplayState::default();
   for a in ordered {
      match a.action_type {
         ActionType::Create | ActionType::Move => {
            state.file_id.clone_from(&a.destination_id);
            state.path.clone_from(&a.destination_path);
            state.live = true;
         },
         ActionType::Delete => state.live = false,
         ActionType::Write | ActionType::Backup => {},
      }
      state.size = a.size;
      if a.content_id.is_some() {
         state.content_id.clone_from(&a.content_id);
      }
   }
   state
}
