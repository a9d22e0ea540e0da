use std::{
   collections::BTreeMap,
   fmt,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicI64, Ordering},
   },
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{FileId, PortablePath};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
   File,
   Dir,
}

/// Serializable view of a node, as handed to broadcasters and remote peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
   pub id:            FileId,
   pub name:          String,
   pub portable_path: PortablePath,
   pub parent_id:     Option<FileId>,
   pub owner:         String,
   pub is_dir:        bool,
   pub size:          i64,
   pub mod_time:      DateTime<Utc>,
   pub children:      Vec<FileId>,
   pub content_id:    Option<String>,
   pub share_id:      Option<String>,
   pub read_only:     bool,
}

/// One file or directory in a [`super::FileTree`].
pub struct Node {
   id:    RwLock<FileId>,
   path:  RwLock<PortablePath>,
   owner: String,
   kind:  NodeKind,

   /// Bytes; `-1` until the size is known.
   size:     AtomicI64,
   mod_time: RwLock<DateTime<Utc>>,

   parent:   RwLock<Weak<Node>>,
   children: RwLock<BTreeMap<String, Arc<Node>>>,

   claim:    Mutex<Option<Arc<Task>>>,
   claim_cv: Condvar,

   share_id:   RwLock<Option<String>>,
   content_id: RwLock<Option<String>>,
   read_only:  AtomicBool,
}

impl fmt::Debug for Node {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Node")
         .field("id", &*self.id.read())
         .field("path", &self.path.read().to_string())
         .field("size", &self.size())
         .finish()
   }
}

impl Node {
   pub(crate) fn new(
      id: FileId,
      path: PortablePath,
      owner: String,
      kind: NodeKind,
      size: i64,
      mod_time: DateTime<Utc>,
   ) -> Self {
      Self {
         id: RwLock::new(id),
         path: RwLock::new(path),
         owner,
         kind,
         size: AtomicI64::new(size),
         mod_time: RwLock::new(mod_time),
         parent: RwLock::new(Weak::new()),
         children: RwLock::new(BTreeMap::new()),
         claim: Mutex::new(None),
         claim_cv: Condvar::new(),
         share_id: RwLock::new(None),
         content_id: RwLock::new(None),
         read_only: AtomicBool::new(false),
      }
   }

   pub(crate) fn with_mod_time(self, mod_time: DateTime<Utc>) -> Self {
      *self.mod_time.write() = mod_time;
      self
   }

   pub fn id(&self) -> FileId {
      self.id.read().clone()
   }

   pub fn name(&self) -> String {
      let path = self.path.read();
      if path.is_root() {
         return path.alias().to_string();
      }
      path.filename().to_string()
   }

   pub fn portable_path(&self) -> PortablePath {
      self.path.read().clone()
   }

   pub fn owner(&self) -> &str {
      &self.owner
   }

   pub const fn kind(&self) -> NodeKind {
      self.kind
   }

   pub fn is_dir(&self) -> bool {
      self.kind == NodeKind::Dir
   }

   pub fn size(&self) -> i64 {
      self.size.load(Ordering::Acquire)
   }

   /// Stores a new size and returns the previous one.
   pub(crate) fn swap_size(&self, size: i64) -> i64 {
      self.size.swap(size, Ordering::AcqRel)
   }

   pub fn mod_time(&self) -> DateTime<Utc> {
      *self.mod_time.read()
   }

   pub(crate) fn touch_mod_time(&self) {
      *self.mod_time.write() = Utc::now();
   }

   pub fn parent(&self) -> Option<Arc<Self>> {
      self.parent.read().upgrade()
   }

   pub fn children(&self) -> Vec<Arc<Self>> {
      self.children.read().values().cloned().collect()
   }

   pub fn child(&self, name: &str) -> Option<Arc<Self>> {
      self.children.read().get(name).cloned()
   }

   pub fn child_count(&self) -> usize {
      self.children.read().len()
   }

   pub fn content_id(&self) -> Option<String> {
      self.content_id.read().clone()
   }

   pub(crate) fn set_content_id(&self, content_id: Option<String>) {
      *self.content_id.write() = content_id;
   }

   pub fn share_id(&self) -> Option<String> {
      self.share_id.read().clone()
   }

   pub(crate) fn set_share_id(&self, share_id: Option<String>) {
      *self.share_id.write() = share_id;
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only.load(Ordering::Acquire)
   }

   pub(crate) fn set_read_only(&self, read_only: bool) {
      self.read_only.store(read_only, Ordering::Release);
   }

   /// True if `other` is this node or one of its descendants.
   pub fn is_ancestor_of(self: &Arc<Self>, other: &Arc<Self>) -> bool {
      let mut cur = Some(Arc::clone(other));
      while let Some(n) = cur {
         if Arc::ptr_eq(&n, self) {
            return true;
         }
         cur = n.parent();
      }
      false
   }

   /// Sum of the children's known sizes.
   pub fn children_size(&self) -> i64 {
      self.children.read().values().map(|c| c.size().max(0)).sum()
   }

   /// The task currently holding the exclusive claim.
   pub fn claimant(&self) -> Option<Arc<Task>> {
      self.claim.lock().clone()
   }

   pub fn format_info(&self) -> FileInfo {
      FileInfo {
         id:            self.id(),
         name:          self.name(),
         portable_path: self.portable_path(),
         parent_id:     self.parent().map(|p| p.id()),
         owner:         self.owner.clone(),
         is_dir:        self.is_dir(),
         size:          self.size(),
         mod_time:      self.mod_time(),
         children:      self.children.read().values().map(|c| c.id()).collect(),
         content_id:    self.content_id(),
         share_id:      self.share_id(),
         read_only:     self.is_read_only(),
      }
   }

   pub(crate) fn set_location(&self, id: FileId, path: PortablePath) {
      *self.id.write() = id;
      *self.path.write() = path;
   }

   pub(crate) fn set_parent(&self, parent: &Arc<Self>) {
      *self.parent.write() = Arc::downgrade(parent);
   }

   pub(crate) fn link_child(&self, name: String, child: Arc<Self>) -> Option<Arc<Self>> {
      self.children.write().insert(name, child)
   }

   pub(crate) fn unlink_child(&self, name: &str) -> Option<Arc<Self>> {
      self.children.write().remove(name)
   }

   /// Blocks until no other task holds the claim, then takes it for `task`.
   pub(crate) fn acquire_claim(&self, task: &Arc<Task>) {
      let mut slot = self.claim.lock();
      while slot.as_ref().is_some_and(|held| held.id() != task.id()) {
         self.claim_cv.wait(&mut slot);
      }
      *slot = Some(Arc::clone(task));
   }

   /// Releases the claim held by `task_id`. Panics when another task holds
   /// it; releasing someone else's claim is a programming error.
   pub(crate) fn release_claim(&self, task_id: &str) {
      let mut slot = self.claim.lock();
      match slot.as_ref() {
         None => {},
         Some(held) if held.id() == task_id => {
            *slot = None;
            self.claim_cv.notify_all();
         },
         Some(held) => panic!(
            "claim on {} is held by task {}, not {task_id}",
            self.path.read(),
            held.id()
         ),
      }
   }

   /// Releases the claim if `task_id` still holds it.
   pub(crate) fn release_if_held(&self, task_id: &str) {
      let mut slot = self.claim.lock();
      if slot.as_ref().is_some_and(|held| held.id() == task_id) {
         *slot = None;
         self.claim_cv.notify_all();
      }
   }
}
