//! In-memory mirror of the on-disk media hierarchy.
//!
//! Nodes are identified by a hash of their portable path, so an id changes
//! when a node moves and the tree re-registers every moved descendant. Every
//! structural mutation appends one action per touched node to a
//! [`FileEvent`]; callers that do not pass an event get a dedicated one that
//! is logged when the operation returns.
//!
//! Tasks claim nodes exclusively before touching them. Move and remove first
//! cancel and wait for every claimant in the affected subtree, so no task
//! observes a half-moved or half-deleted subtree.

mod node;
mod path;

use std::{
   collections::HashMap,
   fs,
   io,
   path::{Path, PathBuf},
   sync::Arc,
};

use chrono::{DateTime, Utc};
pub use node::{FileInfo, Node, NodeKind};
use parking_lot::RwLock;
pub use path::PortablePath;
use walkdir::WalkDir;

use crate::{
   Result,
   broadcast::Broadcaster,
   error::TreeError,
   journal::{FileEvent, Journal},
   media::MediaIndex,
   task::Task,
   util::short_hash,
};

pub type FileId = String;

/// Id of the root node of every tree.
pub const ROOT_ID: &str = "ROOT";

/// Directory below each user's home that holds trashed files.
pub const TRASH_DIR_NAME: &str = ".user_trash";

/// Derives the id of the node at `path`.
pub fn file_id_for(path: &PortablePath) -> FileId {
   if path.is_root() {
      return ROOT_ID.to_string();
   }
   short_hash(path.to_string().as_bytes(), 16)
}

pub struct FileTree {
   root:        Arc<Node>,
   root_path:   PathBuf,
   alias:       String,
   index:       RwLock<HashMap<FileId, Arc<Node>>>,
   journal:     Arc<Journal>,
   media:       Arc<MediaIndex>,
   broadcaster: Arc<dyn Broadcaster>,
   ignore:      Vec<String>,
}

impl std::fmt::Debug for FileTree {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("FileTree")
         .field("alias", &self.alias)
         .field("root_path", &self.root_path)
         .field("nodes", &self.len())
         .finish()
   }
}

impl FileTree {
   /// Creates a tree rooted at `root_path`, creating the directory if needed.
   pub fn new(
      root_path: impl Into<PathBuf>,
      alias: &str,
      journal: Arc<Journal>,
      media: Arc<MediaIndex>,
      broadcaster: Arc<dyn Broadcaster>,
   ) -> Result<Self> {
      let root_path = root_path.into();
      fs::create_dir_all(&root_path)?;
      let root = Arc::new(Node::new(
         ROOT_ID.to_string(),
         PortablePath::root(alias),
         String::new(),
         NodeKind::Dir,
         0,
         Utc::now(),
      ));
      let mut index = HashMap::new();
      index.insert(ROOT_ID.to_string(), Arc::clone(&root));

      Ok(Self {
         root,
         root_path,
         alias: alias.to_string(),
         index: RwLock::new(index),
         journal,
         media,
         broadcaster,
         ignore: vec![".DS_Store".to_string()],
      })
   }

   /// Replaces the list of file names skipped when loading from disk.
   pub fn with_ignore(mut self, names: Vec<String>) -> Self {
      self.ignore = names;
      self
   }

   pub fn root(&self) -> Arc<Node> {
      Arc::clone(&self.root)
   }

   pub fn root_path(&self) -> &Path {
      &self.root_path
   }

   pub fn alias(&self) -> &str {
      &self.alias
   }

   pub fn journal(&self) -> &Arc<Journal> {
      &self.journal
   }

   pub fn media(&self) -> &Arc<MediaIndex> {
      &self.media
   }

   pub fn broadcaster(&self) -> &Arc<dyn Broadcaster> {
      &self.broadcaster
   }

   pub fn len(&self) -> usize {
      self.index.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() <= 1
   }

   pub fn get(&self, id: &str) -> Option<Arc<Node>> {
      self.index.read().get(id).cloned()
   }

   pub fn get_or_err(&self, id: &str) -> Result<Arc<Node>> {
      self.get(id).ok_or_else(|| TreeError::NotFound(id.to_string()).into())
   }

   pub fn get_by_path(&self, path: &PortablePath) -> Option<Arc<Node>> {
      if path.alias() != self.alias {
         return None;
      }
      self.get(&file_id_for(path))
   }

   pub fn abs_path(&self, node: &Node) -> PathBuf {
      node.portable_path().to_absolute(&self.root_path)
   }

   pub fn to_portable(&self, abs: &Path, is_dir: bool) -> Result<PortablePath> {
      Ok(PortablePath::from_absolute(&self.alias, &self.root_path, abs, is_dir)?)
   }

   /// Builds an unattached node for `name` below `parent`.
   fn new_node(&self, parent: &Node, name: &str, kind: NodeKind, size: i64) -> Result<Node> {
      validate_name(name)?;
      if !parent.is_dir() {
         return Err(TreeError::NotADirectory(parent.portable_path().to_string()).into());
      }
      let path = parent.portable_path().child(name, kind == NodeKind::Dir);
      let owner = if parent.parent().is_none() {
         name.to_string()
      } else {
         parent.owner().to_string()
      };
      Ok(Node::new(file_id_for(&path), path, owner, kind, size, Utc::now()))
   }

   /// Links `node` under `parent` without any checks. Only for the initial
   /// load, where the disk listing is already consistent.
   pub fn insert_bulk(&self, node: Arc<Node>, parent: &Arc<Node>) {
      node.set_parent(parent);
      if parent.is_read_only() {
         node.set_read_only(true);
      }
      parent.link_child(node.name(), Arc::clone(&node));
      self.index.write().insert(node.id(), node);
   }

   /// Checked insert: rejects id collisions and existing names, creates the
   /// entry on disk if missing, resizes ancestors, journals a create and
   /// broadcasts it.
   pub fn insert(
      &self,
      node: Arc<Node>,
      parent: &Arc<Node>,
      event: Option<&FileEvent>,
   ) -> Result<Arc<Node>> {
      if !parent.is_dir() {
         return Err(TreeError::NotADirectory(parent.portable_path().to_string()).into());
      }
      let name = node.name();
      if parent.child(&name).is_some() {
         return Err(TreeError::AlreadyExists(node.portable_path().to_string()).into());
      }
      {
         let mut index = self.index.write();
         if index.contains_key(&node.id()) {
            return Err(TreeError::IdCollision(node.id()).into());
         }
         index.insert(node.id(), Arc::clone(&node));
      }

      let abs = self.abs_path(&node);
      let created = if node.is_dir() {
         fs::create_dir_all(&abs)
      } else {
         fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&abs)
            .map(|_| ())
      };
      if let Err(e) = created {
         self.index.write().remove(&node.id());
         return Err(e.into());
      }
      if !node.is_dir() && node.size() < 0 {
         node.swap_size(fs::metadata(&abs).map_or(0, |m| m.len() as i64));
      }

      node.set_parent(parent);
      if parent.is_read_only() {
         node.set_read_only(true);
      }
      parent.link_child(name, Arc::clone(&node));

      self.with_event(event, |e| e.new_create_action(&node));
      self.broadcaster.push_file_create(node.format_info());
      self.resize_up(parent);
      Ok(node)
   }

   /// Creates a directory. Fails with `AlreadyExists` when the name is taken.
   pub fn mkdir(
      &self,
      parent: &Arc<Node>,
      name: &str,
      event: Option<&FileEvent>,
   ) -> Result<Arc<Node>> {
      if let Some(existing) = parent.child(name) {
         return Err(TreeError::AlreadyExists(existing.portable_path().to_string()).into());
      }
      let node = self.new_node(parent, name, NodeKind::Dir, 0)?;
      self.insert(Arc::new(node), parent, event)
   }

   /// Returns the directory `name` below `parent`, creating it if missing.
   pub fn mkdir_or_get(
      &self,
      parent: &Arc<Node>,
      name: &str,
      event: Option<&FileEvent>,
   ) -> Result<Arc<Node>> {
      match parent.child(name) {
         Some(existing) if existing.is_dir() => Ok(existing),
         Some(existing) => {
            Err(TreeError::NotADirectory(existing.portable_path().to_string()).into())
         },
         None => self.mkdir(parent, name, event),
      }
   }

   /// Creates an empty file (or registers one already on disk).
   pub fn touch(
      &self,
      parent: &Arc<Node>,
      name: &str,
      event: Option<&FileEvent>,
   ) -> Result<Arc<Node>> {
      if let Some(existing) = parent.child(name) {
         return Err(TreeError::AlreadyExists(existing.portable_path().to_string()).into());
      }
      let node = self.new_node(parent, name, NodeKind::File, -1)?;
      self.insert(Arc::new(node), parent, event)
   }

   /// Detaches `node` from its parent, drains claims in the subtree, drops
   /// media associations and index entries, then removes it from disk.
   pub fn remove(
      &self,
      node: &Arc<Node>,
      event: Option<&FileEvent>,
      by: Option<&Arc<Task>>,
   ) -> Result<()> {
      let Some(parent) = node.parent() else {
         return Err(TreeError::Root("removed").into());
      };
      let abs = self.abs_path(node);
      parent.unlink_child(&node.name());

      let subtree = collect_subtree(node);
      for n in &subtree {
         drain_claims(n, by);
      }
      self.with_event(event, |e| {
         for n in &subtree {
            if let Some(content_id) = n.content_id()
               && let Err(err) = self.media.remove_file(&content_id, &n.id())
            {
               tracing::warn!(file = %n.portable_path(), "failed to detach media: {err}");
            }
            self.index.write().remove(&n.id());
            e.new_delete_action(n);
            self.broadcaster.push_file_delete(n.format_info());
         }
      });

      let removed = if node.is_dir() {
         fs::remove_dir_all(&abs)
      } else {
         fs::remove_file(&abs)
      };
      match removed {
         Ok(()) => {},
         Err(e) if e.kind() == io::ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }

      self.resize_up(&parent);
      Ok(())
   }

   /// Moves (and optionally renames) `node` into `new_parent`.
   ///
   /// Claims anywhere in the subtree are cancelled and drained before the
   /// on-disk rename; after that point the move is not interrupted. Each
   /// descendant is re-registered under its new id with media and share
   /// attachments carried over.
   pub fn move_node(
      &self,
      node: &Arc<Node>,
      new_parent: &Arc<Node>,
      new_name: Option<&str>,
      overwrite: bool,
      event: Option<&FileEvent>,
      by: Option<&Arc<Task>>,
   ) -> Result<Arc<Node>> {
      let Some(old_parent) = node.parent() else {
         return Err(TreeError::Root("moved").into());
      };
      if !new_parent.is_dir() {
         return Err(TreeError::NotADirectory(new_parent.portable_path().to_string()).into());
      }
      if new_parent.parent().is_none() || node.owner() != new_parent.owner() {
         return Err(TreeError::IllegalMove(format!(
            "{} cannot move into {}",
            node.portable_path(),
            new_parent.portable_path()
         ))
         .into());
      }
      if node.is_ancestor_of(new_parent) {
         return Err(TreeError::IllegalMove(format!(
            "{} cannot move into itself",
            node.portable_path()
         ))
         .into());
      }

      let old_name = node.name();
      let name = new_name.unwrap_or(&old_name).to_string();
      validate_name(&name)?;
      if Arc::ptr_eq(&old_parent, new_parent) && name == old_name {
         return Ok(Arc::clone(node));
      }

      self.with_event(event, |e| {
         self.move_inner(node, &old_parent, new_parent, &name, overwrite, e, by)
      })?;
      Ok(Arc::clone(node))
   }

   #[allow(clippy::too_many_arguments, reason = "internal helper of move_node")]
   fn move_inner(
      &self,
      node: &Arc<Node>,
      old_parent: &Arc<Node>,
      new_parent: &Arc<Node>,
      name: &str,
      overwrite: bool,
      event: &FileEvent,
      by: Option<&Arc<Task>>,
   ) -> Result<()> {
      if let Some(existing) = new_parent.child(name) {
         if !overwrite {
            return Err(TreeError::AlreadyExists(existing.portable_path().to_string()).into());
         }
         self.remove(&existing, Some(event), by)?;
      }

      let subtree = collect_subtree(node);
      for n in &subtree {
         drain_claims(n, by);
      }

      let old_abs = self.abs_path(node);
      let new_abs = new_parent
         .portable_path()
         .child(name, node.is_dir())
         .to_absolute(&self.root_path);
      fs::rename(&old_abs, &new_abs)?;

      old_parent.unlink_child(&node.name());
      node.set_parent(new_parent);

      // Parents come before children in `subtree`, so each parent path is
      // already rewritten when its children are visited.
      for n in &subtree {
         let old_id = n.id();
         let old_path = n.portable_path();
         let new_path = match n.parent() {
            Some(p) if Arc::ptr_eq(n, node) => p.portable_path().child(name, n.is_dir()),
            Some(p) => p.portable_path().child(&n.name(), n.is_dir()),
            None => continue,
         };
         let new_id = file_id_for(&new_path);
         {
            let mut index = self.index.write();
            index.remove(&old_id);
            n.set_location(new_id.clone(), new_path);
            index.insert(new_id.clone(), Arc::clone(n));
         }
         if let Some(content_id) = n.content_id() {
            if let Err(err) = self.media.add_file(&content_id, &new_id) {
               tracing::warn!(file = %n.portable_path(), "failed to attach media: {err}");
            }
            if let Err(err) = self.media.remove_file(&content_id, &old_id) {
               tracing::warn!(file = %n.portable_path(), "failed to detach media: {err}");
            }
         }
         n.touch_mod_time();
         event.new_move_action(&old_id, &old_path, n);
         self.broadcaster.push_file_move(&old_id, n.format_info());
      }
      new_parent.link_child(name.to_string(), Arc::clone(node));

      self.resize_up(old_parent);
      self.resize_up(new_parent);
      Ok(())
   }

   /// Records a content change on a file: refreshes size and modify time
   /// from disk, journals a write and resizes ancestors.
   pub fn record_write(&self, node: &Arc<Node>, event: Option<&FileEvent>) -> Result<()> {
      let meta = fs::metadata(self.abs_path(node))?;
      node.swap_size(meta.len() as i64);
      node.touch_mod_time();
      self.with_event(event, |e| e.new_write_action(node));
      self.broadcaster.push_file_update(node.format_info());
      if let Some(parent) = node.parent() {
         self.resize_up(&parent);
      }
      Ok(())
   }

   /// Attaches a content id to a file, moving its media association.
   pub fn set_content_id(&self, node: &Arc<Node>, content_id: &str) -> Result<()> {
      if let Some(old) = node.content_id() {
         if old == content_id {
            return Ok(());
         }
         self.media.remove_file(&old, &node.id())?;
      }
      self.media.add_file(content_id, &node.id())?;
      node.set_content_id(Some(content_id.to_string()));
      Ok(())
   }

   pub fn set_share(&self, node: &Arc<Node>, share_id: Option<String>) {
      node.set_share_id(share_id);
      self.broadcaster.push_file_update(node.format_info());
   }

   /// Marks a subtree read-only (or writable again).
   pub fn set_read_only(&self, node: &Arc<Node>, read_only: bool) {
      for n in collect_subtree(node) {
         n.set_read_only(read_only);
      }
   }

   /// Recomputes directory sizes from `node` toward the root. Notifies only
   /// for directories whose size changed.
   pub fn resize_up(&self, node: &Arc<Node>) {
      let mut cur = Some(Arc::clone(node));
      while let Some(n) = cur {
         if n.is_dir() {
            let size = n.children_size();
            if n.swap_size(size) != size {
               self.broadcaster.push_file_update(n.format_info());
            }
         }
         cur = n.parent();
      }
   }

   /// Recomputes sizes for the whole subtree below `node`, leaves first.
   /// Files with an unknown size are stat-ed.
   pub fn resize_down(&self, node: &Arc<Node>) {
      leaf_map(node, &mut |n| {
         let size = if n.is_dir() {
            n.children_size()
         } else if n.size() < 0 {
            fs::metadata(self.abs_path(n)).map_or(0, |m| m.len() as i64)
         } else {
            n.size()
         };
         if n.swap_size(size) != size {
            self.broadcaster.push_file_update(n.format_info());
         }
      });
   }

   /// Takes the exclusive claim on `node` for `task`, blocking while another
   /// task holds it. The claim is released when the task exits if it was not
   /// released earlier.
   pub fn add_task(&self, node: &Arc<Node>, task: &Arc<Task>) {
      node.acquire_claim(task);
      let claimed = Arc::downgrade(node);
      task.set_cleanup(move |t| {
         if let Some(n) = claimed.upgrade() {
            n.release_if_held(t.id());
         }
      });
   }

   /// Releases the claim `task` holds on `node`.
   ///
   /// # Panics
   /// When a different task holds the claim.
   pub fn remove_task(&self, node: &Arc<Node>, task: &Task) {
      node.release_claim(task.id());
   }

   /// Loads the on-disk hierarchy below the root with unchecked inserts, then
   /// computes sizes and journals a create for every node the journal does
   /// not yet know. Returns the number of nodes loaded.
   pub fn load_from_disk(&self) -> Result<usize> {
      let ignore = self.ignore.clone();
      let mut count = 0usize;
      let mut walker = WalkDir::new(&self.root_path)
         .min_depth(1)
         .sort_by_file_name()
         .into_iter()
         .filter_entry(|e| !ignore.iter().any(|i| e.file_name().to_str() == Some(i.as_str())));

      while let Some(entry) = walker.next() {
         let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
               tracing::warn!("skipping unreadable entry: {e}");
               continue;
            },
         };
         let is_dir = entry.file_type().is_dir();
         let path = match self.to_portable(entry.path(), is_dir) {
            Ok(path) => path,
            Err(e) => {
               tracing::warn!(path = %entry.path().display(), "skipping unmappable entry: {e}");
               if is_dir {
                  walker.skip_current_dir();
               }
               continue;
            },
         };
         if self.get_by_path(&path).is_some() {
            continue;
         }
         let Some(parent) = path.parent().and_then(|p| self.get_by_path(&p)) else {
            tracing::warn!(path = %path, "parent not loaded, skipping");
            continue;
         };
         let meta = entry.metadata().ok();
         let size = if is_dir { 0 } else { meta.as_ref().map_or(-1, |m| m.len() as i64) };
         let kind = if is_dir { NodeKind::Dir } else { NodeKind::File };
         let mut node = self.new_node(&parent, path.filename(), kind, size)?;
         if let Some(modified) = meta.and_then(|m| m.modified().ok()) {
            node = node.with_mod_time(DateTime::<Utc>::from(modified));
         }
         self.insert_bulk(Arc::new(node), &parent);
         count += 1;
      }

      self.resize_down(&self.root);
      self.reconcile_journal();
      tracing::info!(nodes = count, root = %self.root_path.display(), "loaded file tree");
      Ok(count)
   }

   /// Journals a create for every node without a live lifetime.
   fn reconcile_journal(&self) {
      let event = self.journal.new_event();
      bubble_map_down(&self.root, &mut |n| {
         if n.parent().is_some() && !self.journal.has_live_lifetime(&n.id()) {
            event.new_create_action(n);
         }
      });
      if event.len() > 0 {
         tracing::debug!(actions = event.len(), "journaling untracked files");
      }
      if let Err(e) = self.journal.log_event(&event) {
         tracing::warn!("failed to journal untracked files: {e}");
      }
   }

   fn with_event<T>(&self, event: Option<&FileEvent>, f: impl FnOnce(&FileEvent) -> T) -> T {
      match event {
         Some(e) => f(e),
         None => {
            let e = self.journal.new_event();
            let out = f(&e);
            if let Err(err) = self.journal.log_event(&e) {
               tracing::warn!("failed to log event: {err}");
            }
            out
         },
      }
   }
}

fn validate_name(name: &str) -> Result<()> {
   if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains(':') {
      return Err(TreeError::BadPath(name.to_string()).into());
   }
   Ok(())
}

/// `node` and every descendant, parents before children.
pub fn collect_subtree(node: &Arc<Node>) -> Vec<Arc<Node>> {
   let mut out = Vec::new();
   bubble_map_down(node, &mut |n| out.push(Arc::clone(n)));
   out
}

/// Visits `node` and then its descendants, parents first.
pub fn bubble_map_down(node: &Arc<Node>, f: &mut impl FnMut(&Arc<Node>)) {
   f(node);
   for child in node.children() {
      bubble_map_down(&child, f);
   }
}

/// Visits descendants before their parent, ending with `node`.
pub fn leaf_map(node: &Arc<Node>, f: &mut impl FnMut(&Arc<Node>)) {
   for child in node.children() {
      leaf_map(&child, f);
   }
   f(node);
}

/// Cancels and waits for any task other than `by` claiming `node`.
fn drain_claims(node: &Arc<Node>, by: Option<&Arc<Task>>) {
   while let Some(holder) = node.claimant() {
      if by.is_some_and(|b| b.id() == holder.id()) {
         return;
      }
      tracing::debug!(file = %node.portable_path(), task_id = %holder.id(), "draining claim");
      holder.cancel();
      holder.wait();
      node.release_if_held(holder.id());
   }
}
