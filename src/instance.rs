//! Server identity and the core/backup relationship.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{Result, error::Error, store::Store, util::short_hash};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
   /// Owns the media and accepts writes.
   Core,
   /// Mirrors one or more cores; never originates file changes.
   Backup,
   /// Receiving a core's history and files from a backup.
   Restore,
   #[default]
   Uninitialized,
}

impl fmt::Display for Role {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(match self {
         Self::Core => "core",
         Self::Backup => "backup",
         Self::Restore => "restore",
         Self::Uninitialized => "uninitialized",
      })
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
   pub id:           String,
   pub name:         String,
   pub role:         Role,
   /// On the local core: the key backups must present. On a remote core
   /// record: the key this server presents to it.
   pub api_key:      Option<String>,
   pub core_address: Option<String>,
   pub is_local:     bool,
   pub last_backup:  Option<DateTime<Utc>>,
}

impl Instance {
   fn new_local(name: &str) -> Self {
      Self {
         id:           new_instance_id(name),
         name:         name.to_string(),
         role:         Role::Uninitialized,
         api_key:      None,
         core_address: None,
         is_local:     true,
         last_backup:  None,
      }
   }
}

fn new_instance_id(name: &str) -> String {
   short_hash(format!("{name}:{}", Utc::now().to_rfc3339()).as_bytes(), 12)
}

/// The local instance and every known remote, persisted through the store.
pub struct InstanceRegistry {
   local:   RwLock<Instance>,
   remotes: RwLock<HashMap<String, Instance>>,
   store:   Arc<dyn Store>,
}

impl fmt::Debug for InstanceRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("InstanceRegistry")
         .field("local", &self.local.read().id)
         .field("remotes", &self.remotes.read().len())
         .finish()
   }
}

impl InstanceRegistry {
   /// Loads instances from the store, creating an uninitialized local
   /// instance on first start.
   pub fn open(store: Arc<dyn Store>, name: &str) -> Result<Self> {
      let mut local = None;
      let mut remotes = HashMap::new();
      for instance in store.load_instances()? {
         if instance.is_local {
            local = Some(instance);
         } else {
            remotes.insert(instance.id.clone(), instance);
         }
      }
      let local = match local {
         Some(local) => local,
         None => {
            let local = Instance::new_local(name);
            store.save_instance(&local)?;
            tracing::info!(id = %local.id, "created local instance");
            local
         },
      };
      Ok(Self { local: RwLock::new(local), remotes: RwLock::new(remotes), store })
   }

   pub fn local(&self) -> Instance {
      self.local.read().clone()
   }

   pub fn local_id(&self) -> String {
      self.local.read().id.clone()
   }

   pub fn role(&self) -> Role {
      self.local.read().role
   }

   /// Fails with [`Error::Role`] unless the local instance has `role`.
   pub fn require_role(&self, op: &'static str, role: Role) -> Result<()> {
      let local = self.role();
      if local != role {
         return Err(Error::Role { op, role: local });
      }
      Ok(())
   }

   /// Fails with [`Error::Role`] when the local instance is a backup.
   pub fn require_not_backup(&self, op: &'static str) -> Result<()> {
      let local = self.role();
      if local == Role::Backup {
         return Err(Error::Role { op, role: local });
      }
      Ok(())
   }

   /// Makes this server a core. A key is generated when none is given.
   pub fn init_core(&self, name: &str, api_key: Option<String>) -> Result<Instance> {
      self.init_local(name, Role::Core, |local| {
         local.api_key =
            Some(api_key.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()));
      })
   }

   /// Makes this server a backup. Call [`InstanceRegistry::add_remote`] with
   /// the paired core afterwards.
   pub fn init_backup(&self, name: &str) -> Result<Instance> {
      self.init_local(name, Role::Backup, |local| local.api_key = None)
   }

   /// Prepares this server to receive a restore of the core `core_id`. The
   /// server takes over the core's id and key so backups keep recognizing
   /// it. Repeating the call restarts an unfinished restore.
   pub fn init_restore(&self, core_id: &str, name: &str, api_key: &str) -> Result<Instance> {
      let current = self.role();
      if current != Role::Uninitialized && current != Role::Restore {
         return Err(Error::Role { op: "restore", role: current });
      }
      let previous = self.local.read().id.clone();
      let mut local = self.local.read().clone();
      local.id = core_id.to_string();
      local.name = name.to_string();
      local.role = Role::Restore;
      local.api_key = Some(api_key.to_string());
      self.store.save_instance(&local)?;
      if previous != local.id {
         self.store.delete_instance(&previous)?;
      }
      *self.local.write() = local.clone();
      tracing::info!(id = %local.id, %previous, "adopted core identity for restore");
      Ok(local)
   }

   /// Ends a restore; the server is a core from here on.
   pub fn complete_restore(&self) -> Result<Instance> {
      self.require_role("complete restore", Role::Restore)?;
      let mut local = self.local.read().clone();
      local.role = Role::Core;
      self.store.save_instance(&local)?;
      *self.local.write() = local.clone();
      tracing::info!(id = %local.id, "restore complete");
      Ok(local)
   }

   fn init_local(&self, name: &str, role: Role, f: impl FnOnce(&mut Instance)) -> Result<Instance> {
      let current = self.role();
      if current != Role::Uninitialized && current != role {
         return Err(Error::Role { op: "initialize", role: current });
      }
      let mut local = self.local.read().clone();
      local.name = name.to_string();
      local.role = role;
      f(&mut local);
      self.store.save_instance(&local)?;
      *self.local.write() = local.clone();
      tracing::info!(id = %local.id, %role, "initialized local instance");
      Ok(local)
   }

   pub fn add_remote(&self, mut instance: Instance) -> Result<()> {
      instance.is_local = false;
      self.store.save_instance(&instance)?;
      self.remotes.write().insert(instance.id.clone(), instance);
      Ok(())
   }

   pub fn remote(&self, id: &str) -> Option<Instance> {
      self.remotes.read().get(id).cloned()
   }

   pub fn remotes(&self) -> Vec<Instance> {
      let mut out: Vec<Instance> = self.remotes.read().values().cloned().collect();
      out.sort_by(|a, b| a.id.cmp(&b.id));
      out
   }

   /// Remote cores, for a backup to replicate from.
   pub fn cores(&self) -> Vec<Instance> {
      self.remotes().into_iter().filter(|r| r.role == Role::Core).collect()
   }

   pub fn set_last_backup(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
      let updated = {
         let mut remotes = self.remotes.write();
         let Some(remote) = remotes.get_mut(id) else {
            return Ok(());
         };
         remote.last_backup = Some(at);
         remote.clone()
      };
      self.store.save_instance(&updated)
   }

   /// True when `key` matches the local key of a core or a server being
   /// restored into one.
   pub fn check_key(&self, key: &str) -> bool {
      let local = self.local.read();
      matches!(local.role, Role::Core | Role::Restore) && local.api_key.as_deref() == Some(key)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::store::MemoryStore;

   #[test]
   fn local_instance_survives_reopen() {
      let store = Arc::new(MemoryStore::new());
      let first = InstanceRegistry::open(store.clone(), "alpha").expect("open");
      first.init_core("alpha", Some("key".into())).expect("init");

      let second = InstanceRegistry::open(store, "ignored").expect("reopen");
      assert_eq!(second.local_id(), first.local_id());
      assert_eq!(second.role(), Role::Core);
      assert!(second.check_key("key"));
      assert!(!second.check_key("other"));
   }

   #[test]
   fn role_cannot_flip() {
      let registry = InstanceRegistry::open(Arc::new(MemoryStore::new()), "b").expect("open");
      registry.init_backup("b").expect("init");
      assert!(matches!(registry.init_core("b", None), Err(Error::Role { .. })));
      assert!(registry.require_role("backup", Role::Backup).is_ok());
      assert!(registry.require_not_backup("upload").is_err());
      assert!(matches!(registry.init_restore("c", "c", "k"), Err(Error::Role { .. })));
   }

   #[test]
   fn restore_adopts_the_core_identity() {
      let store = Arc::new(MemoryStore::new());
      let registry = InstanceRegistry::open(store.clone(), "fresh").expect("open");
      let own_id = registry.local_id();
      registry.init_restore("core-1", "home", "key").expect("restore");
      assert_eq!(registry.role(), Role::Restore);
      assert!(registry.check_key("key"));
      assert!(matches!(registry.init_core("home", None), Err(Error::Role { .. })));

      registry.complete_restore().expect("complete");
      let reopened = InstanceRegistry::open(store.clone(), "ignored").expect("reopen");
      assert_eq!(reopened.local_id(), "core-1");
      assert_eq!(reopened.role(), Role::Core);
      assert!(reopened.check_key("key"));
      assert!(store.load_instances().expect("load").iter().all(|i| i.id != own_id));
      assert!(matches!(reopened.complete_restore(), Err(Error::Role { role: Role::Core, .. })));
   }
}
