//! Role initialization: make this server a core, or pair it with a core as
//! a backup.

use std::sync::Arc;

use console::style;

use super::blocking;
use crate::{
   Error, Result, config,
   instance::{Instance, InstanceRegistry, Role},
   replication::{CoreClient, HttpCoreClient, PairRequest},
   store::{JsonStore, Store},
};

fn open_registry(cfg: &config::Config) -> Result<InstanceRegistry> {
   let store: Arc<dyn Store> = Arc::new(JsonStore::open(&cfg.data_dir)?);
   InstanceRegistry::open(store, &cfg.server_name)
}

/// Initializes the local instance as a core and prints its key.
pub async fn execute_core(name: Option<String>, api_key: Option<String>) -> Result<()> {
   let cfg = config::get().clone();
   let local = blocking("init core", move || {
      let registry = open_registry(&cfg)?;
      let name = name.unwrap_or_else(|| cfg.server_name.clone());
      registry.init_core(&name, api_key.or_else(|| cfg.api_key.clone()))
   })
   .await?;

   println!("{}", style("Initialized core").green().bold());
   println!("Instance: {}", style(&local.id).cyan());
   if let Some(key) = &local.api_key {
      println!("API key: {}", style(key).yellow());
   }
   Ok(())
}

/// Pairs with the core at `address` and initializes the local instance as
/// its backup.
pub async fn execute_backup(
   name: Option<String>,
   address: Option<String>,
   api_key: Option<String>,
) -> Result<()> {
   let cfg = config::get().clone();
   let address = address
      .or_else(|| cfg.core_address.clone())
      .ok_or_else(|| Error::Server { op: "pair", reason: "no core address given".to_string() })?;
   let api_key = api_key
      .or_else(|| cfg.api_key.clone())
      .ok_or_else(|| Error::Server { op: "pair", reason: "no api key given".to_string() })?;

   let core = blocking("pair", move || {
      let registry = open_registry(&cfg)?;
      let local = registry.local();
      if local.role == Role::Core {
         return Err(Error::Role { op: "pair", role: local.role });
      }

      let client = HttpCoreClient::new(&address, &api_key)?;
      let name = name.unwrap_or_else(|| cfg.server_name.clone());
      let response = client.pair(&PairRequest { id: local.id, name: name.clone() })?;
      if response.alias != cfg.root_alias {
         return Err(Error::Server {
            op:     "pair",
            reason: format!(
               "core uses root alias {:?} but this server is configured with {:?}",
               response.alias, cfg.root_alias
            ),
         });
      }

      registry.init_backup(&name)?;
      let core = Instance {
         id:           response.id,
         name:         response.name,
         role:         Role::Core,
         api_key:      Some(api_key),
         core_address: Some(address),
         is_local:     false,
         last_backup:  None,
      };
      registry.add_remote(core.clone())?;
      Ok(core)
   })
   .await?;

   println!("{}", style("Paired with core").green().bold());
   println!("Core: {} {}", style(&core.id).cyan(), style(&core.name).dim());
   Ok(())
}
