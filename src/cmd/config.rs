//! Prints the effective configuration.

use crate::{Result, config};

pub fn execute(path_only: bool) -> Result<()> {
   if path_only {
      println!("{}", config::config_file_path().display());
      return Ok(());
   }
   print!("{}", config::get().to_toml()?);
   Ok(())
}
