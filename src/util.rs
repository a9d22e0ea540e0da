//! Utility functions for filesystem operations and identifiers

use std::{
   fs::{self, File},
   io::{Read, Write},
   path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::URL_SAFE};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Result, error::Error};

/// Read buffer used when hashing file content.
pub const HASH_BUFFER_BYTES: usize = 1024 * 1024;

/// Length of a content id derived by [`content_id_for_reader`].
pub const CONTENT_ID_LEN: usize = 20;

/// Flushes directory metadata so a preceding rename is durable.
pub fn fsync_dir(path: &Path) -> Result<()> {
   File::open(path)?.sync_all()?;
   Ok(())
}

/// Writes `value` as pretty JSON next to `path`, then renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   let tmp_path = temp_path(path)?;
   let data = serde_json::to_vec_pretty(value)?;
   let mut file = File::create(&tmp_path)?;
   file.write_all(&data)?;
   file.sync_all()?;
   drop(file);
   fs::rename(&tmp_path, path)?;
   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

fn temp_path(path: &Path) -> Result<PathBuf> {
   let name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| Error::Server { op: "write", reason: "invalid path".to_string() })?;
   Ok(path.with_file_name(format!("{name}.tmp")))
}

/// Hex sha256 digest of `input`, truncated to `len` characters.
pub fn short_hash(input: &[u8], len: usize) -> String {
   let digest = hex::encode(Sha256::digest(input));
   digest[..len.min(digest.len())].to_string()
}

/// Streams a reader through sha256 and returns the url-safe base64 digest
/// truncated to [`CONTENT_ID_LEN`].
pub fn content_id_for_reader<R: Read>(reader: R) -> Result<String> {
   Ok(hash_reader(reader)?.0)
}

/// Like [`content_id_for_reader`], also returning the number of bytes read.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(String, u64)> {
   let mut hasher = Sha256::new();
   let mut buf = vec![0u8; HASH_BUFFER_BYTES];
   let mut total = 0u64;
   loop {
      let n = reader.read(&mut buf)?;
      if n == 0 {
         break;
      }
      total += n as u64;
      hasher.update(&buf[..n]);
   }
   let encoded = URL_SAFE.encode(hasher.finalize());
   Ok((encoded[..CONTENT_ID_LEN].to_string(), total))
}

/// Formats a byte count as a human-readable size string
pub fn format_size(bytes: u64) -> String {
   const KB: u64 = 1024;
   const MB: u64 = KB * 1024;
   const GB: u64 = MB * 1024;

   if bytes < KB {
      format!("{bytes} B")
   } else if bytes < MB {
      format!("{:.1} KB", bytes as f64 / KB as f64)
   } else if bytes < GB {
      format!("{:.1} MB", bytes as f64 / MB as f64)
   } else {
      format!("{:.1} GB", bytes as f64 / GB as f64)
   }
}
