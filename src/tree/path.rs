//! Root-relative ("portable") paths.
//!
//! A portable path is `ALIAS:relative/path`. Directories end with `/`; the
//! root of an alias is `ALIAS:`. Portable paths are what the journal records
//! and what crosses the wire, so the same file has the same path on a core and
//! on its backups regardless of where each keeps its media root.

use std::{
   fmt,
   path::{Component, Path, PathBuf},
   str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortablePath {
   alias: String,
   rel:   String,
}

impl PortablePath {
   pub fn root(alias: &str) -> Self {
      Self { alias: alias.to_string(), rel: String::new() }
   }

   pub fn alias(&self) -> &str {
      &self.alias
   }

   /// The part after `ALIAS:`.
   pub fn relative(&self) -> &str {
      &self.rel
   }

   pub fn is_root(&self) -> bool {
      self.rel.is_empty()
   }

   pub fn is_dir(&self) -> bool {
      self.is_root() || self.rel.ends_with('/')
   }

   /// Last component without the trailing slash. Empty for the root.
   pub fn filename(&self) -> &str {
      let trimmed = self.rel.trim_end_matches('/');
      trimmed.rsplit('/').next().unwrap_or(trimmed)
   }

   pub fn parent(&self) -> Option<Self> {
      if self.is_root() {
         return None;
      }
      let trimmed = self.rel.trim_end_matches('/');
      let rel = match trimmed.rfind('/') {
         Some(idx) => trimmed[..=idx].to_string(),
         None => String::new(),
      };
      Some(Self { alias: self.alias.clone(), rel })
   }

   /// Appends a child name. Only meaningful on directories.
   pub fn child(&self, name: &str, is_dir: bool) -> Self {
      let mut rel = self.rel.clone();
      rel.push_str(name);
      if is_dir {
         rel.push('/');
      }
      Self { alias: self.alias.clone(), rel }
   }

   /// Relative components, root first.
   pub fn components(&self) -> impl Iterator<Item = &str> {
      self.rel.split('/').filter(|c| !c.is_empty())
   }

   /// True if `self` is `other` or lies below it.
   pub fn starts_with(&self, other: &Self) -> bool {
      self.alias == other.alias && other.is_dir() && self.rel.starts_with(&other.rel)
   }

   pub fn to_absolute(&self, root: &Path) -> PathBuf {
      let mut out = root.to_path_buf();
      for c in self.components() {
         out.push(c);
      }
      out
   }

   /// Maps an absolute path under `root` to its portable form.
   pub fn from_absolute(
      alias: &str,
      root: &Path,
      abs: &Path,
      is_dir: bool,
   ) -> Result<Self, TreeError> {
      let rel_path = abs
         .strip_prefix(root)
         .map_err(|_| TreeError::BadPath(abs.display().to_string()))?;
      let mut rel = String::new();
      for c in rel_path.components() {
         let Component::Normal(part) = c else {
            return Err(TreeError::BadPath(abs.display().to_string()));
         };
         let part = part
            .to_str()
            .ok_or_else(|| TreeError::BadPath(abs.display().to_string()))?;
         if !rel.is_empty() {
            rel.push('/');
         }
         rel.push_str(part);
      }
      if is_dir && !rel.is_empty() {
         rel.push('/');
      }
      Ok(Self { alias: alias.to_string(), rel })
   }
}

impl fmt::Display for PortablePath {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}:{}", self.alias, self.rel)
   }
}

impl FromStr for PortablePath {
   type Err = TreeError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let (alias, rel) = s
         .split_once(':')
         .ok_or_else(|| TreeError::BadPath(s.to_string()))?;
      if alias.is_empty() || rel.starts_with('/') || rel.contains("//") {
         return Err(TreeError::BadPath(s.to_string()));
      }
      if rel.split('/').any(|c| c == "." || c == "..") {
         return Err(TreeError::BadPath(s.to_string()));
      }
      Ok(Self { alias: alias.to_string(), rel: rel.to_string() })
   }
}

impl TryFrom<String> for PortablePath {
   type Error = TreeError;

   fn try_from(value: String) -> Result<Self, Self::Error> {
      value.parse()
   }
}

impl From<PortablePath> for String {
   fn from(p: PortablePath) -> Self {
      p.to_string()
   }
}
