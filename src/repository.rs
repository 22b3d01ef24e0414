//! Repository descriptors and the sanitized keys used by every ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote repository as reported by the source inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDescriptor {
    /// Qualified `owner/name`
    #[serde(rename = "nameWithOwner")]
    pub full_name: String,

    /// Unqualified name
    #[serde(rename = "name")]
    pub name: String,

    #[serde(default)]
    pub is_private: bool,

    /// Remote last-modified timestamp
    pub updated_at: DateTime<Utc>,

    #[serde(rename = "isArchived", default)]
    pub archived: bool,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
}

impl RepositoryDescriptor {
    pub fn key(&self) -> SanitizedKey {
        SanitizedKey::new(&self.full_name)
    }

    /// Owner part of the qualified name
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or("")
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A qualified repository name with path separators replaced by `_`.
///
/// Two names that differ only in `/` versus `_` map to the same key; such
/// collisions are not detected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SanitizedKey(String);

impl SanitizedKey {
    pub fn new(full_name: &str) -> Self {
        Self(full_name.replace(['/', '\\'], "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SanitizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<std::path::Path> for SanitizedKey {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}
