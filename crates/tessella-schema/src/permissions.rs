//! Caller permissions.
//!
//! Permissions arrive from the auth collaborator as a nested map: project,
//! entities or relations, type system name, configuration section, operation,
//! list of field system names. The structure hashes to a stable fingerprint
//! so permission-filtered schemas can be cached per caller shape instead of
//! per caller.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation a permission grants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Get,
    Post,
    Put,
    Delete,
    Index,
}

/// Permissions on one entity or relation type, split by configuration
/// section. The value of each operation is the granted field list.
#[derive(Debug, Clone, Default, Hash, Serialize, Deserialize)]
pub struct TypePermissions {
    #[serde(default)]
    pub data: BTreeMap<Permission, BTreeSet<String>>,
    #[serde(default)]
    pub es_data: BTreeMap<Permission, BTreeSet<String>>,
}

impl TypePermissions {
    /// Whether the operation is granted at all; an empty field list still
    /// grants the operation itself.
    pub fn allows(&self, permission: Permission) -> bool {
        self.data.contains_key(&permission)
    }

    pub fn fields(&self, permission: Permission) -> Option<&BTreeSet<String>> {
        self.data.get(&permission)
    }
}

#[derive(Debug, Clone, Default, Hash, Serialize, Deserialize)]
pub struct ProjectPermissions {
    #[serde(default)]
    pub entities: BTreeMap<String, TypePermissions>,
    #[serde(default)]
    pub relations: BTreeMap<String, TypePermissions>,
}

/// Full permission set of one caller, keyed by project system name.
#[derive(Debug, Clone, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub BTreeMap<String, ProjectPermissions>);

impl Permissions {
    pub fn project(&self, project: &str) -> Option<&ProjectPermissions> {
        self.0.get(project)
    }

    pub fn entity(&self, project: &str, type_name: &str) -> Option<&TypePermissions> {
        self.project(project)
            .and_then(|p| p.entities.get(type_name))
    }

    pub fn relation(&self, project: &str, type_name: &str) -> Option<&TypePermissions> {
        self.project(project)
            .and_then(|p| p.relations.get(type_name))
    }

    /// Stable fingerprint of the whole structure. Two callers with the same
    /// grants share one schema cache entry.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AuthError(pub String);

/// Maps a caller token to its permissions. Token issuance and permission
/// storage live behind this seam.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn permissions(&self, token: &str) -> std::result::Result<Permissions, AuthError>;
}
