//! Shared test fixtures: canned permissions, a stub auth provider and a
//! recording revision log over the core graph stubs.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use tessella_core::GraphTransaction;

use crate::mutate::{RevisionEntry, RevisionError, RevisionLog};
use crate::permissions::{AuthError, AuthProvider, Permissions};

/// Permissions granting full read and write access to the film catalogue
/// fixture of `tessella_core::testing::films_project`.
pub fn catalogue_permissions() -> Permissions {
    serde_json::from_value(json!({
        "cinecos": {
            "entities": {
                "film": {
                    "data": {
                        "get": ["title", "year", "genre"],
                        "post": ["title", "year", "genre"],
                        "put": ["title", "year", "genre"],
                        "delete": [],
                    },
                },
                "person": {
                    "data": {
                        "get": ["name", "date_of_birth"],
                        "put": ["name", "date_of_birth"],
                    },
                },
                "book": {
                    "data": { "get": ["title"] },
                },
            },
            "relations": {
                "cast": { "data": { "get": ["order"] } },
                "director": { "data": { "get": [] } },
            },
        },
    }))
    .expect("fixture permissions deserialize")
}

/// Same fixture, read access to films only and nothing else.
pub fn film_reader_permissions() -> Permissions {
    serde_json::from_value(json!({
        "cinecos": {
            "entities": {
                "film": { "data": { "get": ["title"] } },
            },
        },
    }))
    .expect("fixture permissions deserialize")
}

/// Auth seam returning one fixed permission set for every token.
pub struct StubAuthProvider {
    permissions: Permissions,
}

impl StubAuthProvider {
    pub fn new(permissions: Permissions) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl AuthProvider for StubAuthProvider {
    async fn permissions(&self, _token: &str) -> Result<Permissions, AuthError> {
        Ok(self.permissions.clone())
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Revision log that records every entry, optionally failing to exercise
/// rollback paths.
#[derive(Default)]
pub struct RecordingRevisionLog {
    entries: Mutex<Vec<RevisionEntry>>,
    fail: Mutex<bool>,
}

impl RecordingRevisionLog {
    pub fn fail_next(&self) {
        *locked(&self.fail) = true;
    }

    pub fn entries(&self) -> Vec<RevisionEntry> {
        locked(&self.entries).clone()
    }
}

#[async_trait]
impl RevisionLog for RecordingRevisionLog {
    async fn append(
        &self,
        txn: &mut dyn GraphTransaction,
        entry: &RevisionEntry,
    ) -> Result<(), RevisionError> {
        // The concrete transaction must be reachable for implementations
        // that write through the same connection.
        if txn
            .as_any()
            .downcast_mut::<tessella_core::testing::StubTransaction>()
            .is_none()
        {
            return Err(RevisionError("unexpected transaction type".to_string()));
        }
        if *locked(&self.fail) {
            return Err(RevisionError("revision store unavailable".to_string()));
        }
        locked(&self.entries).push(entry.clone());
        Ok(())
    }
}

/// Field set helper for permission assertions.
pub fn names(fields: &BTreeSet<String>) -> Vec<&str> {
    fields.iter().map(String::as_str).collect()
}
