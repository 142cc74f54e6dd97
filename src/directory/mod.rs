//! Directory - resolves display names into participant identities
//!
//! The bridge looks names up here before inviting anyone. `SqliteDirectory`
//! is the local store used by the binary.

mod contacts;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{Invitee, ParticipantId};

pub use contacts::SqliteDirectory;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),
}

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Person,
    Group,
    Service,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Person => "person",
            EntryKind::Group => "group",
            EntryKind::Service => "service",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "group" => EntryKind::Group,
            "service" => EntryKind::Service,
            _ => EntryKind::Person,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: ParticipantId,
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl DirectoryEntry {
    pub fn person(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: EntryKind::Person,
            avatar: None,
        }
    }

    pub fn to_invitee(&self) -> Invitee {
        Invitee {
            id: self.id.clone(),
            display_name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// Name lookup used before inviting someone.
pub trait Directory: Send + Sync {
    /// Entries whose name matches `query`, best match first.
    fn search(&self, query: &str) -> Result<Vec<DirectoryEntry>, DirectoryError>;
}
