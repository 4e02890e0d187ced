//! Shared references between documents, audit entries and storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Document types that carry a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Quote,
    Job,
    Invoice,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Quote => "quote",
            EntityKind::Job => "job",
            EntityKind::Invoice => "invoice",
        }
    }

    /// Prefix of the human-readable document number.
    pub fn number_prefix(&self) -> &'static str {
        match self {
            EntityKind::Quote => "Q",
            EntityKind::Job => "J",
            EntityKind::Invoice => "INV",
        }
    }

    /// Format a per-organization sequence value as a document number.
    pub fn format_number(&self, sequence: i64) -> String {
        format!("{}-{:05}", self.number_prefix(), sequence)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quote" => Ok(EntityKind::Quote),
            "job" => Ok(EntityKind::Job),
            "invoice" => Ok(EntityKind::Invoice),
            other => Err(anyhow::anyhow!("Unknown entity kind '{}'", other)),
        }
    }
}

/// Reference to a single document of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn quote(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Quote,
            id,
        }
    }

    pub fn job(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Job,
            id,
        }
    }

    pub fn invoice(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Invoice,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A document that owns line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DocumentRef {
    Quote(Uuid),
    Invoice(Uuid),
}

impl DocumentRef {
    pub fn id(&self) -> Uuid {
        match self {
            DocumentRef::Quote(id) | DocumentRef::Invoice(id) => *id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            DocumentRef::Quote(_) => EntityKind::Quote,
            DocumentRef::Invoice(_) => EntityKind::Invoice,
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef {
            kind: self.kind(),
            id: self.id(),
        }
    }

    /// Rebuild a reference from its stored kind and id.
    pub fn from_parts(kind: &str, id: Uuid) -> Result<Self, anyhow::Error> {
        match kind {
            "quote" => Ok(DocumentRef::Quote(id)),
            "invoice" => Ok(DocumentRef::Invoice(id)),
            other => Err(anyhow::anyhow!("'{}' documents do not own line items", other)),
        }
    }
}
