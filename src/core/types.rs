use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Canonical field values of a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A record in a backend's wire shape.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Process-wide item identity counter
static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime-local identity of an item.
///
/// Independent of either backend's primary key and never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Generate a new unique item ID
    pub fn new() -> Self {
        ItemId(NEXT_ITEM_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item_{}", self.0)
    }
}

/// One of the two backing systems a record synchronizes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The remote network service.
    Transporter,
    /// The persistent local cache.
    LocalCache,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Transporter, Target::LocalCache];

    /// The opposite side.
    pub fn other(self) -> Target {
        match self {
            Target::Transporter => Target::LocalCache,
            Target::LocalCache => Target::Transporter,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Target::Transporter => 0,
            Target::LocalCache => 1,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transporter => "transporter",
            Self::LocalCache => "local_cache",
        };
        write!(f, "{label}")
    }
}

/// Where a change (or a whole record) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Transporter,
    LocalCache,
    /// User input; nothing downstream has seen it yet.
    #[default]
    Fresh,
}

impl Origin {
    /// Targets a change from this origin must be propagated to.
    pub fn downstream(self) -> Vec<Target> {
        match self {
            Origin::Transporter => vec![Target::LocalCache],
            Origin::LocalCache => vec![Target::Transporter],
            Origin::Fresh => Target::ALL.to_vec(),
        }
    }

    pub fn target(self) -> Option<Target> {
        match self {
            Origin::Transporter => Some(Target::Transporter),
            Origin::LocalCache => Some(Target::LocalCache),
            Origin::Fresh => None,
        }
    }
}

impl From<Target> for Origin {
    fn from(target: Target) -> Self {
        match target {
            Target::Transporter => Origin::Transporter,
            Target::LocalCache => Origin::LocalCache,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{target}"),
            None => write!(f, "fresh"),
        }
    }
}
