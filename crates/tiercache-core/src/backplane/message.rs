//! Backplane message model.

use std::fmt;

use uuid::Uuid;

use crate::key::CacheKey;

/// Identifies one cache instance on the backplane.
///
/// Generated once per instance; used to drop messages an instance published itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which write produced a `Changed` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Put,
    Update,
}

impl ChangeAction {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Add => 1,
            Self::Put => 2,
            Self::Update => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Add),
            2 => Some(Self::Put),
            3 => Some(Self::Update),
            _ => None,
        }
    }
}

/// What happened on the publishing instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackplaneAction {
    Changed { key: CacheKey, change: ChangeAction },
    Removed { key: CacheKey },
    Clear,
    ClearRegion { region: String },
}

impl BackplaneAction {
    pub const CHANGED: u8 = 1;
    pub const REMOVED: u8 = 2;
    pub const CLEAR: u8 = 3;
    pub const CLEAR_REGION: u8 = 4;

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Changed { .. } => Self::CHANGED,
            Self::Removed { .. } => Self::REMOVED,
            Self::Clear => Self::CLEAR,
            Self::ClearRegion { .. } => Self::CLEAR_REGION,
        }
    }
}

/// One invalidation notice. Carries no value payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackplaneMessage {
    pub owner: OwnerId,
    pub action: BackplaneAction,
}

impl BackplaneMessage {
    pub fn changed(owner: OwnerId, key: CacheKey, change: ChangeAction) -> Self {
        Self {
            owner,
            action: BackplaneAction::Changed { key, change },
        }
    }

    pub fn removed(owner: OwnerId, key: CacheKey) -> Self {
        Self {
            owner,
            action: BackplaneAction::Removed { key },
        }
    }

    pub fn clear(owner: OwnerId) -> Self {
        Self {
            owner,
            action: BackplaneAction::Clear,
        }
    }

    pub fn clear_region(owner: OwnerId, region: impl Into<String>) -> Self {
        Self {
            owner,
            action: BackplaneAction::ClearRegion {
                region: region.into(),
            },
        }
    }
}
