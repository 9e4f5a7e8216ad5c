//! Entity data model shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Entity identifier, stable across the original and derived schemas.
pub type EntityId = i64;

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Inactive,
    Suspended,
    Pending,
    Blocked,
}

impl EntityStatus {
    /// All statuses accepted by the derived schema.
    pub const ALL: [EntityStatus; 5] = [
        EntityStatus::Active,
        EntityStatus::Inactive,
        EntityStatus::Suspended,
        EntityStatus::Pending,
        EntityStatus::Blocked,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Inactive => "inactive",
            EntityStatus::Suspended => "suspended",
            EntityStatus::Pending => "pending",
            EntityStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string outside the accepted enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for EntityStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EntityStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Aggregate monetary counters, in minor currency units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonetaryTotals {
    pub deposits: i64,
    pub bets: i64,
    pub withdrawals: i64,
    pub cpa_earned: i64,
    pub rev_earned: i64,
    pub commissions_paid: i64,
}

/// A hierarchical record as read from the original schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub external_id: String,
    pub name: String,
    /// Raw status text from the source; see [`Entity::status`].
    pub status: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub totals: MonetaryTotals,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// Create an active entity with zeroed totals.
    pub fn new(id: EntityId, parent_id: Option<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            external_id: format!("ext-{id}"),
            name: name.into(),
            status: EntityStatus::Active.as_str().to_string(),
            registered_at: None,
            totals: MonetaryTotals::default(),
            created_at: Utc::now(),
        }
    }

    /// Set the raw status text.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the monetary totals.
    pub fn with_totals(mut self, totals: MonetaryTotals) -> Self {
        self.totals = totals;
        self
    }

    /// Parsed status.
    pub fn status(&self) -> Result<EntityStatus, UnknownStatus> {
        self.status.parse()
    }

    /// Check the record-level invariants the derived schema enforces.
    pub fn validate(&self) -> Result<(), RecordViolation> {
        self.status()?;
        if self.parent_id == Some(self.id) {
            return Err(RecordViolation::SelfParent(self.id));
        }
        if self.name.trim().is_empty() {
            return Err(RecordViolation::EmptyName(self.id));
        }
        Ok(())
    }
}

/// Why a single record cannot be migrated. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordViolation {
    #[error(transparent)]
    Status(#[from] UnknownStatus),

    #[error("entity {0} is its own parent")]
    SelfParent(EntityId),

    #[error("entity {0} has an empty name")]
    EmptyName(EntityId),
}

/// Derived ancestor/descendant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub ancestor_id: EntityId,
    pub descendant_id: EntityId,
    /// Number of parent hops from descendant to ancestor (>= 1).
    pub level_distance: u32,
}

impl HierarchyEdge {
    pub fn new(ancestor_id: EntityId, descendant_id: EntityId, level_distance: u32) -> Self {
        Self {
            ancestor_id,
            descendant_id,
            level_distance,
        }
    }
}

/// Child-to-parent link of a target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
}

/// Source identifier range captured once before a migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceBounds {
    pub count: u64,
    pub min_id: Option<EntityId>,
    pub max_id: Option<EntityId>,
}

impl SourceBounds {
    /// An empty source table.
    pub const EMPTY: SourceBounds = SourceBounds {
        count: 0,
        min_id: None,
        max_id: None,
    };

    /// Inclusive identifier range, if the table is non-empty.
    pub fn range(&self) -> Option<(EntityId, EntityId)> {
        self.min_id.zip(self.max_id)
    }
}

/// Maintained counters of a target entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchyCounters {
    pub direct_referrals: i64,
    pub network_size: i64,
    pub hierarchy_level: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("active".parse::<EntityStatus>(), Ok(EntityStatus::Active));
        assert_eq!(" Suspended ".parse::<EntityStatus>(), Ok(EntityStatus::Suspended));
        assert_eq!(
            "deleted".parse::<EntityStatus>(),
            Err(UnknownStatus("deleted".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_self_parent() {
        let entity = Entity::new(7, Some(7), "loop");
        assert_eq!(entity.validate(), Err(RecordViolation::SelfParent(7)));
    }

    #[test]
    fn test_validate_rejects_unknown_status() {
        let entity = Entity::new(1, None, "root").with_status("archived");
        assert!(matches!(entity.validate(), Err(RecordViolation::Status(_))));
    }

    #[test]
    fn test_bounds_range() {
        assert_eq!(SourceBounds::EMPTY.range(), None);
        let bounds = SourceBounds {
            count: 3,
            min_id: Some(1),
            max_id: Some(3),
        };
        assert_eq!(bounds.range(), Some((1, 3)));
    }
}
