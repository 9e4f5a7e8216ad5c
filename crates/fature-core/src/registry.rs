//! Static table registry.
//!
//! Every table name that reaches a SQL statement comes from this module.
//! Adapters interpolate these `&'static str` values and nothing else.

/// Name of the derived (optimized) schema.
pub const DERIVED_SCHEMA: &str = "fature_v2";

/// Derived entity table.
pub const DERIVED_ENTITIES: &str = "affiliates_optimized";

/// Derived hierarchy closure table.
pub const HIERARCHY_INDEX: &str = "hierarchy_index";

/// Derived transaction table read by monitoring.
pub const DERIVED_TRANSACTIONS: &str = "transactions";

/// Derived commission table read by monitoring.
pub const DERIVED_COMMISSIONS: &str = "commissions";

/// Query performance log read by monitoring.
pub const QUERY_PERFORMANCE_LOG: &str = "query_performance_log";

/// Cache table read by monitoring.
pub const PERFORMANCE_CACHE: &str = "performance_cache";

/// Append-only rollback audit table (original schema).
pub const ROLLBACK_LOG: &str = "rollback_log";

/// Safety-net copy of the derived entity table taken during a rollback.
pub const ROLLBACK_SAFETY_SNAPSHOT: &str = "affiliates_v2_backup_rollback";

/// An original-schema table that can be snapshotted and restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name in the original schema.
    pub name: &'static str,
    /// Name of its pre-migration snapshot.
    pub snapshot: &'static str,
    /// Whether a missing snapshot blocks a rollback.
    pub required: bool,
    /// Position in the restore sequence (lower first).
    pub restore_order: u8,
}

/// The primary entity table.
pub const PRIMARY_TABLE: TableSpec = TableSpec {
    name: "affiliates",
    snapshot: "affiliates_backup_pre_v2",
    required: true,
    restore_order: 0,
};

/// Secondary tables, restored best-effort after the primary table.
pub const SECONDARY_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "transactions",
        snapshot: "transactions_backup_pre_v2",
        required: false,
        restore_order: 1,
    },
    TableSpec {
        name: "commissions",
        snapshot: "commissions_backup_pre_v2",
        required: false,
        restore_order: 2,
    },
    TableSpec {
        name: "payments",
        snapshot: "payments_backup_pre_v2",
        required: false,
        restore_order: 3,
    },
];

/// Secondary tables in restore order.
pub fn secondary_restore_plan() -> Vec<&'static TableSpec> {
    let mut plan: Vec<&'static TableSpec> = SECONDARY_TABLES.iter().collect();
    plan.sort_by_key(|spec| spec.restore_order);
    plan
}

/// Every table that owns a pre-migration snapshot, primary first.
pub fn all_snapshotted_tables() -> Vec<&'static TableSpec> {
    let mut tables = vec![&PRIMARY_TABLE];
    tables.extend(secondary_restore_plan());
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_restores_first() {
        let tables = all_snapshotted_tables();
        assert_eq!(tables[0].name, "affiliates");
        assert!(tables[0].required);
        assert!(tables[1..].iter().all(|t| !t.required));
        assert!(tables
            .windows(2)
            .all(|pair| pair[0].restore_order < pair[1].restore_order));
    }

    #[test]
    fn test_snapshot_names_are_distinct() {
        let tables = all_snapshotted_tables();
        for (i, a) in tables.iter().enumerate() {
            assert!(a.snapshot.ends_with("_backup_pre_v2"));
            for b in &tables[i + 1..] {
                assert_ne!(a.snapshot, b.snapshot);
            }
        }
    }
}
