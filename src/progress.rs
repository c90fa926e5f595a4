use crate::blob::keys;
use crate::master::{MasterRow, unique_stores};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Which organizational column the progress view groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    AreaManager,
    AreaSupervisor,
}

impl Dimension {
    /// Accepts the short query-parameter spellings used by the API.
    pub fn parse(raw: &str) -> Option<Dimension> {
        match raw.trim().to_lowercase().as_str() {
            "am" | "area_manager" => Some(Dimension::AreaManager),
            "as" | "area_supervisor" => Some(Dimension::AreaSupervisor),
            _ => None,
        }
    }

    fn value_of(self, row: &MasterRow) -> String {
        let raw = match self {
            Dimension::AreaManager => &row.area_manager,
            Dimension::AreaSupervisor => &row.area_supervisor,
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            "(tanpa grup)".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Per-group completion counts, derived on every view and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRow {
    /// Organizational dimension value (an AM or AS name).
    pub group: String,
    /// Stores in the group that owe a result file.
    pub target: u64,
    /// Stores whose result file for this version exists.
    pub sudah: u64,
    /// sudah / target; zero-target groups report zero progress.
    pub ratio: f64,
}

/// Aggregate per-group progress for one master version.
///
/// The master is deduplicated to one row per store; a store counts as done
/// when its canonical result key for `version` appears in `result_keys`.
/// Output is sorted ascending by completion ratio so the least-progressed
/// group surfaces first, with the group name breaking ties.
pub fn aggregate(
    master: &[MasterRow],
    result_keys: &[String],
    namespace: &str,
    version: &str,
    dimension: Dimension,
) -> Vec<ProgressRow> {
    let present: HashSet<&str> = result_keys.iter().map(|k| k.as_str()).collect();

    let mut groups: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for store in unique_stores(master) {
        let done = present.contains(keys::result(namespace, &store.store_code, version).as_str());
        let entry = groups.entry(dimension.value_of(&store)).or_insert((0, 0));
        entry.0 += 1;
        if done {
            entry.1 += 1;
        }
    }

    let mut rows: Vec<ProgressRow> = groups
        .into_iter()
        .map(|(group, (target, sudah))| ProgressRow {
            group,
            target,
            sudah,
            ratio: if target == 0 {
                0.0
            } else {
                sudah as f64 / target as f64
            },
        })
        .collect();

    rows.sort_by(|a, b| {
        a.ratio
            .partial_cmp(&b.ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.group.cmp(&b.group))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_row(store: &str, am: &str) -> MasterRow {
        MasterRow {
            store_code: store.to_string(),
            store_name: format!("Toko {}", store),
            area_manager: am.to_string(),
            area_supervisor: "AS1".to_string(),
            product_code: "P1".to_string(),
            description: String::new(),
            quantity: 0.0,
            amount: 0.0,
            annotation: String::new(),
        }
    }

    #[test]
    fn least_progressed_group_sorts_first() {
        let master = vec![
            store_row("A1", "A"),
            store_row("A2", "A"),
            store_row("A3", "A"),
            store_row("B1", "B"),
            store_row("B2", "B"),
        ];
        let result_keys = vec![
            keys::result("ns", "A1", "2026-01"),
            keys::result("ns", "B1", "2026-01"),
            keys::result("ns", "B2", "2026-01"),
        ];

        let rows = aggregate(&master, &result_keys, "ns", "2026-01", Dimension::AreaManager);
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].group, "A");
        assert_eq!(rows[0].target, 3);
        assert_eq!(rows[0].sudah, 1);
        assert!((rows[0].ratio - 1.0 / 3.0).abs() < 1e-9);

        assert_eq!(rows[1].group, "B");
        assert_eq!(rows[1].target, 2);
        assert_eq!(rows[1].sudah, 2);
        assert_eq!(rows[1].ratio, 1.0);
    }

    #[test]
    fn duplicate_master_rows_count_each_store_once() {
        let mut master = vec![store_row("A1", "A"), store_row("A1", "A")];
        master[1].product_code = "P2".to_string();

        let rows = aggregate(&master, &[], "ns", "2026-01", Dimension::AreaManager);
        assert_eq!(rows[0].target, 1);
    }

    #[test]
    fn other_versions_do_not_count_as_done() {
        let master = vec![store_row("A1", "A")];
        let result_keys = vec![keys::result("ns", "A1", "2025-12")];

        let rows = aggregate(&master, &result_keys, "ns", "2026-01", Dimension::AreaManager);
        assert_eq!(rows[0].sudah, 0);
    }

    #[test]
    fn blank_dimension_values_fall_into_a_catchall_group() {
        let master = vec![store_row("A1", "  ")];
        let rows = aggregate(&master, &[], "ns", "2026-01", Dimension::AreaManager);
        assert_eq!(rows[0].group, "(tanpa grup)");
    }
}
