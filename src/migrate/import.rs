use std::collections::BTreeMap;

use log::info;
use rusqlite::Transaction;

use crate::bundles::{gen_bounds, Bundle};
use crate::error::RelayError;
use crate::migrate::legacy::LegacySnapshot;
use crate::saves::Save;

/// Legacy-id to new-id bindings for one migration run. Owned by the import
/// pass and discarded with it; nothing outside the run's transaction ever
/// sees these ids.
///
/// Identifier policy: fresh identifiers. The store assigns every new row id
/// on insert and the binding table is the only bridge back to the legacy
/// keys. Legacy ids are never forced onto new rows.
#[derive(Debug, Default)]
pub struct BindingTable {
    saves: BTreeMap<i64, i64>,
    bundles: BTreeMap<i64, i64>,
}

impl BindingTable {
    pub fn bind_save(&mut self, old_id: i64, new_id: i64) {
        self.saves.insert(old_id, new_id);
    }

    pub fn bind_bundle(&mut self, old_id: i64, new_id: i64) {
        self.bundles.insert(old_id, new_id);
    }

    pub fn save(&self, old_id: i64) -> Option<i64> {
        self.saves.get(&old_id).copied()
    }

    pub fn bundle(&self, old_id: i64) -> Option<i64> {
        self.bundles.get(&old_id).copied()
    }
}

/// Per-bundle generation tags accumulated while writing memberships, keyed by
/// new bundle id. Input to the repair pass.
pub type RepairQueue = BTreeMap<i64, Vec<String>>;

#[derive(Clone, Copy, Debug, Default)]
pub struct ImportCounts {
    pub saves: usize,
    pub bundles: usize,
    pub memberships: usize,
    pub bundles_downgraded: usize,
}

/// Write every save, bundle, and membership edge from the snapshot into the
/// open transaction, rebinding all identifiers. Any failure must be treated
/// as fatal by the caller (rollback); this function writes nothing outside
/// `tx`.
pub fn import_snapshot(
    tx: &Transaction,
    snapshot: &LegacySnapshot,
) -> Result<(ImportCounts, RepairQueue), RelayError> {
    let mut bindings = BindingTable::default();
    let mut counts = ImportCounts::default();

    info!("Inserting {} saves, please wait...", snapshot.saves.len());
    for save in &snapshot.saves {
        let new_id = Save::insert(
            tx,
            &save.upload_time,
            &save.download_code,
            save.download_count,
            &save.generation,
            save.legal,
            &save.payload,
        )?;
        bindings.bind_save(save.id, new_id);
        counts.saves += 1;
    }

    info!("Inserting {} bundles, please wait...", snapshot.bundles.len());
    // Current legality per new bundle id, so the downgrade rule below touches
    // each bundle row at most once.
    let mut bundle_legal: BTreeMap<i64, bool> = BTreeMap::new();
    for bundle in &snapshot.bundles {
        let new_id = Bundle::insert(
            tx,
            &bundle.upload_time,
            &bundle.download_code,
            bundle.download_count,
            bundle.legal,
            &bundle.min_gen,
            &bundle.max_gen,
        )?;
        bindings.bind_bundle(bundle.id, new_id);
        bundle_legal.insert(new_id, bundle.legal);
        counts.bundles += 1;
    }

    let save_by_old_id: BTreeMap<i64, &crate::migrate::legacy::LegacySave> =
        snapshot.saves.iter().map(|s| (s.id, s)).collect();

    info!(
        "Attaching {} memberships, please wait...",
        snapshot.memberships.len()
    );
    let mut repair_queue = RepairQueue::new();
    for edge in &snapshot.memberships {
        // A missing binding means the legacy store referenced a row the full
        // scan never produced; with a closed-world snapshot that is a bug,
        // not a recoverable condition.
        let new_save_id = bindings.save(edge.save_id).ok_or_else(|| {
            RelayError::Consistency(format!(
                "membership references save id {} which was never read",
                edge.save_id
            ))
        })?;
        let new_bundle_id = bindings.bundle(edge.bundle_id).ok_or_else(|| {
            RelayError::Consistency(format!(
                "membership references bundle id {} which was never read",
                edge.bundle_id
            ))
        })?;
        let legacy_save = save_by_old_id.get(&edge.save_id).ok_or_else(|| {
            RelayError::Consistency(format!(
                "save id {} bound but missing from the snapshot",
                edge.save_id
            ))
        })?;

        Bundle::attach_save(tx, new_bundle_id, new_save_id)?;
        counts.memberships += 1;

        // One-directional repair: an illegal member makes the bundle illegal;
        // a legal member never flips anything back.
        if !legacy_save.legal {
            let currently_legal = bundle_legal.get_mut(&new_bundle_id);
            if let Some(flag) = currently_legal {
                if *flag {
                    Bundle::set_legal(tx, new_bundle_id, false)?;
                    *flag = false;
                    counts.bundles_downgraded += 1;
                }
            }
        }

        repair_queue
            .entry(new_bundle_id)
            .or_default()
            .push(legacy_save.generation.clone());
    }

    Ok((counts, repair_queue))
}

/// Recompute each touched bundle's generation bounds from its actual attached
/// members - lexicographic min and max, never inherited from the legacy row.
/// Bundles with no memberships in this run keep their imported bounds.
pub fn repair_invariants(tx: &Transaction, repair_queue: &RepairQueue) -> Result<usize, RelayError> {
    let mut repaired = 0;
    for (bundle_id, tags) in repair_queue {
        if let Some((min_gen, max_gen)) = gen_bounds(tags) {
            Bundle::set_gen_bounds(tx, *bundle_id, &min_gen, &max_gen)?;
            repaired += 1;
        }
    }
    if repaired > 0 {
        info!("Corrected generation bounds on {repaired} bundles");
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::migrate::legacy::{LegacyBundle, LegacyMembership, LegacySave};

    fn legacy_save(id: i64, code: &str, generation: &str, legal: bool) -> LegacySave {
        LegacySave {
            id,
            upload_time: "2019-03-14T09:00:00Z".to_string(),
            download_code: code.to_string(),
            download_count: 3,
            generation: generation.to_string(),
            legal,
            payload: format!("b64-{code}"),
        }
    }

    fn legacy_bundle(id: i64, code: &str, legal: bool, min_gen: &str, max_gen: &str) -> LegacyBundle {
        LegacyBundle {
            id,
            download_code: code.to_string(),
            upload_time: "2019-03-14T09:00:00Z".to_string(),
            download_count: 1,
            legal,
            min_gen: min_gen.to_string(),
            max_gen: max_gen.to_string(),
        }
    }

    #[test]
    fn test_import_rebinds_and_carries_fields() {
        let db = Database::new_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();

        let snapshot = LegacySnapshot {
            saves: vec![legacy_save(900, "1111122222", "7.1", true)],
            bundles: vec![],
            memberships: vec![],
        };

        let (counts, _) = import_snapshot(&tx, &snapshot).unwrap();
        tx.commit().unwrap();
        assert_eq!(counts.saves, 1);

        let save = Save::get_by_code(&conn, "1111122222").unwrap().unwrap();
        assert_ne!(save.save_id(), 900, "fresh identifiers, not legacy ids");
        assert_eq!(save.download_count(), 3);
        assert_eq!(save.generation(), "7.1");
        assert_eq!(save.payload(), "b64-1111122222");
    }

    #[test]
    fn test_dangling_membership_is_a_consistency_error() {
        let db = Database::new_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();

        let snapshot = LegacySnapshot {
            saves: vec![legacy_save(1, "1111122222", "8", true)],
            bundles: vec![legacy_bundle(10, "3333344444", true, "8", "8")],
            memberships: vec![LegacyMembership {
                save_id: 999, // never read
                bundle_id: 10,
            }],
        };

        let result = import_snapshot(&tx, &snapshot);
        assert!(matches!(result, Err(RelayError::Consistency(_))));
    }

    #[test]
    fn test_illegal_member_downgrades_bundle_once() {
        let db = Database::new_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();

        let snapshot = LegacySnapshot {
            saves: vec![
                legacy_save(1, "1111122222", "1", true),
                legacy_save(2, "3333344444", "2", false),
            ],
            bundles: vec![legacy_bundle(10, "5555566666", true, "1", "1")],
            memberships: vec![
                LegacyMembership { save_id: 1, bundle_id: 10 },
                LegacyMembership { save_id: 2, bundle_id: 10 },
            ],
        };

        let (counts, queue) = import_snapshot(&tx, &snapshot).unwrap();
        assert_eq!(counts.bundles_downgraded, 1);
        repair_invariants(&tx, &queue).unwrap();
        tx.commit().unwrap();

        let bundle = Bundle::get_by_code(&conn, "5555566666").unwrap().unwrap();
        assert!(!bundle.legal());
        assert_eq!(bundle.min_gen(), "1");
        assert_eq!(bundle.max_gen(), "2");
    }

    #[test]
    fn test_repair_uses_lexicographic_bounds() {
        let db = Database::new_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();

        let snapshot = LegacySnapshot {
            saves: vec![
                legacy_save(1, "1111122222", "10", true),
                legacy_save(2, "3333344444", "2", true),
            ],
            bundles: vec![legacy_bundle(10, "5555566666", true, "9", "9")],
            memberships: vec![
                LegacyMembership { save_id: 1, bundle_id: 10 },
                LegacyMembership { save_id: 2, bundle_id: 10 },
            ],
        };

        let (_, queue) = import_snapshot(&tx, &snapshot).unwrap();
        repair_invariants(&tx, &queue).unwrap();
        tx.commit().unwrap();

        let bundle = Bundle::get_by_code(&conn, "5555566666").unwrap().unwrap();
        // Strings, not numbers: "10" sorts before "2"
        assert_eq!(bundle.min_gen(), "10");
        assert_eq!(bundle.max_gen(), "2");
    }

    #[test]
    fn test_bundle_without_memberships_keeps_imported_bounds() {
        let db = Database::new_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let tx = conn.transaction().unwrap();

        let snapshot = LegacySnapshot {
            saves: vec![],
            bundles: vec![legacy_bundle(10, "5555566666", true, "3", "6")],
            memberships: vec![],
        };

        let (_, queue) = import_snapshot(&tx, &snapshot).unwrap();
        assert!(queue.is_empty());
        repair_invariants(&tx, &queue).unwrap();
        tx.commit().unwrap();

        let bundle = Bundle::get_by_code(&conn, "5555566666").unwrap().unwrap();
        assert_eq!(bundle.min_gen(), "3");
        assert_eq!(bundle.max_gen(), "6");
    }
}
