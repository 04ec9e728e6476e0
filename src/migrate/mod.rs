//! Legacy-store migration engine.
//!
//! One-time import of the previous relay's store into the current one:
//! read the legacy rows in full, optionally re-verify legality through the
//! external console, then re-key everything into the new store inside a
//! single transaction, repairing the per-bundle aggregate invariants that
//! legacy data is known to get wrong. Commit is all-or-nothing; cleanup
//! (legacy file deletion, config flag clearing) happens only after a
//! successful commit and is best-effort.

pub mod import;
pub mod legacy;
pub mod reconcile;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use strum::Display;

use crate::config::{Config, MigrationConfig};
use crate::database::Database;
use crate::error::RelayError;
use crate::verify::Verifier;

use import::ImportCounts;
use reconcile::ReconcileStats;

/// Phases of a migration run. Transitions are strictly sequential; the only
/// branches are skipping `Reconciling` when no recheck was requested and the
/// terminal split between `Succeeded` and `RolledBack`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum MigrationPhase {
    Idle,
    Reading,
    Reconciling,
    Importing,
    RepairingInvariants,
    Committing,
    Succeeded,
    RolledBack,
}

#[derive(Clone, Debug, Default)]
pub struct MigrationReport {
    pub saves_read: usize,
    pub bundles_read: usize,
    pub memberships_read: usize,
    pub recheck: Option<ReconcileStats>,
    pub counts: ImportCounts,
    pub bundles_repaired: usize,
}

#[derive(Clone, Debug)]
pub struct MigrationOptions {
    pub legacy_path: PathBuf,
    pub recheck_legality: bool,
    pub download_archive: bool,
    pub archive_url: String,
    pub verify_threads: usize,
    /// Config file to rewrite with cleared flags after success. None skips
    /// the config half of cleanup (tests, ephemeral runs).
    pub config_path: Option<PathBuf>,
}

impl MigrationOptions {
    pub fn from_config(migration: &MigrationConfig, config_path: Option<PathBuf>) -> Self {
        MigrationOptions {
            legacy_path: PathBuf::from(&migration.legacy_path),
            recheck_legality: migration.recheck_legality,
            download_archive: migration.download_archive,
            archive_url: migration.archive_url.clone(),
            verify_threads: migration.verify_threads(),
            config_path,
        }
    }
}

pub struct Migrator {
    db: Database,
    verifier: Arc<dyn Verifier>,
    options: MigrationOptions,
}

impl Migrator {
    pub fn new(db: Database, verifier: Arc<dyn Verifier>, options: MigrationOptions) -> Self {
        Self {
            db,
            verifier,
            options,
        }
    }

    /// Run the migration to completion. Returns `Ok(None)` when there is no
    /// legacy store to migrate, `Ok(Some(report))` after a committed run.
    /// On any fatal error the transaction is rolled back, the legacy store
    /// and configuration are left untouched, and the run is safe to retry.
    pub fn run(
        &self,
        interrupt_token: &Arc<AtomicBool>,
    ) -> Result<Option<MigrationReport>, RelayError> {
        let mut phase = MigrationPhase::Idle;

        let legacy_path = self.options.legacy_path.clone();
        if !legacy_path.exists() {
            if self.options.download_archive {
                legacy::fetch_archive(&self.options.archive_url, &legacy_path)?;
                if !legacy_path.exists() {
                    return Err(RelayError::Fetch(
                        "archive download left no legacy store on disk".to_string(),
                    ));
                }
            } else {
                info!("No legacy store found; nothing to migrate");
                return Ok(None);
            }
        }

        let mut report = MigrationReport::default();

        Self::advance(&mut phase, MigrationPhase::Reading);
        let mut snapshot = legacy::read_snapshot(&legacy_path)?;
        report.saves_read = snapshot.saves.len();
        report.bundles_read = snapshot.bundles.len();
        report.memberships_read = snapshot.memberships.len();

        Self::check_interrupted(interrupt_token)?;

        if self.options.recheck_legality {
            Self::advance(&mut phase, MigrationPhase::Reconciling);
            let stats = reconcile::recheck_legality(
                &self.verifier,
                &mut snapshot.saves,
                self.options.verify_threads,
                interrupt_token,
            )?;
            report.recheck = Some(stats);
        }

        Self::check_interrupted(interrupt_token)?;

        // The transaction opens strictly after the reconciliation barrier;
        // everything from here to commit is single-writer.
        Self::advance(&mut phase, MigrationPhase::Importing);
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let (counts, repair_queue) = match import::import_snapshot(&tx, &snapshot) {
            Ok(result) => result,
            Err(e) => {
                let _ = tx.rollback();
                Self::advance(&mut phase, MigrationPhase::RolledBack);
                error!("Migration import failed, rolled back: {e}");
                return Err(e);
            }
        };
        report.counts = counts;

        Self::advance(&mut phase, MigrationPhase::RepairingInvariants);
        match import::repair_invariants(&tx, &repair_queue) {
            Ok(repaired) => report.bundles_repaired = repaired,
            Err(e) => {
                let _ = tx.rollback();
                Self::advance(&mut phase, MigrationPhase::RolledBack);
                error!("Migration invariant repair failed, rolled back: {e}");
                return Err(e);
            }
        }

        if interrupt_token.load(Ordering::Acquire) {
            // The store does not auto-roll-back an abandoned unit of work;
            // do it explicitly before bailing.
            let _ = tx.rollback();
            Self::advance(&mut phase, MigrationPhase::RolledBack);
            return Err(RelayError::Interrupted);
        }

        Self::advance(&mut phase, MigrationPhase::Committing);
        info!("Committing migration, this may take a few moments...");
        tx.commit()?;
        Self::advance(&mut phase, MigrationPhase::Succeeded);

        self.cleanup_after_success(&legacy_path);

        info!(
            "Legacy store migrated: {} saves, {} bundles, {} memberships ({} bundles marked illegal, {} bounds corrected)",
            report.counts.saves,
            report.counts.bundles,
            report.counts.memberships,
            report.counts.bundles_downgraded,
            report.bundles_repaired,
        );
        if let Some(stats) = &report.recheck {
            info!(
                "Legality recheck: {} attempted, {} failed, {} relabeled",
                stats.attempted, stats.failed, stats.relabeled
            );
        }

        Ok(Some(report))
    }

    /// Post-commit cleanup. Two independent best-effort steps; a failure in
    /// either is logged and does not invalidate the committed migration.
    fn cleanup_after_success(&self, legacy_path: &Path) {
        if let Err(e) = fs::remove_file(legacy_path) {
            error!(
                "Failed to remove migrated legacy store {}: {e}",
                legacy_path.display()
            );
        }

        if let Some(config_path) = &self.options.config_path {
            let mut config = Config::load_config_from(config_path);
            config.migration.migrate_legacy = false;
            config.migration.recheck_legality = false;
            config.migration.download_archive = false;
            if let Err(e) = config.save(config_path) {
                error!(
                    "Failed to clear migration flags in {}: {e}",
                    config_path.display()
                );
            }
        }
    }

    fn advance(phase: &mut MigrationPhase, next: MigrationPhase) {
        info!("Migration phase: {phase} -> {next}");
        *phase = next;
    }

    fn check_interrupted(interrupt_token: &Arc<AtomicBool>) -> Result<(), RelayError> {
        if interrupt_token.load(Ordering::Acquire) {
            Err(RelayError::Interrupted)
        } else {
            Ok(())
        }
    }
}
