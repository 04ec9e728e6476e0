use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded};
use log::{info, warn};
use threadpool::ThreadPool;

use crate::error::RelayError;
use crate::migrate::legacy::LegacySave;
use crate::verify::Verifier;

/// Queue depth for dispatched verification jobs. Concurrency itself is capped
/// by the worker count, not the queue.
const DISPATCH_QUEUE_DEPTH: usize = 100;

const PROGRESS_INTERVAL: usize = 250;

/// Observable outcome of a recheck pass. Failures are soft: the record keeps
/// its legacy legality flag and the migration proceeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileStats {
    pub attempted: usize,
    pub failed: usize,
    pub relabeled: usize,
}

struct VerifyJob {
    index: usize,
    payload: String,
    generation: String,
}

/// Re-verify every save's legality flag through the external verifier, with
/// at most `threads` calls in flight at once.
///
/// Workers never touch the save records: each job carries its own index and
/// verdicts flow back over a channel. The flags are rewritten only after
/// `pool.join()`, so a flag is never read or written while a verification
/// call for it may still be running.
pub fn recheck_legality(
    verifier: &Arc<dyn Verifier>,
    saves: &mut [LegacySave],
    threads: usize,
    interrupt_token: &Arc<AtomicBool>,
) -> Result<ReconcileStats, RelayError> {
    if saves.is_empty() {
        return Ok(ReconcileStats::default());
    }

    let total = saves.len();
    info!("Rechecking legality of {total} saves, please wait...");

    let num_threads = threads.min(total).max(1);
    let pool = ThreadPool::new(num_threads);

    let (job_tx, job_rx) = bounded::<VerifyJob>(DISPATCH_QUEUE_DEPTH);
    let (verdict_tx, verdict_rx) = unbounded::<(usize, bool)>();

    let attempted = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    for _ in 0..num_threads {
        let job_rx = job_rx.clone();
        let verdict_tx = verdict_tx.clone();
        let verifier = Arc::clone(verifier);
        let attempted = Arc::clone(&attempted);
        let failed = Arc::clone(&failed);

        pool.execute(move || {
            while let Ok(job) = job_rx.recv() {
                let done = attempted.fetch_add(1, Ordering::Relaxed) + 1;
                if done % PROGRESS_INTERVAL == 0 {
                    info!(
                        "Rechecked {done}/{total} saves ({} failures so far)",
                        failed.load(Ordering::Relaxed)
                    );
                }

                match verifier.verify(&job.payload, &job.generation) {
                    Ok(reply) => {
                        let _ = verdict_tx.send((job.index, reply.legal));
                    }
                    Err(_) => {
                        // Soft failure: counted, flag left as the legacy store
                        // had it.
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
    }
    drop(verdict_tx);

    for (index, save) in saves.iter().enumerate() {
        if interrupt_token.load(Ordering::Acquire) {
            break;
        }
        let job = VerifyJob {
            index,
            payload: save.payload.clone(),
            generation: save.generation.clone(),
        };
        if job_tx.send(job).is_err() {
            break; // all workers gone; join below surfaces the state
        }
    }

    // Barrier: close the queue and wait for every dispatched verification to
    // return before any flag is read or written.
    drop(job_tx);
    pool.join();

    if interrupt_token.load(Ordering::Acquire) {
        return Err(RelayError::Interrupted);
    }

    let mut stats = ReconcileStats {
        attempted: attempted.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        relabeled: 0,
    };

    for (index, legal) in verdict_rx.iter() {
        let save = &mut saves[index];
        if save.legal != legal {
            stats.relabeled += 1;
        }
        save.legal = legal;
    }

    if stats.failed > 0 {
        warn!(
            "Legality recheck finished with {} of {} calls failed; legacy flags kept for those saves",
            stats.failed, stats.attempted
        );
    } else {
        info!("Finished rechecking legality of {} saves", stats.attempted);
    }

    Ok(stats)
}
