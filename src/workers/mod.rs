//! Bounded worker pool.
//!
//! Jobs are tagged with their submission sequence number, fanned out to a fixed set
//! of worker threads and fanned back in on the calling thread, which hands results
//! to the consumer strictly in submission order. A token channel caps how many jobs
//! may be dispatched but not yet consumed, so a slow head-of-line job cannot make the
//! reorder buffer grow without bound.

mod cancel;
pub use cancel::CancelToken;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::bounded;

use crate::ArchiverError;

/// Hard ceiling on worker threads unless the caller raises it.
pub const DEFAULT_MAX_THREADS: usize = 64;

/// Turns a requested thread count into an actual one. `0` means one per CPU.
pub fn resolve_threads(requested: usize, ceiling: usize) -> usize {
    let wanted = if requested == 0 { num_cpus::get() } else { requested };
    wanted.min(ceiling.max(1)).max(1)
}

/// Fixed-size executor for compression and decompression jobs.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
    window: usize,
    cancel: CancelToken,
}

impl WorkerPool {
    /// Builds a pool of `threads` workers that keeps at most `window` jobs dispatched
    /// but not yet consumed. A `window` of 0 picks twice the thread count.
    pub fn new(threads: usize, window: usize, cancel: CancelToken) -> Result<Self, ArchiverError> {
        let threads = threads.max(1);
        let window = if window == 0 { threads * 2 } else { window };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("wpack-worker-{i}"))
            .build()
            .map_err(|e| ArchiverError::InvalidOptions(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool, threads, window, cancel })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `work` over every job and feeds the results to `consume` in submission
    /// order, together with their sequence number.
    ///
    /// The first error returned by `work` or `consume` stops dispatching, lets the
    /// in-flight jobs drain, drops the queued ones and is returned to the caller.
    /// Per-job failures that should not stop the run belong inside `R`.
    pub fn run_ordered<J, R, I, F, C>(&self, jobs: I, work: F, mut consume: C) -> Result<(), ArchiverError>
    where
        I: IntoIterator<Item = J>,
        I::IntoIter: Send,
        J: Send,
        R: Send,
        F: Fn(usize, J) -> Result<R, ArchiverError> + Sync,
        C: FnMut(usize, R) -> Result<(), ArchiverError>,
    {
        let jobs = jobs.into_iter();
        let abort = AtomicBool::new(false);
        let exhausted = AtomicBool::new(false);
        let cancel = &self.cancel;

        let (job_tx, job_rx) = bounded::<(usize, J)>(self.threads);
        let (res_tx, res_rx) = bounded::<(usize, Result<R, ArchiverError>)>(self.window);
        let (tok_tx, tok_rx) = bounded::<()>(self.window);
        for _ in 0..self.window {
            // Cannot fail: the channel holds exactly `window` tokens.
            let _ = tok_tx.send(());
        }

        let failure = thread::scope(|ts| {
            // --- Producer: hands out jobs as tokens come back ---
            let abort_ref = &abort;
            let exhausted_ref = &exhausted;
            ts.spawn(move || {
                for (seq, job) in jobs.enumerate() {
                    if abort_ref.load(Ordering::Acquire) || cancel.is_cancelled() {
                        return;
                    }
                    if tok_rx.recv().is_err() || job_tx.send((seq, job)).is_err() {
                        return;
                    }
                }
                exhausted_ref.store(true, Ordering::Release);
            });

            self.pool.in_place_scope(|s| {
                // --- Workers ---
                for _ in 0..self.threads {
                    let job_rx = job_rx.clone();
                    let res_tx = res_tx.clone();
                    let work = &work;
                    let abort = &abort;
                    s.spawn(move |_| {
                        for (seq, job) in job_rx.iter() {
                            let out = if abort.load(Ordering::Acquire) || cancel.is_cancelled() {
                                Err(ArchiverError::Cancelled)
                            } else {
                                work(seq, job)
                            };
                            if res_tx.send((seq, out)).is_err() {
                                break;
                            }
                        }
                    });
                }
                drop(job_rx);
                drop(res_tx);

                // --- Consumer: reorder and hand over in sequence ---
                let mut pending: BTreeMap<usize, R> = BTreeMap::new();
                let mut next = 0usize;
                let mut failure = None;
                'recv: for (seq, out) in res_rx.iter() {
                    match out {
                        Ok(r) => {
                            pending.insert(seq, r);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                    while let Some(r) = pending.remove(&next) {
                        let current = next;
                        next += 1;
                        if let Err(e) = consume(current, r) {
                            failure = Some(e);
                            break 'recv;
                        }
                        // Ignored: the producer may already have exited.
                        let _ = tok_tx.send(());
                        if cancel.is_cancelled() {
                            failure = Some(ArchiverError::Cancelled);
                            break 'recv;
                        }
                    }
                }
                if failure.is_some() {
                    abort.store(true, Ordering::Release);
                }
                drop(res_rx);
                drop(tok_tx);
                failure
            })
        });

        match failure {
            Some(e) => Err(e),
            None if !exhausted.load(Ordering::Acquire) => Err(ArchiverError::Cancelled),
            None => Ok(()),
        }
    }

    /// Runs `work` over every job and returns the results in submission order.
    pub fn map_ordered<J, R, I, F>(&self, jobs: I, work: F) -> Result<Vec<R>, ArchiverError>
    where
        I: IntoIterator<Item = J>,
        I::IntoIter: Send,
        J: Send,
        R: Send,
        F: Fn(usize, J) -> Result<R, ArchiverError> + Sync,
    {
        let mut out = Vec::new();
        self.run_ordered(jobs, work, |_, r| {
            out.push(r);
            Ok(())
        })?;
        Ok(out)
    }
}
