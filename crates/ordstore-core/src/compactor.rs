//! Background compactor: periodic checkpoints off the write path.
//!
//! The compactor wakes every `compaction_cadence`, and when the retained log
//! exceeds `checkpoint_trigger_bytes` it asks the engine for a compaction.
//! Writers are only blocked while the engine copies the live state and
//! rotates the log; the checkpoint file itself is written without locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::compaction::CompactionResult;
use crate::error::{StoreError, StoreResult};

/// Granularity at which a sleeping compactor notices shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// What the compactor drives. Implemented by the engine's shared state.
pub(crate) trait CompactionTarget: Send + Sync + 'static {
    /// Bytes of log currently on disk.
    fn log_bytes(&self) -> u64;

    /// Write a checkpoint and drop the log it supersedes.
    fn compact(&self) -> StoreResult<CompactionResult>;
}

/// Handle to a running compactor thread.
/// Dropping this handle signals the thread to stop.
pub(crate) struct CompactorHandle {
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Request shutdown and wait for an in-flight compaction to finish.
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    /// Wake-ups completed so far.
    #[cfg(test)]
    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("Compactor thread panicked");
            }
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the compactor for `target`.
pub(crate) fn start_compactor<T: CompactionTarget>(
    target: Arc<T>,
    trigger_bytes: u64,
    cadence: Duration,
) -> StoreResult<CompactorHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let cycles = Arc::new(AtomicU64::new(0));
    let thread_shutdown = Arc::clone(&shutdown);
    let thread_cycles = Arc::clone(&cycles);

    let thread = thread::Builder::new()
        .name("ordstore-compactor".to_string())
        .spawn(move || {
            compactor_loop(&*target, trigger_bytes, cadence, &thread_shutdown, &thread_cycles)
        })
        .map_err(|e| StoreError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to spawn compactor thread: {}", e),
        })?;

    Ok(CompactorHandle {
        shutdown,
        cycles,
        thread: Some(thread),
    })
}

fn compactor_loop<T: CompactionTarget>(
    target: &T,
    trigger_bytes: u64,
    cadence: Duration,
    shutdown: &AtomicBool,
    cycles: &AtomicU64,
) {
    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(SHUTDOWN_POLL.min(cadence));
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        run_cycle(target, trigger_bytes);
        cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// One wake-up: compact if the log has grown past the trigger.
fn run_cycle<T: CompactionTarget>(target: &T, trigger_bytes: u64) {
    let log_bytes = target.log_bytes();
    if log_bytes < trigger_bytes {
        return;
    }

    match target.compact() {
        Ok(result) => tracing::info!(
            sequence = result.sequence,
            live_entries = result.live_entries,
            segments_removed = result.segments_removed,
            bytes_saved = result.bytes_saved(),
            "Background compaction finished"
        ),
        // Retried on the next wake-up
        Err(e) => tracing::warn!(error = %e, log_bytes, "Background compaction failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[derive(Default)]
    struct FakeTarget {
        log_bytes: AtomicU64,
        compactions: AtomicU64,
        fail: AtomicBool,
    }

    impl CompactionTarget for FakeTarget {
        fn log_bytes(&self) -> u64 {
            self.log_bytes.load(Ordering::SeqCst)
        }

        fn compact(&self) -> StoreResult<CompactionResult> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::LogPoisoned("test".into()));
            }
            self.compactions.fetch_add(1, Ordering::SeqCst);
            let before = self.log_bytes.swap(0, Ordering::SeqCst);
            Ok(CompactionResult {
                checkpoint_path: PathBuf::from("checkpoint"),
                sequence: 1,
                live_entries: 0,
                checkpoint_bytes: 36,
                log_bytes_before: before,
                segments_removed: 1,
                checkpoints_removed: 0,
                versions_purged: 0,
                nodes_purged: 0,
            })
        }
    }

    #[test]
    fn test_cycle_respects_trigger() {
        let target = FakeTarget::default();
        target.log_bytes.store(10, Ordering::SeqCst);

        run_cycle(&target, 100);
        assert_eq!(target.compactions.load(Ordering::SeqCst), 0);

        target.log_bytes.store(100, Ordering::SeqCst);
        run_cycle(&target, 100);
        assert_eq!(target.compactions.load(Ordering::SeqCst), 1);
        assert_eq!(target.log_bytes(), 0);
    }

    #[test]
    fn test_failed_compaction_is_retried() {
        let target = FakeTarget::default();
        target.log_bytes.store(500, Ordering::SeqCst);
        target.fail.store(true, Ordering::SeqCst);

        run_cycle(&target, 100);
        assert_eq!(target.log_bytes(), 500);

        target.fail.store(false, Ordering::SeqCst);
        run_cycle(&target, 100);
        assert_eq!(target.compactions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_shutdown() {
        let target = Arc::new(FakeTarget::default());
        target.log_bytes.store(1 << 20, Ordering::SeqCst);

        let handle = start_compactor(Arc::clone(&target), 1024, Duration::from_millis(20)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.cycles() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // The first wake-up compacts; later ones find the log empty
        assert_eq!(target.compactions.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }
}
