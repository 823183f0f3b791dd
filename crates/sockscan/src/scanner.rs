// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background socket scanner: one long-lived task that repeatedly walks all
//! monitored processes' socket descriptors under a rate-limit gate and
//! publishes each completed pass as a double-buffered snapshot.

use crate::config::ScannerConfig;
use crate::errors::ScannerError;
use crate::rate::{next_gate_period, Gate};
use crate::walker::{ProcWalker, SocketMap};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, warn};

/// State shared between the scan loop and snapshot consumers. Every field is
/// read and written under the one lock; the lock is never held across a walk
/// or a sleep.
struct Shared {
    running: bool,
    stop_requested: bool,
    /// Scan-side buffer, parked here while no loop task is alive so a later
    /// `start` reuses the allocation.
    walking_buf: Option<Vec<u8>>,
    /// Serialized output of the most recently completed pass.
    ready_buf: Vec<u8>,
    /// Socket map of the most recently completed pass. Replaced wholesale on
    /// publish, never mutated afterwards.
    ready_sockets: Arc<SocketMap>,
}

/// Rate-limited background reader of per-process socket descriptors.
///
/// [`start`](Self::start) spawns a single scan-loop task;
/// [`snapshot`](Self::snapshot) hands out the latest completed pass without
/// waiting on the scan. At most one loop task is alive per scanner.
pub struct BackgroundScanner {
    walker: Arc<dyn ProcWalker>,
    config: ScannerConfig,
    shared: Arc<Mutex<Shared>>,
}

impl BackgroundScanner {
    /// Both snapshot buffers are allocated here and reused for the scanner's
    /// entire lifetime, including across stop/start cycles.
    pub fn new(walker: Arc<dyn ProcWalker>, config: ScannerConfig) -> Result<Self, ScannerError> {
        config.validate()?;
        let shared = Shared {
            running: false,
            stop_requested: false,
            walking_buf: Some(Vec::with_capacity(config.buffer_capacity)),
            ready_buf: Vec::with_capacity(config.buffer_capacity),
            ready_sockets: Arc::new(SocketMap::default()),
        };
        Ok(Self {
            walker,
            config,
            shared: Arc::new(Mutex::new(shared)),
        })
    }

    /// Launch the scan loop. Returns without waiting for the first pass.
    ///
    /// Must be called from within a Tokio runtime. Fails with
    /// [`ScannerError::AlreadyRunning`] while a loop task is alive, including
    /// when a requested stop has not been observed yet.
    pub fn start(&self) -> Result<(), ScannerError> {
        #[allow(clippy::expect_used)]
        let mut state = self.shared.lock().expect("lock poisoned");
        if state.running {
            return Err(ScannerError::AlreadyRunning);
        }
        state.running = true;
        let walking = state
            .walking_buf
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.config.buffer_capacity));
        drop(state);

        tokio::spawn(scan_loop(
            Arc::clone(&self.walker),
            Arc::clone(&self.shared),
            self.config.clone(),
            walking,
        ));
        Ok(())
    }

    /// Request an asynchronous shutdown. The loop finishes its in-flight
    /// pass before honoring the request; it never publishes that pass.
    pub fn stop(&self) -> Result<(), ScannerError> {
        #[allow(clippy::expect_used)]
        let mut state = self.shared.lock().expect("lock poisoned");
        if !state.running {
            return Err(ScannerError::NotRunning);
        }
        state.stop_requested = true;
        Ok(())
    }

    /// Whether a scan loop is currently alive. A requested stop counts as
    /// running until the loop observes it at a pass boundary.
    #[must_use]
    pub fn is_running(&self) -> bool {
        #[allow(clippy::expect_used)]
        let state = self.shared.lock().expect("lock poisoned");
        state.running
    }

    /// Append the latest completed pass's bytes into `buf` and return its
    /// socket map.
    ///
    /// Never triggers a scan, and always observes a fully published pass:
    /// the bytes and the map come from the same pass, taken under the same
    /// lock the loop publishes under. Before the first pass completes this
    /// yields an empty buffer and an empty map.
    pub fn snapshot(&self, buf: &mut Vec<u8>) -> Arc<SocketMap> {
        #[allow(clippy::expect_used)]
        let state = self.shared.lock().expect("lock poisoned");
        buf.extend_from_slice(&state.ready_buf);
        Arc::clone(&state.ready_sockets)
    }
}

/// Clear both lifecycle flags and park the scan-side buffer. Called with the
/// lock held, as the loop's final act before exiting.
fn park(state: &mut Shared, mut walking: Vec<u8>) {
    state.stop_requested = false;
    state.running = false;
    walking.clear();
    state.walking_buf = Some(walking);
}

async fn scan_loop(
    walker: Arc<dyn ProcWalker>,
    shared: Arc<Mutex<Shared>>,
    config: ScannerConfig,
    mut walking: Vec<u8>,
) {
    let mut gate_period = config.initial_gate_period;
    let mut gate = Gate::new(gate_period);

    loop {
        let pass_start = Instant::now();
        let sockets = match walker
            .walk(&mut walking, &mut gate, config.fd_block_size)
            .await
        {
            Ok(sockets) => sockets,
            Err(e) => {
                error!("background socket scanner: error walking process descriptors: {e}");
                // A failed pass's partial output must not leak into the retry.
                walking.clear();
                #[allow(clippy::expect_used)]
                let mut state = shared.lock().expect("lock poisoned");
                if state.stop_requested {
                    park(&mut state, walking);
                    return;
                }
                drop(state);
                continue;
            }
        };

        {
            #[allow(clippy::expect_used)]
            let mut state = shared.lock().expect("lock poisoned");
            if state.stop_requested {
                park(&mut state, walking);
                return;
            }
            // Publish: flip the buffer roles and replace the map. Pointer
            // swaps only; consumers copy bytes out on their side of the lock.
            mem::swap(&mut walking, &mut state.ready_buf);
            state.ready_sockets = Arc::new(sockets);
        }

        let pass_time = pass_start.elapsed();
        debug!("background socket scanner: full pass took {pass_time:?}");
        if pass_time.as_secs_f64() > 1.5 * config.target_pass_duration.as_secs_f64() {
            warn!(
                "background socket scanner: full pass took {:?}: 50% more than expected ({:?})",
                pass_time, config.target_pass_duration
            );
        }

        gate_period = next_gate_period(
            gate_period,
            pass_time,
            config.target_pass_duration,
            config.min_gate_period,
            config.max_gate_period,
        );
        debug!("background socket scanner: new gate period {gate_period:?}");
        gate = Gate::new(gate_period);

        walking.clear();

        // Sleep out the slack in the pass budget; skipped when the pass
        // overran it.
        if let Some(slack) = config.target_pass_duration.checked_sub(pass_time) {
            tokio::time::sleep(slack).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::{Proc, WalkError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tracing_test::traced_test;

    /// Walker that completes one small pass per call and tags its output
    /// with the pass number. `fail` makes every attempt error out.
    struct CountingWalker {
        attempts: AtomicU64,
        passes: AtomicU64,
        fail: AtomicBool,
    }

    impl CountingWalker {
        fn new() -> Self {
            Self {
                attempts: AtomicU64::new(0),
                passes: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ProcWalker for CountingWalker {
        async fn walk(
            &self,
            buf: &mut Vec<u8>,
            gate: &mut Gate,
            _block_size: u64,
        ) -> Result<SocketMap, WalkError> {
            gate.tick().await;
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(WalkError::Enumeration("walk failed".to_string()));
            }
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            buf.extend_from_slice(format!("pass-{pass}").as_bytes());
            let mut sockets = SocketMap::default();
            sockets.insert(
                pass,
                Proc {
                    pid: pass as u32 + 1,
                    name: format!("proc-{pass}"),
                },
            );
            Ok(sockets)
        }
    }

    /// Walker whose first pass succeeds and whose second call never returns,
    /// freezing the published snapshot.
    struct OneShotWalker {
        calls: AtomicU64,
    }

    #[async_trait]
    impl ProcWalker for OneShotWalker {
        async fn walk(
            &self,
            buf: &mut Vec<u8>,
            gate: &mut Gate,
            _block_size: u64,
        ) -> Result<SocketMap, WalkError> {
            gate.tick().await;
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                std::future::pending::<()>().await;
            }
            buf.extend_from_slice(b"only-pass");
            let mut sockets = SocketMap::default();
            sockets.insert(
                7,
                Proc {
                    pid: 7,
                    name: "single".to_string(),
                },
            );
            Ok(sockets)
        }
    }

    fn test_config() -> ScannerConfig {
        ScannerConfig {
            initial_gate_period: Duration::from_millis(1),
            max_gate_period: Duration::from_millis(5),
            target_pass_duration: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn read_snapshot(scanner: &BackgroundScanner) -> (Vec<u8>, Arc<SocketMap>) {
        let mut buf = Vec::new();
        let sockets = scanner.snapshot(&mut buf);
        (buf, sockets)
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let scanner =
            BackgroundScanner::new(Arc::new(CountingWalker::new()), test_config()).unwrap();
        scanner.start().unwrap();
        assert!(matches!(scanner.start(), Err(ScannerError::AlreadyRunning)));
        scanner.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let scanner =
            BackgroundScanner::new(Arc::new(CountingWalker::new()), test_config()).unwrap();
        assert!(matches!(scanner.stop(), Err(ScannerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let config = ScannerConfig {
            fd_block_size: 0,
            ..test_config()
        };
        assert!(matches!(
            BackgroundScanner::new(Arc::new(CountingWalker::new()), config),
            Err(ScannerError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_takes_effect_and_restart_publishes_again() {
        let walker = Arc::new(CountingWalker::new());
        let scanner = BackgroundScanner::new(walker.clone(), test_config()).unwrap();

        scanner.start().unwrap();
        wait_for(|| !read_snapshot(&scanner).0.is_empty()).await;

        scanner.stop().unwrap();
        wait_for(|| !scanner.is_running()).await;
        assert!(matches!(scanner.stop(), Err(ScannerError::NotRunning)));

        let passes_at_stop = walker.passes.load(Ordering::SeqCst);
        scanner.start().unwrap();
        wait_for(|| walker.passes.load(Ordering::SeqCst) > passes_at_stop).await;
        scanner.stop().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_idempotent_between_passes() {
        let scanner = BackgroundScanner::new(
            Arc::new(OneShotWalker {
                calls: AtomicU64::new(0),
            }),
            test_config(),
        )
        .unwrap();
        scanner.start().unwrap();
        wait_for(|| !read_snapshot(&scanner).0.is_empty()).await;

        let (buf_a, sockets_a) = read_snapshot(&scanner);
        sleep(Duration::from_millis(50)).await;
        let (buf_b, sockets_b) = read_snapshot(&scanner);

        assert_eq!(buf_a, b"only-pass");
        assert_eq!(buf_a, buf_b);
        assert!(Arc::ptr_eq(&sockets_a, &sockets_b));
        assert_eq!(sockets_a.get(&7).unwrap().name, "single");
    }

    #[tokio::test]
    async fn test_failures_are_retried_and_never_fatal() {
        let walker = Arc::new(CountingWalker::new());
        walker.fail.store(true, Ordering::SeqCst);
        let scanner = BackgroundScanner::new(walker.clone(), test_config()).unwrap();

        scanner.start().unwrap();
        wait_for(|| walker.attempts.load(Ordering::SeqCst) >= 3).await;

        // Still alive, still publishing nothing.
        assert!(scanner.is_running());
        assert!(read_snapshot(&scanner).0.is_empty());

        // Recovery publishes on the next successful pass.
        walker.fail.store(false, Ordering::SeqCst);
        wait_for(|| !read_snapshot(&scanner).0.is_empty()).await;
        scanner.stop().unwrap();
    }

    #[tokio::test]
    async fn test_failure_retains_published_snapshot() {
        let walker = Arc::new(CountingWalker::new());
        let scanner = BackgroundScanner::new(walker.clone(), test_config()).unwrap();

        scanner.start().unwrap();
        wait_for(|| !read_snapshot(&scanner).0.is_empty()).await;

        walker.fail.store(true, Ordering::SeqCst);
        let failed_from = walker.attempts.load(Ordering::SeqCst);
        wait_for(|| walker.attempts.load(Ordering::SeqCst) >= failed_from + 3).await;

        let (buf_a, sockets_a) = read_snapshot(&scanner);
        let (buf_b, sockets_b) = read_snapshot(&scanner);
        assert!(!buf_a.is_empty());
        assert_eq!(buf_a, buf_b);
        assert!(Arc::ptr_eq(&sockets_a, &sockets_b));

        scanner.stop().unwrap();
        wait_for(|| !scanner.is_running()).await;
    }

    #[tokio::test]
    async fn test_stop_during_persistent_failure() {
        let walker = Arc::new(CountingWalker::new());
        walker.fail.store(true, Ordering::SeqCst);
        let scanner = BackgroundScanner::new(walker.clone(), test_config()).unwrap();

        scanner.start().unwrap();
        wait_for(|| walker.attempts.load(Ordering::SeqCst) >= 2).await;

        scanner.stop().unwrap();
        wait_for(|| !scanner.is_running()).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_overrunning_pass_logs_warning() {
        /// Walker slow enough that every pass blows the 1.5x budget.
        struct SlowWalker;

        #[async_trait]
        impl ProcWalker for SlowWalker {
            async fn walk(
                &self,
                buf: &mut Vec<u8>,
                gate: &mut Gate,
                _block_size: u64,
            ) -> Result<SocketMap, WalkError> {
                gate.tick().await;
                sleep(Duration::from_millis(40)).await;
                buf.extend_from_slice(b"slow-pass");
                Ok(SocketMap::default())
            }
        }

        let scanner = BackgroundScanner::new(Arc::new(SlowWalker), test_config()).unwrap();
        scanner.start().unwrap();
        wait_for(|| logs_contain("50% more than expected")).await;
        scanner.stop().unwrap();
    }
}
