//! Cooperative single-threaded readiness loop
//!
//! Sources implement [`Selectable`]: the loop polls them for readiness and
//! runs the callback of the first ready source to completion before waiting
//! again. When nothing becomes ready within the select timeout, every
//! [`PeriodicTask`] runs once.
//!
//! The loop runs on a tokio current-thread runtime. Callbacks are
//! synchronous; only the bounded wait in [`EventLoop::select`] suspends.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-5: Denial of Service Protection - Round-robin polling prevents source starvation
//! - SI-11: Error Handling - Callback failures are logged and never stop the loop

use crate::error::{FpmError, Result};
use std::cell::RefCell;
use std::future::poll_fn;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Default bounded wait of one select iteration.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// An event source driven by the loop.
pub trait Selectable {
    fn name(&self) -> &str;

    /// Register interest and report whether [`Selectable::on_ready`] has
    /// work to do.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Handle readiness. Must not block.
    fn on_ready(&mut self) -> Result<()>;
}

/// Work run on every select timeout.
pub trait PeriodicTask {
    fn name(&self) -> &str;

    fn on_timeout(&mut self) -> Result<()>;
}

impl<T: Selectable> Selectable for Rc<RefCell<T>> {
    fn name(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.try_borrow_mut() {
            Ok(mut inner) => inner.poll_ready(cx),
            Err(_) => Poll::Ready(Err(io::Error::other("selectable already borrowed"))),
        }
    }

    fn on_ready(&mut self) -> Result<()> {
        self.try_borrow_mut()
            .map_err(|_| FpmError::Internal("re-entrant selectable callback".into()))?
            .on_ready()
    }
}

impl<T: PeriodicTask> PeriodicTask for Rc<RefCell<T>> {
    fn name(&self) -> &str {
        std::any::type_name::<T>()
    }

    fn on_timeout(&mut self) -> Result<()> {
        self.try_borrow_mut()
            .map_err(|_| FpmError::Internal("re-entrant periodic task".into()))?
            .on_timeout()
    }
}

/// Result of one [`EventLoop::select`] call.
#[derive(Debug)]
pub enum SelectOutcome {
    /// Source at this index is ready.
    Ready(usize),
    /// Nothing became ready within the timeout.
    Timeout,
    /// Polling the source at `index` failed.
    Error { index: usize, error: io::Error },
}

/// Loop counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub ready: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub callback_failures: u64,
}

/// Single-threaded readiness loop.
pub struct EventLoop {
    sources: Vec<Box<dyn Selectable>>,
    tasks: Vec<Box<dyn PeriodicTask>>,
    timeout: Duration,
    next_start: usize,
    stats: LoopStats,
}

impl EventLoop {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sources: Vec::new(),
            tasks: Vec::new(),
            timeout,
            next_start: 0,
            stats: LoopStats::default(),
        }
    }

    /// Add a source; returns its index in [`SelectOutcome::Ready`].
    pub fn add_source<S: Selectable + 'static>(&mut self, source: S) -> usize {
        self.sources.push(Box::new(source));
        self.sources.len() - 1
    }

    pub fn add_periodic_task<T: PeriodicTask + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Wait until a source is ready or the timeout elapses.
    ///
    /// Polling starts after the last ready source so one busy source cannot
    /// starve the others.
    pub async fn select(&mut self) -> SelectOutcome {
        let count = self.sources.len();
        if count == 0 {
            tokio::time::sleep(self.timeout).await;
            return SelectOutcome::Timeout;
        }

        let start = self.next_start % count;
        let sources = &mut self.sources;
        let ready = poll_fn(|cx| {
            for offset in 0..count {
                let index = (start + offset) % count;
                match sources[index].poll_ready(cx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Ok(index)),
                    Poll::Ready(Err(error)) => return Poll::Ready(Err((index, error))),
                    Poll::Pending => {}
                }
            }
            Poll::Pending
        });

        match tokio::time::timeout(self.timeout, ready).await {
            Ok(Ok(index)) => {
                self.next_start = index + 1;
                SelectOutcome::Ready(index)
            }
            Ok(Err((index, error))) => {
                self.next_start = index + 1;
                SelectOutcome::Error { index, error }
            }
            Err(_) => SelectOutcome::Timeout,
        }
    }

    /// One select iteration followed by the callback or periodic work it
    /// calls for.
    pub async fn run_once(&mut self) -> SelectOutcome {
        let outcome = self.select().await;
        match &outcome {
            SelectOutcome::Ready(index) => {
                self.stats.ready += 1;
                if let Some(source) = self.sources.get_mut(*index) {
                    trace!(source = source.name(), "Source ready");
                    if let Err(e) = source.on_ready() {
                        self.stats.callback_failures += 1;
                        warn!(source = source.name(), error = %e, "Source callback failed");
                    }
                }
            }
            SelectOutcome::Timeout => {
                self.stats.timeouts += 1;
                self.run_periodic_tasks();
            }
            SelectOutcome::Error { index, error } => {
                self.stats.errors += 1;
                let name = self.sources.get(*index).map(|s| s.name()).unwrap_or("?");
                warn!(source = name, error = %error, "Select error, retrying");
            }
        }
        outcome
    }

    /// Run until `shutdown` is set.
    ///
    /// The flag is checked between iterations, so shutdown latency is at most
    /// one select timeout plus one callback.
    #[instrument(skip_all, fields(sources = self.sources.len(), tasks = self.tasks.len()))]
    pub async fn run(&mut self, shutdown: &AtomicBool) {
        info!(timeout_ms = self.timeout.as_millis() as u64, "Event loop started");
        while !shutdown.load(Ordering::Relaxed) {
            self.run_once().await;
        }
        info!("Event loop stopped");
    }

    fn run_periodic_tasks(&mut self) {
        for task in &mut self.tasks {
            debug!(task = task.name(), "Running periodic task");
            if let Err(e) = task.on_timeout() {
                self.stats.callback_failures += 1;
                warn!(task = task.name(), error = %e, "Periodic task failed");
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("tasks", &self.tasks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
