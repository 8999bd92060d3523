//! Periodic calculation driver
//!
//! Ticks at the configured period and runs each cycle on the blocking pool,
//! since a cycle holds the shared-state lock and talks to the bus
//! synchronously. Ticks are skipped while an administrative operation is
//! waiting for the lock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::console::DiagnosticSink;
use crate::guard::SharedState;

use super::cycle::{run_cycle, CycleReport};

/// Lower bound for the cycle period
pub const MIN_PERIOD_MS: u64 = 10;

/// Cycle timing statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    /// Total cycles executed
    pub total_cycles: u64,
    /// Duration of the last cycle in ms
    pub current_cycle_ms: u64,
    /// Maximum cycle time seen
    pub max_cycle_ms: u64,
    /// Average cycle time (exponential moving average)
    pub avg_cycle_ms: f64,
    /// Cycles that took longer than the period
    pub overrun_count: u64,
    /// Last overrun duration in ms
    pub last_overrun_ms: u64,
    /// Ticks skipped for a pending administrative operation
    pub skipped_cycles: u64,
    /// Statement errors over all cycles
    pub statement_errors: u64,
}

impl CycleStats {
    /// Update stats after a cycle
    pub fn update(&mut self, cycle_duration: Duration, target_cycle_ms: u64) {
        let cycle_ms = cycle_duration.as_millis() as u64;
        self.total_cycles += 1;
        self.current_cycle_ms = cycle_ms;

        if cycle_ms > self.max_cycle_ms {
            self.max_cycle_ms = cycle_ms;
        }

        // Exponential moving average (alpha = 0.1)
        const ALPHA: f64 = 0.1;
        self.avg_cycle_ms = ALPHA * (cycle_ms as f64) + (1.0 - ALPHA) * self.avg_cycle_ms;

        if cycle_ms > target_cycle_ms {
            self.overrun_count += 1;
            self.last_overrun_ms = cycle_ms - target_cycle_ms;
            warn!(
                cycle_ms = cycle_ms,
                target_ms = target_cycle_ms,
                overrun_ms = self.last_overrun_ms,
                "Calculation cycle overrun detected"
            );
        }
    }
}

/// Outcome of one scheduler tick
#[derive(Debug)]
pub struct Tick {
    /// `None` when the cycle was skipped or the engine is disabled
    pub report: Option<CycleReport>,
    /// Period configured at the time of the tick
    pub period: Duration,
}

/// Drives [`run_cycle`] at a fixed period
pub struct CalculationScheduler {
    shared: Arc<SharedState>,
    sink: Arc<dyn DiagnosticSink>,
    period: Duration,
    stats: Arc<Mutex<CycleStats>>,
}

impl CalculationScheduler {
    pub fn new(shared: Arc<SharedState>, sink: Arc<dyn DiagnosticSink>, period_ms: u64) -> Self {
        Self {
            shared,
            sink,
            period: clamp_period(period_ms),
            stats: Arc::new(Mutex::new(CycleStats::default())),
        }
    }

    /// Shared handle to the timing statistics
    pub fn stats(&self) -> Arc<Mutex<CycleStats>> {
        self.stats.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Main loop, runs until the task is dropped
    pub async fn run(mut self) {
        let mut interval = self.interval();
        info!(
            period_ms = self.period.as_millis() as u64,
            "Calculation scheduler started"
        );

        loop {
            interval.tick().await;

            let tick = self.tick().await;
            if tick.period != self.period {
                info!(
                    old_ms = self.period.as_millis() as u64,
                    new_ms = tick.period.as_millis() as u64,
                    "Calculation period changed"
                );
                self.period = tick.period;
                interval = self.interval();
            }
        }
    }

    fn interval(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Run one cycle unless paused or disabled
    pub async fn tick(&self) -> Tick {
        if self.shared.pause_requested() {
            debug!("Calculation cycle skipped, administrative operation pending");
            self.stats.lock().skipped_cycles += 1;
            return Tick {
                report: None,
                period: self.period,
            };
        }

        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let (enabled, period_ms) = shared.lock().read(|ws| {
                (
                    ws.config.calculation.enabled,
                    ws.config.calculation.period_ms,
                )
            });
            let report = enabled.then(|| run_cycle(&shared, sink.as_ref()));
            (report, period_ms)
        })
        .await;

        match result {
            Ok((report, period_ms)) => {
                if let Some(report) = &report {
                    let mut stats = self.stats.lock();
                    stats.update(started.elapsed(), self.period.as_millis() as u64);
                    stats.statement_errors += report.errors as u64;
                    debug!(
                        statements = report.statements,
                        errors = report.errors,
                        writes = report.writes,
                        reads = report.registers_read,
                        "Calculation cycle complete"
                    );
                }
                Tick {
                    report,
                    period: clamp_period(period_ms),
                }
            }
            Err(e) => {
                error!("Calculation cycle task failed: {}", e);
                Tick {
                    report: None,
                    period: self.period,
                }
            }
        }
    }
}

fn clamp_period(period_ms: u64) -> Duration {
    Duration::from_millis(period_ms.max(MIN_PERIOD_MS))
}
