use crate::shm::{ExitReason, SharedState};
use nix::sys::signal::Signal;
use rustc_hash::FxHashMap;
use std::{fmt, time::Duration};

/// Outcome of a session.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub spawned: u64,
    /// Workers that exited on their own.
    pub exits: u64,
    /// Workers killed by a fatal-class signal.
    pub fatal: FxHashMap<Signal, u64>,
    /// Workers killed by any other signal.
    pub other_signals: u64,
    /// Workers found stopped and killed.
    pub stopped: u64,
    /// Slots cleared by a sweep after all children vanished.
    pub swept: u64,
    pub regenerations: u64,
    /// Calls the counter held when regenerations reset it.
    pub regenerated_calls: u64,
    pub total_syscalls: u64,
    /// Calls counted since the last regeneration.
    pub remaining_counter: u64,
    pub peak_running: usize,
    pub exit_reason: ExitReason,
    pub elapsed: Duration,
}

impl Summary {
    pub fn fatal_total(&self) -> u64 {
        self.fatal.values().sum()
    }

    pub fn fatal_by(&self, sig: Signal) -> u64 {
        self.fatal.get(&sig).copied().unwrap_or(0)
    }

    /// Worker terminations observed through the reap path.
    pub fn reaped(&self) -> u64 {
        self.exits + self.fatal_total() + self.other_signals + self.stopped
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fatal: Vec<_> = self.fatal.iter().collect();
        fatal.sort_by_key(|(sig, _)| **sig as i32);
        write!(
            f,
            "{} calls in {:.1}s, workers spawned/exited {}/{}, regens: {}, stopped: {}, swept: {}, other signals: {}, fatal:",
            self.total_syscalls,
            self.elapsed.as_secs_f64(),
            self.spawned,
            self.exits,
            self.regenerations,
            self.stopped,
            self.swept,
            self.other_signals,
        )?;
        if fatal.is_empty() {
            write!(f, " none")?;
        }
        for (sig, n) in fatal {
            write!(f, " {}={}", sig.as_str(), n)?;
        }
        write!(f, " ({})", self.exit_reason)
    }
}

/// Periodic status line.
pub(crate) fn report(shared: &SharedState, summary: &Summary, elapsed: Duration, workers: usize) {
    let total = shared.total_syscalls();
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { total as f64 / secs } else { 0.0 };
    log::info!(
        "calls: {} ({:.0}/s), running: {}/{}, spawned: {}, fatal: {}, regens: {}",
        total,
        rate,
        shared.running(),
        workers,
        summary.spawned,
        summary.fatal_total(),
        shared.regenerations()
    );
}
