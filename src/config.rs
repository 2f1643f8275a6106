use crate::shm::MAX_SLOTS;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker slots.
    pub workers: usize,
    /// Calls between two resource regenerations.
    pub regen_threshold: u64,
    /// A worker whose last call finished longer ago than this is killed.
    pub hang_timeout: Duration,
    /// Calls a worker makes before exiting and being replaced.
    pub syscalls_per_worker: u64,
    /// Stop the session after this many calls in total.
    pub max_syscalls: Option<u64>,
    /// Alarm armed before calls that may block, in seconds.
    pub alarm_secs: u32,
    /// Probability of a flag list argument being fully random.
    pub flag_wild_ratio: f64,
    pub seed: Option<u64>,
    /// Fuzz these syscalls only.
    pub only: Vec<String>,
    pub exclude: Vec<String>,
    /// Stop when the kernel taint flags change.
    pub check_tainted: bool,
    pub stats_interval: Duration,
    /// Bound of one blocking wait for child state changes.
    pub reap_timeout: Duration,
    /// Pause between two events of one reap drain.
    pub reap_pause: Duration,
    /// Pause before regenerating resources.
    pub regen_pause: Duration,
    pub watchdog_poll: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            regen_threshold: 100_000,
            hang_timeout: Duration::from_secs(30),
            syscalls_per_worker: 10_000,
            max_syscalls: None,
            alarm_secs: 1,
            flag_wild_ratio: 0.1,
            seed: None,
            only: Vec::new(),
            exclude: Vec::new(),
            check_tainted: true,
            stats_interval: Duration::from_secs(10),
            reap_timeout: Duration::from_secs(1),
            reap_pause: Duration::from_millis(1),
            regen_pause: Duration::from_secs(1),
            watchdog_poll: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.workers == 0 || self.workers > MAX_SLOTS {
            anyhow::bail!("bad worker number: {}, expected 1..={}", self.workers, MAX_SLOTS);
        }
        if self.regen_threshold == 0 {
            anyhow::bail!("regeneration threshold must be positive");
        }
        if self.syscalls_per_worker == 0 {
            anyhow::bail!("per-worker syscall budget must be positive");
        }
        if self.max_syscalls == Some(0) {
            anyhow::bail!("session syscall budget must be positive");
        }
        if self.hang_timeout.is_zero() {
            anyhow::bail!("hang timeout must be positive");
        }
        if self.alarm_secs == 0 {
            anyhow::bail!("alarm must be at least one second");
        }
        if !(0.0..=1.0).contains(&self.flag_wild_ratio) {
            anyhow::bail!("wild ratio {} not in [0, 1]", self.flag_wild_ratio);
        }
        if self.watchdog_poll.is_zero() || self.watchdog_poll > self.hang_timeout {
            anyhow::bail!(
                "watchdog poll interval {:?} must be positive and not above the hang timeout",
                self.watchdog_poll
            );
        }
        Ok(())
    }
}
