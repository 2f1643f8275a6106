//! The supervisor: starts the watchdog, keeps every slot filled with a worker, reaps
//! them as they die and regenerates resources periodically.

use crate::{
    config::Config,
    process::{ChildEvent, ProcessControl, ProcessError},
    resources::{ResourceError, Resources},
    select::{SyscallSelector, Uniform},
    shm::{ExitReason, SharedState, ShmError},
    stats::{self, Summary},
    syscall::Registry,
    util::stop_soon,
    watchdog::Watchdog,
    worker::Worker,
    RngType,
};
use nix::{sys::signal::Signal, unistd::Pid};
use rand::prelude::*;
use rustc_hash::FxHashSet;
use std::{
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Signals whose delivery to a worker is an expected fuzzing outcome.
pub const FATAL_SIGNALS: [Signal; 6] = [
    Signal::SIGSEGV,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGKILL,
    Signal::SIGALRM,
    Signal::SIGPIPE,
];

const WATCHDOG_START_TIMEOUT: Duration = Duration::from_secs(10);
const WATCHDOG_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no empty slot with {running} of {slots} workers running\n{dump}")]
    SlotTableFull {
        running: usize,
        slots: usize,
        dump: String,
    },
    #[error("watchdog did not show up within {0:?}")]
    WatchdogStart(Duration),
    #[error("shm: {0}")]
    Shm(#[from] ShmError),
    #[error("resources: {0}")]
    Resources(#[from] ResourceError),
    #[error("process: {0}")]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Done,
}

pub struct Supervisor<'a, P: ProcessControl> {
    shared: Arc<SharedState>,
    control: P,
    config: &'a Config,
    registry: &'a Registry,
    selector: Box<dyn SyscallSelector>,
    resources: Resources,
    rng: RngType,
    phase: Phase,
    summary: Summary,
    /// Stopped workers killed and vacated, their terminal event is still to come.
    retired: FxHashSet<Pid>,
    started: Instant,
    last_report: Instant,
}

impl<'a, P: ProcessControl> Supervisor<'a, P> {
    pub fn new(
        control: P,
        config: &'a Config,
        registry: &'a Registry,
        seed: u64,
    ) -> Result<Self, SupervisorError> {
        let shared = Arc::new(SharedState::new(config.workers)?);
        Self::with_shared(shared, control, config, registry, seed)
    }

    /// Supervisor over an existing slot table.
    pub fn with_shared(
        shared: Arc<SharedState>,
        control: P,
        config: &'a Config,
        registry: &'a Registry,
        seed: u64,
    ) -> Result<Self, SupervisorError> {
        let mut rng = RngType::seed_from_u64(seed);
        let resources = Resources::new(&mut rng)?;
        let now = Instant::now();
        Ok(Self {
            shared,
            control,
            config,
            registry,
            selector: Box::new(Uniform),
            resources,
            rng,
            phase: Phase::Starting,
            summary: Summary::default(),
            retired: FxHashSet::default(),
            started: now,
            last_report: now,
        })
    }

    pub fn with_selector(mut self, selector: Box<dyn SyscallSelector>) -> Self {
        self.selector = selector;
        self
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    #[inline]
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Drive the session to its end.
    pub fn run(&mut self) -> Result<Summary, SupervisorError> {
        while self.phase != Phase::Done {
            self.step()?;
        }
        Ok(self.summary.clone())
    }

    /// Advance the state machine by one round.
    pub fn step(&mut self) -> Result<(), SupervisorError> {
        match self.phase {
            Phase::Starting => {
                self.start()?;
                self.phase = Phase::Running;
            }
            Phase::Running => {
                if self.shared.exit_requested() {
                    log::info!("stopping: {}", self.shared.exit_reason());
                    self.phase = Phase::Draining;
                } else {
                    self.tick()?;
                }
            }
            Phase::Draining => {
                self.drain()?;
                self.finish();
                self.phase = Phase::Done;
            }
            Phase::Done => (),
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), SupervisorError> {
        self.started = Instant::now();
        self.last_report = self.started;
        self.shared.supervisor().set_supervisor_pid(Pid::this());

        if self.shared.watchdog_pid().is_none() {
            let shared = &*self.shared;
            let control = &self.control;
            let config = self.config;
            self.control
                .spawn_detached(move || Watchdog::new(shared, control, config).run())?;
            let deadline = Instant::now() + WATCHDOG_START_TIMEOUT;
            while self.shared.watchdog_pid().is_none() {
                if Instant::now() >= deadline {
                    return Err(SupervisorError::WatchdogStart(WATCHDOG_START_TIMEOUT));
                }
                sleep(WATCHDOG_POLL);
            }
        }
        log::info!(
            "session started, {} workers, {} syscalls, watchdog {}",
            self.config.workers,
            self.registry.len(),
            self.shared
                .watchdog_pid()
                .map(|p| p.to_string())
                .unwrap_or_default()
        );
        Ok(())
    }

    fn tick(&mut self) -> Result<(), SupervisorError> {
        if stop_soon() {
            self.shared.request_exit(ExitReason::Interrupted);
            return Ok(());
        }
        self.fill()?;
        self.reap(Some(self.config.reap_timeout));
        self.regenerate();
        self.check_budget();
        if self.last_report.elapsed() >= self.config.stats_interval {
            stats::report(
                &self.shared,
                &self.summary,
                self.started.elapsed(),
                self.config.workers,
            );
            self.last_report = Instant::now();
        }
        Ok(())
    }

    /// Fork workers into empty slots until all of them are running.
    fn fill(&mut self) -> Result<(), SupervisorError> {
        let sup = self.shared.supervisor();
        while self.shared.running() < self.config.workers && !self.shared.exit_requested() {
            let slot = match sup.find_empty() {
                Some(slot) if sup.reserve(slot) => slot,
                _ => {
                    let dump = self.shared.dump();
                    log::error!("slot table full:\n{}", dump);
                    return Err(SupervisorError::SlotTableFull {
                        running: self.shared.running(),
                        slots: self.shared.nr_slots(),
                        dump,
                    });
                }
            };

            let seed: u64 = self.rng.gen();
            let shared = &*self.shared;
            let registry = self.registry;
            let selector = &*self.selector;
            let res = &self.resources;
            let config = self.config;
            let body =
                move || Worker::new(shared, slot, registry, selector, res, config, seed).run();

            match self.control.spawn_worker(body) {
                Ok(pid) => {
                    if !sup.record(slot, pid) {
                        log::error!("slot {} taken by someone else than {}", slot, pid);
                        self.shared.request_exit(ExitReason::Desync);
                        return Ok(());
                    }
                    self.summary.spawned += 1;
                    self.summary.peak_running =
                        std::cmp::max(self.summary.peak_running, self.shared.running());
                    log::debug!("slot {}: spawned {}", slot, pid);
                }
                Err(e) => {
                    sup.release(slot);
                    log::warn!("failed to spawn worker: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for one child event, then drain whatever else is pending.
    fn reap(&mut self, timeout: Option<Duration>) {
        let mut timeout = timeout;
        loop {
            let ev = match self.control.wait_for_change(timeout) {
                Ok(ev) => ev,
                Err(e) => {
                    log::warn!("{}", e);
                    return;
                }
            };
            match ev {
                ChildEvent::StillAlive => return,
                ChildEvent::NoChildren => {
                    self.sweep();
                    return;
                }
                ev => self.handle(ev),
            }
            timeout = Some(Duration::ZERO);
            if !self.config.reap_pause.is_zero() {
                sleep(self.config.reap_pause);
            }
        }
    }

    fn handle(&mut self, ev: ChildEvent) {
        match ev {
            ChildEvent::Exited(pid, code) => {
                if let Some(slot) = self.lookup(pid) {
                    let calls = self.vacate(slot);
                    self.summary.exits += 1;
                    log::debug!(
                        "slot {}: {} exited ({}) after {} calls",
                        slot,
                        pid,
                        code,
                        calls
                    );
                }
            }
            ChildEvent::Signaled(pid, sig) => {
                if let Some(slot) = self.lookup(pid) {
                    let current = self.shared.slot(slot).current;
                    let calls = self.vacate(slot);
                    let name = self.syscall_name(current);
                    if FATAL_SIGNALS.contains(&sig) {
                        *self.summary.fatal.entry(sig).or_default() += 1;
                        log::debug!(
                            "slot {}: {} killed by {} in {} after {} calls",
                            slot,
                            pid,
                            sig,
                            name,
                            calls
                        );
                    } else {
                        self.summary.other_signals += 1;
                        log::warn!(
                            "slot {}: {} killed by unexpected {} in {} after {} calls",
                            slot,
                            pid,
                            sig,
                            name,
                            calls
                        );
                    }
                }
            }
            ChildEvent::Stopped(pid, sig) => match self.shared.find_pid(pid) {
                Some(slot) => {
                    log::warn!("slot {}: {} stopped by {}, killing", slot, pid, sig);
                    if sig == Signal::SIGSTOP {
                        if let Err(e) = self.control.resume(pid) {
                            log::warn!("{}", e);
                        }
                    }
                    if let Err(e) = self.control.terminate(pid) {
                        log::warn!("{}", e);
                    }
                    self.vacate(slot);
                    self.retired.insert(pid);
                    self.summary.stopped += 1;
                }
                None if self.retired.contains(&pid) => (),
                None => {
                    log::error!(
                        "unknown pid {} stopped by {}, slot table:\n{}",
                        pid,
                        sig,
                        self.shared.dump()
                    );
                    if let Err(e) = self.control.terminate(pid) {
                        log::warn!("{}", e);
                    }
                    self.desync();
                }
            },
            ChildEvent::Continued(_) | ChildEvent::StillAlive | ChildEvent::NoChildren => (),
        }
    }

    /// Slot of a terminated child, `None` for children already retired. An unknown pid
    /// means the table lost track of a child and ends the session.
    fn lookup(&mut self, pid: Pid) -> Option<usize> {
        if let Some(slot) = self.shared.find_pid(pid) {
            return Some(slot);
        }
        if !self.retired.remove(&pid) {
            log::error!("reaped unknown pid {}, slot table:\n{}", pid, self.shared.dump());
            self.desync();
        }
        None
    }

    fn desync(&mut self) {
        self.shared.request_exit(ExitReason::Desync);
    }

    fn vacate(&mut self, slot: usize) -> u64 {
        match self.shared.supervisor().vacate(slot) {
            Some(snap) => snap.syscall_count,
            None => 0,
        }
    }

    /// No child is left, whatever still looks occupied is stale.
    fn sweep(&mut self) {
        let sup = self.shared.supervisor();
        for slot in 0..self.shared.nr_slots() {
            if let Some(snap) = sup.vacate(slot) {
                log::warn!("slot {}: swept stale {:?}", slot, snap.pid);
                self.summary.swept += 1;
            }
        }
        self.retired.clear();
    }

    fn regenerate(&mut self) {
        let threshold = self.config.regen_threshold;
        let sup = self.shared.supervisor();
        if !sup.regeneration_due(threshold) {
            return;
        }
        if !self.config.regen_pause.is_zero() {
            sleep(self.config.regen_pause);
        }
        self.summary.regenerated_calls += sup.begin_regeneration();
        if let Err(e) = self.resources.regenerate(&mut self.rng) {
            log::warn!("regeneration failed, keeping old resources: {}", e);
        }
        sup.end_regeneration();
        self.summary.regenerations += 1;
        log::debug!(
            "regenerated resources ({}), {} calls so far",
            self.summary.regenerations,
            self.shared.total_syscalls()
        );
    }

    fn check_budget(&mut self) {
        if let Some(max) = self.config.max_syscalls {
            if self.shared.total_syscalls() >= max {
                self.shared.request_exit(ExitReason::SyscallBudget);
            }
        }
    }

    /// Let the watchdog leave, then reap until no worker is left. Workers that outlive
    /// the hang timeout are killed.
    fn drain(&mut self) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.config.hang_timeout;
        while self.shared.watchdog_pid().is_some() {
            if Instant::now() >= deadline {
                log::warn!("watchdog did not leave in time");
                break;
            }
            sleep(WATCHDOG_POLL);
        }

        let started = Instant::now();
        let mut killed = false;
        while !self.shared.is_empty() {
            self.reap(Some(self.config.reap_timeout.min(Duration::from_millis(100))));
            if !killed && started.elapsed() >= self.config.hang_timeout {
                for (slot, snap) in self.shared.slots() {
                    if let Some(pid) = snap.pid.pid() {
                        log::warn!("slot {}: {} still running, killing", slot, pid);
                        self.control.terminate(pid)?;
                    }
                }
                killed = true;
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        let s = &mut self.summary;
        s.exit_reason = self.shared.exit_reason();
        s.total_syscalls = self.shared.total_syscalls();
        s.remaining_counter = self.shared.regenerate_counter();
        s.elapsed = self.started.elapsed();
    }

    fn syscall_name(&self, current: u32) -> &'static str {
        match (current as usize).checked_sub(1) {
            Some(idx) if idx < self.registry.len() => self.registry.get(idx).entry().name,
            _ => "-",
        }
    }
}
