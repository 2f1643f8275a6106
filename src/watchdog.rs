//! Watchdog process: kills workers that stopped making progress and ends the session
//! when the supervisor vanishes or the kernel gets tainted.

use crate::{
    config::Config,
    process::{ProcessControl, EXIT_OK},
    shm::{ExitReason, SharedState},
    util::now_millis,
};
use nix::unistd::Pid;
use rustc_hash::FxHashSet;
use std::{
    ffi::CString,
    fs::read_to_string,
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

const TAINT_PATH: &str = "/proc/sys/kernel/tainted";

pub struct Watchdog<'a, P: ProcessControl> {
    shared: &'a SharedState,
    control: &'a P,
    hang_timeout_ms: u64,
    poll: Duration,
    taint_path: Option<PathBuf>,
    taint: Option<u64>,
    /// Pids already sent SIGKILL, not killed again while they wait for reaping.
    killed: FxHashSet<Pid>,
}

impl<'a, P: ProcessControl> Watchdog<'a, P> {
    pub fn new(shared: &'a SharedState, control: &'a P, config: &Config) -> Self {
        Self {
            shared,
            control,
            hang_timeout_ms: config.hang_timeout.as_millis() as u64,
            poll: config.watchdog_poll,
            taint_path: if config.check_tainted {
                Some(PathBuf::from(TAINT_PATH))
            } else {
                None
            },
            taint: None,
            killed: FxHashSet::default(),
        }
    }

    pub fn with_taint_path<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.taint_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Entry of the watchdog process, returns the exit status.
    pub fn run(&mut self) -> i32 {
        if let Ok(name) = CString::new("sysfuzz-watchdog") {
            if let Err(e) = nix::sys::prctl::set_name(&name) {
                log::debug!("watchdog: set name: {}", e);
            }
        }
        self.shared.watchdog().publish(Pid::this());
        log::info!("watchdog: running, pid {}", Pid::this());
        self.init_taint();

        while !self.shared.exit_requested() {
            if !self.tick(now_millis()) {
                break;
            }
            sleep(self.poll);
        }

        log::info!("watchdog: leaving ({})", self.shared.exit_reason());
        self.shared.watchdog().clear();
        EXIT_OK
    }

    fn init_taint(&mut self) {
        if let Some(path) = self.taint_path.as_ref() {
            match read_taint(path) {
                Some(t) => {
                    log::debug!("watchdog: kernel taint {:#x}", t);
                    self.taint = Some(t);
                }
                None => {
                    log::warn!("watchdog: {} unreadable, taint check off", path.display());
                    self.taint_path = None;
                }
            }
        }
    }

    /// One poll round, returns false once the session must end.
    pub fn tick(&mut self, now: u64) -> bool {
        if let Some(sup) = self.shared.supervisor_pid() {
            if !self.control.is_alive(sup) {
                log::error!("watchdog: supervisor {} is gone", sup);
                self.shared.request_exit(ExitReason::SupervisorGone);
                return false;
            }
        }
        if self.tainted() {
            self.shared.request_exit(ExitReason::Tainted);
            return false;
        }
        self.check_slots(now);
        true
    }

    fn tainted(&mut self) -> bool {
        let path = match self.taint_path.as_ref() {
            Some(p) => p,
            None => return false,
        };
        let now = read_taint(path);
        match (self.taint, now) {
            (Some(old), Some(new)) if old != new => {
                log::error!("watchdog: kernel taint changed {:#x} -> {:#x}", old, new);
                true
            }
            (None, Some(new)) => {
                self.taint = Some(new);
                false
            }
            _ => false,
        }
    }

    /// Kill every worker whose last progress is older than the hang timeout.
    /// Returns how many were killed in this round.
    pub fn check_slots(&mut self, now: u64) -> usize {
        let mut n = 0;
        let mut live = FxHashSet::default();
        for (slot, snap) in self.shared.slots() {
            let pid = match snap.pid.pid() {
                Some(pid) => pid,
                None => continue,
            };
            live.insert(pid);
            if snap.last_active == 0
                || now.saturating_sub(snap.last_active) <= self.hang_timeout_ms
                || self.killed.contains(&pid)
            {
                continue;
            }
            log::warn!(
                "watchdog: slot {} pid {} stuck for {}ms after {} calls (in: {}), killing",
                slot,
                pid,
                now - snap.last_active,
                snap.syscall_count,
                snap.current
            );
            match self.control.terminate(pid) {
                Ok(()) => {
                    self.killed.insert(pid);
                    n += 1;
                }
                Err(e) => log::warn!("watchdog: {}", e),
            }
        }
        self.killed.retain(|pid| live.contains(pid));
        n
    }
}

fn read_taint(path: &Path) -> Option<u64> {
    read_to_string(path).ok()?.trim().parse().ok()
}
