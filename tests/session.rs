//! Full sessions with real forked workers.

use nix::sys::signal::{raise, Signal};
use serial_test::serial;
use shared_memory::{Shmem, ShmemConf};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use sysfuzz::{
    process::ForkControl,
    select::Weighted,
    shm::ExitReason,
    supervisor::Supervisor,
    syscall::{ArgKind, ArgSpec, Registry, Syscall, SyscallEntry, SyscallRecord},
    Config,
};

/// Crash counter shared with the forked workers.
struct Counter(Shmem);

impl Counter {
    fn new() -> Self {
        let shm = ShmemConf::new().size(8).create().unwrap();
        Self(shm)
    }

    fn get(&self) -> &AtomicU64 {
        unsafe { &*(self.0.as_ptr() as *const AtomicU64) }
    }
}

struct AlwaysOk(SyscallEntry);

impl Syscall for AlwaysOk {
    fn entry(&self) -> &SyscallEntry {
        &self.0
    }
}

struct AlwaysCrash {
    entry: SyscallEntry,
    counter: *const AtomicU64,
}

impl Syscall for AlwaysCrash {
    fn entry(&self) -> &SyscallEntry {
        &self.entry
    }

    fn invoke(&self, _rec: &SyscallRecord) -> i64 {
        unsafe { &*self.counter }.fetch_add(1, Ordering::SeqCst);
        raise(Signal::SIGSEGV).unwrap();
        unreachable!()
    }
}

const ONE_ARG: [ArgSpec; 1] = [ArgSpec::new("x", ArgKind::Raw)];

fn entry(name: &'static str, nr: i64) -> SyscallEntry {
    SyscallEntry {
        name,
        nr: nr as _,
        nargs: 1,
        args: &ONE_ARG,
        flags: 0,
    }
}

fn config() -> Config {
    Config {
        workers: 4,
        regen_threshold: 100,
        hang_timeout: Duration::from_secs(10),
        syscalls_per_worker: 100,
        max_syscalls: Some(1_000),
        check_tainted: false,
        stats_interval: Duration::from_secs(60),
        reap_timeout: Duration::from_millis(50),
        reap_pause: Duration::ZERO,
        regen_pause: Duration::ZERO,
        watchdog_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

#[test]
#[serial]
fn crashes_and_regenerations_are_accounted() {
    let counter = Counter::new();
    let registry = Registry::new(vec![
        Box::new(AlwaysOk(entry("ok", nix::libc::SYS_getppid as i64))) as Box<dyn Syscall>,
        Box::new(AlwaysCrash {
            entry: entry("crash", nix::libc::SYS_getpid as i64),
            counter: counter.get(),
        }),
    ])
    .unwrap();
    let selector = Weighted::new(&registry, &[("ok", 9), ("crash", 1)], 1).unwrap();
    let config = config();

    let mut sup = Supervisor::new(ForkControl, &config, &registry, 42)
        .unwrap()
        .with_selector(Box::new(selector));
    let summary = sup.run().unwrap();

    assert_eq!(summary.exit_reason, ExitReason::SyscallBudget);
    assert!(summary.total_syscalls >= 1_000);
    let crashes = counter.get().load(Ordering::SeqCst);
    assert!(crashes > 0);
    assert_eq!(summary.fatal_by(Signal::SIGSEGV), crashes);
    assert!(summary.peak_running <= 4);
    assert_eq!(summary.other_signals, 0);
    assert_eq!(
        summary.remaining_counter + summary.regenerated_calls,
        summary.total_syscalls
    );
    assert!(summary.regenerations >= 1);
    assert!(summary.regenerations * 100 <= summary.regenerated_calls);
    assert_eq!(summary.reaped() + summary.swept, summary.spawned);

    let shared = sup.shared();
    assert!(shared.is_empty());
    assert_eq!(shared.running(), 0);
    assert!(shared.watchdog_pid().is_none());
}

#[test]
#[serial]
fn non_blocking_builtins_run_to_budget() {
    let mut config = config();
    config.max_syscalls = Some(500);
    config.only = vec!["lseek".into(), "dup".into(), "fsync".into()];
    let registry = sysfuzz::registry(&config).unwrap();
    assert_eq!(registry.len(), 3);

    let summary = Supervisor::new(ForkControl, &config, &registry, 7)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(summary.exit_reason, ExitReason::SyscallBudget);
    assert!(summary.total_syscalls >= 500);
    assert!(summary.spawned >= 5);
}
