//! Code running inside a forked worker: claim the slot, then select, generate, sanitise,
//! invoke, account and post until the budget is spent or the session ends.

use crate::{
    child_log::set_child_slot,
    config::Config,
    gen::ArgGen,
    process::EXIT_OK,
    resources::Resources,
    select::SyscallSelector,
    shm::{SharedState, SlotOccupant},
    syscall::{HeapAlloc, HookCtx, Registry, ScratchAlloc, SyscallRecord},
    util::now_millis,
    RngType,
};
use nix::{
    sys::signal::{signal, SigHandler, Signal},
    unistd::{alarm, Pid},
};
use rand::SeedableRng;
use std::{ffi::CString, thread::sleep, time::Duration};

/// Exit status of a worker whose slot never became its own.
pub const EXIT_CLAIM_FAILED: i32 = 2;

const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);
const REGEN_WAIT: Duration = Duration::from_millis(10);

/// Signals that must terminate a worker instead of being handled or ignored.
const RESET_SIGNALS: [Signal; 7] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGPIPE,
];

pub struct Worker<'a> {
    shared: &'a SharedState,
    slot: usize,
    registry: &'a Registry,
    selector: &'a dyn SyscallSelector,
    res: &'a Resources,
    alloc: &'a dyn ScratchAlloc,
    rng: RngType,
    budget: u64,
    alarm_secs: u32,
    wild_ratio: f64,
    claim_timeout: Duration,
}

impl<'a> Worker<'a> {
    pub fn new(
        shared: &'a SharedState,
        slot: usize,
        registry: &'a Registry,
        selector: &'a dyn SyscallSelector,
        res: &'a Resources,
        config: &Config,
        seed: u64,
    ) -> Self {
        Self {
            shared,
            slot,
            registry,
            selector,
            res,
            alloc: &HeapAlloc,
            rng: RngType::seed_from_u64(seed),
            budget: config.syscalls_per_worker,
            alarm_secs: config.alarm_secs,
            wild_ratio: config.flag_wild_ratio,
            claim_timeout: CLAIM_TIMEOUT,
        }
    }

    pub fn with_alloc(mut self, alloc: &'a dyn ScratchAlloc) -> Self {
        self.alloc = alloc;
        self
    }

    /// Entry of a freshly forked worker, returns the exit status.
    pub fn run(&mut self) -> i32 {
        set_child_slot(self.slot);
        setup_process(self.slot);
        self.fuzz(Pid::this())
    }

    /// Claim the slot as `me` and fuzz until done.
    pub(crate) fn fuzz(&mut self, me: Pid) -> i32 {
        let occ = self.shared.occupant(self.slot);
        if !occ.claim(me, self.claim_timeout) {
            child_warn!("slot never became ours, pid {}", me);
            return EXIT_CLAIM_FAILED;
        }
        occ.touch(now_millis());
        child_debug!("started, pid {}", me);

        let mut done = 0;
        while done < self.budget && !self.shared.exit_requested() {
            if self.shared.regenerating() {
                sleep(REGEN_WAIT);
                continue;
            }
            self.step(&occ);
            done += 1;
        }
        child_debug!("leaving after {} calls", done);
        EXIT_OK
    }

    /// One call, returns the finished record.
    pub(crate) fn step(&mut self, occ: &SlotOccupant) -> SyscallRecord {
        let registry = self.registry;
        let idx = self.selector.select(registry, &mut self.rng);
        let call = registry.get(idx);
        let entry = call.entry();

        let mut gen = ArgGen::new(&mut self.rng, self.res, self.wild_ratio);
        let mut rec = gen.generate(idx, entry);
        let mut ctx = HookCtx {
            alloc: self.alloc,
            gen: &mut gen,
        };
        let scratch = call.sanitise(&mut ctx, &mut rec);
        if let Some(s) = scratch.as_ref() {
            occ.set_scratch(s.addr());
        }
        occ.begin_call(idx);

        let armed = entry.need_alarm();
        if armed {
            alarm::set(self.alarm_secs);
        }
        let ret = call.invoke(&rec);
        if armed {
            alarm::cancel();
        }
        rec.ret = Some(ret);
        occ.record_syscall(now_millis());

        call.post(&mut ctx, &rec, scratch);
        occ.clear_scratch();
        rec
    }
}

fn setup_process(slot: usize) {
    if let Ok(name) = CString::new(format!("sysfuzz-child{}", slot)) {
        if let Err(e) = nix::sys::prctl::set_name(&name) {
            child_debug!("set name: {}", e);
        }
    }
    for sig in RESET_SIGNALS {
        // SAFETY: restoring the default disposition installs no handler.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigDfl) } {
            child_warn!("reset {}: {}", sig, e);
        }
    }
}
