//! Slot table shared by the supervisor, the watchdog and every child.
//!
//! The whole session is coordinated through one shared memory mapping. Fields are
//! partitioned by writer role and each role only gets the accessors it may use:
//!
//! * [`SupervisorView`]: slot identity (reserve, record, vacate), regeneration state.
//! * [`WatchdogView`]: publishes and clears the watchdog pid.
//! * [`SlotOccupant`]: per-slot counters, timestamp and scratch of the occupying child.
//!
//! Reads are open to everyone through [`SharedState`] itself.

use nix::unistd::Pid;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::{
    fmt,
    mem::size_of,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Pid value of a slot nobody occupies.
pub const PID_EMPTY: i32 = -1;
/// Pid value of a slot reserved by the supervisor for a child that is being forked.
pub const PID_RESERVED: i32 = -2;
/// Upper bound of slots, keeps the mapping small.
pub const MAX_SLOTS: usize = 1024;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("bad slot number: {0}, expected 1..={}", MAX_SLOTS)]
    BadSlotNumber(usize),
    #[error("shm: {0}")]
    Shm(#[from] ShmemError),
}

/// Why the session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ExitReason {
    #[default]
    None = 0,
    /// SIGINT/SIGTERM from the operator.
    Interrupted,
    /// Total number of calls reached the configured maximum.
    SyscallBudget,
    /// Kernel taint flags changed during the session.
    Tainted,
    /// The watchdog could not find the supervisor anymore.
    SupervisorGone,
    /// Slot table and the kernel's process table diverged.
    Desync,
}

impl ExitReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ExitReason::Interrupted,
            2 => ExitReason::SyscallBudget,
            3 => ExitReason::Tainted,
            4 => ExitReason::SupervisorGone,
            5 => ExitReason::Desync,
            _ => ExitReason::None,
        }
    }

    /// Reasons that should make the process exit with failure.
    pub fn is_abnormal(self) -> bool {
        matches!(self, ExitReason::Desync | ExitReason::SupervisorGone)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::None => "none",
            ExitReason::Interrupted => "interrupted",
            ExitReason::SyscallBudget => "syscall budget reached",
            ExitReason::Tainted => "kernel became tainted",
            ExitReason::SupervisorGone => "supervisor disappeared",
            ExitReason::Desync => "slot table desync",
        };
        write!(f, "{}", s)
    }
}

/// Decoded pid field of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPid {
    Empty,
    Reserved,
    Occupied(Pid),
}

impl SlotPid {
    fn from_raw(v: i32) -> Self {
        match v {
            PID_RESERVED => SlotPid::Reserved,
            v if v > 0 => SlotPid::Occupied(Pid::from_raw(v)),
            _ => SlotPid::Empty,
        }
    }

    pub fn pid(self) -> Option<Pid> {
        match self {
            SlotPid::Occupied(pid) => Some(pid),
            _ => None,
        }
    }
}

/// Copy of one slot at some point in time.
#[derive(Debug, Clone, Copy)]
pub struct SlotSnapshot {
    pub pid: SlotPid,
    pub syscall_count: u64,
    /// Monotonic millis of the last completed call (or of the claim), 0 if never.
    pub last_active: u64,
    /// Address of the scratch resource held for the in-flight call, 0 if none.
    pub scratch: u64,
    /// Registry index + 1 of the in-flight call, 0 if none.
    pub current: u32,
}

#[repr(C)]
struct Header {
    nr_slots: AtomicU32,
    running: AtomicU32,
    supervisor_pid: AtomicI32,
    watchdog_pid: AtomicI32,
    exit_reason: AtomicU8,
    regenerating: AtomicBool,
    regenerate_counter: AtomicU64,
    total_syscalls: AtomicU64,
    regenerations: AtomicU64,
}

#[repr(C)]
struct Slot {
    pid: AtomicI32,
    current: AtomicU32,
    syscall_count: AtomicU64,
    last_active: AtomicU64,
    scratch: AtomicU64,
}

pub struct SharedState {
    _shm: Shmem,
    header: *const Header,
    slots: *const Slot,
    nr_slots: usize,
}

// SAFETY: every field behind the raw pointers is an atomic living in a mapping that
// outlives `self`, sharing across threads is no different from sharing across processes.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    /// Create the mapping with `nr_slots` empty slots. Must happen before any fork.
    pub fn new(nr_slots: usize) -> Result<Self, ShmError> {
        if nr_slots == 0 || nr_slots > MAX_SLOTS {
            return Err(ShmError::BadSlotNumber(nr_slots));
        }
        let sz = size_of::<Header>() + nr_slots * size_of::<Slot>();
        let mut shm = ShmemConf::new().size(sz).create()?;
        shm.set_owner(true);

        let base = shm.as_ptr();
        let header = base as *const Header;
        // SAFETY: Header is 8-byte aligned and padded to a multiple of 8, the mapping
        // is page aligned and large enough for the header followed by the slots.
        let slots = unsafe { base.add(size_of::<Header>()) } as *const Slot;
        let state = Self {
            _shm: shm,
            header,
            slots,
            nr_slots,
        };
        state.init();
        Ok(state)
    }

    fn init(&self) {
        let h = self.header();
        h.nr_slots.store(self.nr_slots as u32, Ordering::Relaxed);
        h.running.store(0, Ordering::Relaxed);
        h.supervisor_pid.store(0, Ordering::Relaxed);
        h.watchdog_pid.store(0, Ordering::Relaxed);
        h.exit_reason.store(ExitReason::None as u8, Ordering::Relaxed);
        h.regenerating.store(false, Ordering::Relaxed);
        h.regenerate_counter.store(0, Ordering::Relaxed);
        h.total_syscalls.store(0, Ordering::Relaxed);
        h.regenerations.store(0, Ordering::Relaxed);
        for i in 0..self.nr_slots {
            let s = self.slot_ref(i);
            s.pid.store(PID_EMPTY, Ordering::Relaxed);
            s.current.store(0, Ordering::Relaxed);
            s.syscall_count.store(0, Ordering::Relaxed);
            s.last_active.store(0, Ordering::Relaxed);
            s.scratch.store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    #[inline(always)]
    fn header(&self) -> &Header {
        // SAFETY: points into the mapping owned by `self._shm`.
        unsafe { &*self.header }
    }

    #[inline(always)]
    fn slot_ref(&self, slot: usize) -> &Slot {
        assert!(slot < self.nr_slots, "slot {} out of range", slot);
        // SAFETY: bounds checked above, the mapping holds `nr_slots` slots.
        unsafe { &*self.slots.add(slot) }
    }

    pub fn supervisor(&self) -> SupervisorView<'_> {
        SupervisorView { state: self }
    }

    pub fn watchdog(&self) -> WatchdogView<'_> {
        WatchdogView { state: self }
    }

    pub fn occupant(&self, slot: usize) -> SlotOccupant<'_> {
        let _ = self.slot_ref(slot);
        SlotOccupant { state: self, slot }
    }

    #[inline]
    pub fn nr_slots(&self) -> usize {
        self.nr_slots
    }

    #[inline]
    pub fn running(&self) -> usize {
        self.header().running.load(Ordering::SeqCst) as usize
    }

    pub fn slot(&self, slot: usize) -> SlotSnapshot {
        let s = self.slot_ref(slot);
        SlotSnapshot {
            pid: SlotPid::from_raw(s.pid.load(Ordering::SeqCst)),
            syscall_count: s.syscall_count.load(Ordering::Relaxed),
            last_active: s.last_active.load(Ordering::Relaxed),
            scratch: s.scratch.load(Ordering::Relaxed),
            current: s.current.load(Ordering::Relaxed),
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, SlotSnapshot)> + '_ {
        (0..self.nr_slots).map(move |i| (i, self.slot(i)))
    }

    /// Slot currently holding `pid`.
    pub fn find_pid(&self, pid: Pid) -> Option<usize> {
        (0..self.nr_slots).find(|&i| self.slot_ref(i).pid.load(Ordering::SeqCst) == pid.as_raw())
    }

    /// No slot is occupied or reserved.
    pub fn is_empty(&self) -> bool {
        (0..self.nr_slots).all(|i| self.slot_ref(i).pid.load(Ordering::SeqCst) == PID_EMPTY)
    }

    /// Check slot uniqueness and occupancy accounting, returns a description of the
    /// first violation found.
    pub fn check_accounting(&self) -> Result<(), String> {
        let mut seen = Vec::with_capacity(self.nr_slots);
        for (i, snap) in self.slots() {
            if let SlotPid::Occupied(pid) = snap.pid {
                if seen.contains(&pid) {
                    return Err(format!("pid {} held by more than one slot (slot {})", pid, i));
                }
                seen.push(pid);
            }
        }
        let running = self.running();
        if running != seen.len() {
            return Err(format!(
                "running count {} but {} occupied slots",
                running,
                seen.len()
            ));
        }
        Ok(())
    }

    pub fn exit_reason(&self) -> ExitReason {
        ExitReason::from_u8(self.header().exit_reason.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.exit_reason() != ExitReason::None
    }

    /// Ask every process of the session to wind down. The first reason recorded wins,
    /// returns whether `reason` was the one recorded.
    pub fn request_exit(&self, reason: ExitReason) -> bool {
        self.header()
            .exit_reason
            .compare_exchange(
                ExitReason::None as u8,
                reason as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    #[inline]
    pub fn regenerating(&self) -> bool {
        self.header().regenerating.load(Ordering::SeqCst)
    }

    pub fn regenerate_counter(&self) -> u64 {
        self.header().regenerate_counter.load(Ordering::SeqCst)
    }

    pub fn total_syscalls(&self) -> u64 {
        self.header().total_syscalls.load(Ordering::Relaxed)
    }

    pub fn regenerations(&self) -> u64 {
        self.header().regenerations.load(Ordering::Relaxed)
    }

    pub fn watchdog_pid(&self) -> Option<Pid> {
        let pid = self.header().watchdog_pid.load(Ordering::SeqCst);
        if pid > 0 {
            Some(Pid::from_raw(pid))
        } else {
            None
        }
    }

    pub fn supervisor_pid(&self) -> Option<Pid> {
        let pid = self.header().supervisor_pid.load(Ordering::SeqCst);
        if pid > 0 {
            Some(Pid::from_raw(pid))
        } else {
            None
        }
    }

    /// One line per slot, for diagnostics.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, snap) in self.slots() {
            let pid = match snap.pid {
                SlotPid::Empty => "empty".to_string(),
                SlotPid::Reserved => "reserved".to_string(),
                SlotPid::Occupied(pid) => pid.to_string(),
            };
            let _ = writeln!(
                out,
                "slot{}: {} (calls: {}, scratch: {:#x})",
                i, pid, snap.syscall_count, snap.scratch
            );
        }
        out
    }
}

/// Fields written by the supervisor only.
pub struct SupervisorView<'a> {
    state: &'a SharedState,
}

impl SupervisorView<'_> {
    pub fn set_supervisor_pid(&self, pid: Pid) {
        self.state
            .header()
            .supervisor_pid
            .store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn find_empty(&self) -> Option<usize> {
        (0..self.state.nr_slots)
            .find(|&i| self.state.slot_ref(i).pid.load(Ordering::SeqCst) == PID_EMPTY)
    }

    /// empty -> reserved.
    pub fn reserve(&self, slot: usize) -> bool {
        self.state
            .slot_ref(slot)
            .pid
            .compare_exchange(PID_EMPTY, PID_RESERVED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// reserved -> empty, for a fork that never happened.
    pub fn release(&self, slot: usize) {
        let _ = self.state.slot_ref(slot).pid.compare_exchange(
            PID_RESERVED,
            PID_EMPTY,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// reserved -> occupied(pid). The child may have written the same value already.
    /// Returns false if the slot held something else than RESERVED or `pid`.
    pub fn record(&self, slot: usize, pid: Pid) -> bool {
        let s = self.state.slot_ref(slot);
        let ok = match s.pid.compare_exchange(
            PID_RESERVED,
            pid.as_raw(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(cur) => cur == pid.as_raw(),
        };
        if ok {
            self.state.header().running.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }

    /// occupied -> empty. Returns the last state of the slot, `None` if it was not occupied.
    pub fn vacate(&self, slot: usize) -> Option<SlotSnapshot> {
        let snap = self.state.slot(slot);
        snap.pid.pid()?;
        let s = self.state.slot_ref(slot);
        s.pid.store(PID_EMPTY, Ordering::SeqCst);
        s.current.store(0, Ordering::Relaxed);
        s.syscall_count.store(0, Ordering::Relaxed);
        s.last_active.store(0, Ordering::Relaxed);
        s.scratch.store(0, Ordering::Relaxed);
        self.state.header().running.fetch_sub(1, Ordering::SeqCst);
        Some(snap)
    }

    /// Whether the counter reached `threshold` since the last regeneration.
    pub fn regeneration_due(&self, threshold: u64) -> bool {
        self.state.regenerate_counter() >= threshold
    }

    /// Mark regeneration in progress and reset the counter, returns the calls it held.
    pub fn begin_regeneration(&self) -> u64 {
        let h = self.state.header();
        h.regenerating.store(true, Ordering::SeqCst);
        h.regenerate_counter.swap(0, Ordering::SeqCst)
    }

    pub fn end_regeneration(&self) {
        let h = self.state.header();
        h.regenerations.fetch_add(1, Ordering::Relaxed);
        h.regenerating.store(false, Ordering::SeqCst);
    }
}

/// Fields written by the watchdog only.
pub struct WatchdogView<'a> {
    state: &'a SharedState,
}

impl WatchdogView<'_> {
    pub fn publish(&self, pid: Pid) {
        self.state
            .header()
            .watchdog_pid
            .store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.state.header().watchdog_pid.store(0, Ordering::SeqCst);
    }
}

/// Fields of one slot written by the child occupying it.
pub struct SlotOccupant<'a> {
    state: &'a SharedState,
    slot: usize,
}

impl SlotOccupant<'_> {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Claim the slot reserved for `me` and wait until it reads back as ours.
    /// Gives up after `timeout` if the slot never becomes ours.
    pub fn claim(&self, me: Pid, timeout: Duration) -> bool {
        let s = self.state.slot_ref(self.slot);
        let _ = s.pid.compare_exchange(
            PID_RESERVED,
            me.as_raw(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let start = Instant::now();
        while s.pid.load(Ordering::SeqCst) != me.as_raw() {
            if start.elapsed() >= timeout {
                return false;
            }
            sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn touch(&self, now: u64) {
        self.state
            .slot_ref(self.slot)
            .last_active
            .store(now, Ordering::Relaxed);
    }

    pub fn begin_call(&self, index: usize) {
        self.state
            .slot_ref(self.slot)
            .current
            .store(index as u32 + 1, Ordering::Relaxed);
    }

    /// Account one finished call.
    pub fn record_syscall(&self, now: u64) {
        let s = self.state.slot_ref(self.slot);
        s.syscall_count.fetch_add(1, Ordering::Relaxed);
        s.last_active.store(now, Ordering::Relaxed);
        s.current.store(0, Ordering::Relaxed);
        let h = self.state.header();
        h.total_syscalls.fetch_add(1, Ordering::Relaxed);
        h.regenerate_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_scratch(&self, addr: u64) {
        self.state
            .slot_ref(self.slot)
            .scratch
            .store(addr, Ordering::SeqCst);
    }

    pub fn clear_scratch(&self) {
        self.set_scratch(0);
    }

    pub fn syscall_count(&self) -> u64 {
        self.state
            .slot_ref(self.slot)
            .syscall_count
            .load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn slot_lifecycle() {
        let s = SharedState::new(2).unwrap();
        assert!(s.is_empty());
        let sup = s.supervisor();
        let slot = sup.find_empty().unwrap();
        assert!(sup.reserve(slot));
        assert_eq!(s.slot(slot).pid, SlotPid::Reserved);
        // reserved slots are not counted as running.
        assert_eq!(s.running(), 0);
        assert!(s.check_accounting().is_ok());
        assert!(!s.is_empty());

        assert!(sup.record(slot, pid(100)));
        assert_eq!(s.running(), 1);
        assert_eq!(s.find_pid(pid(100)), Some(slot));
        assert!(s.check_accounting().is_ok());

        let snap = sup.vacate(slot).unwrap();
        assert_eq!(snap.pid, SlotPid::Occupied(pid(100)));
        assert_eq!(s.running(), 0);
        assert!(s.is_empty());
        assert!(sup.vacate(slot).is_none());
        assert_eq!(s.running(), 0);
    }

    #[test]
    fn child_and_parent_record_same_pid() {
        let s = SharedState::new(1).unwrap();
        let sup = s.supervisor();
        assert!(sup.reserve(0));
        let me = Pid::this();
        assert!(s.occupant(0).claim(me, Duration::from_millis(10)));
        // parent writes after the child claimed, same value, no conflict.
        assert!(sup.record(0, me));
        assert_eq!(s.running(), 1);
        assert!(s.check_accounting().is_ok());
    }

    #[test]
    fn claim_never_proceeds_on_foreign_slot() {
        let s = SharedState::new(1).unwrap();
        let sup = s.supervisor();
        // empty, never reserved.
        assert!(!s.occupant(0).claim(Pid::this(), Duration::from_millis(20)));
        assert_eq!(s.slot(0).pid, SlotPid::Empty);
        // reserved then recorded for somebody else.
        assert!(sup.reserve(0));
        assert!(sup.record(0, pid(4242)));
        assert!(!s.occupant(0).claim(Pid::this(), Duration::from_millis(20)));
        assert_eq!(s.slot(0).pid, SlotPid::Occupied(pid(4242)));
    }

    #[test]
    fn record_rejects_unreserved_slot() {
        let s = SharedState::new(1).unwrap();
        let sup = s.supervisor();
        assert!(!sup.record(0, pid(7)));
        assert_eq!(s.running(), 0);
        assert!(sup.reserve(0));
        assert!(!sup.reserve(0));
        sup.release(0);
        assert!(s.is_empty());
    }

    #[test]
    fn exit_reason_first_wins() {
        let s = SharedState::new(1).unwrap();
        assert!(!s.exit_requested());
        assert!(s.request_exit(ExitReason::Tainted));
        assert!(!s.request_exit(ExitReason::Interrupted));
        assert_eq!(s.exit_reason(), ExitReason::Tainted);
    }

    #[test]
    fn regeneration_resets_counter() {
        let s = SharedState::new(1).unwrap();
        let sup = s.supervisor();
        assert!(sup.reserve(0));
        assert!(sup.record(0, Pid::this()));
        let occ = s.occupant(0);
        for i in 0..250 {
            occ.record_syscall(i);
        }
        assert!(sup.regeneration_due(100));
        assert_eq!(sup.begin_regeneration(), 250);
        assert!(s.regenerating());
        sup.end_regeneration();
        assert!(!s.regenerating());
        assert_eq!(s.regenerate_counter(), 0);
        assert!(!sup.regeneration_due(100));
        assert_eq!(s.regenerations(), 1);
        assert_eq!(s.total_syscalls(), 250);
        assert_eq!(occ.syscall_count(), 250);
    }

    #[test]
    fn accounting_detects_duplicate_pid() {
        let s = SharedState::new(2).unwrap();
        let sup = s.supervisor();
        assert!(sup.reserve(0));
        assert!(sup.record(0, pid(10)));
        assert!(sup.reserve(1));
        assert!(sup.record(1, pid(10)));
        assert!(s.check_accounting().is_err());
    }

    #[test]
    fn rejects_bad_slot_number() {
        assert!(SharedState::new(0).is_err());
        assert!(SharedState::new(MAX_SLOTS + 1).is_err());
    }
}
