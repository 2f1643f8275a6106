//! Process control: forking workers and the watchdog, waiting for child state changes,
//! killing and resuming.
//!
//! Everything the supervisor does to other processes goes through [`ProcessControl`],
//! [`ForkControl`] is the Linux implementation.

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("fork: {0}")]
    Fork(Errno),
    #[error("wait: {0}")]
    Wait(Errno),
    #[error("signal {sig} to {pid}: {errno}")]
    Signal { pid: Pid, sig: Signal, errno: Errno },
    #[error("ptrace cont {pid}: {errno}")]
    Resume { pid: Pid, errno: Errno },
}

/// Child state change observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    Exited(Pid, i32),
    Signaled(Pid, Signal),
    Stopped(Pid, Signal),
    Continued(Pid),
    /// Children exist but none changed state within the wait bound.
    StillAlive,
    /// The supervisor has no children left.
    NoChildren,
}

impl ChildEvent {
    /// Pid of a terminal event, the process is gone after it.
    pub fn terminated(&self) -> Option<Pid> {
        match self {
            ChildEvent::Exited(pid, _) | ChildEvent::Signaled(pid, _) => Some(*pid),
            _ => None,
        }
    }
}

/// Exit status of a child whose body returned normally.
pub const EXIT_OK: i32 = 0;
/// Exit status of a child whose body panicked.
pub const EXIT_PANIC: i32 = 101;

pub trait ProcessControl {
    /// Fork a child running `body`, it never returns into the caller's code.
    fn spawn_worker<F>(&self, body: F) -> Result<Pid, ProcessError>
    where
        F: FnOnce() -> i32;

    /// Fork a grandchild running `body` that is not a child of the caller.
    /// The intermediate process is reaped before returning.
    fn spawn_detached<F>(&self, body: F) -> Result<(), ProcessError>
    where
        F: FnOnce() -> i32;

    /// Wait for a state change of any child. `None` blocks until one happens,
    /// `Some(Duration::ZERO)` never blocks.
    fn wait_for_change(&self, timeout: Option<Duration>) -> Result<ChildEvent, ProcessError>;

    fn terminate(&self, pid: Pid) -> Result<(), ProcessError>;

    /// Continue a stopped child.
    fn resume(&self, pid: Pid) -> Result<(), ProcessError>;

    fn is_alive(&self, pid: Pid) -> bool;
}

/// Fork based process control.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkControl;

const WAIT_POLL: Duration = Duration::from_millis(5);

fn run_child<F: FnOnce() -> i32>(body: F) -> ! {
    let code = match catch_unwind(AssertUnwindSafe(body)) {
        Ok(code) => code,
        Err(_) => EXIT_PANIC,
    };
    // SAFETY: skip atexit handlers and destructors of state inherited from the parent.
    unsafe { nix::libc::_exit(code) }
}

fn map_status(status: WaitStatus) -> ChildEvent {
    match status {
        WaitStatus::Exited(pid, code) => ChildEvent::Exited(pid, code),
        WaitStatus::Signaled(pid, sig, _) => ChildEvent::Signaled(pid, sig),
        WaitStatus::Stopped(pid, sig) => ChildEvent::Stopped(pid, sig),
        WaitStatus::PtraceEvent(pid, sig, _) => ChildEvent::Stopped(pid, sig),
        WaitStatus::PtraceSyscall(pid) => ChildEvent::Stopped(pid, Signal::SIGTRAP),
        WaitStatus::Continued(pid) => ChildEvent::Continued(pid),
        WaitStatus::StillAlive => ChildEvent::StillAlive,
    }
}

impl ProcessControl for ForkControl {
    fn spawn_worker<F>(&self, body: F) -> Result<Pid, ProcessError>
    where
        F: FnOnce() -> i32,
    {
        // SAFETY: the child only touches shared memory, its own heap and raw syscalls
        // before leaving through `_exit`.
        match unsafe { fork() }.map_err(ProcessError::Fork)? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => run_child(body),
        }
    }

    fn spawn_detached<F>(&self, body: F) -> Result<(), ProcessError>
    where
        F: FnOnce() -> i32,
    {
        // SAFETY: see `spawn_worker`.
        match unsafe { fork() }.map_err(ProcessError::Fork)? {
            ForkResult::Parent { child } => loop {
                match waitpid(child, None) {
                    Ok(_) => return Ok(()),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(ProcessError::Wait(e)),
                }
            },
            ForkResult::Child => {
                let code = match unsafe { fork() } {
                    Ok(ForkResult::Parent { .. }) => 0,
                    Ok(ForkResult::Child) => run_child(body),
                    Err(_) => 1,
                };
                unsafe { nix::libc::_exit(code) }
            }
        }
    }

    fn wait_for_change(&self, timeout: Option<Duration>) -> Result<ChildEvent, ProcessError> {
        let any = Pid::from_raw(-1);
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let flags = if deadline.is_some() {
                flags | WaitPidFlag::WNOHANG
            } else {
                flags
            };
            match waitpid(any, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    if deadline.map_or(true, |d| Instant::now() >= d) {
                        return Ok(ChildEvent::StillAlive);
                    }
                    sleep(WAIT_POLL);
                }
                Ok(status) => return Ok(map_status(status)),
                Err(Errno::ECHILD) => return Ok(ChildEvent::NoChildren),
                Err(Errno::EINTR) => {
                    if deadline.is_none() {
                        continue;
                    }
                }
                Err(e) => return Err(ProcessError::Wait(e)),
            }
        }
    }

    fn terminate(&self, pid: Pid) -> Result<(), ProcessError> {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal {
                pid,
                sig: Signal::SIGKILL,
                errno,
            }),
        }
    }

    fn resume(&self, pid: Pid) -> Result<(), ProcessError> {
        match ptrace::cont(pid, None) {
            Ok(()) => Ok(()),
            // not traced by us, fall back to a plain SIGCONT.
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {
                kill(pid, Signal::SIGCONT).map_err(|errno| ProcessError::Signal {
                    pid,
                    sig: Signal::SIGCONT,
                    errno,
                })
            }
            Err(errno) => Err(ProcessError::Resume { pid, errno }),
        }
    }

    fn is_alive(&self, pid: Pid) -> bool {
        !matches!(kill(pid, None), Err(Errno::ESRCH))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted process control for driving the supervisor without forking.

    use super::*;
    use rustc_hash::FxHashSet;
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    #[derive(Default)]
    pub(crate) struct MockInner {
        pub next_pid: i32,
        /// Events handed out by `wait_for_change`, in order.
        pub events: VecDeque<ChildEvent>,
        pub alive: FxHashSet<Pid>,
        pub spawned: Vec<Pid>,
        pub terminated: Vec<Pid>,
        pub resumed: Vec<Pid>,
        pub detached: usize,
        /// Fail this many upcoming forks.
        pub fail_forks: usize,
        /// Kill turns into a signaled event for the pid.
        pub kill_reports_signal: bool,
        /// Run `spawn_detached` bodies in-process.
        pub run_detached: bool,
    }

    #[derive(Clone)]
    pub(crate) struct MockControl {
        pub inner: Rc<RefCell<MockInner>>,
    }

    impl MockControl {
        pub fn new() -> Self {
            let inner = MockInner {
                next_pid: 1000,
                ..Default::default()
            };
            Self {
                inner: Rc::new(RefCell::new(inner)),
            }
        }

        pub fn push(&self, ev: ChildEvent) {
            self.inner.borrow_mut().events.push_back(ev);
        }

        pub fn spawned(&self) -> Vec<Pid> {
            self.inner.borrow().spawned.clone()
        }

        /// Report every live child as exited normally.
        pub fn exit_all(&self) {
            let mut inner = self.inner.borrow_mut();
            let mut alive: Vec<_> = inner.alive.iter().copied().collect();
            alive.sort();
            for pid in alive {
                inner.events.push_back(ChildEvent::Exited(pid, 0));
            }
        }
    }

    impl ProcessControl for MockControl {
        fn spawn_worker<F>(&self, _body: F) -> Result<Pid, ProcessError>
        where
            F: FnOnce() -> i32,
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_forks > 0 {
                inner.fail_forks -= 1;
                return Err(ProcessError::Fork(Errno::EAGAIN));
            }
            inner.next_pid += 1;
            let pid = Pid::from_raw(inner.next_pid);
            inner.alive.insert(pid);
            inner.spawned.push(pid);
            Ok(pid)
        }

        fn spawn_detached<F>(&self, body: F) -> Result<(), ProcessError>
        where
            F: FnOnce() -> i32,
        {
            let run = {
                let mut inner = self.inner.borrow_mut();
                inner.detached += 1;
                inner.run_detached
            };
            if run {
                body();
            }
            Ok(())
        }

        fn wait_for_change(&self, _timeout: Option<Duration>) -> Result<ChildEvent, ProcessError> {
            let mut inner = self.inner.borrow_mut();
            match inner.events.pop_front() {
                Some(ev) => {
                    if let Some(pid) = ev.terminated() {
                        inner.alive.remove(&pid);
                    }
                    Ok(ev)
                }
                None if inner.alive.is_empty() => Ok(ChildEvent::NoChildren),
                None => Ok(ChildEvent::StillAlive),
            }
        }

        fn terminate(&self, pid: Pid) -> Result<(), ProcessError> {
            let mut inner = self.inner.borrow_mut();
            inner.terminated.push(pid);
            if inner.kill_reports_signal && inner.alive.contains(&pid) {
                inner
                    .events
                    .push_back(ChildEvent::Signaled(pid, Signal::SIGKILL));
            }
            Ok(())
        }

        fn resume(&self, pid: Pid) -> Result<(), ProcessError> {
            self.inner.borrow_mut().resumed.push(pid);
            Ok(())
        }

        fn is_alive(&self, pid: Pid) -> bool {
            self.inner.borrow().alive.contains(&pid)
        }
    }
}
