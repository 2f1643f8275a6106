//! Syscall descriptors: static metadata of each fuzzed syscall plus its optional
//! sanitise/post hooks.

use crate::gen::ArgGen;
use iota::iota;
use nix::libc;
use std::fmt;

pub mod registry;
pub mod table;

pub use registry::{Registry, RegistryError};

/// Max number of syscall arguments.
pub const MAX_ARGS: usize = 6;

pub type SyscallFlags = u32;

iota! {
    pub const NEED_ALARM: SyscallFlags = 1 << (iota); // call may block, arm an alarm first
    , AVOID_SYSCALL                                   // only selected when named explicitly
}

/// How the value of one argument is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Raw,
    Fd,
    Address,
    Len,
    /// OR of a subset of the candidates.
    List(&'static [u64]),
    /// One of the candidates.
    Op(&'static [u64]),
    /// Inclusive bounds.
    Range { lo: u64, hi: u64 },
    SockAddr,
    /// Length of the preceding `SockAddr` argument.
    SockAddrLen,
}

impl ArgKind {
    pub fn name(&self) -> &'static str {
        match self {
            ArgKind::Raw => "raw",
            ArgKind::Fd => "fd",
            ArgKind::Address => "address",
            ArgKind::Len => "len",
            ArgKind::List(_) => "list",
            ArgKind::Op(_) => "op",
            ArgKind::Range { .. } => "range",
            ArgKind::SockAddr => "sockaddr",
            ArgKind::SockAddrLen => "sockaddr_len",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
}

impl ArgSpec {
    pub const fn new(name: &'static str, kind: ArgKind) -> Self {
        Self { name, kind }
    }
}

/// Static metadata of one syscall.
#[derive(Debug, Clone, Copy)]
pub struct SyscallEntry {
    pub name: &'static str,
    pub nr: libc::c_long,
    pub nargs: usize,
    pub args: &'static [ArgSpec],
    pub flags: SyscallFlags,
}

impl SyscallEntry {
    #[inline]
    pub fn need_alarm(&self) -> bool {
        self.flags & NEED_ALARM != 0
    }

    #[inline]
    pub fn avoid(&self) -> bool {
        self.flags & AVOID_SYSCALL != 0
    }
}

impl fmt::Display for SyscallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", arg.name, arg.kind.name())?;
        }
        write!(f, ")")
    }
}

/// One invocation attempt, built fresh by the worker for every call.
#[derive(Debug)]
pub struct SyscallRecord {
    /// Registry index of the descriptor.
    pub index: usize,
    pub nr: libc::c_long,
    pub args: [u64; MAX_ARGS],
    pub ret: Option<i64>,
    /// Buffers some arguments point into, they must live until the call returns.
    pub attachments: Vec<Box<[u8]>>,
}

impl SyscallRecord {
    pub fn new(index: usize, nr: libc::c_long) -> Self {
        Self {
            index,
            nr,
            args: [0; MAX_ARGS],
            ret: None,
            attachments: Vec::new(),
        }
    }

    /// Keep `buf` alive with the record and return its address.
    pub fn attach(&mut self, buf: Box<[u8]>) -> u64 {
        let addr = buf.as_ptr() as u64;
        self.attachments.push(buf);
        addr
    }
}

/// Memory allocated by a sanitise hook for one call. Not clonable, it is moved into the
/// post hook exactly once.
#[derive(Debug)]
pub struct Scratch {
    buf: Box<[u64]>,
    len: usize,
}

impl Scratch {
    #[inline]
    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `buf` holds at least `len` bytes and u8 has no alignment requirement.
        unsafe { std::slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, self.len) }
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: see `bytes_mut`.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr() as *const u8, self.len) }
    }
}

pub trait ScratchAlloc {
    /// 8-byte aligned zeroed memory of `size` bytes, `None` when out of memory.
    fn alloc(&self, size: usize) -> Option<Scratch>;
    fn release(&self, scratch: Scratch);
}

/// Allocator backed by the process heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAlloc;

impl HeapAlloc {
    pub(crate) fn make(size: usize) -> Option<Scratch> {
        let words = (size + 7) / 8;
        let mut buf: Vec<u64> = Vec::new();
        buf.try_reserve_exact(words.max(1)).ok()?;
        buf.resize(words.max(1), 0);
        Some(Scratch {
            buf: buf.into_boxed_slice(),
            len: size,
        })
    }
}

impl ScratchAlloc for HeapAlloc {
    fn alloc(&self, size: usize) -> Option<Scratch> {
        Self::make(size)
    }

    fn release(&self, scratch: Scratch) {
        drop(scratch)
    }
}

/// What the hooks get to work with.
pub struct HookCtx<'a, 'r> {
    pub alloc: &'a dyn ScratchAlloc,
    /// For substitute arguments when allocation fails.
    pub gen: &'a mut ArgGen<'r>,
}

/// A fuzzed syscall.
pub trait Syscall {
    fn entry(&self) -> &SyscallEntry;

    /// Adjust the generated arguments before the call. Memory the rewritten arguments
    /// point to is returned and handed back to `post` afterwards.
    fn sanitise(&self, _ctx: &mut HookCtx, _rec: &mut SyscallRecord) -> Option<Scratch> {
        None
    }

    /// Clean up after the call, must release `scratch`.
    fn post(&self, ctx: &mut HookCtx, _rec: &SyscallRecord, scratch: Option<Scratch>) {
        if let Some(scratch) = scratch {
            ctx.alloc.release(scratch);
        }
    }

    /// Whether sanitise/post are overridden, informational only.
    fn has_hooks(&self) -> bool {
        false
    }

    fn invoke(&self, rec: &SyscallRecord) -> i64 {
        let a = &rec.args;
        // SAFETY: raw syscall with fuzzed arguments. Memory the kernel writes to is either
        // owned by the record, scratch, our own mappings or invalid and rejected with EFAULT.
        unsafe { libc::syscall(rec.nr, a[0], a[1], a[2], a[3], a[4], a[5]) as i64 }
    }
}

/// Descriptor without hooks.
pub struct Plain(pub SyscallEntry);

impl Syscall for Plain {
    fn entry(&self) -> &SyscallEntry {
        &self.0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Allocators for checking hook behaviour.

    use super::*;
    use std::cell::{Cell, RefCell};

    /// Records every allocation and release.
    #[derive(Default)]
    pub(crate) struct SpyAlloc {
        pub allocs: Cell<usize>,
        pub releases: Cell<usize>,
        pub live: RefCell<Vec<u64>>,
    }

    impl ScratchAlloc for SpyAlloc {
        fn alloc(&self, size: usize) -> Option<Scratch> {
            let s = HeapAlloc::make(size)?;
            self.allocs.set(self.allocs.get() + 1);
            self.live.borrow_mut().push(s.addr());
            Some(s)
        }

        fn release(&self, scratch: Scratch) {
            let mut live = self.live.borrow_mut();
            let idx = live
                .iter()
                .position(|&a| a == scratch.addr())
                .expect("release of unknown scratch");
            live.swap_remove(idx);
            self.releases.set(self.releases.get() + 1);
        }
    }

    /// Always out of memory.
    #[derive(Default)]
    pub(crate) struct OomAlloc {
        pub attempts: Cell<usize>,
    }

    impl ScratchAlloc for OomAlloc {
        fn alloc(&self, _size: usize) -> Option<Scratch> {
            self.attempts.set(self.attempts.get() + 1);
            None
        }

        fn release(&self, _scratch: Scratch) {
            panic!("nothing was allocated");
        }
    }
}
