//! madvise.

use crate::syscall::{ArgKind, ArgSpec, Plain, SyscallEntry};
use nix::libc;

const MADV_ADVICE: [u64; 19] = [
    libc::MADV_NORMAL as u64,
    libc::MADV_RANDOM as u64,
    libc::MADV_SEQUENTIAL as u64,
    libc::MADV_WILLNEED as u64,
    libc::MADV_DONTNEED as u64,
    libc::MADV_FREE as u64,
    libc::MADV_REMOVE as u64,
    libc::MADV_DONTFORK as u64,
    libc::MADV_DOFORK as u64,
    libc::MADV_MERGEABLE as u64,
    libc::MADV_UNMERGEABLE as u64,
    libc::MADV_HUGEPAGE as u64,
    libc::MADV_NOHUGEPAGE as u64,
    libc::MADV_DONTDUMP as u64,
    libc::MADV_DODUMP as u64,
    18, // MADV_WIPEONFORK
    19, // MADV_KEEPONFORK
    20, // MADV_COLD
    21, // MADV_PAGEOUT
];

const MADVISE_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("addr", ArgKind::Address),
    ArgSpec::new("len", ArgKind::Len),
    ArgSpec::new("advice", ArgKind::Op(&MADV_ADVICE)),
];

pub fn madvise() -> Plain {
    Plain(SyscallEntry {
        name: "madvise",
        nr: libc::SYS_madvise,
        nargs: 3,
        args: &MADVISE_ARGS,
        flags: 0,
    })
}
