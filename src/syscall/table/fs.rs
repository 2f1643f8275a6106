//! read, write, lseek, fsync, dup.

use crate::syscall::{
    ArgKind, ArgSpec, HookCtx, Plain, Scratch, Syscall, SyscallEntry, SyscallRecord, NEED_ALARM,
};
use nix::libc;

/// Largest buffer read gets, bigger counts are clamped.
pub const READ_BUF_MAX: usize = 64 << 10;

const READ_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("buf", ArgKind::Address),
    ArgSpec::new("count", ArgKind::Len),
];

/// read(2) into a buffer of its own, the kernel never scribbles over the worker's memory.
pub struct Read(SyscallEntry);

pub fn read() -> Read {
    Read(SyscallEntry {
        name: "read",
        nr: libc::SYS_read,
        nargs: 3,
        args: &READ_ARGS,
        flags: NEED_ALARM,
    })
}

impl Syscall for Read {
    fn entry(&self) -> &SyscallEntry {
        &self.0
    }

    fn sanitise(&self, ctx: &mut HookCtx, rec: &mut SyscallRecord) -> Option<Scratch> {
        let size = std::cmp::min(rec.args[2], READ_BUF_MAX as u64) as usize;
        match ctx.alloc.alloc(size) {
            Some(buf) => {
                rec.args[1] = buf.addr();
                rec.args[2] = size as u64;
                Some(buf)
            }
            None => {
                rec.args[1] = ctx.gen.address();
                None
            }
        }
    }

    fn has_hooks(&self) -> bool {
        true
    }
}

const WRITE_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("buf", ArgKind::Address),
    ArgSpec::new("count", ArgKind::Len),
];

const LSEEK_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("offset", ArgKind::Raw),
    // SEEK_SET, SEEK_CUR, SEEK_END, SEEK_DATA, SEEK_HOLE
    ArgSpec::new("whence", ArgKind::Op(&[0, 1, 2, 3, 4])),
];

const FD_ARG: [ArgSpec; 1] = [ArgSpec::new("fd", ArgKind::Fd)];

pub fn write() -> Plain {
    Plain(SyscallEntry {
        name: "write",
        nr: libc::SYS_write,
        nargs: 3,
        args: &WRITE_ARGS,
        flags: 0,
    })
}

pub fn lseek() -> Plain {
    Plain(SyscallEntry {
        name: "lseek",
        nr: libc::SYS_lseek,
        nargs: 3,
        args: &LSEEK_ARGS,
        flags: 0,
    })
}

pub fn fsync() -> Plain {
    Plain(SyscallEntry {
        name: "fsync",
        nr: libc::SYS_fsync,
        nargs: 1,
        args: &FD_ARG,
        flags: 0,
    })
}

pub fn dup() -> Plain {
    Plain(SyscallEntry {
        name: "dup",
        nr: libc::SYS_dup,
        nargs: 1,
        args: &FD_ARG,
        flags: 0,
    })
}
