//! Socket send family and shutdown.

use crate::syscall::{
    ArgKind, ArgSpec, HookCtx, Plain, Scratch, Syscall, SyscallEntry, SyscallRecord, NEED_ALARM,
};
use nix::libc;
use rand::Rng;
use std::mem::size_of;

/// MSG_* flags as the kernel defines them.
pub const MSG_FLAGS: [u64; 20] = [
    0x1,        // MSG_OOB
    0x2,        // MSG_PEEK
    0x4,        // MSG_DONTROUTE
    0x8,        // MSG_CTRUNC
    0x10,       // path mtu discovery, sends nothing
    0x20,       // MSG_TRUNC
    0x40,       // MSG_DONTWAIT
    0x80,       // MSG_EOR
    0x100,      // MSG_WAITALL
    0x200,      // MSG_FIN
    0x400,      // MSG_SYN
    0x800,      // MSG_CONFIRM
    0x1000,     // MSG_RST
    0x2000,     // MSG_ERRQUEUE
    0x4000,     // MSG_NOSIGNAL
    0x8000,     // MSG_MORE
    0x10000,    // MSG_WAITFORONE
    0x2000_0000, // MSG_FASTOPEN
    0x4000_0000, // MSG_CMSG_CLOEXEC
    0x8000_0000, // MSG_CMSG_COMPAT
];

/// sendmsg(2) takes every MSG_* flag but 0x10, which makes it send nothing.
const SENDMSG_FLAGS: [u64; 19] = [
    0x1, 0x2, 0x4, 0x8, 0x20, 0x40, 0x80, 0x100, 0x200, 0x400, 0x800, 0x1000, 0x2000, 0x4000,
    0x8000, 0x10000, 0x2000_0000, 0x4000_0000, 0x8000_0000,
];

const SHUTDOWN_ARGS: [ArgSpec; 2] = [
    ArgSpec::new("fd", ArgKind::Fd),
    // SHUT_RD, SHUT_WR, SHUT_RDWR
    ArgSpec::new("how", ArgKind::Op(&[0, 1, 2])),
];

const SEND_ARGS: [ArgSpec; 4] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("buff", ArgKind::Address),
    ArgSpec::new("len", ArgKind::Len),
    ArgSpec::new("flags", ArgKind::List(&MSG_FLAGS)),
];

const SENDTO_ARGS: [ArgSpec; 6] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("buff", ArgKind::Address),
    ArgSpec::new("len", ArgKind::Len),
    ArgSpec::new("flags", ArgKind::List(&MSG_FLAGS)),
    ArgSpec::new("addr", ArgKind::SockAddr),
    ArgSpec::new("addr_len", ArgKind::SockAddrLen),
];

const SENDMSG_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("msg", ArgKind::Address),
    ArgSpec::new("flags", ArgKind::List(&SENDMSG_FLAGS)),
];

const SENDMMSG_ARGS: [ArgSpec; 4] = [
    ArgSpec::new("fd", ArgKind::Fd),
    ArgSpec::new("mmsg", ArgKind::Address),
    ArgSpec::new("vlen", ArgKind::Len),
    ArgSpec::new("flags", ArgKind::List(&MSG_FLAGS)),
];

pub fn shutdown() -> Plain {
    Plain(SyscallEntry {
        name: "shutdown",
        nr: libc::SYS_shutdown,
        nargs: 2,
        args: &SHUTDOWN_ARGS,
        flags: 0,
    })
}

/// send(2) is sendto(2) without an address on every architecture we run on.
pub fn send() -> Plain {
    Plain(SyscallEntry {
        name: "send",
        nr: libc::SYS_sendto,
        nargs: 4,
        args: &SEND_ARGS,
        flags: 0,
    })
}

pub fn sendto() -> Plain {
    Plain(SyscallEntry {
        name: "sendto",
        nr: libc::SYS_sendto,
        nargs: 6,
        args: &SENDTO_ARGS,
        flags: NEED_ALARM,
    })
}

pub fn sendmmsg() -> Plain {
    Plain(SyscallEntry {
        name: "sendmmsg",
        nr: libc::SYS_sendmmsg,
        nargs: 4,
        args: &SENDMMSG_ARGS,
        flags: NEED_ALARM,
    })
}

/// sendmsg(2) with a message header in scratch. The name is a generated socket address
/// next to the header, the iovec array is either one entry in scratch or a generated
/// address and length, control data and flags are random.
pub struct SendMsg(SyscallEntry);

pub fn sendmsg() -> SendMsg {
    SendMsg(SyscallEntry {
        name: "sendmsg",
        nr: libc::SYS_sendmsg,
        nargs: 3,
        args: &SENDMSG_ARGS,
        flags: NEED_ALARM,
    })
}

const HDR_LEN: usize = size_of::<libc::msghdr>();
const IOV_LEN: usize = size_of::<libc::iovec>();

impl Syscall for SendMsg {
    fn entry(&self) -> &SyscallEntry {
        &self.0
    }

    fn sanitise(&self, ctx: &mut HookCtx, rec: &mut SyscallRecord) -> Option<Scratch> {
        let sa = ctx.gen.sockaddr();
        let mut buf = match ctx.alloc.alloc(HDR_LEN + IOV_LEN + sa.len()) {
            Some(buf) => buf,
            None => {
                rec.args[1] = ctx.gen.address();
                return None;
            }
        };
        let base = buf.addr();
        let iov_addr = base + HDR_LEN as u64;
        let name_addr = iov_addr + IOV_LEN as u64;

        let iov = libc::iovec {
            iov_base: ctx.gen.address() as *mut libc::c_void,
            iov_len: ctx.gen.len() as usize,
        };
        // SAFETY: all-zero is a valid msghdr.
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_name = name_addr as *mut libc::c_void;
        hdr.msg_namelen = sa.len() as libc::socklen_t;
        if ctx.gen.rng().gen() {
            hdr.msg_iov = iov_addr as *mut libc::iovec;
            hdr.msg_iovlen = 1;
        } else {
            hdr.msg_iov = ctx.gen.address() as *mut libc::iovec;
            hdr.msg_iovlen = ctx.gen.len() as _;
        }
        hdr.msg_control = ctx.gen.address() as *mut libc::c_void;
        hdr.msg_controllen = ctx.gen.len() as _;
        hdr.msg_flags = ctx.gen.raw() as libc::c_int;

        let bytes = buf.bytes_mut();
        bytes[HDR_LEN + IOV_LEN..].copy_from_slice(&sa);
        // SAFETY: scratch is 8-byte aligned and large enough, msghdr and iovec are
        // multiples of 8 bytes on 64-bit targets, unaligned writes cover the others.
        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut libc::msghdr, hdr);
            std::ptr::write_unaligned(bytes.as_mut_ptr().add(HDR_LEN) as *mut libc::iovec, iov);
        }
        rec.args[1] = base;
        Some(buf)
    }

    fn has_hooks(&self) -> bool {
        true
    }
}
