//! modify_ldt, x86 only.

use crate::syscall::{ArgKind, ArgSpec, HookCtx, Scratch, Syscall, SyscallEntry, SyscallRecord};
use nix::libc;

/// Size of `struct user_desc`.
const USER_DESC_LEN: usize = 16;
/// Buffer handed to a read of the whole LDT.
const LDT_READ_LEN: usize = 65536;

const FUNC_READ: u64 = 0;
const FUNC_WRITE: u64 = 1;

const MODIFY_LDT_ARGS: [ArgSpec; 3] = [
    ArgSpec::new("func", ArgKind::Op(&[FUNC_READ, FUNC_WRITE])),
    ArgSpec::new("ptr", ArgKind::Address),
    ArgSpec::new("bytecount", ArgKind::Len),
];

pub struct ModifyLdt(SyscallEntry);

pub fn modify_ldt() -> ModifyLdt {
    ModifyLdt(SyscallEntry {
        name: "modify_ldt",
        nr: libc::SYS_modify_ldt,
        nargs: 3,
        args: &MODIFY_LDT_ARGS,
        flags: 0,
    })
}

impl Syscall for ModifyLdt {
    fn entry(&self) -> &SyscallEntry {
        &self.0
    }

    fn sanitise(&self, ctx: &mut HookCtx, rec: &mut SyscallRecord) -> Option<Scratch> {
        let size = match rec.args[0] {
            FUNC_READ => LDT_READ_LEN,
            FUNC_WRITE => USER_DESC_LEN,
            _ => return None,
        };
        match ctx.alloc.alloc(size) {
            Some(mut buf) => {
                if rec.args[0] == FUNC_WRITE {
                    ctx.gen.fill_bytes(buf.bytes_mut());
                }
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
