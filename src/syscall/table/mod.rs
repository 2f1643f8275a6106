//! Built-in descriptors.

use super::Syscall;

pub mod fs;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod ldt;
pub mod mm;
pub mod net;

pub fn builtin() -> Vec<Box<dyn Syscall>> {
    #[allow(unused_mut)]
    let mut calls: Vec<Box<dyn Syscall>> = vec![
        Box::new(fs::read()),
        Box::new(fs::write()),
        Box::new(fs::lseek()),
        Box::new(fs::fsync()),
        Box::new(fs::dup()),
        Box::new(mm::madvise()),
        Box::new(net::shutdown()),
        Box::new(net::send()),
        Box::new(net::sendto()),
        Box::new(net::sendmsg()),
        Box::new(net::sendmmsg()),
    ];
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    calls.push(Box::new(ldt::modify_ldt()));
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gen::ArgGen,
        resources::Resources,
        syscall::{
            testing::{OomAlloc, SpyAlloc},
            HookCtx,
        },
        RngType,
    };
    use rand::SeedableRng;

    #[test]
    fn hooks_release_what_they_allocate() {
        let mut rng = RngType::seed_from_u64(9);
        let res = Resources::new(&mut rng).unwrap();
        let mut gen = ArgGen::new(&mut rng, &res, 0.1);
        for call in builtin() {
            let alloc = SpyAlloc::default();
            for _ in 0..200 {
                let mut rec = gen.generate(0, call.entry());
                let generated = rec.args;
                let mut ctx = HookCtx {
                    alloc: &alloc,
                    gen: &mut gen,
                };
                let scratch = call.sanitise(&mut ctx, &mut rec);
                if !call.has_hooks() {
                    assert_eq!(rec.args, generated, "{} rewrote args", call.entry().name);
                }
                if let Some(s) = &scratch {
                    assert!(alloc.live.borrow().contains(&s.addr()));
                }
                call.post(&mut ctx, &rec, scratch);
                assert!(alloc.live.borrow().is_empty(), "{} leaked", call.entry().name);
            }
            assert_eq!(
                alloc.allocs.get(),
                alloc.releases.get(),
                "{}",
                call.entry().name
            );
            if call.has_hooks() {
                assert!(alloc.allocs.get() > 0, "{} never allocated", call.entry().name);
            } else {
                assert_eq!(alloc.allocs.get(), 0, "{} allocated", call.entry().name);
            }
        }
    }

    #[test]
    fn oom_substitutes_address() {
        let mut rng = RngType::seed_from_u64(10);
        let res = Resources::new(&mut rng).unwrap();
        let mut gen = ArgGen::new(&mut rng, &res, 0.1);
        for call in builtin().into_iter().filter(|c| c.has_hooks()) {
            let alloc = OomAlloc::default();
            for _ in 0..50 {
                let mut rec = gen.generate(0, call.entry());
                let mut ctx = HookCtx {
                    alloc: &alloc,
                    gen: &mut gen,
                };
                assert!(call.sanitise(&mut ctx, &mut rec).is_none());
                call.post(&mut ctx, &rec, None);
            }
            assert!(alloc.attempts.get() > 0, "{}", call.entry().name);
        }
    }

    #[test]
    fn read_buffer_is_clamped() {
        let mut rng = RngType::seed_from_u64(12);
        let res = Resources::new(&mut rng).unwrap();
        let mut gen = ArgGen::new(&mut rng, &res, 0.1);
        let alloc = SpyAlloc::default();
        let call = fs::read();
        for _ in 0..500 {
            let mut rec = gen.generate(0, call.entry());
            let mut ctx = HookCtx {
                alloc: &alloc,
                gen: &mut gen,
            };
            let s = call.sanitise(&mut ctx, &mut rec).unwrap();
            assert_eq!(rec.args[1], s.addr());
            assert_eq!(rec.args[2], s.len() as u64);
            assert!(s.len() <= fs::READ_BUF_MAX);
            call.post(&mut ctx, &rec, Some(s));
        }
    }
}
