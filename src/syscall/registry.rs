//! Validated, read-only set of descriptors a session fuzzes.

use super::{table, ArgKind, Syscall, MAX_ARGS};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{name}: arity {nargs} not in 1..={}", MAX_ARGS)]
    BadArity { name: &'static str, nargs: usize },
    #[error("{name}: arity {nargs} but {described} arguments described")]
    ArgMismatch {
        name: &'static str,
        nargs: usize,
        described: usize,
    },
    #[error("{name}: argument '{arg}' has no candidates")]
    NoCandidates {
        name: &'static str,
        arg: &'static str,
    },
    #[error("{name}: argument '{arg}' has an empty range")]
    EmptyRange {
        name: &'static str,
        arg: &'static str,
    },
    #[error("{name}: argument '{arg}' is not preceded by a socket address")]
    UnpairedSockAddrLen {
        name: &'static str,
        arg: &'static str,
    },
    #[error("duplicated syscall: {0}")]
    Duplicate(&'static str),
    #[error("unknown syscall: {0}")]
    Unknown(String),
    #[error("no syscall left to fuzz")]
    Empty,
}

pub struct Registry {
    calls: Vec<Box<dyn Syscall>>,
    by_name: FxHashMap<&'static str, usize>,
}

impl Registry {
    pub fn new(calls: Vec<Box<dyn Syscall>>) -> Result<Self, RegistryError> {
        if calls.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut by_name = FxHashMap::default();
        for (idx, call) in calls.iter().enumerate() {
            check(call.as_ref())?;
            let name = call.entry().name;
            if by_name.insert(name, idx).is_some() {
                return Err(RegistryError::Duplicate(name));
            }
        }
        Ok(Self { calls, by_name })
    }

    /// Registry of every built-in descriptor.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::new(table::builtin())
    }

    /// Keep `only` (all non-avoided if empty), then drop `exclude`.
    /// Avoided syscalls are kept only if named in `only`.
    pub fn filter(self, only: &[String], exclude: &[String]) -> Result<Self, RegistryError> {
        for name in only.iter().chain(exclude.iter()) {
            if !self.by_name.contains_key(name.as_str()) {
                return Err(RegistryError::Unknown(name.clone()));
            }
        }
        let calls = self
            .calls
            .into_iter()
            .filter(|call| {
                let e = call.entry();
                let selected = if only.is_empty() {
                    !e.avoid()
                } else {
                    only.iter().any(|n| n == e.name)
                };
                selected && !exclude.iter().any(|n| n == e.name)
            })
            .collect::<Vec<_>>();
        Self::new(calls)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> &dyn Syscall {
        self.calls[idx].as_ref()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn Syscall> {
        self.index_of(name).map(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Syscall> + '_ {
        self.calls.iter().map(|c| c.as_ref())
    }
}

fn check(call: &dyn Syscall) -> Result<(), RegistryError> {
    let e = call.entry();
    let name = e.name;
    if e.nargs == 0 || e.nargs > MAX_ARGS {
        return Err(RegistryError::BadArity {
            name,
            nargs: e.nargs,
        });
    }
    if e.nargs != e.args.len() {
        return Err(RegistryError::ArgMismatch {
            name,
            nargs: e.nargs,
            described: e.args.len(),
        });
    }
    let mut prev = None;
    for arg in e.args {
        match arg.kind {
            ArgKind::List(vals) | ArgKind::Op(vals) if vals.is_empty() => {
                return Err(RegistryError::NoCandidates {
                    name,
                    arg: arg.name,
                })
            }
            ArgKind::Range { lo, hi } if lo > hi => {
                return Err(RegistryError::EmptyRange {
                    name,
                    arg: arg.name,
                })
            }
            ArgKind::SockAddrLen if prev != Some(ArgKind::SockAddr) => {
                return Err(RegistryError::UnpairedSockAddrLen {
                    name,
                    arg: arg.name,
                })
            }
            _ => (),
        }
        prev = Some(arg.kind);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{ArgSpec, Plain, SyscallEntry};

    fn entry(name: &'static str, nargs: usize, args: &'static [ArgSpec]) -> Box<dyn Syscall> {
        Box::new(Plain(SyscallEntry {
            name,
            nr: 0,
            nargs,
            args,
            flags: 0,
        }))
    }

    const ONE: [ArgSpec; 1] = [ArgSpec::new("a", ArgKind::Raw)];

    #[test]
    fn builtin_is_valid() {
        let r = Registry::builtin().unwrap();
        assert!(r.len() >= 11);
        for name in ["read", "write", "lseek", "sendto", "sendmsg", "sendmmsg"] {
            assert!(r.by_name(name).is_some(), "{} missing", name);
        }
        for (i, call) in r.iter().enumerate() {
            assert_eq!(r.index_of(call.entry().name), Some(i));
        }
    }

    #[test]
    fn rejects_bad_descriptors() {
        const NO_CANDIDATES: [ArgSpec; 1] = [ArgSpec::new("flags", ArgKind::List(&[]))];
        const EMPTY_RANGE: [ArgSpec; 1] = [ArgSpec::new("n", ArgKind::Range { lo: 5, hi: 1 })];
        const UNPAIRED: [ArgSpec; 2] = [
            ArgSpec::new("fd", ArgKind::Fd),
            ArgSpec::new("addrlen", ArgKind::SockAddrLen),
        ];
        assert!(matches!(
            Registry::new(vec![entry("x", 0, &[])]),
            Err(RegistryError::BadArity { .. })
        ));
        assert!(matches!(
            Registry::new(vec![entry("x", 2, &ONE)]),
            Err(RegistryError::ArgMismatch { .. })
        ));
        assert!(matches!(
            Registry::new(vec![entry("x", 1, &NO_CANDIDATES)]),
            Err(RegistryError::NoCandidates { .. })
        ));
        assert!(matches!(
            Registry::new(vec![entry("x", 1, &EMPTY_RANGE)]),
            Err(RegistryError::EmptyRange { .. })
        ));
        assert!(matches!(
            Registry::new(vec![entry("x", 2, &UNPAIRED)]),
            Err(RegistryError::UnpairedSockAddrLen { .. })
        ));
        assert!(matches!(
            Registry::new(vec![entry("x", 1, &ONE), entry("x", 1, &ONE)]),
            Err(RegistryError::Duplicate("x"))
        ));
        assert!(matches!(Registry::new(Vec::new()), Err(RegistryError::Empty)));
    }

    #[test]
    fn filter_only_and_exclude() {
        let only = vec!["read".to_string(), "write".to_string()];
        let r = Registry::builtin().unwrap().filter(&only, &[]).unwrap();
        assert_eq!(r.len(), 2);

        let exclude = vec!["read".to_string()];
        let r = Registry::builtin().unwrap().filter(&only, &exclude).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.get(0).entry().name, "write");

        let unknown = vec!["no_such_call".to_string()];
        assert!(matches!(
            Registry::builtin().unwrap().filter(&unknown, &[]),
            Err(RegistryError::Unknown(_))
        ));
        assert!(matches!(
            Registry::builtin().unwrap().filter(&only, &only),
            Err(RegistryError::Empty)
        ));
    }

    #[test]
    fn avoided_kept_only_when_named() {
        struct Avoided(SyscallEntry);
        impl Syscall for Avoided {
            fn entry(&self) -> &SyscallEntry {
                &self.0
            }
        }
        let calls = || -> Vec<Box<dyn Syscall>> {
            vec![
                entry("plain", 1, &ONE),
                Box::new(Avoided(SyscallEntry {
                    name: "avoided",
                    nr: 0,
                    nargs: 1,
                    args: &ONE,
                    flags: crate::syscall::AVOID_SYSCALL,
                })),
            ]
        };
        let r = Registry::new(calls()).unwrap().filter(&[], &[]).unwrap();
        assert_eq!(r.len(), 1);
        assert!(r.by_name("avoided").is_none());

        let only = vec!["avoided".to_string()];
        let r = Registry::new(calls()).unwrap().filter(&only, &[]).unwrap();
        assert_eq!(r.len(), 1);
        assert!(r.by_name("avoided").is_some());
    }
}
