//! Syscall selection policies.

use crate::{
    gen::choose_weighted,
    syscall::{Registry, RegistryError},
    RngType,
};
use rand::prelude::*;

pub trait SyscallSelector {
    /// Registry index of the next syscall to invoke.
    fn select(&self, registry: &Registry, rng: &mut RngType) -> usize;
}

/// Every syscall equally likely.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl SyscallSelector for Uniform {
    #[inline]
    fn select(&self, registry: &Registry, rng: &mut RngType) -> usize {
        rng.gen_range(0..registry.len())
    }
}

/// Syscalls chosen proportionally to a per-syscall weight.
#[derive(Debug, Clone)]
pub struct Weighted {
    /// Accumulated weights, one per registry entry.
    acc: Vec<u64>,
}

impl Weighted {
    /// `weights` names syscalls of `registry`, unnamed ones get `default`.
    pub fn new(
        registry: &Registry,
        weights: &[(&str, u64)],
        default: u64,
    ) -> Result<Self, RegistryError> {
        let mut w = vec![default; registry.len()];
        for (name, weight) in weights {
            let idx = registry
                .index_of(name)
                .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
            w[idx] = *weight;
        }
        let mut acc = Vec::with_capacity(w.len());
        let mut sum = 0;
        for weight in w {
            sum += weight;
            acc.push(sum);
        }
        if sum == 0 {
            return Err(RegistryError::Empty);
        }
        Ok(Self { acc })
    }
}

impl SyscallSelector for Weighted {
    fn select(&self, registry: &Registry, rng: &mut RngType) -> usize {
        if self.acc.len() != registry.len() {
            return Uniform.select(registry, rng);
        }
        choose_weighted(rng, &self.acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_covers_registry() {
        let r = Registry::builtin().unwrap();
        let mut rng = RngType::seed_from_u64(1);
        let mut seen = vec![0usize; r.len()];
        for _ in 0..10_000 {
            seen[Uniform.select(&r, &mut rng)] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0));
    }

    #[test]
    fn weighted_follows_weights() {
        let r = Registry::builtin().unwrap();
        let w = Weighted::new(&r, &[("read", 9), ("write", 1)], 0).unwrap();
        let read = r.index_of("read").unwrap();
        let write = r.index_of("write").unwrap();
        let mut rng = RngType::seed_from_u64(2);
        let mut reads = 0;
        for _ in 0..10_000 {
            let idx = w.select(&r, &mut rng);
            assert!(idx == read || idx == write);
            if idx == read {
                reads += 1;
            }
        }
        assert!((8_700..9_300).contains(&reads), "reads {}", reads);
    }

    #[test]
    fn weighted_rejects_unknown_and_zero() {
        let r = Registry::builtin().unwrap();
        assert!(Weighted::new(&r, &[("nope", 1)], 1).is_err());
        assert!(Weighted::new(&r, &[], 0).is_err());
    }
}
