//! Fuzzing resources workers inherit across fork: the fd pool, the scratch mappings and
//! the random page. The supervisor replaces all of them on every regeneration.

use crate::RngType;
use nix::errno::Errno;
use thiserror::Error;

pub mod fds;
pub mod maps;

pub use fds::FdPool;
pub use maps::{MapKind, Mapping, Maps};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("open {path}: {errno}")]
    Open { path: &'static str, errno: Errno },
    #[error("{what}: {errno}")]
    Fd { what: &'static str, errno: Errno },
    #[error("mmap: {0}")]
    Mmap(Errno),
    #[error("zero sized mapping")]
    EmptyMapping,
}

pub struct Resources {
    fds: FdPool,
    maps: Maps,
    random_page: Mapping,
    generation: u64,
}

impl Resources {
    pub fn new(rng: &mut RngType) -> Result<Self, ResourceError> {
        Ok(Self {
            fds: FdPool::new()?,
            maps: Maps::new(rng)?,
            random_page: Mapping::new(1, MapKind::Random, rng)?,
            generation: 0,
        })
    }

    /// Replace every resource. The new set is built completely before the old one is
    /// dropped, a failure leaves the current set in place.
    pub fn regenerate(&mut self, rng: &mut RngType) -> Result<(), ResourceError> {
        let fresh = Self::new(rng)?;
        let generation = self.generation + 1;
        *self = Self {
            generation,
            ..fresh
        };
        Ok(())
    }

    #[inline]
    pub fn fds(&self) -> &FdPool {
        &self.fds
    }

    #[inline]
    pub fn maps(&self) -> &Maps {
        &self.maps
    }

    #[inline]
    pub fn random_page(&self) -> &Mapping {
        &self.random_page
    }

    /// Number of regenerations this set went through.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Address for an address argument.
    pub fn pick_addr(&self, rng: &mut RngType) -> u64 {
        self.maps.pick(rng, &self.random_page)
    }
}
