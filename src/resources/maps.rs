//! Anonymous mappings handed to address arguments.

use super::ResourceError;
use crate::{arch::PAGE_SIZE, RngType};
use nix::{
    libc::c_void,
    sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags},
};
use rand::prelude::*;
use std::{num::NonZeroUsize, ptr::NonNull};

/// Addresses that never point into user memory a worker owns.
const BAD_ADDRS: [u64; 5] = [
    0,
    1,
    0xffff_ffff_ffff_f000,
    0xffff_8800_0000_0000,
    0x0000_7fff_ffff_f000,
];

/// How a mapping is filled and protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    ReadWrite,
    ReadOnly,
    NoAccess,
    Zeroed,
    Ones,
    Random,
}

pub struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    pub fn new(pages: usize, kind: MapKind, rng: &mut RngType) -> Result<Self, ResourceError> {
        let len = pages.max(1) * *PAGE_SIZE;
        let sz = NonZeroUsize::new(len).ok_or(ResourceError::EmptyMapping)?;
        // SAFETY: fresh private anonymous mapping, no existing memory is aliased.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                sz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(ResourceError::Mmap)?;
        let map = Self { ptr, len };

        {
            // SAFETY: the mapping is readable and writable and `len` bytes long.
            let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u8, len) };
            match kind {
                MapKind::Ones => bytes.fill(0xff),
                MapKind::Random | MapKind::ReadWrite | MapKind::ReadOnly => rng.fill_bytes(bytes),
                MapKind::Zeroed | MapKind::NoAccess => (),
            }
        }
        let prot = match kind {
            MapKind::ReadOnly => Some(ProtFlags::PROT_READ),
            MapKind::NoAccess => Some(ProtFlags::PROT_NONE),
            _ => None,
        };
        if let Some(prot) = prot {
            // SAFETY: range lies within our own mapping.
            unsafe { mprotect(ptr, len, prot) }.map_err(ResourceError::Mmap)?;
        }
        Ok(map)
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr() && addr < self.addr() + self.len as u64
    }

    /// Some address inside the mapping, page aligned half of the time.
    pub fn pick(&self, rng: &mut RngType) -> u64 {
        let page = *PAGE_SIZE;
        let pages = self.len / page;
        let base = self.addr() + (rng.gen_range(0..pages) * page) as u64;
        if rng.gen() {
            base
        } else {
            base + rng.gen_range(0..page) as u64
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing refers to it after drop.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("munmap {:#x}: {}", self.addr(), e);
        }
    }
}

/// The set of mappings address arguments point into.
pub struct Maps {
    maps: Vec<Mapping>,
}

impl Maps {
    pub fn new(rng: &mut RngType) -> Result<Self, ResourceError> {
        const LAYOUT: [(usize, MapKind); 6] = [
            (1, MapKind::ReadWrite),
            (4, MapKind::ReadWrite),
            (1, MapKind::ReadOnly),
            (1, MapKind::NoAccess),
            (1, MapKind::Zeroed),
            (1, MapKind::Ones),
        ];
        let mut maps = Vec::with_capacity(LAYOUT.len());
        for (pages, kind) in LAYOUT {
            maps.push(Mapping::new(pages, kind, rng)?);
        }
        Ok(Self { maps })
    }

    pub fn maps(&self) -> &[Mapping] {
        &self.maps
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.maps.iter().any(|m| m.contains(addr))
    }

    /// Address inside one of the mappings, or `random_page` a quarter of the time,
    /// or a bad address occasionally.
    pub fn pick(&self, rng: &mut RngType, random_page: &Mapping) -> u64 {
        match rng.gen_range(0..100) {
            0..=4 => BAD_ADDRS.choose(rng).copied().unwrap_or(0),
            5..=29 => random_page.pick(rng),
            _ => match self.maps.choose(rng) {
                Some(m) => m.pick(rng),
                None => random_page.pick(rng),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_contents() {
        let mut rng = RngType::seed_from_u64(1);
        let ones = Mapping::new(1, MapKind::Ones, &mut rng).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ones.addr() as *const u8, ones.len()) };
        assert!(bytes.iter().all(|&b| b == 0xff));

        let zero = Mapping::new(2, MapKind::Zeroed, &mut rng).unwrap();
        assert_eq!(zero.len(), 2 * *PAGE_SIZE);
        let bytes = unsafe { std::slice::from_raw_parts(zero.addr() as *const u8, zero.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn picked_addresses_are_inside() {
        let mut rng = RngType::seed_from_u64(2);
        let maps = Maps::new(&mut rng).unwrap();
        let page = Mapping::new(1, MapKind::Random, &mut rng).unwrap();
        let mut bad = 0;
        for _ in 0..1000 {
            let addr = maps.pick(&mut rng, &page);
            if !maps.contains(addr) && !page.contains(addr) {
                assert!(BAD_ADDRS.contains(&addr), "stray address {:#x}", addr);
                bad += 1;
            }
        }
        assert!(bad > 0 && bad < 150, "bad: {}", bad);
    }
}
