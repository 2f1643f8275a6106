use crate::{
    resources::Resources,
    syscall::{ArgKind, SyscallEntry, SyscallRecord},
    RngType,
};
use rand::prelude::*;

// Integer, length and flag values.
mod scalar;
// Socket addresses.
mod sockaddr;

/// Produces argument values for one worker, biased toward edge cases.
pub struct ArgGen<'r> {
    rng: &'r mut RngType,
    res: &'r Resources,
    wild_ratio: f64,
}

impl<'r> ArgGen<'r> {
    /// `wild_ratio` is the probability of a flag list argument being fully random.
    pub fn new(rng: &'r mut RngType, res: &'r Resources, wild_ratio: f64) -> Self {
        Self {
            rng,
            res,
            wild_ratio: wild_ratio.clamp(0.0, 1.0),
        }
    }

    #[inline]
    pub fn rng(&mut self) -> &mut RngType {
        &mut *self.rng
    }

    /// Fresh record for the descriptor at registry `index`.
    pub fn generate(&mut self, index: usize, entry: &SyscallEntry) -> SyscallRecord {
        let mut rec = SyscallRecord::new(index, entry.nr);
        let mut sockaddr_len = None;
        for (i, arg) in entry.args.iter().enumerate() {
            rec.args[i] = match arg.kind {
                ArgKind::Raw => self.raw(),
                ArgKind::Fd => self.fd(),
                ArgKind::Address => self.address(),
                ArgKind::Len => self.len(),
                ArgKind::List(vals) => self.flags(vals),
                ArgKind::Op(vals) => self.op(vals),
                ArgKind::Range { lo, hi } => self.range(lo, hi),
                ArgKind::SockAddr => {
                    let sa = sockaddr::gen(self.rng);
                    sockaddr_len = Some(sa.len() as u64);
                    rec.attach(sa)
                }
                ArgKind::SockAddrLen => match sockaddr_len.take() {
                    Some(len) => len,
                    None => self.len(),
                },
            };
        }
        rec
    }

    pub fn raw(&mut self) -> u64 {
        scalar::raw(self.rng)
    }

    /// Descriptor from the pool, sign extended.
    pub fn fd(&mut self) -> u64 {
        self.res.fds().pick(self.rng) as i64 as u64
    }

    pub fn address(&mut self) -> u64 {
        self.res.pick_addr(self.rng)
    }

    pub fn len(&mut self) -> u64 {
        scalar::len(self.rng)
    }

    pub fn flags(&mut self, vals: &[u64]) -> u64 {
        scalar::flags(self.rng, vals, self.wild_ratio)
    }

    pub fn op(&mut self, vals: &[u64]) -> u64 {
        scalar::op(self.rng, vals)
    }

    pub fn range(&mut self, lo: u64, hi: u64) -> u64 {
        scalar::range(self.rng, lo, hi)
    }

    /// Socket address buffer, the length is the buffer's length.
    pub fn sockaddr(&mut self) -> Box<[u8]> {
        sockaddr::gen(self.rng)
    }

    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf)
    }
}

/// Return chosen index based on `weights`.
///
/// Weight is accumulated value. For example, [10, 35, 50] means each item has
/// 10%, 25%, 15% to be chosen.
pub(crate) fn choose_weighted(rng: &mut RngType, weights: &[u64]) -> usize {
    let max = match weights.last() {
        Some(&max) if max > 0 => max,
        _ => return 0,
    };
    let n = rng.gen_range(0..max);
    // first item whose accumulated weight exceeds `n`, zero weight items are skipped.
    weights.partition_point(|&w| w <= n)
}
