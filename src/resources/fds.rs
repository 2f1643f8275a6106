//! Pool of live file descriptors handed to fd arguments.

use super::ResourceError;
use crate::RngType;
use nix::{
    fcntl::{open, OFlag},
    sys::{
        socket::{socket, socketpair, AddressFamily, SockFlag, SockType},
        stat::Mode,
    },
    unistd::pipe,
};
use rand::prelude::*;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Descriptors that are never valid in a worker.
const BAD_FDS: [RawFd; 4] = [-1, 1023, 65535, i32::MAX];

pub struct FdPool {
    fds: Vec<OwnedFd>,
    raw: Vec<RawFd>,
}

impl FdPool {
    pub fn new() -> Result<Self, ResourceError> {
        let mut fds = Vec::new();
        for path in ["/dev/null", "/dev/zero"] {
            let fd = open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
                .map_err(|e| ResourceError::Open { path, errno: e })?;
            // SAFETY: `open` just returned this descriptor and nothing else owns it.
            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
        }

        let (r, w) = pipe().map_err(|e| ResourceError::Fd { what: "pipe", errno: e })?;
        fds.push(r);
        fds.push(w);

        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| ResourceError::Fd {
            what: "socketpair",
            errno: e,
        })?;
        fds.push(a);
        fds.push(b);

        let sockets = [
            (AddressFamily::Inet, SockType::Datagram, "udp socket"),
            (AddressFamily::Inet, SockType::Stream, "tcp socket"),
            (AddressFamily::Unix, SockType::Datagram, "unix socket"),
        ];
        for (family, ty, what) in sockets {
            match socket(family, ty, SockFlag::SOCK_CLOEXEC, None) {
                Ok(fd) => fds.push(fd),
                // some families can be disabled, the pool is still useful without them.
                Err(e) => log::debug!("{}: {}", what, e),
            }
        }

        let raw = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        Ok(Self { fds, raw })
    }

    /// Live descriptors.
    #[inline]
    pub fn fds(&self) -> &[RawFd] {
        &self.raw
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Live descriptor most of the time, a bad one occasionally.
    pub fn pick(&self, rng: &mut RngType) -> RawFd {
        if self.raw.is_empty() || rng.gen_ratio(1, 20) {
            BAD_FDS.choose(rng).copied().unwrap_or(-1)
        } else {
            self.raw.choose(rng).copied().unwrap_or(-1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};

    #[test]
    fn pool_fds_are_open() {
        let pool = FdPool::new().unwrap();
        assert!(pool.len() >= 6);
        for &fd in pool.fds() {
            assert!(fcntl(fd, FcntlArg::F_GETFD).is_ok());
        }
    }

    #[test]
    fn pick_mostly_live() {
        let pool = FdPool::new().unwrap();
        let mut rng = RngType::seed_from_u64(7);
        let live = (0..1000)
            .filter(|_| pool.fds().contains(&pool.pick(&mut rng)))
            .count();
        assert!(live > 850, "live: {}", live);
        assert!(live < 1000);
    }
}
