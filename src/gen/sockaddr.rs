//! Socket addresses for sockaddr arguments.

use crate::RngType;
use nix::libc;
use rand::prelude::*;

const FAMILIES: [u16; 6] = [
    libc::AF_UNIX as u16,
    libc::AF_INET as u16,
    libc::AF_INET6 as u16,
    libc::AF_NETLINK as u16,
    libc::AF_PACKET as u16,
    libc::AF_UNSPEC as u16,
];

/// One past the highest address family the kernel knows.
const AF_MAX: u16 = 46;

/// Size of `struct sockaddr_storage`.
const STORAGE_LEN: usize = 128;

/// A generated address of some family, its length is the length handed to the kernel.
pub(super) fn gen(rng: &mut RngType) -> Box<[u8]> {
    let family = if rng.gen_ratio(1, 20) {
        rng.gen_range(0..=AF_MAX)
    } else {
        FAMILIES.choose(rng).copied().unwrap_or(libc::AF_UNSPEC as u16)
    };
    let mut buf = match family as i32 {
        libc::AF_UNIX => unix(rng),
        libc::AF_INET => inet(rng),
        libc::AF_INET6 => inet6(rng),
        libc::AF_NETLINK => netlink(rng),
        _ => {
            let mut buf = vec![0u8; rng.gen_range(2..=STORAGE_LEN)];
            rng.fill_bytes(&mut buf[2..]);
            buf
        }
    };
    buf[..2].copy_from_slice(&family.to_ne_bytes());
    buf.into_boxed_slice()
}

fn port(rng: &mut RngType) -> [u8; 2] {
    const PORTS: [u16; 5] = [0, 22, 80, 1023, 65535];
    let p = if rng.gen() {
        PORTS.choose(rng).copied().unwrap_or(0)
    } else {
        rng.gen()
    };
    p.to_be_bytes()
}

fn unix(rng: &mut RngType) -> Vec<u8> {
    // sun_family + sun_path[108]
    let mut buf = vec![0u8; 2];
    match rng.gen_range(0..3) {
        // abstract namespace
        0 => {
            buf.push(0);
            let n = rng.gen_range(1..16);
            buf.extend((0..n).map(|_| rng.gen_range(b'a'..=b'z')));
        }
        1 => buf.extend_from_slice(b"/tmp/sysfuzz.sock\0"),
        _ => {
            let n = rng.gen_range(0..=108);
            buf.extend((0..n).map(|_| rng.gen::<u8>()));
        }
    }
    buf
}

fn inet(rng: &mut RngType) -> Vec<u8> {
    const ADDRS: [[u8; 4]; 4] = [
        [0, 0, 0, 0],
        [127, 0, 0, 1],
        [255, 255, 255, 255],
        [224, 0, 0, 1],
    ];
    let mut buf = vec![0u8; 16];
    buf[2..4].copy_from_slice(&port(rng));
    let addr = if rng.gen_ratio(3, 4) {
        ADDRS.choose(rng).copied().unwrap_or([0; 4])
    } else {
        rng.gen()
    };
    buf[4..8].copy_from_slice(&addr);
    buf
}

fn inet6(rng: &mut RngType) -> Vec<u8> {
    let mut buf = vec![0u8; 28];
    buf[2..4].copy_from_slice(&port(rng));
    // flowinfo stays zero, addr is loopback or random, scope id random.
    if rng.gen() {
        buf[23] = 1;
    } else {
        rng.fill_bytes(&mut buf[8..24]);
    }
    if rng.gen_ratio(1, 10) {
        buf[24..28].copy_from_slice(&rng.gen::<u32>().to_ne_bytes());
    }
    buf
}

fn netlink(rng: &mut RngType) -> Vec<u8> {
    // nl_family, nl_pad, nl_pid, nl_groups
    let mut buf = vec![0u8; 12];
    let pid: u32 = if rng.gen() { 0 } else { rng.gen() };
    buf[4..8].copy_from_slice(&pid.to_ne_bytes());
    buf[8..12].copy_from_slice(&rng.gen::<u32>().to_ne_bytes());
    buf
}
