#[cfg(target_arch = "x86_64")]
pub static TARGET_ARCH: &str = "amd64";

#[cfg(target_arch = "x86")]
pub static TARGET_ARCH: &str = "386";

#[cfg(target_arch = "aarch64")]
pub static TARGET_ARCH: &str = "arm64";

#[cfg(target_arch = "arm")]
pub static TARGET_ARCH: &str = "arm";

#[cfg(target_arch = "riscv64")]
pub static TARGET_ARCH: &str = "riscv64";

#[cfg(target_arch = "s390x")]
pub static TARGET_ARCH: &str = "s390x";

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64",
    target_arch = "s390x"
)))]
pub static TARGET_ARCH: &str = "unknown";

lazy_static! {
    /// Page size of the running kernel.
    pub static ref PAGE_SIZE: usize = {
        use nix::unistd::{sysconf, SysconfVar};
        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(sz)) if sz > 0 => sz as usize,
            _ => 4096,
        }
    };
}
