#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod child_log;
pub mod arch;
pub mod config;
pub mod gen;
pub mod process;
pub mod resources;
pub mod select;
pub mod shm;
pub mod stats;
pub mod supervisor;
pub mod syscall;
pub mod util;
pub mod watchdog;
pub mod worker;

pub use config::Config;
pub use stats::Summary;

use anyhow::Context;
use process::ForkControl;
use rand::{rngs::SmallRng, Rng};
use supervisor::Supervisor;
use syscall::Registry;

pub type RngType = SmallRng;

/// Builtin syscalls narrowed by the `only`/`exclude` lists of `config`.
pub fn registry(config: &Config) -> anyhow::Result<Registry> {
    let registry = Registry::builtin().context("builtin syscall table")?;
    registry
        .filter(&config.only, &config.exclude)
        .context("failed to select syscalls")
}

/// Run one fuzzing session with forked workers until it ends.
pub fn boot(config: Config) -> anyhow::Result<Summary> {
    config.check().context("bad config")?;
    util::setup_signal_handler().context("failed to install signal handler")?;

    let registry = registry(&config)?;
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
    log::info!(
        "sysfuzz on {}, {} syscalls, {} workers, seed {}",
        arch::TARGET_ARCH,
        registry.len(),
        config.workers,
        seed
    );

    let mut sup = Supervisor::new(ForkControl, &config, &registry, seed)
        .context("failed to set up supervisor")?;
    let summary = sup.run()?;
    if summary.exit_reason.is_abnormal() {
        log::error!("session ended abnormally: {}", summary);
    } else {
        log::info!("session done: {}", summary);
    }
    Ok(summary)
}
