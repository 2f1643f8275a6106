use nix::time::{clock_gettime, ClockId};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

lazy_static! {
    static ref STOP_SOON: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

/// Route SIGINT/SIGTERM to the stop flag, the supervisor turns it into `exit_now`.
pub fn setup_signal_handler() -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&STOP_SOON))?;
    }
    Ok(())
}

/// Milliseconds on the monotonic clock, comparable across processes of one boot.
pub fn now_millis() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000,
        Err(_) => 0,
    }
}
