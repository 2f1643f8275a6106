use std::cell::Cell;

thread_local! {
    static CHILD_SLOT: Cell<usize> = Cell::new(0);
}

#[inline]
pub fn set_child_slot(slot: usize) {
    CHILD_SLOT.with(|r| r.set(slot));
}

#[inline]
pub fn child_slot() -> usize {
    CHILD_SLOT.with(|r| r.get())
}

#[macro_export]
macro_rules! child_debug {
    ($t: tt) => (
        log::debug!(std::concat!("child-{}: ", $t), $crate::child_log::child_slot())
    );
    ($t: tt, $($arg:tt)*) => (
        log::debug!(std::concat!("child-{}: ", $t), $crate::child_log::child_slot(), $($arg)*)
    )
}

#[macro_export]
macro_rules! child_warn {
    ($t: tt) => (
        log::warn!(std::concat!("child-{}: ", $t), $crate::child_log::child_slot())
    );
    ($t: tt, $($arg:tt)*) => (
        log::warn!(std::concat!("child-{}: ", $t), $crate::child_log::child_slot(), $($arg)*)
    )
}
