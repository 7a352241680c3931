//! Where a contained background task panicked.
//!
//! By the time `catch_unwind` hands back a payload the stack is gone, so the location and
//! backtrace are recorded by a panic hook instead and picked up on the same thread right after
//! the unwind is caught. The hook chains to whatever hook was installed before it.

use std::{backtrace::Backtrace, cell::RefCell, panic, sync::Once};

pub(crate) struct PanicReport {
    pub(crate) location: Option<String>,
    pub(crate) backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

pub(crate) fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let report = PanicReport {
                location: info.location().map(|l| l.to_string()),
                backtrace: Backtrace::force_capture(),
            };
            LAST_PANIC.with(|last| *last.borrow_mut() = Some(report));
            previous(info);
        }));
    });
}

/// The report of the last panic on this thread, if the hook saw one since the last call.
pub(crate) fn take_report() -> Option<PanicReport> {
    LAST_PANIC.with(|last| last.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_panic_site() {
        install_hook();
        let _ = take_report();

        let expected_line = line!() + 1;
        let caught = panic::catch_unwind(|| panic!("boom"));
        assert!(caught.is_err());

        let report = take_report().unwrap();
        let location = report.location.unwrap();
        assert!(location.starts_with(&format!("{}:{}:", file!(), expected_line)));
        assert!(take_report().is_none());
    }
}
