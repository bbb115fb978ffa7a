/*!
Process-level shutdown on SIGINT/SIGTERM.

Children run in their own process groups, so a terminal Ctrl-C only reaches the gateway. The
handlers record the signal; the main thread polls for it, stops accepting and terminates
every live child before the process exits.
*/

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_shutdown(sig: i32) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the shutdown flag.
pub fn install_signal_handlers() -> nix::Result<()> {
    let act = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // The handler only stores to atomics.
    unsafe {
        signal::sigaction(Signal::SIGINT, &act)?;
        signal::sigaction(Signal::SIGTERM, &act)?;
    }
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Ask for shutdown without a signal.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// The signal that requested shutdown, if any.
pub fn received_signal() -> Option<Signal> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        n => Signal::try_from(n).ok(),
    }
}

/// Block until shutdown is requested, checking every `poll`.
pub fn wait_for_shutdown(poll: Duration) {
    while !shutdown_requested() {
        std::thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shutdown_releases_waiter() {
        let waiter = std::thread::spawn(|| wait_for_shutdown(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        request_shutdown();
        waiter.join().expect("waiter");
        assert!(shutdown_requested());
        assert_eq!(received_signal(), None);
    }
}
