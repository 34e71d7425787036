//! Graceful shutdown support via atomic flag and signal handlers

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag — set by SIGTERM/SIGINT handler
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if shutdown was requested
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Request shutdown (for signal handlers and tests)
pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// Register SIGINT/SIGTERM handlers.
///
/// First signal: set the graceful shutdown flag so workers drain.
/// Second signal: force exit with 130.
/// SAFETY: AtomicBool::swap and process::exit are async-signal-safe.
pub fn install_signal_handlers() {
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("failed to register SIGTERM handler");
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("failed to register SIGINT handler");
    }
}
