//! Logging sink handed to gateway devices

use std::sync::Arc;
use tracing::{error, info, warn};

/// One-way leveled notification channel.
///
/// Implementations must not block; callers never inspect a return value.
pub trait NatLogger: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `tracing` macros under the `upnp_nat` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl NatLogger for TracingLogger {
    fn info(&self, message: &str) {
        info!(target: "upnp_nat", "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(target: "upnp_nat", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "upnp_nat", "{}", message);
    }
}

/// Shared logger handle
pub type SharedLogger = Arc<dyn NatLogger>;

/// Default logger used when the caller does not inject one
pub fn tracing_logger() -> SharedLogger {
    Arc::new(TracingLogger)
}
