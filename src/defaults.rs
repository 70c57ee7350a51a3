//! Named default values for [`crate::config::Config`] fields.

use std::time::Duration;

/// Default port for the server's binary protocol.
pub const fn port() -> u16 {
    3301
}

/// Default number of seconds between reconnect attempts. `0` disables
/// automatic reconnection.
pub const fn reconnect_period() -> Duration {
    Duration::from_secs(0)
}

/// Whether to retry connecting even before the first successful connect.
pub const fn reconnect_always() -> bool {
    false
}

/// Default initial-connect timeout.
pub const fn connect_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

/// Default number of initial connection attempts before giving up (unless
/// `reconnect_always` is set).
pub const fn connect_attempts() -> usize {
    1
}

/// Default per-request timeout. `None` disables per-request timeouts.
pub const fn request_timeout() -> Option<Duration> {
    None
}

/// Default cap on the number of concurrently pending requests. `None` means
/// unbounded.
pub const fn max_pending_requests() -> Option<usize> {
    None
}

/// The `_vspace` metadata space's well-known numeric id.
pub const VSPACE_ID: u32 = 281;

/// The `_vindex` metadata space's well-known numeric id.
pub const VINDEX_ID: u32 = 289;

/// Length, in bytes, of the server's greeting banner.
pub const GREETING_LENGTH: usize = 128;

/// Length, in bytes, of each of the two lines in the greeting.
pub const GREETING_LINE_LENGTH: usize = 64;
