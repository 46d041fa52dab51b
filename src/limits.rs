use std::time::Duration;

/// Width of the virtual resize zone on each bar edge (half inside, half outside).
pub const RESIZE_HANDLE_WIDTH_PX: f64 = 30.0;

/// Resizing never shrinks a stay below this.
pub const MIN_STAY_NIGHTS: i64 = 1;

/// Default depth of the undo stack; oldest commands are evicted beyond it.
pub const DEFAULT_MAX_UNDO_DEPTH: usize = 50;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Applies to polls and push-triggered fetches, never to mutations.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive sync failures before a degraded signal is raised.
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Broadcast buffer for chart events and command stack changes.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Used when a payment is marked without naming a method.
pub const DEFAULT_PAYMENT_METHOD: &str = "bank transfer";
