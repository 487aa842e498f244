pub mod decay;
pub mod exit;
pub mod log_assert;
pub mod oneshot_notify;
pub mod protocol;
pub mod retry;
pub mod time;
pub mod timeout_future;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
