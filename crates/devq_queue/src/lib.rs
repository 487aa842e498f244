//! The job source: the client side of the devq queue service.
//!
//! The queue is the single source of truth for which jobs exist, which are claimed, and which
//! outcomes have been reported. Workers and the run tracker only ever talk to it through
//! [JobSource]; they never coordinate with each other directly.

mod error;
pub mod feed;
pub mod http;
pub mod in_memory;
mod source;

pub use error::QueueError;
pub use source::{JobSource, SharedJobSource};
