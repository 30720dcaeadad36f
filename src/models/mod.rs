//! Long-poll message models
//!
//! The request and response bodies an external transport exchanges with
//! [`crate::watch::WatchService::long_poll`].

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::WatchRequest;
pub use responses::WatchResponse;
