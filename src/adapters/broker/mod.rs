//! Task broker integration
//!
//! - [`traits`] - the [`TaskChannel`] abstraction used by the daemon
//! - [`http`] - HTTP task API implementation (poll for jobs, post results)

pub mod http;
pub mod traits;

pub use http::HttpTaskChannel;
pub use traits::{Delivery, Receipt, TaskChannel};
