//! Back-office domain services for a fuel-station network.
//!
//! Every service borrows the same [`connstore::Db`] facade, so swapping the
//! active connection or injecting a test double changes the backend for all
//! of them at once. Services own validation and business rules; persistence
//! details stay behind the `restdb` row API.

pub mod error;
pub mod error_log;
pub mod services;

pub use error::{Result, ServiceError};
