//! Order audits: durable storage and the record/verify operations on top of it.

pub mod service;
pub mod store;
pub mod types;

pub use service::{AuditService, Recorded};
pub use store::AuditStore;
pub use types::*;
