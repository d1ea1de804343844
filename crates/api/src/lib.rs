//! Axum-based API server for OrderProof.
//!
//! This crate provides:
//! - `/v1/verify?orderId=...` - Public integrity + anchoring verdict for a completed order
//! - `/v1/proof?orderId=...` - Merkle inclusion proof for an order's recorded digest
//! - `/v1/audits` - Audit records (and recording, when writes are enabled)
//! - `/v1/anchors` - Anchor history (and manual anchoring, when writes are enabled)

#![warn(missing_docs)]

/// API server runtime and in-process app builder.
pub mod server;
