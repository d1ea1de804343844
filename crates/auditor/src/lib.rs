//! Order audit store, Merkle batching and on-chain anchoring for OrderProof.
//!
//! This crate provides:
//! - An append-only audit store keyed by order (`order_<orderId>`)
//! - Recording and verifying the SHA-256 digest of paid orders
//! - Merkle trees over the whole audit population
//! - Anchoring tree roots on an EVM chain with a PENDING/CONFIRMED/FAILED ledger
//! - Public verification responses combining both layers
//!
//! # Architecture
//!
//! ```text
//! payment path ──► AuditService ──► AuditStore ──► KvStore (append-only)
//!                      ▲                               │
//!  ReconcileSweep ─────┘                               │ scan
//!  (OrderSource)                                       ▼
//!                                                BatchBuilder
//!                                                      │ root
//!  AnchorScheduler ──► AnchorCoordinator ──────────────┤
//!                          │        │                  ▼
//!                          │        └──► anchors table (SQLite)
//!                          ▼
//!                     AnchorLedger ──► AuditAnchor (on-chain)
//!
//! GET /v1/verify ──► VerificationAssembler ──► AuditService + AnchorCoordinator
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod anchor;
pub mod audit;
pub mod batch;
pub mod config;
pub mod kv;
pub mod ledger;
pub mod logging;
pub mod orders;
pub mod retry;
pub mod services;
pub mod storage;
pub mod sweep;
pub mod verification;

pub use orderproof_core::*;
