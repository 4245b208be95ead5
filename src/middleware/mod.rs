//! HTTP middleware that puts the admission pipeline in front of handlers.
//!
//! # Architecture
//!
//! ```text
//! Request → client IP → body buffering → AdmissionPipeline → Handler
//!                            ↓                  ↓
//!                       413 / 400      403 / 400 / 404 / 429 / 5xx
//! ```
//!
//! Forwarding headers only count when the direct peer is a configured
//! trusted proxy, so callers cannot pick the address that master-key IP
//! checks and IP-zone rate limits see.

pub mod admission;
pub mod ip;

pub use admission::{AdmissionLayer, AdmissionService, FileData, classify_body};
pub use ip::{ClientIp, UNKNOWN_IP, resolve_client_ip};
