//! Session Module
//!
//! Negotiates an upload session for a manifest and holds the resulting
//! authorization window (destinations, chunk ceiling, retry budget, expiry).

pub mod negotiator;
pub mod types;

pub use negotiator::SessionNegotiator;
pub use types::*;
