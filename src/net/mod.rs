//! Network subsystem: the one-peer TCP link.

pub mod link;

pub use link::{Accepted, PeerLink, PeerSession};
