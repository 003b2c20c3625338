//! Transport collaborator.
//!
//! The core only needs an at-most-once, fire-and-forget send. Replies come
//! back as ordinary inbound envelopes carrying the request's correlation id,
//! and the node routes them itself. Delivery may drop, delay or reorder.

use crate::messages::Envelope;
use crate::types::PaxosError;

/// Sends envelopes to peers.
///
/// An `Ok` means the envelope was handed off, not that it arrived.
pub trait Transport {
    /// Send `envelope` to `envelope.to`.
    fn send(&self, envelope: Envelope) -> Result<(), PaxosError>;
}
