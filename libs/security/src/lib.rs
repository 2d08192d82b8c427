//! Authentication of provider webhooks: payload signatures and the
//! subscription handshake.

pub mod handshake;
pub mod signature;

pub use handshake::accept_challenge;
pub use signature::{SIGNATURE_HEADER, compute_signature, verify_signature};
