//! The chained audit envelope.
//!
//! `AuditEnvelope` is what the store actually persists: one `AuditRecord`
//! plus its position in the request's stream and the two digests that tie
//! it to its neighbors. Because every envelope commits to the digest of
//! the one before it, no stored event can be edited, dropped, or reordered
//! without `verify_chain` noticing.

use serde::{Deserialize, Serialize};

use researchflow_contracts::audit::AuditRecord;

/// A single entry in the hash chain for one request's audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEnvelope {
    /// Position in the request's stream, assigned densely from 0.
    pub sequence: u64,

    /// The immutable audit record.
    pub record: AuditRecord,

    /// Digest of the preceding envelope; `GENESIS_HASH` at position 0.
    pub prev_hash: String,

    /// Digest of this envelope, as computed by `hash_record()`.
    pub this_hash: String,
}

impl AuditEnvelope {
    /// Stand-in predecessor digest for the first envelope of a stream.
    ///
    /// All-zero hex is not a digest this crate will ever compute, so a
    /// stream's starting point cannot be confused with a real link.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}
