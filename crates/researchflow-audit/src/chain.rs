//! Digest computation and stream verification for audit envelopes.
//!
//! Every envelope carries the digest of the envelope before it, so the
//! stream for one request forms a tamper-evident chain: altering a stored
//! record changes its digest, which breaks the link every later envelope
//! committed to.
//!
//! The digest folds in, ahead of the record itself: the predecessor digest,
//! the envelope's position, and the owning request. Committing to position
//! and request id means an envelope cannot be replayed at a different
//! offset or spliced into another request's stream without detection.

use sha2::{Digest, Sha256};

use researchflow_contracts::audit::AuditRecord;
use researchflow_contracts::state::RequestId;

use crate::envelope::AuditEnvelope;

/// Digest one envelope's content as a lowercase hex SHA-256 string.
///
/// The record contributes its canonical (compact, deterministic) JSON
/// encoding, length-delimited so no field boundary is ambiguous.
/// `AuditRecord` serialization is infallible, so the internal `expect`
/// never fires for values this crate constructs.
pub fn hash_record(
    request_id: RequestId,
    sequence: u64,
    record: &AuditRecord,
    prev_hash: &str,
) -> String {
    let body = serde_json::to_vec(record)
        .expect("audit records contain only serializable fields");

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence.to_be_bytes());
    hasher.update(request_id.0.as_bytes());
    hasher.update((body.len() as u64).to_be_bytes());
    hasher.update(&body);
    hex::encode(hasher.finalize())
}

/// Check one request's envelope stream end to end.
///
/// A stream is valid when every envelope, in order:
///
/// 1. sits at the sequence number matching its position,
/// 2. names the digest of its predecessor (the genesis sentinel at
///    position zero), and
/// 3. carries a `this_hash` that recomputes from its own content.
///
/// A stream with no envelopes is valid; there is nothing to check.
pub fn verify_chain(envelopes: &[AuditEnvelope]) -> bool {
    let mut expected_prev: &str = AuditEnvelope::GENESIS_HASH;

    for (position, envelope) in envelopes.iter().enumerate() {
        let placed_correctly =
            envelope.sequence == position as u64 && envelope.prev_hash == expected_prev;
        if !placed_correctly {
            return false;
        }

        let recomputed = hash_record(
            envelope.record.request_id,
            envelope.sequence,
            &envelope.record,
            &envelope.prev_hash,
        );
        if recomputed != envelope.this_hash {
            return false;
        }

        expected_prev = &envelope.this_hash;
    }

    true
}
