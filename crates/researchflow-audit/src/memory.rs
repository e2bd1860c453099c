//! In-memory multi-request audit chain store.
//!
//! `InMemoryAuditChains` keeps one append-only hash chain per request
//! behind a single `Mutex`, making it safe to share across the store and
//! any observers. The persistence layer appends to it inside its save
//! transaction so a state write and its audit events land together.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use researchflow_contracts::audit::AuditRecord;
use researchflow_contracts::state::RequestId;

use crate::chain::{hash_record, verify_chain};
use crate::envelope::AuditEnvelope;

/// The per-request mutable chain tail.
struct ChainState {
    envelopes: Vec<AuditEnvelope>,
    sequence: u64,
    last_hash: String,
}

impl ChainState {
    fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            sequence: 0,
            last_hash: AuditEnvelope::GENESIS_HASH.to_string(),
        }
    }
}

/// An in-memory, append-only audit store holding one hash chain per request.
///
/// # Thread safety
///
/// All methods acquire an internal `Mutex`. Per-request ordering is
/// guaranteed by the engine's lease discipline: only the lease holder
/// produces events for a request, and the store appends them while holding
/// its own transaction lock.
#[derive(Default)]
pub struct InMemoryAuditChains {
    chains: Mutex<HashMap<RequestId, ChainState>>,
}

impl InMemoryAuditChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record to its request's chain.
    pub fn append(&self, record: AuditRecord) {
        let mut chains = self.chains.lock().expect("audit chain lock poisoned");
        let chain = chains.entry(record.request_id).or_insert_with(ChainState::new);

        let prev_hash = chain.last_hash.clone();
        let sequence = chain.sequence;
        let this_hash = hash_record(record.request_id, sequence, &record, &prev_hash);

        trace!(
            request_id = %record.request_id,
            sequence,
            kind = ?record.kind,
            "audit event appended"
        );

        chain.envelopes.push(AuditEnvelope {
            sequence,
            record,
            prev_hash,
            this_hash: this_hash.clone(),
        });
        chain.sequence += 1;
        chain.last_hash = this_hash;
    }

    /// Append a batch of records in order.
    pub fn append_all(&self, records: impl IntoIterator<Item = AuditRecord>) {
        for record in records {
            self.append(record);
        }
    }

    /// The full chained stream for one request, in append order.
    ///
    /// Returns an empty vector for unknown requests — a request with no
    /// audit history and a nonexistent request are indistinguishable here;
    /// existence is the state store's concern.
    pub fn stream(&self, request_id: RequestId) -> Vec<AuditEnvelope> {
        let chains = self.chains.lock().expect("audit chain lock poisoned");
        chains.get(&request_id).map(|c| c.envelopes.clone()).unwrap_or_default()
    }

    /// Verify the hash chain for one request.
    pub fn verify(&self, request_id: RequestId) -> bool {
        let chains = self.chains.lock().expect("audit chain lock poisoned");
        chains.get(&request_id).map(|c| verify_chain(&c.envelopes)).unwrap_or(true)
    }

    /// Number of events recorded for one request.
    pub fn len(&self, request_id: RequestId) -> usize {
        let chains = self.chains.lock().expect("audit chain lock poisoned");
        chains.get(&request_id).map(|c| c.envelopes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, request_id: RequestId) -> bool {
        self.len(request_id) == 0
    }
}
