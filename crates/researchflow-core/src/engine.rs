//! The workflow engine: the node → route → persist cycle.
//!
//! Multiple workflows run concurrently up to the configured worker count;
//! each individual workflow is strictly serial, enforced by a per-request
//! lease. The engine is event-driven: work arrives from new submissions,
//! approval decisions, the timeout sweeper, and crash-recovery scans.
//!
//! The loop for one workflow:
//!
//!   1. Acquire the lease; report `LeaseHeld` if another worker owns it.
//!   2. Load state; resolve any pending scope change; route.
//!   3. Terminal → persist the terminal entry (once) and stop.
//!   4. Gate park → persist, release the lease, and return; an external
//!      decision event re-enters the loop later.
//!   5. Otherwise run the node handler, persist with the expected version,
//!      and route again. A version conflict re-reads and re-computes —
//!      a stale write is never applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use researchflow_config::FlowConfig;
use researchflow_contracts::approval::{
    Approval, ApprovalDecision, ApprovalId, ApprovalType, PendingFilter,
};
use researchflow_contracts::audit::{AuditKind, AuditRecord, Severity};
use researchflow_contracts::error::{FlowError, FlowResult};
use researchflow_contracts::state::{
    FlowState, RequestId, Requirements, Researcher, Version, WorkflowState,
};

use crate::adapter::{AgentAdapter, AgentRegistry};
use crate::gates::ApprovalGateService;
use crate::handlers::{self, HandlerCx, StepOutcome};
use crate::routing::{route, Route};
use crate::traits::{ApprovalStore, LeaseKeeper, StateStore};

/// Where one engine pass left the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow reached (or already rested at) this terminal state.
    Completed(FlowState),
    /// The workflow is parked at this gate awaiting a decision.
    Parked { gate: FlowState },
    /// Another worker holds the lease; nothing was done.
    LeaseHeld,
}

/// The ResearchFlow workflow engine.
pub struct Engine {
    store: Arc<dyn StateStore>,
    approvals: Arc<dyn ApprovalStore>,
    leases: Arc<dyn LeaseKeeper>,
    adapter: AgentAdapter,
    gates: ApprovalGateService,
    config: FlowConfig,
    /// Lease owner identity for this engine instance.
    instance_id: String,
    workers: Arc<Semaphore>,
    /// Cancellation tokens for invocations currently in flight.
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        approvals: Arc<dyn ApprovalStore>,
        leases: Arc<dyn LeaseKeeper>,
        registry: Arc<AgentRegistry>,
        config: FlowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter: AgentAdapter::new(registry, config.agent),
            gates: ApprovalGateService::new(approvals.clone()),
            workers: Arc::new(Semaphore::new(config.engine.worker_count)),
            instance_id: format!("engine-{}", uuid::Uuid::new_v4()),
            store,
            approvals,
            leases,
            config,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// The decision surface for review UIs.
    pub fn gate_service(&self) -> &ApprovalGateService {
        &self.gates
    }

    /// Create a new workflow for a researcher submission.
    pub async fn submit(
        &self,
        researcher: Researcher,
        initial_request: impl Into<String>,
    ) -> FlowResult<RequestId> {
        let state = WorkflowState::new(researcher, initial_request);
        let created = AuditRecord::new(state.request_id, AuditKind::Created).payload(json!({
            "researcher": state.researcher.email,
            "initial_request": state.initial_request,
        }));
        self.store.create(&state, vec![created]).await?;
        info!(request_id = %state.request_id, "workflow created");
        Ok(state.request_id)
    }

    /// Drive one workflow until it parks or terminates.
    pub async fn run(&self, request_id: RequestId) -> FlowResult<RunOutcome> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| FlowError::Internal { reason: "worker pool closed".to_string() })?;

        let ttl = self.config.engine.lease_ttl();
        let Some(mut lease) =
            self.leases.try_acquire(request_id, &self.instance_id, ttl).await?
        else {
            debug!(request_id = %request_id, "lease held elsewhere; skipping");
            return Ok(RunOutcome::LeaseHeld);
        };

        let cancel = self.register_inflight(request_id);
        let result = self.drive(request_id, &mut lease, &cancel).await;
        self.clear_inflight(request_id, &cancel);
        if let Err(e) = self.leases.release(lease).await {
            warn!(request_id = %request_id, error = %e, "lease release failed");
        }

        if let Err(e) = &result {
            error!(request_id = %request_id, error = %e, "engine pass failed");
        }
        result
    }

    /// Spawn `run` onto the runtime, returning its join handle.
    pub fn spawn(self: &Arc<Self>, request_id: RequestId) -> tokio::task::JoinHandle<FlowResult<RunOutcome>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(request_id).await })
    }

    /// Record a reviewer decision, then resume the affected workflow.
    pub async fn decide(
        &self,
        approval_id: ApprovalId,
        decision: ApprovalDecision,
    ) -> FlowResult<RunOutcome> {
        let approval = self.gates.decide(approval_id, decision).await?;
        self.run(approval.request_id).await
    }

    /// Time out overdue approvals and resume their workflows.
    ///
    /// Returns the number of approvals that timed out.
    pub async fn sweep_approvals(&self, now: chrono::DateTime<Utc>) -> FlowResult<usize> {
        let timed_out = self.gates.sweep_timeouts(now).await?;
        let count = timed_out.len();
        for approval in timed_out {
            if let Err(e) = self.run(approval.request_id).await {
                warn!(
                    request_id = %approval.request_id,
                    error = %e,
                    "resume after approval timeout failed"
                );
            }
        }
        Ok(count)
    }

    /// Crash-recovery scan: re-enter the loop for every resumable workflow.
    pub async fn recover(&self) -> FlowResult<Vec<(RequestId, RunOutcome)>> {
        let pending = self.store.list_pending_resumable().await?;
        info!(count = pending.len(), "crash-recovery scan");
        let mut outcomes = Vec::with_capacity(pending.len());
        for request_id in pending {
            match self.run(request_id).await {
                Ok(outcome) => outcomes.push((request_id, outcome)),
                Err(e) => warn!(request_id = %request_id, error = %e, "recovery pass failed"),
            }
        }
        Ok(outcomes)
    }

    /// Administrative cancellation.
    ///
    /// Cancels any in-flight agent invocation, persists the cancellation
    /// sentinel under the usual conditional write, and drives the workflow
    /// to its terminal state (or leaves that to the current lease holder,
    /// whose next conflicting save will observe the sentinel).
    pub async fn cancel(&self, request_id: RequestId) -> FlowResult<()> {
        if let Some(token) = self.inflight.lock().expect("inflight lock poisoned").get(&request_id)
        {
            token.cancel();
        }

        loop {
            let (mut state, version) = self.store.load(request_id).await?;
            if state.current_state.is_terminal() {
                return Ok(());
            }
            if state.cancel_requested {
                break;
            }
            state.cancel_requested = true;
            state.updated_at = Utc::now();
            let events = vec![AuditRecord::new(request_id, AuditKind::Escalated)
                .severity(Severity::Warning)
                .payload(json!({ "reason": "administrative cancellation requested" }))];
            match self.store.save(&state, version, events).await {
                Ok(_) => break,
                Err(FlowError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        match self.run(request_id).await? {
            RunOutcome::LeaseHeld => {
                // The holder's next save conflicts and re-reads the sentinel.
                debug!(request_id = %request_id, "cancellation left to current lease holder");
            }
            outcome => {
                debug!(request_id = %request_id, ?outcome, "cancellation drove workflow to rest");
            }
        }
        Ok(())
    }

    /// File a scope-change request against a non-terminal workflow.
    ///
    /// Creates a `scope_change` approval carrying the proposed requirements
    /// revision and parks the workflow until it is decided. Returns the
    /// approval to decide; filing again while one is pending returns the
    /// existing approval's ID.
    pub async fn request_scope_change(
        &self,
        request_id: RequestId,
        proposed: Requirements,
    ) -> FlowResult<ApprovalId> {
        loop {
            let (mut state, version) = self.store.load(request_id).await?;
            if state.current_state.is_terminal() {
                return Err(FlowError::TerminalStateImmutable { request_id });
            }
            if state.cancel_requested {
                return Err(FlowError::Cancelled { request_id });
            }
            // An approved change re-enters feasibility validation, so it is
            // pointless once that loop site has no runs remaining.
            let cap = self.config.max_iterations.phenotype;
            if state.iteration_counters.phenotype + 1 > cap {
                return Err(FlowError::IterationCapExceeded {
                    request_id,
                    site: researchflow_contracts::state::LoopSite::Phenotype,
                    cap,
                });
            }
            if let Some(existing) = state.pending_scope_change {
                return Ok(existing);
            }

            let now = Utc::now();
            let payload =
                serde_json::to_value(&proposed).map_err(|e| FlowError::Internal {
                    reason: format!("scope change payload failed to serialize: {e}"),
                })?;
            let approval = Approval::pending(
                request_id,
                ApprovalType::ScopeChange,
                payload,
                now,
                now + self.config.approval.default_sla(),
            );
            let approval_id = approval.approval_id;
            self.approvals.create_pending(approval).await?;

            state.pending_scope_change = Some(approval_id);
            state.updated_at = now;
            let events = vec![AuditRecord::new(request_id, AuditKind::ApprovalRequested)
                .payload(json!({
                    "approval_id": approval_id,
                    "approval_type": ApprovalType::ScopeChange,
                }))];
            match self.store.save(&state, version, events).await {
                Ok(_) => {
                    info!(request_id = %request_id, approval_id = %approval_id, "scope change requested");
                    return Ok(approval_id);
                }
                // A concurrent writer interleaved; the orphaned pending
                // approval is reclaimed by the sweeper.
                Err(FlowError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ── The execution loop ───────────────────────────────────────────────

    async fn drive(
        &self,
        request_id: RequestId,
        lease: &mut crate::traits::LeaseToken,
        cancel: &CancellationToken,
    ) -> FlowResult<RunOutcome> {
        let ttl = self.config.engine.lease_ttl();
        loop {
            *lease = self.leases.renew(lease, ttl).await?;

            let (mut state, version) = match self.store.load(request_id).await {
                Ok(loaded) => loaded,
                Err(FlowError::SchemaDrift { reason, .. }) => {
                    error!(request_id = %request_id, reason = %reason, "schema drift; quarantining");
                    self.store.quarantine(request_id, &reason).await?;
                    return Ok(RunOutcome::Completed(FlowState::HumanReview));
                }
                Err(e) => return Err(e),
            };
            let mut events = Vec::new();

            // A pending scope change supersedes normal routing.
            if state.pending_scope_change.is_some() {
                match handlers::resolve_scope_change(
                    &mut state,
                    &mut events,
                    self.approvals.as_ref(),
                )
                .await?
                {
                    StepOutcome::Parked => {
                        return Ok(RunOutcome::Parked { gate: state.current_state });
                    }
                    StepOutcome::Advanced => {
                        state.updated_at = Utc::now();
                        match self.save_with_retry(&state, version, events).await {
                            Ok(_) => continue,
                            Err(FlowError::ConcurrencyConflict { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            match route(&state, &self.config) {
                Route::Terminal(terminal) => {
                    if state.current_state != terminal {
                        handlers::enter_terminal(&mut state, &mut events, terminal);
                        state.updated_at = Utc::now();
                        match self.save_with_retry(&state, version, events).await {
                            Ok(_) => {}
                            Err(FlowError::ConcurrencyConflict { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    info!(request_id = %request_id, terminal = %terminal, "workflow at rest");
                    return Ok(RunOutcome::Completed(terminal));
                }

                Route::Node(node) | Route::Gate(node) => {
                    debug!(request_id = %request_id, node = %node, "running node");
                    let pre_state = state.clone();
                    let cx = HandlerCx {
                        adapter: &self.adapter,
                        approvals: self.approvals.as_ref(),
                        config: &self.config,
                        cancel,
                    };
                    let outcome =
                        handlers::run_node(node, &mut state, &mut events, &cx).await?;

                    // A parked re-poll with nothing new to record needs no write.
                    if events.is_empty() && state == pre_state {
                        if outcome == StepOutcome::Parked {
                            return Ok(RunOutcome::Parked { gate: node });
                        }
                        return Err(FlowError::Internal {
                            reason: format!("node '{node}' advanced without observable effect"),
                        });
                    }

                    state.updated_at = Utc::now();
                    match self.save_with_retry(&state, version, events).await {
                        Ok(_) => {}
                        Err(FlowError::ConcurrencyConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                    if outcome == StepOutcome::Parked {
                        return Ok(RunOutcome::Parked { gate: node });
                    }
                }
            }
        }
    }

    /// Save, retrying transient store failures with backoff; after the cap
    /// the error propagates and the workflow stays claimable by any worker.
    async fn save_with_retry(
        &self,
        state: &WorkflowState,
        expected: Version,
        events: Vec<AuditRecord>,
    ) -> FlowResult<Version> {
        let mut attempt = 0u32;
        loop {
            match self.store.save(state, expected, events.clone()).await {
                Err(FlowError::StoreUnavailable { reason }) if attempt < 3 => {
                    attempt += 1;
                    warn!(
                        request_id = %state.request_id,
                        attempt,
                        reason = %reason,
                        "store unavailable; retrying save"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    fn register_inflight(&self, request_id: RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(request_id, token.clone());
        token
    }

    // Only the lease holder registers a token, so there is exactly one
    // entry per running request.
    fn clear_inflight(&self, request_id: RequestId, _token: &CancellationToken) {
        self.inflight.lock().expect("inflight lock poisoned").remove(&request_id);
    }

    /// Pending approvals matching `filter` — convenience passthrough.
    pub async fn list_pending_approvals(
        &self,
        filter: &PendingFilter,
    ) -> FlowResult<Vec<Approval>> {
        self.gates.list_pending(filter).await
    }
}
