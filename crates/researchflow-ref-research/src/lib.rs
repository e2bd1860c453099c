//! # researchflow-ref-research
//!
//! Reference research-request scenarios for the ResearchFlow orchestration
//! core.
//!
//! Exercises the real engine, store, and gate mechanism end to end with
//! scripted agents and fictional clinical data:
//!
//! 1. **Happy path** — twelve states, four approvals, one pass each.
//! 2. **Requirements loop** — rejection with "missing time period", a
//!    revised draft, then approval and completion.
//! 3. **Not feasible** — the phenotype reports an empty cohort; routing
//!    skips the SQL review and terminates.
//! 4. **QA re-extraction** — duplicate rows fail QA; rejection loops back
//!    to extraction and the second attempt completes.
//! 5. **Approval timeout** — the sweeper times out a phenotype review past
//!    its SLA; at the cap the workflow escalates to human review.
//! 6. **Crash recovery** — a worker dies mid-extraction; another re-runs
//!    the node under the same invocation key without a duplicate extract.
//!
//! All data is hardcoded and fictional. No external services are called.

pub mod agents;
pub mod scenarios;
