//! ResearchFlow — Demo CLI
//!
//! Runs one or all of the six reference research-request scenarios. Each
//! scenario uses real ResearchFlow components (engine, in-memory store,
//! approval gates, audit chains) wired together with scripted agents and
//! fictional clinical data.
//!
//! Usage:
//!   cargo run -p demo -- run-all
//!   cargo run -p demo -- happy-path
//!   cargo run -p demo -- requirements-loop
//!   cargo run -p demo -- not-feasible
//!   cargo run -p demo -- qa-reextract
//!   cargo run -p demo -- approval-timeout
//!   cargo run -p demo -- crash-recovery

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use researchflow_contracts::error::FlowResult;
use researchflow_ref_research::scenarios::{
    approval_timeout, crash_recovery, happy_path, not_feasible, qa_reextract,
    requirements_loop,
};

// ── CLI definition ────────────────────────────────────────────────────────────

/// ResearchFlow — clinical research request orchestration demo.
///
/// Each subcommand drives one or all of the six reference scenarios,
/// demonstrating approval gates, loop caps, timeout sweeping, and
/// crash-safe resumption.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "ResearchFlow reference scenario demo",
    long_about = "Runs ResearchFlow reference scenarios showing the durable workflow engine,\n\
                  human-approval gates, iteration caps, and crash recovery.\n\n\
                  Scenarios:\n\
                  1. Happy Path            — twelve states, four approvals\n\
                  2. Requirements Loop     — rejection, revision, approval\n\
                  3. Not Feasible          — empty cohort terminates early\n\
                  4. QA Re-extraction      — failed QA loops back to extraction\n\
                  5. Approval Timeout      — SLA sweep escalates at the cap\n\
                  6. Crash Recovery        — idempotent re-extraction after a crash"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all six reference scenarios in sequence.
    RunAll,
    /// Scenario 1: Happy path (twelve states, four approvals).
    HappyPath,
    /// Scenario 2: Requirements rejected, revised, then approved.
    RequirementsLoop,
    /// Scenario 3: Infeasible cohort terminates at not_feasible.
    NotFeasible,
    /// Scenario 4: QA failure loops back through re-extraction.
    QaReextract,
    /// Scenario 5: Approval timeout past the SLA deadline.
    ApprovalTimeout,
    /// Scenario 6: Crash during extraction with idempotent recovery.
    CrashRecovery,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Structured logging. Set RUST_LOG=debug for engine-level detail.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    print_banner();

    let result = match cli.command {
        Command::RunAll => run_all().await,
        Command::HappyPath => happy_path::run_scenario().await.map(|_| ()),
        Command::RequirementsLoop => requirements_loop::run_scenario().await.map(|_| ()),
        Command::NotFeasible => not_feasible::run_scenario().await.map(|_| ()),
        Command::QaReextract => qa_reextract::run_scenario().await.map(|_| ()),
        Command::ApprovalTimeout => approval_timeout::run_scenario().await.map(|_| ()),
        Command::CrashRecovery => crash_recovery::run_scenario().await.map(|_| ()),
    };

    match result {
        Ok(()) => {
            println!("All selected scenarios completed successfully.");
        }
        Err(e) => {
            eprintln!("Demo error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_all() -> FlowResult<()> {
    happy_path::run_scenario().await?;
    requirements_loop::run_scenario().await?;
    not_feasible::run_scenario().await?;
    qa_reextract::run_scenario().await?;
    approval_timeout::run_scenario().await?;
    crash_recovery::run_scenario().await?;
    Ok(())
}

fn print_banner() {
    println!();
    println!("  ResearchFlow — clinical research request orchestration");
    println!("  engine / gates / audit demo with scripted agents");
    println!("  ======================================================");
    println!();
}
