//! Bench console: an in-process Sender/Receiver integration rig.
//!
//! Where the teacher's gateway service spawned `probe-rs` against real
//! firmware and parsed its defmt/JSON log lines, this drives
//! `wbus_core`'s `SenderEngine` and `ReceiverLoop` directly against an
//! in-memory "air" medium and a scripted W-BUS heater (see `sim.rs`), and
//! narrates the result with the same `tracing` calls the teacher used for
//! telemetry. It exists to run the end-to-end scenarios spec.md §8 names
//! (`scenarios.rs`) as something more than documentation.

mod scenarios;
mod sim;

use anyhow::{Context, Result};
use tracing::{error, info};

use scenarios::ScenarioReport;

fn log_report(report: &ScenarioReport) {
    match report.outcome {
        Some(outcome) => info!(
            scenario = report.name,
            ticks = report.ticks,
            elapsed_ms = report.elapsed_ms,
            frames_sent = report.frames_sent,
            outcome = ?outcome,
            "scenario finished"
        ),
        None => error!(
            scenario = report.name,
            ticks = report.ticks,
            "scenario did not converge within the tick budget"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("bench-console starting: running the spec.md §8 scenario suite");

    // The scenarios are synchronous (they drive the protocol engines
    // tick-by-tick on a simulated clock, not real wall time), but a
    // blocking task keeps the runtime free to still honor Ctrl+C while
    // the suite runs, the same shutdown race the teacher's service ran
    // against its probe-rs subprocess task.
    let suite = tokio::task::spawn_blocking(scenarios::all);

    tokio::select! {
        result = suite => {
            let reports = result.context("scenario suite task panicked")?;
            for report in &reports {
                log_report(report);
            }
            let failed = reports.iter().filter(|r| r.outcome.is_none()).count();
            if failed > 0 {
                error!(failed, "one or more scenarios did not complete");
            } else {
                info!(count = reports.len(), "all scenarios completed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, stopping before the suite finished");
        }
    }

    info!("bench-console stopped");
    Ok(())
}
