use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use driftlock::{Direction, Halt, RedisBackend, Registry, RunReport, Runner, UnitId};

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::loader::load_registry;
use crate::output::OutputManager;

pub const UP_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Apply Migrations",
    commands: &[
        "driftlock up                         # Apply all pending units",
        "driftlock up 20251108173001-users    # Apply up to and including this unit",
    ],
}];

pub const DOWN_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Revert Migrations",
    commands: &[
        "driftlock down 20251108173001-users  # Revert everything after this unit",
        "driftlock down                       # Revert every applied unit",
    ],
}];

pub async fn handle_up(target: Option<String>, output: &OutputManager) -> Result<()> {
    let ctx = ProjectContext::find()?;
    let target = parse_target(target)?;

    output.heading("Apply Migrations");
    run(&ctx, Direction::Up, target, output).await
}

pub async fn handle_down(target: Option<String>, output: &OutputManager) -> Result<()> {
    let ctx = ProjectContext::find()?;
    let target = parse_target(target)?;

    output.heading("Revert Migrations");
    run(&ctx, Direction::Down, target, output).await
}

fn parse_target(target: Option<String>) -> Result<Option<UnitId>> {
    target
        .map(|raw| UnitId::parse(&raw).with_context(|| format!("Invalid target '{raw}'")))
        .transpose()
}

async fn run(
    ctx: &ProjectContext,
    direction: Direction,
    target: Option<UnitId>,
    output: &OutputManager,
) -> Result<()> {
    let registry = load_registry(&ctx.migrations_dir)?;
    if registry.is_empty() {
        output.warning(&format!(
            "No unit files found in {}",
            ctx.migrations_dir.display()
        ));
        return Ok(());
    }
    output.bullet(&format!("{} unit(s) registered", registry.len()));

    let runner = connect_runner(ctx, registry, output).await?;

    let started = Instant::now();
    let report = match direction {
        Direction::Up => runner.up(target.as_ref()).await?,
        Direction::Down => runner.down(target.as_ref()).await?,
    };
    let elapsed_ms = started.elapsed().as_millis();

    render_report(&report, elapsed_ms, output)
}

/// Build a lock-holding runner over the configured Redis database, with
/// Ctrl-C wired to the runner's cancellation flag.
async fn connect_runner(
    ctx: &ProjectContext,
    registry: Registry,
    output: &OutputManager,
) -> Result<Runner<RedisBackend>> {
    let redis_url = ctx.redis_url()?;
    output.verbose(&format!("redis: {redis_url}"));
    output.verbose(&format!("key prefix: {}", ctx.config.driftlock.prefix));

    output.progress("Connecting to Redis");
    let backend = RedisBackend::connect(&redis_url)
        .await
        .context("Failed to connect to Redis")?
        .with_prefix(ctx.config.driftlock.prefix.clone());
    output.clear_line();
    output.success("Connected to Redis");

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::Relaxed);
        }
    });

    Ok(Runner::new(backend, registry)
        .with_lease(ctx.lock_lease())
        .with_cancel_flag(cancel))
}

fn render_report(report: &RunReport, elapsed_ms: u128, output: &OutputManager) -> Result<()> {
    let verb = match report.direction {
        Direction::Up => "applied",
        Direction::Down => "reverted",
    };

    for id in &report.executed {
        output.bullet(&format!("{verb} {id}"));
    }

    output.heading("Summary");

    match &report.halt {
        None => {
            if report.executed.is_empty() {
                output.info("Nothing to do, database is already at the target");
            } else {
                output.success(&format!(
                    "{} unit(s) {verb} in {elapsed_ms}ms",
                    report.executed.len()
                ));
            }
            output.key_value(
                "Last applied",
                report
                    .last_applied
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("none"),
            );
            Ok(())
        }
        Some(Halt::Failed { id, error }) => {
            output.error(&format!("Unit {id} failed: {error}"));
            output.key_value("Failed unit", id.as_str());
            output.key_value(
                "Last applied",
                report
                    .last_applied
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("none"),
            );
            output.info("Prior units stay applied; fix the unit and rerun to resume");
            anyhow::bail!("migration run stopped at {id}")
        }
        Some(Halt::Cancelled { next }) => {
            output.warning(&format!("Cancelled before {next}"));
            output.key_value(
                "Last applied",
                report
                    .last_applied
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("none"),
            );
            anyhow::bail!("migration run cancelled")
        }
    }
}
