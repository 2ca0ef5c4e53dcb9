use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use driftlock::{RedisBackend, Runner, StatusReport, UnitState};

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::loader::load_registry;
use crate::output::{GlobalOptions, OutputManager, TableDisplay};

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Inspect State",
    commands: &[
        "driftlock status                     # Per-unit applied/pending view",
        "driftlock status --output json       # Machine-readable status",
    ],
}];

pub async fn handle_status(output: &OutputManager) -> Result<()> {
    let ctx = ProjectContext::find()?;
    let registry = load_registry(&ctx.migrations_dir)?;

    let redis_url = ctx.redis_url()?;
    output.progress("Connecting to Redis");
    let backend = RedisBackend::connect(&redis_url)
        .await
        .context("Failed to connect to Redis")?
        .with_prefix(ctx.config.driftlock.prefix.clone());
    output.clear_line();

    // Status is a read-only view; it never takes the migration lock.
    let runner = Runner::new(backend, registry);
    let report = runner.status().await?;

    output.heading("Migration Status");
    output.display(&report)?;

    output.key_value(
        "Applied",
        &format!("{}/{}", report.applied_count(), report.entries.len()),
    );

    for record in &report.orphaned {
        output.warning(&format!(
            "Applied record '{}' has no unit file (applied at {})",
            record.id, record.applied_at
        ));
    }

    Ok(())
}

impl TableDisplay for StatusReport {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = Table::new();

        if !options.no_color {
            table.load_preset(comfy_table::presets::UTF8_FULL_CONDENSED);
        } else {
            table.load_preset(comfy_table::presets::ASCII_FULL);
        }

        table.set_header(vec!["Unit", "State", "Applied At"]);

        for entry in &self.entries {
            let (state, applied_at) = match &entry.state {
                UnitState::Applied(at) => ("applied", at.to_rfc3339()),
                UnitState::Pending => ("pending", String::new()),
            };
            table.add_row(vec![
                Cell::new(entry.id.as_str()),
                Cell::new(state),
                Cell::new(applied_at),
            ]);
        }

        table
    }

    fn to_compact(&self) -> String {
        format!(
            "applied {}/{} ({} pending)",
            self.applied_count(),
            self.entries.len(),
            self.pending_count()
        )
    }
}
