use anyhow::{Context, Result};
use driftlock::UnitId;

use crate::context::ProjectContext;
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Author Units",
    commands: &[
        "driftlock new users                  # Create <timestamp>-users.toml",
        "driftlock new add_email_index        # Slugs allow a-z, 0-9, '_' and '-'",
    ],
}];

pub async fn handle_new(slug: &str, output: &OutputManager) -> Result<()> {
    let ctx = ProjectContext::find()?;
    let id = UnitId::mint(slug)?;

    std::fs::create_dir_all(&ctx.migrations_dir).with_context(|| {
        format!(
            "Failed to create migrations directory {}",
            ctx.migrations_dir.display()
        )
    })?;

    let path = ctx.migrations_dir.join(format!("{id}.toml"));
    std::fs::write(&path, unit_template(&id))
        .with_context(|| format!("Failed to write {}", path.display()))?;

    output.heading("New Migration Unit");
    output.success(&format!("Created {}", path.display()));
    output.info("Next steps:");
    output.bullet("Fill in the up and down action lists");
    output.bullet("Run 'driftlock up' to apply");

    Ok(())
}

fn unit_template(id: &UnitId) -> String {
    format!(
        r#"id = "{id}"

# Forward actions, executed in order. Available actions:
#   create-collection (name, schema), create-index (collection, index),
#   drop-index (collection, field), drop-collection (name)
up = []

# Backward actions undoing the forward list.
down = []

# Example:
#
# [[up]]
# action = "create-collection"
# name = "users"
#
# [up.schema]
# required = [
#     {{ name = "_id", type = "identifier" }},
#     {{ name = "email", type = "string" }},
#     {{ name = "name", type = "string" }},
#     {{ name = "created_at", type = "date" }},
# ]
# optional = []
# unique_key = "_id"
# indexes = [{{ field = "email", unique = true }}]
#
# [[down]]
# action = "drop-collection"
# name = "users"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftlock::MigrationUnit;

    #[test]
    fn template_parses_as_an_empty_unit() {
        let id = UnitId::parse("20250101000000-users").unwrap();
        let unit: MigrationUnit = toml::from_str(&unit_template(&id)).unwrap();
        assert_eq!(unit.id, id);
        assert!(unit.up.is_empty());
        assert!(unit.down.is_empty());
    }
}
