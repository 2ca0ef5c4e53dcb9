//! Discovery and parsing of unit files from the migrations directory.

use anyhow::{Context, Result, bail};
use std::path::Path;

use driftlock::{MigrationUnit, Registry};

/// Load every `<id>.toml` unit file under `migrations_dir` into a registry.
///
/// Non-toml entries are skipped. A unit file whose declared id does not
/// match its file stem is rejected: the file name is the source of truth
/// for ordering, so a mismatch means somebody renamed one without the
/// other.
pub fn load_registry(migrations_dir: &Path) -> Result<Registry> {
    if !migrations_dir.exists() {
        return Ok(Registry::new());
    }

    let mut units = Vec::new();

    let entries = std::fs::read_dir(migrations_dir)
        .with_context(|| format!("Failed to read {}", migrations_dir.display()))?;

    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();

        if !path.is_file() || path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let unit: MigrationUnit = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        if unit.id.as_str() != stem {
            bail!(
                "Unit id '{}' does not match file name '{}'",
                unit.id,
                path.display()
            );
        }

        units.push(unit);
    }

    let registry = Registry::from_units(units).context("Invalid migrations directory")?;
    Ok(registry)
}
