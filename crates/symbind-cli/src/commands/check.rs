//! Check command implementation.

use anyhow::{Result, bail};
use owo_colors::OwoColorize;
use symbind::catalog::{FEATURE_PATCHES, HOOK_SITES, MAPPINGS, provided_symbols};
use symbind::{FailurePolicy, Phase, validate_table};

/// Validate the compiled-in tables
pub fn run() -> Result<()> {
    validate_table(MAPPINGS)?;

    let count = |phase: Phase| MAPPINGS.iter().filter(|m| m.phase == phase).count();
    let critical = MAPPINGS
        .iter()
        .filter(|m| m.policy == FailurePolicy::Critical)
        .count();
    println!(
        "{} {} mappings ({} load, {} post-startup, {} critical)",
        "ok".green(),
        MAPPINGS.len(),
        count(Phase::Load),
        count(Phase::PostStartup),
        critical
    );

    let provided = provided_symbols(MAPPINGS);
    let mut missing = Vec::new();

    for site in HOOK_SITES {
        if !provided.contains(site.symbol) {
            missing.push(format!("hook site {}", site.symbol));
        }
    }
    for group in FEATURE_PATCHES {
        for patch in group.patches {
            if !provided.contains(patch.symbol) {
                missing.push(format!("feature patch {} ({})", patch.symbol, group.name));
            }
        }
    }

    if !missing.is_empty() {
        for item in &missing {
            println!("{} {} has no mapping", "error".red(), item);
        }
        bail!("{} references to unmapped symbols", missing.len());
    }

    println!(
        "{} {} hook sites, {} feature patch groups",
        "ok".green(),
        HOOK_SITES.len(),
        FEATURE_PATCHES.len()
    );
    Ok(())
}
