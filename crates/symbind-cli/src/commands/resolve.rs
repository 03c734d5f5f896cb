//! Resolve command implementation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use serde::Serialize;
use symbind::catalog::{MAPPINGS, hook_site};
use symbind::{Config, Engine, FailureFlags, PhaseSummary, SymbolTable};
use tracing::info;

use super::load_image;

#[derive(Serialize)]
struct ResolveReport<'a> {
    base: u64,
    symbols: &'a SymbolTable,
    failures: FailureFlags,
    phases: &'a [PhaseSummary],
}

/// Run both phases over the image and print the symbol table
pub fn run(path: &Path, config: &Path, json: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config)
        .with_context(|| format!("Failed to load config {}", config.display()))?;
    let (image, layout) = load_image(path, &config.code_section)?;
    let base = layout.base_address();
    info!(
        "Image {:#x} (+{:#x}), code {:#x} (+{:#x})",
        base,
        layout.image().len,
        layout.code().start,
        layout.code().len
    );

    let mut engine = Engine::new(&image, layout, MAPPINGS);
    engine.run_load_phase()?;
    // Offline run, there is nothing to hook.
    engine.run_post_startup(|_| Ok(()))?;

    for (name, address) in engine.symbols().iter() {
        let hook = if let Some(site) = hook_site(name) {
            format!(" [hook, {} byte prologue]", site.prologue_len)
                .cyan()
                .to_string()
        } else {
            String::new()
        };
        println!(
            "{:<44} {:#x}  rva {:#x}{}",
            name,
            address,
            address.wrapping_sub(base),
            hook
        );
    }

    for summary in engine.summaries() {
        for name in &summary.unmapped {
            println!("{:<44} {}", name, "unmapped".red());
        }
    }

    let failures = engine.failures();
    if let Some(out) = json {
        let report = ResolveReport {
            base,
            symbols: engine.symbols(),
            failures,
            phases: engine.summaries(),
        };
        fs::write(out, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        info!("Wrote {}", out.display());
    }

    if failures.critical_failed {
        bail!("Critical symbols could not be resolved");
    }
    if failures.init_failed {
        println!("{}", "Some symbols could not be resolved".yellow());
    } else {
        println!("{}", "All symbols resolved".green());
    }
    Ok(())
}
