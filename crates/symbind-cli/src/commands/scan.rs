//! Scan command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize;
use symbind::{Pattern, ReadMemory, Scope};

use super::load_image;

/// Run the scan command
pub fn run(path: &Path, pattern: &str, scope: Scope, section: &str, limit: usize) -> Result<()> {
    let pattern =
        Pattern::compile(pattern).with_context(|| format!("Invalid pattern '{}'", pattern))?;
    let (image, layout) = load_image(path, section)?;

    let range = match scope {
        Scope::Image => layout.image(),
        Scope::Code => layout.code(),
        Scope::Custom => bail!("Custom scope needs a window; scan Image or Code instead"),
    };
    let haystack = image.bytes(range.start, range.len)?;

    println!(
        "Scanning {} {:#x} (+{:#x}) for {}",
        scope,
        range.start,
        range.len,
        pattern.cyan()
    );

    let hits = pattern.find_all(haystack);
    for offset in hits.iter().take(limit) {
        let address = range.start + *offset as u64;
        println!(
            "  {:#x}  rva {:#x}",
            address,
            address - layout.base_address()
        );
    }

    match hits.len() {
        0 => println!("{}", "no matches".yellow()),
        n if n > limit => println!("{} matches ({} shown)", n, limit),
        n => println!("{} matches", n),
    }
    Ok(())
}
