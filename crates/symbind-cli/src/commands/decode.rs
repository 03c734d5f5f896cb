//! Decode command implementation.

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;
use symbind::{CODE_SECTION, call_to_absolute, lea_to_absolute};

use super::address::parse_address;
use super::load_image;
use crate::cli::DecodeKind;

/// Run the decode command
pub fn run(path: &Path, address: &str, kind: DecodeKind) -> Result<()> {
    let (image, layout) = load_image(path, CODE_SECTION)?;
    let base = layout.base_address();
    let address = parse_address(address, base)?;

    let target = match kind {
        DecodeKind::Call => call_to_absolute(&image, address)?,
        DecodeKind::Lea => lea_to_absolute(&image, address)?,
    };

    let location = if layout.image().contains(target) {
        format!("rva {:#x}", target - base)
    } else {
        "outside image".yellow().to_string()
    };
    println!(
        "{:?} at {:#x} -> {} ({})",
        kind,
        address,
        format!("{:#x}", target).green(),
        location
    );
    Ok(())
}
