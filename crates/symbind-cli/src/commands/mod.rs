//! CLI command implementations.

pub mod address;
pub mod check;
pub mod decode;
pub mod resolve;
pub mod scan;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use symbind::{ImageLayout, MemoryBuffer, load_pe_file};

/// Map the PE file at `path` to its loaded layout and locate `section`.
pub fn load_image(path: &Path, section: &str) -> Result<(MemoryBuffer, ImageLayout)> {
    let file = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let image =
        load_pe_file(&file).with_context(|| format!("Failed to map {}", path.display()))?;
    let layout = ImageLayout::from_headers(&image, image.base_address(), image.len(), section)?;
    Ok((image, layout))
}
