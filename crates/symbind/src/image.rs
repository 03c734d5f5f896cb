//! Bounds of the loaded host image and its code section.
//!
//! The loader collaborator hands over a validated `(base, size)` pair. The code range is
//! found by walking the section headers for a named section; when it is missing the whole
//! image is used.

use goblin::pe::header::{Header, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC};
use goblin::pe::section_table::SectionTable;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::memory::{MemoryBuffer, ReadMemory};

/// Default name of the code section.
pub const CODE_SECTION: &str = ".text";

/// Header bytes read when walking section headers in memory.
const MAX_HEADER_SIZE: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AddressRange {
    pub start: u64,
    pub len: usize,
}

impl AddressRange {
    pub const fn new(start: u64, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

/// Validated image bounds plus the code sub-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageLayout {
    image: AddressRange,
    code: AddressRange,
}

impl ImageLayout {
    pub fn new(image: AddressRange, code: AddressRange) -> Result<Self> {
        if image.is_empty() {
            return Err(Error::InvalidImage("image is empty".to_string()));
        }
        if !image.contains_range(&code) {
            return Err(Error::InvalidImage(format!(
                "code range {:#x}..{:#x} is outside image {:#x}..{:#x}",
                code.start,
                code.end(),
                image.start,
                image.end()
            )));
        }
        Ok(Self { image, code })
    }

    /// Layout whose code range is the whole image.
    pub fn whole(image: AddressRange) -> Result<Self> {
        Self::new(image, image)
    }

    /// Walk the section headers of the image at `base` and locate `section`.
    pub fn from_headers<R: ReadMemory>(
        memory: &R,
        base: u64,
        size: usize,
        section: &str,
    ) -> Result<Self> {
        let image = AddressRange::new(base, size);
        let headers = memory.bytes(base, size.min(MAX_HEADER_SIZE))?;
        let parsed = parse_headers(headers)?;

        let Some(text) = parsed
            .sections
            .iter()
            .find(|s| s.name().map(|n| n == section).unwrap_or(false))
        else {
            warn!("Section '{}' not found, scanning the whole image", section);
            return Self::whole(image);
        };

        let start = base + text.virtual_address as u64;
        if !image.contains(start) {
            warn!(
                "Section '{}' starts outside the image ({:#x}), scanning the whole image",
                section, start
            );
            return Self::whole(image);
        }

        let len = (text.size_of_raw_data as u64).min(image.end() - start) as usize;
        debug!("Code section '{}': {:#x} (+{:#x})", section, start, len);
        Self::new(image, AddressRange::new(start, len))
    }

    pub fn image(&self) -> AddressRange {
        self.image
    }

    pub fn code(&self) -> AddressRange {
        self.code
    }

    pub fn base_address(&self) -> u64 {
        self.image.start
    }
}

/// The header fields needed to lay an image out.
struct PeHeaders {
    image_base: u64,
    size_of_image: usize,
    size_of_headers: usize,
    sections: Vec<SectionTable>,
}

fn parse_headers(bytes: &[u8]) -> Result<PeHeaders> {
    let header = Header::parse(bytes)?;
    let optional = header
        .optional_header
        .ok_or_else(|| Error::InvalidImage("missing optional header".to_string()))?;

    let mut offset = header.dos_header.pe_pointer as usize
        + SIZEOF_PE_MAGIC
        + SIZEOF_COFF_HEADER
        + header.coff_header.size_of_optional_header as usize;
    let sections = header.coff_header.sections(bytes, &mut offset)?;

    Ok(PeHeaders {
        image_base: optional.windows_fields.image_base,
        size_of_image: optional.windows_fields.size_of_image as usize,
        size_of_headers: optional.windows_fields.size_of_headers as usize,
        sections,
    })
}

/// Map a PE file into its loaded layout: headers at the preferred image base and every
/// section at its virtual address.
pub fn load_pe_file(file: &[u8]) -> Result<MemoryBuffer> {
    let headers = parse_headers(file)?;
    let size = headers.size_of_image;
    let mut image = vec![0u8; size];

    let header_len = headers.size_of_headers.min(file.len()).min(size);
    image[..header_len].copy_from_slice(&file[..header_len]);

    for section in &headers.sections {
        let raw_start = section.pointer_to_raw_data as usize;
        let virtual_start = section.virtual_address as usize;
        if raw_start >= file.len() || virtual_start >= size {
            debug!(
                "Skipping section {:?}: raw {:#x}, virtual {:#x}",
                section.name().unwrap_or("?"),
                raw_start,
                virtual_start
            );
            continue;
        }

        let len = (section.size_of_raw_data as usize)
            .min(file.len() - raw_start)
            .min(size - virtual_start);
        image[virtual_start..virtual_start + len]
            .copy_from_slice(&file[raw_start..raw_start + len]);
    }

    Ok(MemoryBuffer::new(headers.image_base, image))
}

#[cfg(test)]
pub(crate) mod testing {
    pub const IMAGE_BASE: u64 = 0x1_4000_0000;
    pub const TEXT_RVA: u32 = 0x1000;
    pub const TEXT_RAW: usize = 0x200;
    pub const RDATA_RVA: u32 = 0x2000;
    pub const RDATA_RAW: usize = 0x400;
    pub const IMAGE_SIZE: u32 = 0x3000;

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// A minimal PE32+ file with `.text` and `.rdata` sections of 0x200 raw bytes each.
    pub fn build_pe(text: &[u8], rdata: &[u8]) -> Vec<u8> {
        let mut file = vec![0u8; 0x600];
        put(&mut file, 0, b"MZ");
        put(&mut file, 0x3C, &0x40u32.to_le_bytes());
        put(&mut file, 0x40, b"PE\0\0");

        // COFF header
        put(&mut file, 0x44, &0x8664u16.to_le_bytes());
        put(&mut file, 0x46, &2u16.to_le_bytes());
        put(&mut file, 0x54, &0xF0u16.to_le_bytes());
        put(&mut file, 0x56, &0x22u16.to_le_bytes());

        // Optional header (PE32+)
        put(&mut file, 0x58, &0x20Bu16.to_le_bytes());
        put(&mut file, 0x70, &IMAGE_BASE.to_le_bytes());
        put(&mut file, 0x78, &0x1000u32.to_le_bytes());
        put(&mut file, 0x7C, &0x200u32.to_le_bytes());
        put(&mut file, 0x90, &IMAGE_SIZE.to_le_bytes());
        put(&mut file, 0x94, &0x200u32.to_le_bytes());
        put(&mut file, 0xC4, &16u32.to_le_bytes());

        let sections: [(&[u8; 8], u32, usize, u32); 2] = [
            (b".text\0\0\0", TEXT_RVA, TEXT_RAW, 0x6000_0020),
            (b".rdata\0\0", RDATA_RVA, RDATA_RAW, 0x4000_0040),
        ];
        for (i, (name, rva, raw, flags)) in sections.iter().enumerate() {
            let at = 0x148 + i * 40;
            put(&mut file, at, *name);
            put(&mut file, at + 8, &0x180u32.to_le_bytes());
            put(&mut file, at + 12, &rva.to_le_bytes());
            put(&mut file, at + 16, &0x200u32.to_le_bytes());
            put(&mut file, at + 20, &(*raw as u32).to_le_bytes());
            put(&mut file, at + 36, &flags.to_le_bytes());
        }

        put(&mut file, TEXT_RAW, text);
        put(&mut file, RDATA_RAW, rdata);
        file
    }
}
