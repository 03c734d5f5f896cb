//! # symbind
//!
//! Locates internal entry points of a host binary that ships without symbols, then binds to
//! them by patching code or installing call interception.
//!
//! This crate provides:
//! - Wildcard byte patterns with prefix-accelerated scanning
//! - Decoding of near calls and RIP-relative `lea`/`mov` into absolute addresses
//! - A declarative mapping table, resolved in two phases into a symbol table
//! - Transactional hook installation and opt-in byte patches
//! - Deferred display of startup errors
//!
//! Everything that touches a live process sits behind the [`memory::ReadMemory`],
//! [`patch::CodeMemory`] and [`patch::ThreadControl`] traits. The Win32 backend
//! ([`patch::LocalProcess`]) is only built on 64-bit Windows.

pub mod catalog;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod image;
pub mod mapping;
pub mod memory;
pub mod patch;
pub mod pattern;
pub mod report;
pub mod resolver;
pub mod symbols;

pub use config::{CONFIG_FILE, Config};
pub use decode::{RipLoad, call_to_absolute, decode_call, decode_lea, lea_to_absolute};
pub use engine::Engine;
pub use error::{Error, Result};
pub use image::{AddressRange, CODE_SECTION, ImageLayout, load_pe_file};
pub use mapping::{
    Condition, FailurePolicy, HandlerContext, Mapping, Phase, Scope, Target, TargetHandler,
    TargetKind, TargetResult, validate_table,
};
pub use memory::{LocalMemory, MemoryBuffer, ReadMemory};
pub use patch::{
    CodeMemory, CommitSummary, FeatureFlags, FeaturePatch, FeaturePatchGroup, FeaturePatcher,
    HookManager, HookPlan, HookRequest, HookTransaction, PageProtection, ThreadControl,
    WriteGuard, apply_patch,
};
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub use patch::{LocalProcess, LocalThread};
pub use pattern::{Pattern, PatternError, ScanControl};
pub use report::{ErrorDisplay, ReportOutcome, StartupErrorReporter};
pub use resolver::{MatchVerdict, PhaseSummary, SymbolResolver, combine_targets};
pub use symbols::{FailureFlags, Snapshot, SymbolTable};
