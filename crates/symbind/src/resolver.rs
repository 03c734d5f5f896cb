//! Resolution of mapping entries against host memory.
//!
//! For every pattern match the resolver evaluates the entry's condition, runs each declared
//! target and folds the per-target verdicts into a scan decision:
//!
//! - the match is accepted only when every target returned [`TargetResult::Success`];
//! - scanning continues when any target returned [`TargetResult::TryNext`], otherwise it
//!   stops at this match.
//!
//! Slot writes of a match, including those of chained entries and handlers, are rolled back
//! unless the match is accepted. Failure flags raised along the way are kept.

use serde::Serialize;
use tracing::{debug, error, info};

use crate::decode;
use crate::error::{Error, Result};
use crate::image::{AddressRange, ImageLayout};
use crate::mapping::{
    Condition, FailurePolicy, HandlerContext, Mapping, Phase, Scope, Target, TargetKind,
    TargetResult,
};
use crate::memory::ReadMemory;
use crate::pattern::ScanControl;
use crate::symbols::SymbolTable;

/// Outcome of folding the target results of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchVerdict {
    pub accepted: bool,
    pub control: ScanControl,
}

pub fn combine_targets(results: &[TargetResult]) -> MatchVerdict {
    let accepted = results.iter().all(|&r| r == TargetResult::Success);
    let control = if results.contains(&TargetResult::TryNext) {
        ScanControl::Continue
    } else {
        ScanControl::Stop
    };
    MatchVerdict { accepted, control }
}

/// Result of mapping every entry of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub attempted: usize,
    pub mapped: usize,
    pub unmapped: Vec<&'static str>,
}

pub struct SymbolResolver<'a, R: ReadMemory> {
    memory: &'a R,
    layout: ImageLayout,
    symbols: &'a mut SymbolTable,
}

impl<'a, R: ReadMemory> SymbolResolver<'a, R> {
    pub fn new(memory: &'a R, layout: ImageLayout, symbols: &'a mut SymbolTable) -> Self {
        Self {
            memory,
            layout,
            symbols,
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        self.symbols
    }

    /// Map every entry of `table` that belongs to `phase`, in table order.
    pub fn map_phase(&mut self, table: &[Mapping], phase: Phase) -> Result<PhaseSummary> {
        let mut summary = PhaseSummary {
            phase,
            attempted: 0,
            mapped: 0,
            unmapped: Vec::new(),
        };

        for mapping in table.iter().filter(|m| m.phase == phase) {
            summary.attempted += 1;
            if self.map_symbol(mapping, None)? {
                summary.mapped += 1;
            } else {
                summary.unmapped.push(mapping.name);
            }
        }

        info!(
            "{} phase: mapped {}/{} entries",
            phase, summary.mapped, summary.attempted
        );
        Ok(summary)
    }

    /// Resolve one entry. `window` is the scan range for [`Scope::Custom`] entries.
    ///
    /// Returns whether a match was accepted. Unresolved entries are logged and recorded in
    /// the failure flags according to their policy. Errors are reserved for malformed entries.
    pub fn map_symbol(&mut self, mapping: &Mapping, window: Option<AddressRange>) -> Result<bool> {
        let mapped = self.scan_mapping(mapping, window)?;
        if !mapped {
            self.report_unmapped(mapping);
        }
        Ok(mapped)
    }

    fn scan_mapping(&mut self, mapping: &Mapping, window: Option<AddressRange>) -> Result<bool> {
        let pattern = mapping.compile()?;
        let range = match (mapping.scope, window) {
            (Scope::Image, _) => self.layout.image(),
            (Scope::Code, _) => self.layout.code(),
            (Scope::Custom, Some(window)) => window,
            (Scope::Custom, None) => {
                return Err(Error::InvalidMapping {
                    name: mapping.name.to_string(),
                    message: "Custom scope requires a scan window".to_string(),
                });
            }
        };

        let memory = self.memory;
        let Some(region) = memory.slice_from(range.start) else {
            debug!(
                "{}: scan range {:#x} is not readable",
                mapping.name, range.start
            );
            return Ok(false);
        };
        let haystack = &region[..region.len().min(range.len)];

        let mut mapped = false;
        let mut failure = None;
        pattern.scan(haystack, true, |offset| {
            let address = range.start + offset as u64;
            if !self.condition_holds(&mapping.condition, address) {
                return ScanControl::NoOpinion;
            }
            match self.evaluate_match(mapping, address) {
                Ok(verdict) => {
                    mapped = verdict.accepted;
                    verdict.control
                }
                Err(e) => {
                    failure = Some(e);
                    ScanControl::Stop
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(mapped),
        }
    }

    fn evaluate_match(&mut self, mapping: &Mapping, address: u64) -> Result<MatchVerdict> {
        let snapshot = self.symbols.snapshot();
        let results = mapping
            .declared_targets()
            .map(|target| self.execute_target(mapping, target, address))
            .collect::<Result<Vec<_>>>();
        let results = match results {
            Ok(results) => results,
            Err(e) => {
                self.symbols.restore(snapshot);
                return Err(e);
            }
        };

        let verdict = combine_targets(&results);
        if verdict.accepted {
            debug!("{}: accepted match at {:#x}", mapping.name, address);
        } else {
            self.symbols.restore(snapshot);
            debug!(
                "{}: rejected match at {:#x} ({:?})",
                mapping.name, address, results
            );
        }
        Ok(verdict)
    }

    fn execute_target(
        &mut self,
        mapping: &Mapping,
        target: &Target,
        address: u64,
    ) -> Result<TargetResult> {
        let at = address.wrapping_add_signed(target.offset);
        let resolved = match target.kind {
            TargetKind::None => return Ok(TargetResult::Success),
            TargetKind::Absolute => Ok(at),
            TargetKind::IndirectCall => decode::call_to_absolute(self.memory, at),
            TargetKind::IndirectLea => decode::lea_to_absolute(self.memory, at),
        };

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) if e.is_decode_mismatch() => {
                debug!(
                    "{}: could not map match at {:#x} to a symbol address: {}",
                    mapping.name, address, e
                );
                return Ok(TargetResult::TryNext);
            }
            Err(e) => return Err(e),
        };

        if let Some(slot) = target.slot {
            self.symbols.insert(slot, resolved);
        }

        if let Some(next) = target.next {
            let window = AddressRange::new(resolved, target.next_window);
            if !self.map_symbol(next, Some(window))? {
                return Ok(TargetResult::Fail);
            }
        }

        Ok(match target.handler {
            Some(handler) => {
                let mut context = HandlerContext {
                    memory: self.memory,
                    layout: &self.layout,
                    symbols: self.symbols,
                };
                handler(&mut context, resolved)
            }
            None => TargetResult::Success,
        })
    }

    fn condition_holds(&self, condition: &Condition, address: u64) -> bool {
        match *condition {
            Condition::None => true,
            Condition::String { offset, value } => self
                .string_ref(address.wrapping_add_signed(offset))
                .is_some_and(|s| s == value.as_bytes()),
            Condition::FixedString { offset, value } => self
                .fixed_string_ref(address.wrapping_add_signed(offset))
                .is_some_and(|s| s == value.as_bytes()),
        }
    }

    /// String referenced by the lea at `at`, when it lies inside the image.
    fn string_ref(&self, at: u64) -> Option<&'a [u8]> {
        let memory = self.memory;
        let target = decode::lea_to_absolute(memory, at).ok()?;
        if !self.layout.image().contains(target) {
            return None;
        }
        memory.read_c_str(target).ok()
    }

    /// Characters of the string handle referenced by the lea at `at`.
    fn fixed_string_ref(&self, at: u64) -> Option<&'a [u8]> {
        let memory = self.memory;
        let handle = decode::lea_to_absolute(memory, at).ok()?;
        if !self.layout.image().contains(handle) {
            return None;
        }
        match memory.read_u64(handle).ok()? {
            0 => None,
            chars => memory.read_c_str(chars).ok(),
        }
    }

    fn report_unmapped(&mut self, mapping: &Mapping) {
        match mapping.policy {
            FailurePolicy::AllowFail => debug!("No match found for mapping '{}'", mapping.name),
            FailurePolicy::Report => error!("Could not locate symbol '{}'", mapping.name),
            FailurePolicy::Critical => {
                error!("Could not locate critical symbol '{}'", mapping.name)
            }
        }
        self.symbols.record_failure(mapping.policy);
    }
}
