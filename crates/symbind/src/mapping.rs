//! Declarative mapping entries: what to scan for and what to do with each match.
//!
//! A mapping table is a static, ordered list. Entries are built with `const fn` builders so
//! tables live in `static` items:
//!
//! ```ignore
//! static CREATE_FIXED_STRING: Mapping = Mapping::new(
//!     "ls::FixedString::Create",
//!     "48 8D 0D XX XX XX XX E8 XX XX XX XX 48 8B D8 ",
//! )
//! .target(Target::call(7).store("ls::FixedString::Create"))
//! .policy(FailurePolicy::Critical);
//! ```

use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};
use tracing::error;

use crate::error::{Error, Result};
use crate::image::ImageLayout;
use crate::memory::ReadMemory;
use crate::pattern::Pattern;
use crate::symbols::SymbolTable;

/// Most targets one entry can declare.
pub const MAX_TARGETS: usize = 3;

/// Memory region a pattern is scanned against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr,
)]
pub enum Scope {
    /// The whole loaded image.
    Image,
    /// The code section only.
    Code,
    /// A window supplied by the caller, e.g. by a chained target.
    Custom,
}

/// Resolution phase an entry belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr,
)]
pub enum Phase {
    /// Image-load time: the minimal anchors.
    Load,
    /// After the host finished starting up.
    PostStartup,
}

/// What an unresolved entry does to the failure flags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr,
)]
pub enum FailurePolicy {
    /// Best-effort symbol, failure is silent.
    AllowFail,
    /// Logged and raises the non-critical flag.
    Report,
    /// Additionally raises the critical flag.
    Critical,
}

/// Contextual check evaluated before any target of a match runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    None,
    /// The lea at `match + offset` references a NUL-terminated string inside the image.
    String { offset: i64, value: &'static str },
    /// The lea at `match + offset` references an interned string handle inside the image.
    FixedString { offset: i64, value: &'static str },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr,
)]
pub enum TargetKind {
    None,
    /// `match + offset`.
    Absolute,
    /// Callee of the near call at `match + offset`.
    IndirectCall,
    /// Address referenced by the lea/mov at `match + offset`.
    IndirectLea,
}

/// Per-target verdict for one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum TargetResult {
    Success,
    /// Not a valid target for this match; the match is discarded.
    Fail,
    /// Decoding was inconclusive; try the next occurrence.
    TryNext,
}

/// What a handler sees when it validates a resolved address.
pub struct HandlerContext<'a> {
    pub memory: &'a dyn ReadMemory,
    pub layout: &'a ImageLayout,
    pub symbols: &'a mut SymbolTable,
}

pub type TargetHandler = fn(&mut HandlerContext<'_>, u64) -> TargetResult;

#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub kind: TargetKind,
    pub offset: i64,
    /// Symbol table slot receiving the resolved address.
    pub slot: Option<&'static str>,
    /// Sub-mapping resolved in a window starting at the resolved address.
    pub next: Option<&'static Mapping>,
    pub next_window: usize,
    pub handler: Option<TargetHandler>,
}

impl Target {
    pub const NONE: Target = Target::new(TargetKind::None, 0);

    pub const fn new(kind: TargetKind, offset: i64) -> Self {
        Self {
            kind,
            offset,
            slot: None,
            next: None,
            next_window: 0,
            handler: None,
        }
    }

    pub const fn absolute(offset: i64) -> Self {
        Self::new(TargetKind::Absolute, offset)
    }

    pub const fn call(offset: i64) -> Self {
        Self::new(TargetKind::IndirectCall, offset)
    }

    pub const fn lea(offset: i64) -> Self {
        Self::new(TargetKind::IndirectLea, offset)
    }

    pub const fn store(mut self, slot: &'static str) -> Self {
        self.slot = Some(slot);
        self
    }

    pub const fn chain(mut self, next: &'static Mapping, window: usize) -> Self {
        self.next = Some(next);
        self.next_window = window;
        self
    }

    pub const fn handler(mut self, handler: TargetHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub const fn is_declared(&self) -> bool {
        !matches!(self.kind, TargetKind::None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub name: &'static str,
    pub pattern: &'static str,
    pub scope: Scope,
    pub condition: Condition,
    pub targets: [Target; MAX_TARGETS],
    pub policy: FailurePolicy,
    pub phase: Phase,
}

impl Mapping {
    pub const fn new(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            scope: Scope::Code,
            condition: Condition::None,
            targets: [Target::NONE; MAX_TARGETS],
            policy: FailurePolicy::Report,
            phase: Phase::Load,
        }
    }

    pub const fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub const fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Append a target. A fourth target is rejected at compile time for static tables.
    pub const fn target(mut self, target: Target) -> Self {
        let mut i = 0;
        while i < MAX_TARGETS {
            if !self.targets[i].is_declared() {
                self.targets[i] = target;
                return self;
            }
            i += 1;
        }
        panic!("a mapping holds at most three targets");
    }

    pub const fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn declared_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| t.is_declared())
    }

    /// Compile the pattern and check the entry's shape.
    pub fn compile(&self) -> Result<Pattern> {
        let pattern = Pattern::compile(self.pattern)
            .inspect_err(|e| error!("Mapping '{}' has a malformed pattern: {}", self.name, e))?;

        if self.declared_targets().next().is_none() {
            return Err(Error::InvalidMapping {
                name: self.name.to_string(),
                message: "no targets declared".to_string(),
            });
        }

        for target in self.declared_targets() {
            if let Some(next) = target.next {
                if next.scope != Scope::Custom {
                    return Err(Error::InvalidMapping {
                        name: self.name.to_string(),
                        message: format!("chained mapping '{}' must use Custom scope", next.name),
                    });
                }
                if target.next_window == 0 {
                    return Err(Error::InvalidMapping {
                        name: self.name.to_string(),
                        message: format!("chained mapping '{}' has an empty window", next.name),
                    });
                }
            }
        }

        Ok(pattern)
    }
}

/// Validate every entry of a table, chained sub-mappings included.
pub fn validate_table(table: &[Mapping]) -> Result<()> {
    fn visit(mapping: &Mapping, depth: usize) -> Result<()> {
        if depth > 8 {
            return Err(Error::InvalidMapping {
                name: mapping.name.to_string(),
                message: "chained mappings nest too deeply".to_string(),
            });
        }
        mapping.compile()?;
        for target in mapping.declared_targets() {
            if let Some(next) = target.next {
                visit(next, depth + 1)?;
            }
        }
        Ok(())
    }

    table.iter().try_for_each(|m| visit(m, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternError;

    static INNER: Mapping = Mapping::new("inner", "48 8B 05 ")
        .scope(Scope::Custom)
        .target(Target::lea(0).store("inner"));

    static OUTER: Mapping = Mapping::new("outer", "E8 XX XX XX XX ")
        .target(Target::call(0).chain(&INNER, 0x40))
        .target(Target::absolute(5).store("outer.site"))
        .policy(FailurePolicy::Critical)
        .phase(Phase::PostStartup);

    #[test]
    fn test_builder_fills_targets_in_order() {
        let targets: Vec<TargetKind> = OUTER.declared_targets().map(|t| t.kind).collect();
        assert_eq!(
            targets,
            vec![TargetKind::IndirectCall, TargetKind::Absolute]
        );
        assert_eq!(OUTER.targets[2].kind, TargetKind::None);
        assert_eq!(OUTER.scope, Scope::Code);
        assert_eq!(OUTER.policy, FailurePolicy::Critical);
    }

    #[test]
    fn test_validate_table_accepts_chained_entries() {
        assert!(validate_table(&[OUTER, INNER]).is_ok());
    }

    #[test]
    fn test_compile_rejects_malformed_entries() {
        let no_targets = Mapping::new("empty", "48 8B ");
        assert!(matches!(
            no_targets.compile(),
            Err(Error::InvalidMapping { .. })
        ));

        let bad_pattern = Mapping::new("bad", "XX 8B ").target(Target::absolute(0));
        assert!(matches!(
            bad_pattern.compile(),
            Err(Error::Pattern(PatternError::WildcardFirst))
        ));

        static IMAGE_SCOPED: Mapping =
            Mapping::new("image", "48 ").target(Target::absolute(0));
        let wrong_scope =
            Mapping::new("chain", "48 ").target(Target::absolute(0).chain(&IMAGE_SCOPED, 8));
        assert!(wrong_scope.compile().is_err());
    }

    #[test]
    #[should_panic(expected = "at most three targets")]
    fn test_fourth_target_panics() {
        let _ = Mapping::new("four", "48 ")
            .target(Target::absolute(0))
            .target(Target::absolute(1))
            .target(Target::absolute(2))
            .target(Target::absolute(3));
    }

    #[test]
    fn test_scope_round_trips_through_strings() {
        assert_eq!("Code".parse::<Scope>().unwrap(), Scope::Code);
        assert_eq!(Phase::PostStartup.to_string(), "PostStartup");
        let name: &'static str = FailurePolicy::AllowFail.into();
        assert_eq!(name, "AllowFail");
    }
}
