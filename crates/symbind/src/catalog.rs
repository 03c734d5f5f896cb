//! Compiled-in mapping table for the host executable.
//!
//! Load-phase entries are the anchors needed while the image is initializing; everything the
//! extension only touches once the host is running is deferred to [`Phase::PostStartup`].

use std::collections::BTreeSet;

use crate::mapping::{
    Condition, FailurePolicy, HandlerContext, Mapping, Phase, Scope, Target, TargetResult,
};
use crate::patch::{FeaturePatch, FeaturePatchGroup};

pub const GLOBAL_STRING_TABLE: &str = "ls::GlobalStringTable";
pub const FIXED_STRING_CREATE: &str = "ls::FixedString::Create";
pub const EOC_ALLOC: &str = "ls::EoCAlloc";
pub const EOC_FREE: &str = "ls::EoCFree";
pub const CRT_ALLOC: &str = "ls::CrtAlloc";
pub const CRT_FREE: &str = "ls::CrtFree";
pub const ECL_EOC_CLIENT: &str = "ecl::EoCClient";
pub const ECL_EOC_CLIENT_HANDLE_ERROR: &str = "ecl::EoCClient::HandleError";
pub const ESV_CHARACTER_HIT: &str = "esv::Character::Hit";
pub const ESV_STATUS_MACHINE_APPLY_STATUS: &str = "esv::StatusMachine::ApplyStatus";
pub const ESV_STATUS_HIT_VMT: &str = "esv::StatusHit::VMT";
pub const ESV_STATUS_HIT_ENTER: &str = "esv::StatusHit::Enter";
pub const ESV_STATUS_HEAL_VMT: &str = "esv::StatusHeal::VMT";
pub const ESV_STATUS_HEAL_ENTER: &str = "esv::StatusHeal::Enter";
pub const ESV_STATUS_HEAL_GET_ENTER_CHANCE: &str = "esv::StatusHeal::GetEnterChance";
pub const SKILL_PROTOTYPE_MANAGER_INIT: &str = "eoc::SkillPrototypeManager::Init";
pub const SKILL_PROTOTYPE_MANAGER: &str = "eoc::SkillPrototypeManager";
pub const TRANSLATED_STRING_REPOSITORY_GET: &str = "ls::TranslatedStringRepository::Get";
pub const ACTIVATE_CLIENT_SYSTEMS_HOOK: &str = "ActivateClientSystemsHook";
pub const ACTIVATE_SERVER_SYSTEMS_HOOK: &str = "ActivateServerSystemsHook";
pub const CUSTOM_STAT_UI_ROLL_HOOK: &str = "CustomStatUIRollHook";
pub const UI_CHARACTER_SHEET_HOOK: &str = "UICharacterSheetHook";

/// `esv::Status` virtual table slots.
pub const STATUS_VMT_GET_ENTER_CHANCE: u64 = 11;
pub const STATUS_VMT_ENTER: u64 = 12;

/// Store vtable entry `index` of `vmt` under `slot` when it points into code.
fn store_vmt_entry(
    context: &mut HandlerContext<'_>,
    vmt: u64,
    index: u64,
    slot: &'static str,
) -> bool {
    match context.memory.read_u64(vmt + index * 8) {
        Ok(entry) if context.layout.code().contains(entry) => {
            context.symbols.insert(slot, entry);
            true
        }
        _ => false,
    }
}

fn status_hit_vmt(context: &mut HandlerContext<'_>, vmt: u64) -> TargetResult {
    if store_vmt_entry(context, vmt, STATUS_VMT_ENTER, ESV_STATUS_HIT_ENTER) {
        TargetResult::Success
    } else {
        TargetResult::Fail
    }
}

fn status_heal_vmt(context: &mut HandlerContext<'_>, vmt: u64) -> TargetResult {
    let enter = store_vmt_entry(context, vmt, STATUS_VMT_ENTER, ESV_STATUS_HEAL_ENTER);
    let chance = store_vmt_entry(
        context,
        vmt,
        STATUS_VMT_GET_ENTER_CHANCE,
        ESV_STATUS_HEAL_GET_ENTER_CHANCE,
    );
    if enter && chance {
        TargetResult::Success
    } else {
        TargetResult::Fail
    }
}

/// Global loaded near the start of `SkillPrototypeManager::Init`.
pub static SKILL_PROTOTYPE_MANAGER_GLOBAL: Mapping = Mapping::new(
    SKILL_PROTOTYPE_MANAGER,
    "48 8B 0D XX XX XX XX 48 85 C9 74 XX ",
)
.scope(Scope::Custom)
.target(Target::lea(0).store(SKILL_PROTOTYPE_MANAGER))
.phase(Phase::PostStartup);

pub static MAPPINGS: &[Mapping] = &[
    // Image-load anchors
    Mapping::new(
        GLOBAL_STRING_TABLE,
        "48 8B 05 XX XX XX XX 48 8B 0C C8 48 85 C9 74 XX ",
    )
    .target(Target::lea(0).store(GLOBAL_STRING_TABLE))
    .policy(FailurePolicy::Critical),
    Mapping::new(
        FIXED_STRING_CREATE,
        "48 8D 0D XX XX XX XX E8 XX XX XX XX 48 8B D8 48 85 C0 ",
    )
    .condition(Condition::String {
        offset: 0,
        value: "GlobalStringTable",
    })
    .target(Target::call(7).store(FIXED_STRING_CREATE))
    .policy(FailurePolicy::Critical),
    Mapping::new(
        EOC_ALLOC,
        "48 89 5C 24 08 57 48 83 EC 20 8B FA 48 8B D9 E8 XX XX XX XX 48 85 C0 ",
    )
    .target(Target::absolute(0).store(EOC_ALLOC))
    .policy(FailurePolicy::Critical),
    Mapping::new(
        EOC_FREE,
        "48 85 C9 74 XX 53 48 83 EC 20 48 8B D9 E8 XX XX XX XX 48 8B CB ",
    )
    .target(Target::absolute(0).store(EOC_FREE))
    .policy(FailurePolicy::Critical),
    Mapping::new(
        CRT_ALLOC,
        "E8 XX XX XX XX 48 8B F8 48 85 C0 75 XX 8D 48 10 E8 ",
    )
    .target(Target::call(0).store(CRT_ALLOC))
    .policy(FailurePolicy::AllowFail),
    Mapping::new(CRT_FREE, "48 85 C9 74 XX 4C 8B C1 33 D2 48 8B 0D ")
        .target(Target::absolute(0).store(CRT_FREE))
        .policy(FailurePolicy::AllowFail),
    // Deferred until the host is running
    Mapping::new(
        ECL_EOC_CLIENT,
        "48 8D 15 XX XX XX XX 48 8B 0D XX XX XX XX 45 33 C9 E8 ",
    )
    .condition(Condition::String {
        offset: 0,
        value: "ecl::EoCClient::HandleError",
    })
    .target(Target::lea(7).store(ECL_EOC_CLIENT))
    .target(Target::call(17).store(ECL_EOC_CLIENT_HANDLE_ERROR))
    .phase(Phase::PostStartup),
    Mapping::new(
        ESV_CHARACTER_HIT,
        "48 89 5C 24 08 48 89 74 24 10 57 48 83 EC 20 41 8B F9 49 8B D8 48 8D 0D ",
    )
    .condition(Condition::FixedString {
        offset: 21,
        value: "Hit",
    })
    .target(Target::absolute(0).store(ESV_CHARACTER_HIT))
    .phase(Phase::PostStartup),
    Mapping::new(
        ESV_STATUS_MACHINE_APPLY_STATUS,
        "48 89 5C 24 10 48 89 6C 24 18 56 57 41 56 48 83 EC 40 80 B9 XX XX XX XX 00 ",
    )
    .target(Target::absolute(0).store(ESV_STATUS_MACHINE_APPLY_STATUS))
    .phase(Phase::PostStartup),
    Mapping::new(
        ESV_STATUS_HIT_VMT,
        "48 8D 05 XX XX XX XX 48 89 03 C7 43 XX 07 00 00 00 ",
    )
    .target(
        Target::lea(0)
            .store(ESV_STATUS_HIT_VMT)
            .handler(status_hit_vmt),
    )
    .phase(Phase::PostStartup),
    Mapping::new(
        ESV_STATUS_HEAL_VMT,
        "48 8D 05 XX XX XX XX 48 89 03 C7 43 XX 0D 00 00 00 ",
    )
    .target(
        Target::lea(0)
            .store(ESV_STATUS_HEAL_VMT)
            .handler(status_heal_vmt),
    )
    .phase(Phase::PostStartup),
    Mapping::new(
        SKILL_PROTOTYPE_MANAGER_INIT,
        "E8 XX XX XX XX 48 8B 4B XX 48 8D 55 XX 48 8B 01 FF 50 XX ",
    )
    .target(
        Target::call(0)
            .store(SKILL_PROTOTYPE_MANAGER_INIT)
            .chain(&SKILL_PROTOTYPE_MANAGER_GLOBAL, 0x80),
    )
    .phase(Phase::PostStartup),
    Mapping::new(
        TRANSLATED_STRING_REPOSITORY_GET,
        "48 8B 0D XX XX XX XX 4C 8D 44 24 XX 48 8B D3 E8 ",
    )
    .condition(Condition::FixedString {
        offset: 0,
        value: "TranslatedStringRepository",
    })
    .target(Target::call(15).store(TRANSLATED_STRING_REPOSITORY_GET))
    .policy(FailurePolicy::AllowFail)
    .phase(Phase::PostStartup),
    Mapping::new(
        ACTIVATE_CLIENT_SYSTEMS_HOOK,
        "84 C0 75 XX 48 8B 0D XX XX XX XX 48 8D 15 XX XX XX XX E8 XX XX XX XX 48 8B CB ",
    )
    .condition(Condition::String {
        offset: 11,
        value: "ecl::CustomStatsComponent",
    })
    .target(Target::absolute(2).store(ACTIVATE_CLIENT_SYSTEMS_HOOK))
    .phase(Phase::PostStartup),
    Mapping::new(
        ACTIVATE_SERVER_SYSTEMS_HOOK,
        "84 C0 75 XX 48 8B 0D XX XX XX XX 48 8D 15 XX XX XX XX E8 XX XX XX XX 48 8B CB ",
    )
    .condition(Condition::String {
        offset: 11,
        value: "esv::CustomStatsComponent",
    })
    .target(Target::absolute(2).store(ACTIVATE_SERVER_SYSTEMS_HOOK))
    .phase(Phase::PostStartup),
    Mapping::new(
        CUSTOM_STAT_UI_ROLL_HOOK,
        "40 53 48 83 EC 30 48 8B 05 XX XX XX XX 48 8B D9 48 8B 88 ",
    )
    .target(Target::absolute(0).store(CUSTOM_STAT_UI_ROLL_HOOK))
    .phase(Phase::PostStartup),
    Mapping::new(
        UI_CHARACTER_SHEET_HOOK,
        "C6 45 F8 00 48 8B 0D XX XX XX XX 48 8D 55 XX E8 ",
    )
    .target(Target::absolute(0).store(UI_CHARACTER_SHEET_HOOK))
    .phase(Phase::PostStartup),
];

/// Function entry points that can be hooked, with the length of their pinned prologue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSite {
    pub symbol: &'static str,
    pub prologue_len: usize,
}

pub static HOOK_SITES: &[HookSite] = &[
    HookSite {
        symbol: ESV_CHARACTER_HIT,
        prologue_len: 15,
    },
    HookSite {
        symbol: ESV_STATUS_MACHINE_APPLY_STATUS,
        prologue_len: 18,
    },
];

pub fn hook_site(symbol: &str) -> Option<HookSite> {
    HOOK_SITES.iter().find(|site| site.symbol == symbol).copied()
}

/// Every slot the table can fill through its targets, chained mappings included.
///
/// Symbols inserted by handlers are not listed.
pub fn provided_symbols(table: &[Mapping]) -> BTreeSet<&'static str> {
    fn collect(mapping: &Mapping, out: &mut BTreeSet<&'static str>) {
        for target in mapping.declared_targets() {
            out.extend(target.slot);
            if let Some(next) = target.next {
                collect(next, out);
            }
        }
    }

    let mut out = BTreeSet::new();
    for mapping in table {
        collect(mapping, &mut out);
    }
    out
}

pub static FEATURE_PATCHES: &[FeaturePatchGroup] = &[
    FeaturePatchGroup {
        name: "CustomStats",
        features: &["CustomStats"],
        patches: &[
            FeaturePatch {
                symbol: ACTIVATE_CLIENT_SYSTEMS_HOOK,
                bytes: &[0x90, 0x90],
            },
            FeaturePatch {
                symbol: ACTIVATE_SERVER_SYSTEMS_HOOK,
                bytes: &[0x90, 0x90],
            },
            FeaturePatch {
                symbol: CUSTOM_STAT_UI_ROLL_HOOK,
                bytes: &[0xC3],
            },
        ],
    },
    FeaturePatchGroup {
        name: "CustomStatsPane",
        features: &["CustomStats", "CustomStatsPane"],
        patches: &[FeaturePatch {
            symbol: UI_CHARACTER_SHEET_HOOK,
            bytes: &[0xC6, 0x45, 0xF8, 0x01],
        }],
    },
];
