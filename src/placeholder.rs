//! Built-in illustrative records served when neither the network nor the
//! cache can answer. Always handed out wrapped in [`Fetched::demo`].
//!
//! [`Fetched::demo`]: crate::network_model::Fetched::demo

use serde_json::Map;

use crate::network_model::{
    HeroStat, PlayerProfileInfo, PlayerSearchResult, PlayerSummary, WinLoss,
};

pub const DEMO_ACCOUNT_ID: u64 = 87_287_966;

fn hero(
    id: u32,
    name: &str,
    localized_name: &str,
    attr: &str,
    attack: &str,
    roles: &[&str],
) -> HeroStat {
    HeroStat {
        id,
        name: name.to_string(),
        localized_name: localized_name.to_string(),
        primary_attr: Some(attr.to_string()),
        attack_type: Some(attack.to_string()),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        extra: Map::new(),
    }
}

pub fn demo_heroes() -> Vec<HeroStat> {
    vec![
        hero(
            1,
            "npc_dota_hero_antimage",
            "Anti-Mage",
            "agi",
            "Melee",
            &["Carry", "Escape", "Nuker"],
        ),
        hero(
            2,
            "npc_dota_hero_axe",
            "Axe",
            "str",
            "Melee",
            &["Initiator", "Durable", "Disabler"],
        ),
        hero(
            5,
            "npc_dota_hero_crystal_maiden",
            "Crystal Maiden",
            "int",
            "Ranged",
            &["Support", "Disabler", "Nuker"],
        ),
        hero(
            14,
            "npc_dota_hero_pudge",
            "Pudge",
            "str",
            "Melee",
            &["Disabler", "Initiator", "Durable"],
        ),
        hero(
            74,
            "npc_dota_hero_invoker",
            "Invoker",
            "all",
            "Ranged",
            &["Carry", "Nuker", "Disabler"],
        ),
    ]
}

/// A demo summary carrying the requested account id.
pub fn demo_player(account_id: u64) -> PlayerSummary {
    PlayerSummary {
        profile: Some(PlayerProfileInfo {
            account_id,
            personaname: Some("Demo Player".to_string()),
            avatarfull: None,
            profileurl: None,
            extra: Map::new(),
        }),
        rank_tier: Some(55),
        leaderboard_rank: None,
        extra: Map::new(),
    }
}

pub fn demo_win_loss() -> WinLoss {
    WinLoss { win: 52, lose: 48 }
}

/// Demo search hits whose names contain `query`; all of them when nothing matches.
pub fn demo_search_results(query: &str) -> Vec<PlayerSearchResult> {
    let all = [
        (DEMO_ACCOUNT_ID, "Demo Player"),
        (DEMO_ACCOUNT_ID + 1, "Demo Carry"),
        (DEMO_ACCOUNT_ID + 2, "Demo Support"),
    ];
    let needle = query.trim().to_lowercase();

    let hits: Vec<_> = all
        .iter()
        .filter(|(_, name)| needle.is_empty() || name.to_lowercase().contains(&needle))
        .collect();
    let chosen = if hits.is_empty() { all.iter().collect() } else { hits };

    chosen
        .into_iter()
        .map(|(account_id, name)| PlayerSearchResult {
            account_id: *account_id,
            personaname: Some(name.to_string()),
            avatarfull: None,
            last_match_time: None,
            similarity: None,
        })
        .collect()
}
