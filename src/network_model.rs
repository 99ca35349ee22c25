//! Records returned by the upstream stats API.
//!
//! Only the fields the companion reads are typed; everything else the API
//! sends is kept in `extra` so cached copies stay faithful to the original
//! response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Data handed to the UI together with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fetched<T> {
    pub data: T,
    /// Served from the local cache instead of the network.
    pub cached: bool,
    /// Built-in illustrative records; not real upstream data.
    pub is_demo: bool,
    /// Served from cache whose freshness window has already passed.
    pub stale: bool,
}

impl<T> Fetched<T> {
    pub fn live(data: T) -> Self {
        Self {
            data,
            cached: false,
            is_demo: false,
            stale: false,
        }
    }

    pub fn cached(data: T, fresh: bool) -> Self {
        Self {
            data,
            cached: true,
            is_demo: false,
            stale: !fresh,
        }
    }

    pub fn demo(data: T) -> Self {
        Self {
            data,
            cached: false,
            is_demo: true,
            stale: false,
        }
    }

    /// Keeps the provenance flags while converting the payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data: f(self.data),
            cached: self.cached,
            is_demo: self.is_demo,
            stale: self.stale,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeroStat {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub localized_name: String,
    #[serde(default)]
    pub primary_attr: Option<String>,
    #[serde(default)]
    pub attack_type: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerProfileInfo {
    pub account_id: u64,
    #[serde(default)]
    pub personaname: Option<String>,
    #[serde(default)]
    pub avatarfull: Option<String>,
    #[serde(default)]
    pub profileurl: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSummary {
    #[serde(default)]
    pub profile: Option<PlayerProfileInfo>,
    #[serde(default)]
    pub rank_tier: Option<u32>,
    #[serde(default)]
    pub leaderboard_rank: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinLoss {
    pub win: u32,
    pub lose: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecentMatch {
    pub match_id: u64,
    pub hero_id: u32,
    #[serde(default)]
    pub player_slot: u32,
    #[serde(default)]
    pub radiant_win: bool,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub kills: u32,
    #[serde(default)]
    pub deaths: u32,
    #[serde(default)]
    pub assists: u32,
    #[serde(default)]
    pub start_time: i64,
}

impl RecentMatch {
    /// Slots 0-127 play for Radiant, 128-255 for Dire.
    pub fn is_radiant(&self) -> bool {
        self.player_slot < 128
    }

    pub fn won(&self) -> bool {
        self.is_radiant() == self.radiant_win
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerSearchResult {
    pub account_id: u64,
    #[serde(default)]
    pub personaname: Option<String>,
    #[serde(default)]
    pub avatarfull: Option<String>,
    #[serde(default)]
    pub last_match_time: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
}

impl PlayerSearchResult {
    pub fn from_summary(summary: &PlayerSummary) -> Option<Self> {
        summary.profile.as_ref().map(|profile| Self {
            account_id: profile.account_id,
            personaname: profile.personaname.clone(),
            avatarfull: profile.avatarfull.clone(),
            last_match_time: None,
            similarity: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchDetail {
    pub match_id: u64,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub radiant_win: Option<bool>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}
