//! User-owned records persisted by the local stores.
//!
//! Everything in this module is plain data plus the list rules the stores
//! share: favorites are unique by id and capped with FIFO eviction, builds
//! are upserted by id, and the match cache is a newest-first ring buffer.
//! Both [`StructuredStore`](crate::local_db_state::StructuredStore) and
//! [`FlatStore`](crate::flat_store::FlatStore) call into these helpers so the
//! two tiers can never disagree on the rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CompanionError, Result};

/// Maximum number of favorite heroes kept per profile.
pub const MAX_FAVORITE_HEROES: usize = 10;
/// Maximum number of favorite items kept per profile.
pub const MAX_FAVORITE_ITEMS: usize = 20;
/// Capacity of the per-user match cache ring buffer.
pub const MAX_CACHED_MATCHES: usize = 50;
/// Current layout of [`Preferences`].
pub const PREFERENCES_VERSION: u32 = 1;
/// Format tag written into every [`ExportSnapshot`].
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Anything that lives in a capped, id-unique favorites list.
pub trait Favorite {
    fn favorite_id(&self) -> u32;
    fn date_added(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteHero {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "Utc::now")]
    pub date_added: DateTime<Utc>,
}

impl FavoriteHero {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            role: None,
            notes: String::new(),
            date_added: Utc::now(),
        }
    }
}

impl Favorite for FavoriteHero {
    fn favorite_id(&self) -> u32 {
        self.id
    }

    fn date_added(&self) -> DateTime<Utc> {
        self.date_added
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteItem {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "Utc::now")]
    pub date_added: DateTime<Utc>,
}

impl FavoriteItem {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            category: None,
            notes: String::new(),
            date_added: Utc::now(),
        }
    }
}

impl Favorite for FavoriteItem {
    fn favorite_id(&self) -> u32 {
        self.id
    }

    fn date_added(&self) -> DateTime<Utc> {
        self.date_added
    }
}

/// Inserts `entry`, replacing any entry with the same id.
///
/// When the list is already at `cap` after de-duplication, the entry with the
/// oldest `date_added` is evicted and returned. Ties go to the entry that was
/// inserted first.
pub fn upsert_favorite<T: Favorite>(list: &mut Vec<T>, entry: T, cap: usize) -> Option<T> {
    list.retain(|existing| existing.favorite_id() != entry.favorite_id());

    let mut evicted = None;
    if cap > 0 && list.len() >= cap {
        let oldest = list
            .iter()
            .enumerate()
            .min_by_key(|(_, fav)| fav.date_added())
            .map(|(index, _)| index);
        if let Some(index) = oldest {
            evicted = Some(list.remove(index));
        }
    }

    list.push(entry);
    evicted
}

/// Removes the favorite with `id`. Returns `true` when something was removed.
pub fn remove_favorite<T: Favorite>(list: &mut Vec<T>, id: u32) -> bool {
    let before = list.len();
    list.retain(|existing| existing.favorite_id() != id);
    list.len() != before
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomBuild {
    /// Generated by [`generate_build_id`] when left empty.
    #[serde(default)]
    pub id: String,
    pub hero_id: u32,
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default = "Utc::now")]
    pub date_created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub date_modified: DateTime<Utc>,
}

impl CustomBuild {
    pub fn new(hero_id: u32, name: impl Into<String>, items: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            hero_id,
            name: name.into(),
            items,
            description: String::new(),
            is_public: false,
            date_created: now,
            date_modified: now,
        }
    }

    /// Prepares this build for storage on top of `previous`, the version
    /// currently stored under the same id (if any).
    pub fn stamped(mut self, previous: Option<&CustomBuild>) -> Self {
        if self.id.trim().is_empty() {
            self.id = generate_build_id();
        }
        if let Some(previous) = previous {
            self.date_created = previous.date_created;
        }
        self.date_modified = Utc::now();
        self
    }
}

/// Timestamp plus a random suffix, e.g. `build_1718031234567_k3j9x2a1q`.
pub fn generate_build_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("build_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Upserts `build` by id and returns the stored version.
///
/// A missing id is generated. An existing build with the same id keeps its
/// `date_created`; `date_modified` is always refreshed.
pub fn upsert_build(list: &mut Vec<CustomBuild>, build: CustomBuild) -> CustomBuild {
    let position = list
        .iter()
        .position(|existing| !build.id.is_empty() && existing.id == build.id);

    match position {
        Some(index) => {
            let stored = build.stamped(Some(&list[index]));
            list[index] = stored.clone();
            stored
        }
        None => {
            let stored = build.stamped(None);
            list.push(stored.clone());
            stored
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchResult {
    Win,
    Loss,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Kda {
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
}

impl Kda {
    /// `(kills + assists) / max(deaths, 1)`
    pub fn ratio(&self) -> f64 {
        (f64::from(self.kills) + f64::from(self.assists)) / f64::from(self.deaths.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedMatch {
    pub match_id: u64,
    pub hero_id: u32,
    pub result: MatchResult,
    /// Seconds.
    pub duration: u32,
    #[serde(default)]
    pub kda: Kda,
    #[serde(default)]
    pub items: Vec<u32>,
    #[serde(default = "Utc::now")]
    pub cached_at: DateTime<Utc>,
}

/// Prepends `entry` to a newest-first match list.
///
/// Any prior entry for the same match id is dropped first. The list is then
/// re-sorted by `cachedAt` and truncated to `cap`, so the oldest entries go.
pub fn push_cached_match(list: &mut Vec<CachedMatch>, entry: CachedMatch, cap: usize) {
    list.retain(|existing| existing.match_id != entry.match_id);
    list.insert(0, entry);
    sort_matches_newest_first(list);
    list.truncate(cap);
}

/// Sorts newest first by `cached_at`.
pub fn sort_matches_newest_first(list: &mut [CachedMatch]) {
    list.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    #[serde(default = "enabled")]
    pub patch_notes: bool,
    #[serde(default = "enabled")]
    pub meta_changes: bool,
    #[serde(default)]
    pub match_reminders: bool,
}

fn enabled() -> bool {
    true
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            patch_notes: true,
            meta_changes: true,
            match_reminders: false,
        }
    }
}

/// Versioned user preferences.
///
/// Known settings are named fields; anything the UI stores that this version
/// does not know about goes into `extra` so older builds round-trip it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default = "preferences_version")]
    pub version: u32,
    #[serde(default)]
    pub skill_level: Option<SkillLevel>,
    #[serde(default)]
    pub playstyle: Option<String>,
    #[serde(default)]
    pub preferred_roles: Vec<String>,
    #[serde(default)]
    pub notifications: NotificationPreferences,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn preferences_version() -> u32 {
    PREFERENCES_VERSION
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: PREFERENCES_VERSION,
            skill_level: None,
            playstyle: None,
            preferred_roles: Vec::new(),
            notifications: NotificationPreferences::default(),
            extra: BTreeMap::new(),
        }
    }
}

/// Run of identical results counted back from the most recent match.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Streak {
    pub result: Option<MatchResult>,
    pub length: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatistics {
    pub total_matches: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub average_kda: f64,
    pub current_streak: Streak,
    pub longest_win_streak: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PlayerStatistics {
    /// Aggregates a match history; order of `matches` does not matter.
    pub fn from_matches(matches: &[CachedMatch]) -> Self {
        let mut ordered = matches.to_vec();
        sort_matches_newest_first(&mut ordered);

        let total = ordered.len() as u32;
        let wins = ordered
            .iter()
            .filter(|m| m.result == MatchResult::Win)
            .count() as u32;

        let mut current_streak = Streak::default();
        if let Some(latest) = ordered.first() {
            let length = ordered
                .iter()
                .take_while(|m| m.result == latest.result)
                .count() as u32;
            current_streak = Streak {
                result: Some(latest.result),
                length,
            };
        }

        let mut longest_win_streak = 0;
        let mut run = 0;
        for m in ordered.iter().rev() {
            if m.result == MatchResult::Win {
                run += 1;
                longest_win_streak = longest_win_streak.max(run);
            } else {
                run = 0;
            }
        }

        let (win_rate, average_kda) = if total == 0 {
            (0.0, 0.0)
        } else {
            let kda_sum: f64 = ordered.iter().map(|m| m.kda.ratio()).sum();
            (
                f64::from(wins) / f64::from(total) * 100.0,
                kda_sum / f64::from(total),
            )
        };

        Self {
            total_matches: total,
            wins,
            losses: total - wins,
            win_rate,
            average_kda,
            current_streak,
            longest_win_streak,
            last_updated: Some(Utc::now()),
        }
    }
}

/// The single resident user profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub steam_id: String,
    pub persona_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub favorite_heroes: Vec<FavoriteHero>,
    #[serde(default)]
    pub favorite_items: Vec<FavoriteItem>,
    #[serde(default)]
    pub custom_builds: Vec<CustomBuild>,
    #[serde(default)]
    pub statistics: PlayerStatistics,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(steam_id: impl Into<String>, persona_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            steam_id: steam_id.into(),
            persona_name: persona_name.into(),
            avatar: None,
            preferences: Preferences::default(),
            favorite_heroes: Vec::new(),
            favorite_items: Vec::new(),
            custom_builds: Vec::new(),
            statistics: PlayerStatistics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.steam_id.trim().is_empty() {
            return Err(CompanionError::Validation(
                "profile steamId must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Shallow merge: every field present in `update` replaces the current one.
    pub fn apply(&mut self, update: ProfileUpdate) {
        if let Some(name) = update.persona_name {
            self.persona_name = name;
        }
        if let Some(avatar) = update.avatar {
            self.avatar = Some(avatar);
        }
        if let Some(preferences) = update.preferences {
            self.preferences = preferences;
        }
        if let Some(statistics) = update.statistics {
            self.statistics = statistics;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn add_favorite_hero(&mut self, hero: FavoriteHero) -> Option<FavoriteHero> {
        upsert_favorite(&mut self.favorite_heroes, hero, MAX_FAVORITE_HEROES)
    }

    pub fn remove_favorite_hero(&mut self, hero_id: u32) -> bool {
        remove_favorite(&mut self.favorite_heroes, hero_id)
    }

    pub fn add_favorite_item(&mut self, item: FavoriteItem) -> Option<FavoriteItem> {
        upsert_favorite(&mut self.favorite_items, item, MAX_FAVORITE_ITEMS)
    }

    pub fn remove_favorite_item(&mut self, item_id: u32) -> bool {
        remove_favorite(&mut self.favorite_items, item_id)
    }

    /// Stores an already stamped build, replacing the one with the same id.
    pub fn put_build(&mut self, build: CustomBuild) {
        match self.custom_builds.iter_mut().find(|b| b.id == build.id) {
            Some(existing) => *existing = build,
            None => self.custom_builds.push(build),
        }
    }

    pub fn delete_build(&mut self, build_id: &str) -> bool {
        let before = self.custom_builds.len();
        self.custom_builds.retain(|b| b.id != build_id);
        self.custom_builds.len() != before
    }

    pub fn builds_for_hero(&self, hero_id: Option<u32>) -> Vec<CustomBuild> {
        self.custom_builds
            .iter()
            .filter(|b| hero_id.map_or(true, |id| b.hero_id == id))
            .cloned()
            .collect()
    }
}

/// Partial profile update; `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub persona_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
    #[serde(default)]
    pub statistics: Option<PlayerStatistics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    pub key: String,
    pub value: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// Whole-profile snapshot produced by export and accepted by import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
    #[serde(default)]
    pub favorite_heroes: Vec<FavoriteHero>,
    #[serde(default)]
    pub favorite_items: Vec<FavoriteItem>,
    #[serde(default)]
    pub custom_builds: Vec<CustomBuild>,
    #[serde(default)]
    pub cached_matches: Vec<CachedMatch>,
    #[serde(default)]
    pub settings: BTreeMap<String, JsonValue>,
}

impl ExportSnapshot {
    pub fn empty() -> Self {
        Self {
            version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            profile: None,
            favorite_heroes: Vec::new(),
            favorite_items: Vec::new(),
            custom_builds: Vec::new(),
            cached_matches: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Only snapshots of the same major format version are accepted.
    pub fn validate(&self) -> Result<()> {
        let major = EXPORT_FORMAT_VERSION.split('.').next().unwrap_or("1");
        if self.version.split('.').next() != Some(major) {
            return Err(CompanionError::Validation(format!(
                "unsupported export format version '{}'",
                self.version
            )));
        }
        if let Some(profile) = &self.profile {
            profile.validate()?;
        }
        Ok(())
    }
}
