//! Namespaced key/value store on plain JSON files.
//!
//! Every key is one file `<namespace>.<key>.json` holding an envelope
//! `{data, timestamp, version}`. Collections are stored as whole blobs and
//! rewritten on every change. The store is a mirror of the structured tier
//! and its only home when LMDB cannot be opened.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache_manager::CacheMetadata;
use crate::error::{CompanionError, Result};
use crate::local_db_model::{
    push_cached_match, remove_favorite, sort_matches_newest_first, upsert_build, upsert_favorite,
    CachedMatch, CustomBuild, FavoriteHero, FavoriteItem, SettingRecord, UserProfile,
    MAX_CACHED_MATCHES, MAX_FAVORITE_HEROES, MAX_FAVORITE_ITEMS,
};
use crate::persistence::{OfflineStore, PersistenceBackend};
use crate::retry_queue::FailedRequest;

/// Envelope format tag.
pub const FLAT_FORMAT_VERSION: &str = "1.0";
/// Byte budget over all files of a namespace.
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Matches kept per user when cleanup runs.
const CLEANUP_KEEP_MATCHES: usize = 25;
/// Settings untouched for this long are purged by cleanup.
const STALE_SETTING_DAYS: i64 = 7;
const PROBE_KEY: &str = "__probe__";

const KEY_PROFILE: &str = "user_profile";
const KEY_FAVORITE_HEROES: &str = "favorite_heroes";
const KEY_FAVORITE_ITEMS: &str = "favorite_items";
const KEY_CUSTOM_BUILDS: &str = "custom_builds";
const KEY_MATCH_CACHE: &str = "match_cache";
const KEY_SETTINGS: &str = "settings";
const KEY_HERO_CACHE: &str = "hero_cache";
const KEY_PLAYER_CACHE: &str = "player_cache";
const KEY_MATCH_DETAIL_CACHE: &str = "match_detail_cache";
const KEY_RESPONSE_CACHE: &str = "response_cache";
const KEY_CACHE_METADATA: &str = "cache_metadata";
const KEY_FAILED_REQUESTS: &str = "failed_requests";
const KEY_FAILED_REQUEST_SEQ: &str = "failed_requests_seq";

type PerUser<T> = BTreeMap<String, Vec<T>>;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    data: T,
    timestamp: i64,
    version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub keys: usize,
}

pub struct FlatStore {
    dir: PathBuf,
    namespace: String,
    quota_bytes: u64,
    available: bool,
    write_lock: Mutex<()>,
}

impl FlatStore {
    /// Creates the store and probes the directory with a write and a delete.
    ///
    /// A failed probe leaves the store in the unavailable state instead of
    /// returning an error.
    pub fn new(dir: impl AsRef<Path>, namespace: impl Into<String>, quota_bytes: u64) -> Self {
        let mut store = Self {
            dir: dir.as_ref().to_path_buf(),
            namespace: namespace.into(),
            quota_bytes,
            available: false,
            write_lock: Mutex::new(()),
        };
        store.available = match store.probe() {
            Ok(()) => true,
            Err(e) => {
                warn!("Flat store at {} is unavailable: {e}", store.dir.display());
                false
            }
        };
        store
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stores `value` under `key`. Returns `false` without writing when the
    /// store is unavailable.
    ///
    /// A write that would exceed the quota triggers one cleanup pass and one
    /// retry before failing with [`CompanionError::QuotaExceeded`].
    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool> {
        if !self.available {
            return Ok(false);
        }
        let _guard = self.lock();
        self.write_checked(key, value)?;
        Ok(true)
    }

    /// The stored `data` for `key`, or `default` when missing, corrupt or unavailable.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.read_data(key).unwrap_or(default)
    }

    pub fn remove_item(&self, key: &str) -> bool {
        if !self.available {
            return false;
        }
        let _guard = self.lock();
        fs::remove_file(self.file_path(key)).is_ok()
    }

    pub fn keys(&self) -> Vec<String> {
        if !self.available {
            return Vec::new();
        }
        self.namespace_files()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key != PROBE_KEY)
            .collect()
    }

    /// Removes every key of this namespace and returns how many were removed.
    pub fn clear(&self) -> usize {
        if !self.available {
            return 0;
        }
        let _guard = self.lock();
        let mut removed = 0;
        for (key, _) in self.namespace_files() {
            if fs::remove_file(self.file_path(&key)).is_ok() {
                removed += 1;
            }
        }
        info!("Cleared {removed} flat keys in namespace {}", self.namespace);
        removed
    }

    pub fn get_storage_usage(&self) -> StorageUsage {
        let files = if self.available {
            self.namespace_files()
        } else {
            Vec::new()
        };
        StorageUsage {
            used_bytes: files.iter().map(|(_, size)| size).sum(),
            quota_bytes: self.quota_bytes,
            keys: files.len(),
        }
    }

    /// Frees space by trimming each user's match cache to its newest entries
    /// and purging settings that have not been touched recently.
    ///
    /// Returns the number of entries dropped.
    pub fn cleanup(&self) -> Result<usize> {
        if !self.available {
            return Ok(0);
        }
        let _guard = self.lock();
        self.cleanup_unlocked()
    }

    fn cleanup_unlocked(&self) -> Result<usize> {
        let mut matches: PerUser<CachedMatch> = self.load(KEY_MATCH_CACHE);
        let trimmed_matches = trim_match_cache(&mut matches);
        if trimmed_matches > 0 {
            self.write_raw(KEY_MATCH_CACHE, &matches)?;
        }

        let mut settings: BTreeMap<String, SettingRecord> = self.load(KEY_SETTINGS);
        let purged_settings = purge_stale_settings(&mut settings);
        if purged_settings > 0 {
            self.write_raw(KEY_SETTINGS, &settings)?;
        }

        let dropped = trimmed_matches + purged_settings;

        info!("Flat store cleanup dropped {dropped} entries");
        Ok(dropped)
    }

    fn probe(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(PROBE_KEY);
        fs::write(&path, b"{}")?;
        fs::remove_file(&path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(CompanionError::StorageUnavailable(format!(
                "flat store at {} is not writable",
                self.dir.display()
            )))
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{key}.json", self.namespace))
    }

    /// `(key, size in bytes)` for every file of this namespace.
    fn namespace_files(&self) -> Vec<(String, u64)> {
        let prefix = format!("{}.", self.namespace);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let key = name.strip_prefix(&prefix)?.strip_suffix(".json")?.to_string();
                let size = entry.metadata().ok()?.len();
                Some((key, size))
            })
            .collect()
    }

    fn read_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.available {
            return None;
        }
        let bytes = fs::read(self.file_path(key)).ok()?;
        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => Some(envelope.data),
            Err(e) => {
                debug!("Ignoring corrupt flat entry '{key}': {e}");
                None
            }
        }
    }

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Envelope {
            data: value,
            timestamp: Utc::now().timestamp_millis(),
            version: FLAT_FORMAT_VERSION.to_string(),
        })?)
    }

    fn projected_usage(&self, key: &str, new_len: u64) -> u64 {
        let current_len = fs::metadata(self.file_path(key)).map(|m| m.len()).unwrap_or(0);
        let used: u64 = self.namespace_files().iter().map(|(_, size)| size).sum();
        used.saturating_sub(current_len) + new_len
    }

    fn write_checked<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let mut bytes = Self::encode(value)?;

        if self.projected_usage(key, bytes.len() as u64) > self.quota_bytes {
            warn!("Flat store quota reached writing '{key}'; running cleanup");
            self.cleanup_unlocked()?;
            // The pending blob replaces the file cleanup just rewrote.
            if let Some(trimmed) = Self::cleaned(key, value)? {
                bytes = trimmed;
            }
            let projected = self.projected_usage(key, bytes.len() as u64);
            if projected > self.quota_bytes {
                return Err(CompanionError::QuotaExceeded(format!(
                    "'{key}' needs {projected} of {} bytes",
                    self.quota_bytes
                )));
            }
        }

        self.write_bytes(key, &bytes)
    }

    /// `value` encoded after the cleanup rule for `key`, if cleanup has one.
    fn cleaned<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Option<Vec<u8>>> {
        match key {
            KEY_MATCH_CACHE => {
                let mut matches: PerUser<CachedMatch> =
                    serde_json::from_value(serde_json::to_value(value)?)?;
                trim_match_cache(&mut matches);
                Ok(Some(Self::encode(&matches)?))
            }
            KEY_SETTINGS => {
                let mut settings: BTreeMap<String, SettingRecord> =
                    serde_json::from_value(serde_json::to_value(value)?)?;
                purge_stale_settings(&mut settings);
                Ok(Some(Self::encode(&settings)?))
            }
            _ => Ok(None),
        }
    }

    /// Writes without the quota check; used by cleanup, which only shrinks data.
    fn write_raw<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = Self::encode(value)?;
        self.write_bytes(key, &bytes)
    }

    fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.file_path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read-modify-write of one blob under the write lock.
    fn update<T, R>(&self, key: &str, mutate: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        self.ensure_available()?;
        let _guard = self.lock();
        let mut value: T = self.read_data(key).unwrap_or_default();
        let result = mutate(&mut value);
        self.write_checked(key, &value)?;
        Ok(result)
    }

    fn load<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.read_data(key).unwrap_or_default()
    }
}

/// Trims every user's matches to the newest [`CLEANUP_KEEP_MATCHES`].
fn trim_match_cache(matches: &mut PerUser<CachedMatch>) -> usize {
    let mut trimmed = 0;
    for list in matches.values_mut() {
        if list.len() > CLEANUP_KEEP_MATCHES {
            trimmed += list.len() - CLEANUP_KEEP_MATCHES;
            sort_matches_newest_first(list);
            list.truncate(CLEANUP_KEEP_MATCHES);
        }
    }
    trimmed
}

fn purge_stale_settings(settings: &mut BTreeMap<String, SettingRecord>) -> usize {
    let cutoff = Utc::now() - ChronoDuration::days(STALE_SETTING_DAYS);
    let before = settings.len();
    settings.retain(|_, record| record.updated_at >= cutoff);
    before - settings.len()
}

impl PersistenceBackend for FlatStore {
    fn backend_name(&self) -> &'static str {
        "flat"
    }

    fn get_profile(&self, steam_id: Option<&str>) -> Result<Option<UserProfile>> {
        let profile: Option<UserProfile> = self.read_data(KEY_PROFILE);
        Ok(profile.filter(|p| steam_id.map_or(true, |id| p.steam_id == id)))
    }

    /// Overwrites whatever profile is resident; only one is kept.
    fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        profile.validate()?;
        self.ensure_available()?;
        let _guard = self.lock();
        self.write_checked(KEY_PROFILE, profile)
    }

    fn delete_profile(&self, steam_id: &str) -> Result<bool> {
        match self.get_profile(Some(steam_id))? {
            Some(_) => Ok(self.remove_item(KEY_PROFILE)),
            None => Ok(false),
        }
    }

    fn add_favorite_hero(&self, user_id: &str, hero: FavoriteHero) -> Result<Option<FavoriteHero>> {
        self.update(KEY_FAVORITE_HEROES, |all: &mut PerUser<FavoriteHero>| {
            upsert_favorite(
                all.entry(user_id.to_string()).or_default(),
                hero,
                MAX_FAVORITE_HEROES,
            )
        })
    }

    fn remove_favorite_hero(&self, user_id: &str, hero_id: u32) -> Result<bool> {
        self.update(KEY_FAVORITE_HEROES, |all: &mut PerUser<FavoriteHero>| {
            all.get_mut(user_id)
                .map_or(false, |list| remove_favorite(list, hero_id))
        })
    }

    fn get_favorite_heroes(&self, user_id: &str) -> Result<Vec<FavoriteHero>> {
        let mut all: PerUser<FavoriteHero> = self.load(KEY_FAVORITE_HEROES);
        Ok(all.remove(user_id).unwrap_or_default())
    }

    fn add_favorite_item(&self, user_id: &str, item: FavoriteItem) -> Result<Option<FavoriteItem>> {
        self.update(KEY_FAVORITE_ITEMS, |all: &mut PerUser<FavoriteItem>| {
            upsert_favorite(
                all.entry(user_id.to_string()).or_default(),
                item,
                MAX_FAVORITE_ITEMS,
            )
        })
    }

    fn remove_favorite_item(&self, user_id: &str, item_id: u32) -> Result<bool> {
        self.update(KEY_FAVORITE_ITEMS, |all: &mut PerUser<FavoriteItem>| {
            all.get_mut(user_id)
                .map_or(false, |list| remove_favorite(list, item_id))
        })
    }

    fn get_favorite_items(&self, user_id: &str) -> Result<Vec<FavoriteItem>> {
        let mut all: PerUser<FavoriteItem> = self.load(KEY_FAVORITE_ITEMS);
        Ok(all.remove(user_id).unwrap_or_default())
    }

    fn save_custom_build(&self, user_id: &str, build: CustomBuild) -> Result<CustomBuild> {
        self.update(KEY_CUSTOM_BUILDS, |all: &mut PerUser<CustomBuild>| {
            upsert_build(all.entry(user_id.to_string()).or_default(), build)
        })
    }

    fn get_custom_builds(&self, user_id: &str, hero_id: Option<u32>) -> Result<Vec<CustomBuild>> {
        let mut all: PerUser<CustomBuild> = self.load(KEY_CUSTOM_BUILDS);
        let mut builds = all.remove(user_id).unwrap_or_default();
        if let Some(hero_id) = hero_id {
            builds.retain(|b| b.hero_id == hero_id);
        }
        builds.sort_by(|a, b| a.date_created.cmp(&b.date_created));
        Ok(builds)
    }

    fn delete_custom_build(&self, build_id: &str) -> Result<bool> {
        self.update(KEY_CUSTOM_BUILDS, |all: &mut PerUser<CustomBuild>| {
            let mut removed = false;
            for list in all.values_mut() {
                let before = list.len();
                list.retain(|b| b.id != build_id);
                removed |= list.len() != before;
            }
            removed
        })
    }

    fn cache_match(&self, user_id: &str, entry: CachedMatch) -> Result<()> {
        self.update(KEY_MATCH_CACHE, |all: &mut PerUser<CachedMatch>| {
            push_cached_match(
                all.entry(user_id.to_string()).or_default(),
                entry,
                MAX_CACHED_MATCHES,
            );
        })
    }

    fn get_cached_matches(&self, user_id: &str, limit: usize) -> Result<Vec<CachedMatch>> {
        let mut all: PerUser<CachedMatch> = self.load(KEY_MATCH_CACHE);
        let mut matches = all.remove(user_id).unwrap_or_default();
        sort_matches_newest_first(&mut matches);
        matches.truncate(limit);
        Ok(matches)
    }

    fn clear_old_matches(&self, user_id: &str, keep: usize) -> Result<usize> {
        self.update(KEY_MATCH_CACHE, |all: &mut PerUser<CachedMatch>| {
            all.get_mut(user_id).map_or(0, |list| {
                sort_matches_newest_first(list);
                let removed = list.len().saturating_sub(keep);
                list.truncate(keep);
                removed
            })
        })
    }

    fn get_setting(&self, key: &str) -> Result<Option<JsonValue>> {
        let mut all: BTreeMap<String, SettingRecord> = self.load(KEY_SETTINGS);
        Ok(all.remove(key).map(|record| record.value))
    }

    fn set_setting(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.update(KEY_SETTINGS, |all: &mut BTreeMap<String, SettingRecord>| {
            all.insert(
                key.to_string(),
                SettingRecord {
                    key: key.to_string(),
                    value: value.clone(),
                    updated_at: Utc::now(),
                },
            );
        })
    }

    fn delete_setting(&self, key: &str) -> Result<bool> {
        self.update(KEY_SETTINGS, |all: &mut BTreeMap<String, SettingRecord>| {
            all.remove(key).is_some()
        })
    }

    fn list_settings(&self) -> Result<BTreeMap<String, JsonValue>> {
        let all: BTreeMap<String, SettingRecord> = self.load(KEY_SETTINGS);
        Ok(all.into_iter().map(|(key, record)| (key, record.value)).collect())
    }

    fn health_check(&self) -> Result<()> {
        self.ensure_available()?;
        self.probe()
    }

    fn clear_all(&self) -> Result<()> {
        self.ensure_available()?;
        self.clear();
        Ok(())
    }
}

impl OfflineStore for FlatStore {
    fn put_heroes(&self, heroes: &[JsonValue]) -> Result<()> {
        self.update(KEY_HERO_CACHE, |cache: &mut BTreeMap<u64, JsonValue>| {
            for hero in heroes {
                if let Some(id) = hero.get("id").and_then(JsonValue::as_u64) {
                    cache.insert(id, hero.clone());
                }
            }
        })
    }

    fn get_heroes(&self) -> Result<Vec<JsonValue>> {
        let cache: BTreeMap<u64, JsonValue> = self.load(KEY_HERO_CACHE);
        Ok(cache.into_values().collect())
    }

    fn put_player(&self, account_id: u64, body: &JsonValue) -> Result<()> {
        self.update(KEY_PLAYER_CACHE, |cache: &mut BTreeMap<u64, JsonValue>| {
            cache.insert(account_id, body.clone());
        })
    }

    fn get_player(&self, account_id: u64) -> Result<Option<JsonValue>> {
        let mut cache: BTreeMap<u64, JsonValue> = self.load(KEY_PLAYER_CACHE);
        Ok(cache.remove(&account_id))
    }

    fn put_match_detail(&self, match_id: u64, body: &JsonValue) -> Result<()> {
        self.update(KEY_MATCH_DETAIL_CACHE, |cache: &mut BTreeMap<u64, JsonValue>| {
            cache.insert(match_id, body.clone());
        })
    }

    fn get_match_detail(&self, match_id: u64) -> Result<Option<JsonValue>> {
        let mut cache: BTreeMap<u64, JsonValue> = self.load(KEY_MATCH_DETAIL_CACHE);
        Ok(cache.remove(&match_id))
    }

    fn put_response(&self, key: &str, body: &JsonValue) -> Result<()> {
        self.update(KEY_RESPONSE_CACHE, |cache: &mut BTreeMap<String, JsonValue>| {
            cache.insert(key.to_string(), body.clone());
        })
    }

    fn get_response(&self, key: &str) -> Result<Option<JsonValue>> {
        let mut cache: BTreeMap<String, JsonValue> = self.load(KEY_RESPONSE_CACHE);
        Ok(cache.remove(key))
    }

    fn put_metadata(&self, meta: &CacheMetadata) -> Result<()> {
        self.update(KEY_CACHE_METADATA, |rows: &mut BTreeMap<String, CacheMetadata>| {
            rows.insert(meta.key.clone(), meta.clone());
        })
    }

    fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        let mut rows: BTreeMap<String, CacheMetadata> = self.load(KEY_CACHE_METADATA);
        Ok(rows.remove(key))
    }

    fn delete_expired_metadata(&self, now_ms: i64) -> Result<usize> {
        self.update(KEY_CACHE_METADATA, |rows: &mut BTreeMap<String, CacheMetadata>| {
            let before = rows.len();
            rows.retain(|_, meta| !meta.is_expired_at(now_ms));
            before - rows.len()
        })
    }

    fn insert_failed_request(&self, mut request: FailedRequest) -> Result<FailedRequest> {
        self.ensure_available()?;
        let _guard = self.lock();
        let next_id = self.read_data::<u64>(KEY_FAILED_REQUEST_SEQ).unwrap_or(0) + 1;
        request.id = next_id;

        let mut rows: Vec<FailedRequest> = self.load(KEY_FAILED_REQUESTS);
        rows.push(request.clone());
        self.write_checked(KEY_FAILED_REQUESTS, &rows)?;
        self.write_checked(KEY_FAILED_REQUEST_SEQ, &next_id)?;
        Ok(request)
    }

    fn list_failed_requests(&self) -> Result<Vec<FailedRequest>> {
        let mut rows: Vec<FailedRequest> = self.load(KEY_FAILED_REQUESTS);
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    /// A row that is no longer stored stays deleted.
    fn update_failed_request(&self, request: &FailedRequest) -> Result<()> {
        self.update(KEY_FAILED_REQUESTS, |rows: &mut Vec<FailedRequest>| {
            if let Some(row) = rows.iter_mut().find(|r| r.id == request.id) {
                *row = request.clone();
            }
        })
    }

    fn delete_failed_request(&self, id: u64) -> Result<bool> {
        self.update(KEY_FAILED_REQUESTS, |rows: &mut Vec<FailedRequest>| {
            let before = rows.len();
            rows.retain(|r| r.id != id);
            rows.len() != before
        })
    }
}
