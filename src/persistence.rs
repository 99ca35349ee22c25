//! Storage abstractions shared by the structured and flat tiers.
//!
//! [`PersistenceBackend`] covers user-owned data, [`OfflineStore`] covers
//! network-side data (cached upstream bodies, cache metadata, the retry
//! queue). [`StructuredStore`](crate::local_db_state::StructuredStore) and
//! [`FlatStore`](crate::flat_store::FlatStore) implement both.
//! [`FallbackPersistence`] composes the two tiers for user data.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value as JsonValue;

use crate::cache_manager::CacheMetadata;
use crate::error::{CompanionError, Result};
use crate::local_db_model::{
    CachedMatch, CustomBuild, ExportSnapshot, FavoriteHero, FavoriteItem, UserProfile,
    MAX_CACHED_MATCHES,
};
use crate::retry_queue::FailedRequest;

/// User-owned data: profile, favorites, builds, match cache, settings.
///
/// Every call is one atomic unit on the implementing store; there is no
/// transaction spanning two calls.
pub trait PersistenceBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Profile by steam id, or the first stored profile when `steam_id` is `None`.
    fn get_profile(&self, steam_id: Option<&str>) -> Result<Option<UserProfile>>;
    fn save_profile(&self, profile: &UserProfile) -> Result<()>;
    fn delete_profile(&self, steam_id: &str) -> Result<bool>;

    /// Returns the entry evicted to stay under the cap, if any.
    fn add_favorite_hero(&self, user_id: &str, hero: FavoriteHero) -> Result<Option<FavoriteHero>>;
    fn remove_favorite_hero(&self, user_id: &str, hero_id: u32) -> Result<bool>;
    fn get_favorite_heroes(&self, user_id: &str) -> Result<Vec<FavoriteHero>>;

    fn add_favorite_item(&self, user_id: &str, item: FavoriteItem) -> Result<Option<FavoriteItem>>;
    fn remove_favorite_item(&self, user_id: &str, item_id: u32) -> Result<bool>;
    fn get_favorite_items(&self, user_id: &str) -> Result<Vec<FavoriteItem>>;

    fn save_custom_build(&self, user_id: &str, build: CustomBuild) -> Result<CustomBuild>;
    fn get_custom_builds(&self, user_id: &str, hero_id: Option<u32>) -> Result<Vec<CustomBuild>>;
    fn delete_custom_build(&self, build_id: &str) -> Result<bool>;

    fn cache_match(&self, user_id: &str, entry: CachedMatch) -> Result<()>;
    /// Newest first by `cached_at`.
    fn get_cached_matches(&self, user_id: &str, limit: usize) -> Result<Vec<CachedMatch>>;
    /// Keeps the `keep` newest matches and returns how many were removed.
    fn clear_old_matches(&self, user_id: &str, keep: usize) -> Result<usize>;

    fn get_setting(&self, key: &str) -> Result<Option<JsonValue>>;
    fn set_setting(&self, key: &str, value: &JsonValue) -> Result<()>;
    fn delete_setting(&self, key: &str) -> Result<bool>;
    fn list_settings(&self) -> Result<BTreeMap<String, JsonValue>>;

    fn health_check(&self) -> Result<()>;
    fn clear_all(&self) -> Result<()>;

    /// Snapshot of the resident profile and everything keyed to it.
    fn export_data(&self) -> Result<ExportSnapshot> {
        let mut snapshot = ExportSnapshot::empty();
        snapshot.settings = self.list_settings()?;

        if let Some(profile) = self.get_profile(None)? {
            let user_id = profile.steam_id.clone();
            snapshot.favorite_heroes = self.get_favorite_heroes(&user_id)?;
            snapshot.favorite_items = self.get_favorite_items(&user_id)?;
            snapshot.custom_builds = self.get_custom_builds(&user_id, None)?;
            snapshot.cached_matches = self.get_cached_matches(&user_id, MAX_CACHED_MATCHES)?;
            snapshot.profile = Some(profile);
        }

        Ok(snapshot)
    }

    /// Loads a snapshot produced by [`PersistenceBackend::export_data`].
    ///
    /// Entries are upserted; nothing already stored is removed.
    fn import_data(&self, snapshot: &ExportSnapshot) -> Result<()> {
        snapshot.validate()?;

        let user_id = snapshot.profile.as_ref().map(|p| p.steam_id.clone());
        let has_user_rows = !snapshot.favorite_heroes.is_empty()
            || !snapshot.favorite_items.is_empty()
            || !snapshot.custom_builds.is_empty()
            || !snapshot.cached_matches.is_empty();

        match (&snapshot.profile, user_id) {
            (Some(profile), Some(user_id)) => {
                self.save_profile(profile)?;
                for hero in &snapshot.favorite_heroes {
                    self.add_favorite_hero(&user_id, hero.clone())?;
                }
                for item in &snapshot.favorite_items {
                    self.add_favorite_item(&user_id, item.clone())?;
                }
                for build in &snapshot.custom_builds {
                    self.save_custom_build(&user_id, build.clone())?;
                }
                // Oldest first so the ring buffer ends up newest first.
                for entry in snapshot.cached_matches.iter().rev() {
                    self.cache_match(&user_id, entry.clone())?;
                }
            }
            _ if has_user_rows => {
                return Err(CompanionError::Validation(
                    "snapshot has favorites, builds or matches but no profile".to_string(),
                ))
            }
            _ => {}
        }

        for (key, value) in &snapshot.settings {
            self.set_setting(key, value)?;
        }

        info!(
            "Imported snapshot v{} exported at {} into {}",
            snapshot.version,
            snapshot.exported_at,
            self.backend_name()
        );
        Ok(())
    }
}

/// Network-side data used by the cache manager and the retry queue.
pub trait OfflineStore: Send + Sync {
    fn put_heroes(&self, heroes: &[JsonValue]) -> Result<()>;
    fn get_heroes(&self) -> Result<Vec<JsonValue>>;

    fn put_player(&self, account_id: u64, body: &JsonValue) -> Result<()>;
    fn get_player(&self, account_id: u64) -> Result<Option<JsonValue>>;

    fn put_match_detail(&self, match_id: u64, body: &JsonValue) -> Result<()>;
    fn get_match_detail(&self, match_id: u64) -> Result<Option<JsonValue>>;

    /// Bodies of URLs with no dedicated collection, keyed by cache key.
    fn put_response(&self, key: &str, body: &JsonValue) -> Result<()>;
    fn get_response(&self, key: &str) -> Result<Option<JsonValue>>;

    fn put_metadata(&self, meta: &CacheMetadata) -> Result<()>;
    fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>>;
    fn delete_expired_metadata(&self, now_ms: i64) -> Result<usize>;

    /// Stores the row under a fresh id and returns it with the id filled in.
    fn insert_failed_request(&self, request: FailedRequest) -> Result<FailedRequest>;
    /// Oldest first.
    fn list_failed_requests(&self) -> Result<Vec<FailedRequest>>;
    fn update_failed_request(&self, request: &FailedRequest) -> Result<()>;
    fn delete_failed_request(&self, id: u64) -> Result<bool>;
}

/// Structured tier first, flat tier as mirror and fallback.
///
/// With a primary, reads go to it and writes go to both; mirror failures are
/// logged and swallowed. A profile the primary does not have is read from the
/// mirror and copied forward together with its favorites, builds and match
/// cache. Without a primary the mirror is the only store and its errors
/// propagate.
pub struct FallbackPersistence {
    primary: Option<Arc<dyn PersistenceBackend>>,
    mirror: Arc<dyn PersistenceBackend>,
}

impl FallbackPersistence {
    pub fn new(
        primary: Option<Arc<dyn PersistenceBackend>>,
        mirror: Arc<dyn PersistenceBackend>,
    ) -> Self {
        match &primary {
            Some(p) => debug!(
                "Persistence: {} with {} mirror",
                p.backend_name(),
                mirror.backend_name()
            ),
            None => warn!(
                "Persistence: structured tier unavailable, using {} only",
                mirror.backend_name()
            ),
        }
        Self { primary, mirror }
    }

    /// Brings the primary up to date with what was written while only the
    /// mirror was usable.
    ///
    /// Runs when the mirror holds a profile the primary lacks, or a copy of
    /// the same profile with a later `updated_at`. Returns whether anything
    /// was migrated.
    pub fn reconcile(&self) -> Result<bool> {
        let Some(primary) = &self.primary else {
            return Ok(false);
        };
        let Some(mirrored) = self.mirror.get_profile(None)? else {
            return Ok(false);
        };

        let current = primary.get_profile(Some(&mirrored.steam_id))?;
        if current.is_some_and(|p| p.updated_at >= mirrored.updated_at) {
            return Ok(false);
        }
        self.migrate(primary.as_ref(), &mirrored)?;
        Ok(true)
    }

    /// Makes the primary hold `profile` and exactly the mirror's rows for it.
    fn migrate(&self, primary: &dyn PersistenceBackend, profile: &UserProfile) -> Result<()> {
        let user_id = profile.steam_id.as_str();
        if let Some(resident) = primary.get_profile(None)? {
            if resident.steam_id != user_id {
                primary.delete_profile(&resident.steam_id)?;
            }
        }
        primary.save_profile(profile)?;

        let heroes = self.mirror.get_favorite_heroes(user_id)?;
        for stale in primary.get_favorite_heroes(user_id)? {
            if !heroes.iter().any(|h| h.id == stale.id) {
                primary.remove_favorite_hero(user_id, stale.id)?;
            }
        }
        for hero in &heroes {
            primary.add_favorite_hero(user_id, hero.clone())?;
        }

        let items = self.mirror.get_favorite_items(user_id)?;
        for stale in primary.get_favorite_items(user_id)? {
            if !items.iter().any(|i| i.id == stale.id) {
                primary.remove_favorite_item(user_id, stale.id)?;
            }
        }
        for item in &items {
            primary.add_favorite_item(user_id, item.clone())?;
        }

        let builds = self.mirror.get_custom_builds(user_id, None)?;
        for stale in primary.get_custom_builds(user_id, None)? {
            if !builds.iter().any(|b| b.id == stale.id) {
                primary.delete_custom_build(&stale.id)?;
            }
        }
        for build in &builds {
            primary.save_custom_build(user_id, build.clone())?;
        }

        let matches = self.mirror.get_cached_matches(user_id, MAX_CACHED_MATCHES)?;
        primary.clear_old_matches(user_id, 0)?;
        for entry in matches.iter().rev() {
            primary.cache_match(user_id, entry.clone())?;
        }

        for (key, value) in self.mirror.list_settings()? {
            primary.set_setting(&key, &value)?;
        }

        info!(
            "Migrated profile {user_id} from {} into {}: {} heroes, {} items, {} builds, \
             {} matches",
            self.mirror.backend_name(),
            primary.backend_name(),
            heroes.len(),
            items.len(),
            builds.len(),
            matches.len()
        );
        Ok(())
    }

    fn write<T>(
        &self,
        op: &str,
        apply: impl Fn(&dyn PersistenceBackend) -> Result<T>,
    ) -> Result<T> {
        let Some(primary) = &self.primary else {
            return apply(self.mirror.as_ref());
        };

        let result = apply(primary.as_ref())?;
        if let Err(e) = apply(self.mirror.as_ref()) {
            warn!("Mirror write '{op}' to {} failed: {e}", self.mirror.backend_name());
        }
        Ok(result)
    }

    fn read<T>(
        &self,
        op: &str,
        apply: impl Fn(&dyn PersistenceBackend) -> Result<T>,
    ) -> Result<T> {
        let Some(primary) = &self.primary else {
            return apply(self.mirror.as_ref());
        };

        match apply(primary.as_ref()) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    "Read '{op}' from {} failed ({e}); serving from {}",
                    primary.backend_name(),
                    self.mirror.backend_name()
                );
                apply(self.mirror.as_ref())
            }
        }
    }
}

impl PersistenceBackend for FallbackPersistence {
    fn backend_name(&self) -> &'static str {
        match &self.primary {
            Some(primary) => primary.backend_name(),
            None => self.mirror.backend_name(),
        }
    }

    fn get_profile(&self, steam_id: Option<&str>) -> Result<Option<UserProfile>> {
        let Some(primary) = &self.primary else {
            return self.mirror.get_profile(steam_id);
        };

        match primary.get_profile(steam_id) {
            Ok(Some(profile)) => return Ok(Some(profile)),
            Ok(None) => {}
            Err(e) => warn!("Profile read from {} failed: {e}", primary.backend_name()),
        }

        let mirrored = self.mirror.get_profile(steam_id)?;
        if let Some(profile) = &mirrored {
            info!(
                "Profile {} found only in {}; copying forward",
                profile.steam_id,
                self.mirror.backend_name()
            );
            if let Err(e) = self.migrate(primary.as_ref(), profile) {
                warn!("Could not migrate profile {}: {e}", profile.steam_id);
            }
        }
        Ok(mirrored)
    }

    fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        profile.validate()?;
        self.write("save_profile", |b| b.save_profile(profile))
    }

    fn delete_profile(&self, steam_id: &str) -> Result<bool> {
        self.write("delete_profile", |b| b.delete_profile(steam_id))
    }

    fn add_favorite_hero(&self, user_id: &str, hero: FavoriteHero) -> Result<Option<FavoriteHero>> {
        self.write("add_favorite_hero", |b| b.add_favorite_hero(user_id, hero.clone()))
    }

    fn remove_favorite_hero(&self, user_id: &str, hero_id: u32) -> Result<bool> {
        self.write("remove_favorite_hero", |b| b.remove_favorite_hero(user_id, hero_id))
    }

    fn get_favorite_heroes(&self, user_id: &str) -> Result<Vec<FavoriteHero>> {
        self.read("get_favorite_heroes", |b| b.get_favorite_heroes(user_id))
    }

    fn add_favorite_item(&self, user_id: &str, item: FavoriteItem) -> Result<Option<FavoriteItem>> {
        self.write("add_favorite_item", |b| b.add_favorite_item(user_id, item.clone()))
    }

    fn remove_favorite_item(&self, user_id: &str, item_id: u32) -> Result<bool> {
        self.write("remove_favorite_item", |b| b.remove_favorite_item(user_id, item_id))
    }

    fn get_favorite_items(&self, user_id: &str) -> Result<Vec<FavoriteItem>> {
        self.read("get_favorite_items", |b| b.get_favorite_items(user_id))
    }

    fn save_custom_build(&self, user_id: &str, build: CustomBuild) -> Result<CustomBuild> {
        let Some(primary) = &self.primary else {
            return self.mirror.save_custom_build(user_id, build);
        };

        // The mirror gets the stamped build so both tiers share one id.
        let stored = primary.save_custom_build(user_id, build)?;
        if let Err(e) = self.mirror.save_custom_build(user_id, stored.clone()) {
            warn!("Mirror write 'save_custom_build' failed: {e}");
        }
        Ok(stored)
    }

    fn get_custom_builds(&self, user_id: &str, hero_id: Option<u32>) -> Result<Vec<CustomBuild>> {
        self.read("get_custom_builds", |b| b.get_custom_builds(user_id, hero_id))
    }

    fn delete_custom_build(&self, build_id: &str) -> Result<bool> {
        self.write("delete_custom_build", |b| b.delete_custom_build(build_id))
    }

    fn cache_match(&self, user_id: &str, entry: CachedMatch) -> Result<()> {
        self.write("cache_match", |b| b.cache_match(user_id, entry.clone()))
    }

    fn get_cached_matches(&self, user_id: &str, limit: usize) -> Result<Vec<CachedMatch>> {
        self.read("get_cached_matches", |b| b.get_cached_matches(user_id, limit))
    }

    fn clear_old_matches(&self, user_id: &str, keep: usize) -> Result<usize> {
        self.write("clear_old_matches", |b| b.clear_old_matches(user_id, keep))
    }

    fn get_setting(&self, key: &str) -> Result<Option<JsonValue>> {
        self.read("get_setting", |b| b.get_setting(key))
    }

    fn set_setting(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.write("set_setting", |b| b.set_setting(key, value))
    }

    fn delete_setting(&self, key: &str) -> Result<bool> {
        self.write("delete_setting", |b| b.delete_setting(key))
    }

    fn list_settings(&self) -> Result<BTreeMap<String, JsonValue>> {
        self.read("list_settings", |b| b.list_settings())
    }

    /// Health of the authoritative tier only.
    fn health_check(&self) -> Result<()> {
        match &self.primary {
            Some(primary) => primary.health_check(),
            None => self.mirror.health_check(),
        }
    }

    fn clear_all(&self) -> Result<()> {
        self.write("clear_all", |b| b.clear_all())?;
        debug!("Cleared all local data at {}", Utc::now());
        Ok(())
    }
}
