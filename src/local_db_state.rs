//! LMDB-backed structured store, the authoritative persistence tier.
//!
//! One named database per collection plus one per secondary index. Index
//! databases map a composite key (`user \x1f entity`) to the primary key of
//! the row, so lookups by (user, entity) never scan the row database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache_manager::CacheMetadata;
use crate::error::{CompanionError, Result};
use crate::local_db_model::{
    CachedMatch, CustomBuild, Favorite, FavoriteHero, FavoriteItem, SettingRecord, UserProfile,
    MAX_CACHED_MATCHES, MAX_FAVORITE_HEROES, MAX_FAVORITE_ITEMS,
};
use crate::persistence::{OfflineStore, PersistenceBackend};
use crate::retry_queue::FailedRequest;

/// Layout version recorded in the `meta` database.
pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

const MAX_DBS: u32 = 20;
const KEY_SEPARATOR: char = '\x1f';
const SCHEMA_VERSION_KEY: &str = "schema_version";
const HEALTH_SENTINEL_KEY: &str = "__health_check__";

/// A row database with the index that maps `user \x1f entity` to its rows.
#[derive(Clone, Copy)]
struct IndexedTable {
    rows: Database,
    index: Database,
    label: &'static str,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedRow<T> {
    user_id: String,
    entry: T,
}

pub struct StructuredStore {
    env: Environment,
    path: PathBuf,
    meta: Database,
    user_profiles: Database,
    hero_favorites: IndexedTable,
    item_favorites: IndexedTable,
    custom_builds: IndexedTable,
    match_cache: IndexedTable,
    settings: Database,
    hero_cache: Database,
    player_cache: Database,
    match_detail_cache: Database,
    response_cache: Database,
    cache_metadata: Database,
    failed_requests: Database,
}

impl StructuredStore {
    /// Opens (or creates) the environment at `path` and provisions the schema.
    ///
    /// Any failure to open the environment is reported as
    /// [`CompanionError::StorageUnavailable`].
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            CompanionError::StorageUnavailable(format!("cannot create {}: {e}", path.display()))
        })?;

        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_map_size(map_size)
            .open(path)
            .map_err(|e| {
                CompanionError::StorageUnavailable(format!("cannot open {}: {e}", path.display()))
            })?;

        let meta = env.create_db(Some("meta"), DatabaseFlags::empty())?;
        let recorded = read_schema_version(&env, meta)?;
        match recorded {
            None => info!("Provisioning structured store v{SCHEMA_VERSION} at {}", path.display()),
            Some(v) if v < SCHEMA_VERSION => {
                info!("Upgrading structured store from v{v} to v{SCHEMA_VERSION}")
            }
            Some(v) if v > SCHEMA_VERSION => warn!(
                "Structured store at {} is v{v}, newer than v{SCHEMA_VERSION}",
                path.display()
            ),
            Some(_) => debug!("Structured store v{SCHEMA_VERSION} at {}", path.display()),
        }

        let create = |name: &str| env.create_db(Some(name), DatabaseFlags::empty());
        let store = Self {
            path: path.to_path_buf(),
            meta,
            user_profiles: create("user_profiles")?,
            hero_favorites: IndexedTable {
                rows: create("hero_favorites")?,
                index: create("hero_favorites_by_user_hero")?,
                label: "hero_favorites",
            },
            item_favorites: IndexedTable {
                rows: create("item_favorites")?,
                index: create("item_favorites_by_user_item")?,
                label: "item_favorites",
            },
            custom_builds: IndexedTable {
                rows: create("custom_builds")?,
                index: create("custom_builds_by_user_hero")?,
                label: "custom_builds",
            },
            match_cache: IndexedTable {
                rows: create("match_cache")?,
                index: create("match_cache_by_user")?,
                label: "match_cache",
            },
            settings: create("settings")?,
            hero_cache: create("hero_cache")?,
            player_cache: create("player_cache")?,
            match_detail_cache: create("match_detail_cache")?,
            response_cache: create("response_cache")?,
            cache_metadata: create("cache_metadata")?,
            failed_requests: create("failed_requests")?,
            env,
        };

        if recorded.map_or(true, |v| v < SCHEMA_VERSION) {
            let mut txn = store.env.begin_rw_txn()?;
            txn.put(
                store.meta,
                &SCHEMA_VERSION_KEY,
                &SCHEMA_VERSION.to_be_bytes(),
                WriteFlags::empty(),
            )?;
            txn.commit()?;
        }

        Ok(store)
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        read_schema_version(&self.env, self.meta)
    }

    /// Flushes buffers to disk. The environment closes when the store is dropped.
    pub fn close(&self) -> Result<()> {
        self.env.sync(true)?;
        Ok(())
    }

    fn next_id(&self, txn: &mut RwTransaction<'_>, collection: &str) -> Result<u64> {
        let key = format!("seq:{collection}");
        let current = match txn.get(self.meta, &key) {
            Ok(bytes) => decode_u64(bytes)?,
            Err(lmdb::Error::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };
        let next = current + 1;
        txn.put(self.meta, &key, &next.to_be_bytes(), WriteFlags::empty())?;
        Ok(next)
    }

    fn add_favorite<T>(
        &self,
        table: IndexedTable,
        user_id: &str,
        entry: T,
        cap: usize,
    ) -> Result<Option<T>>
    where
        T: Favorite + Serialize + DeserializeOwned,
    {
        let mut txn = self.env.begin_rw_txn()?;

        let index_key = favorite_key(user_id, entry.favorite_id());
        if let Some(row_id) = get_row_id(&txn, table.index, index_key.as_bytes())? {
            delete_key(&mut txn, table.rows, &row_id.to_be_bytes())?;
            delete_key(&mut txn, table.index, index_key.as_bytes())?;
        }

        let mut rows: Vec<(u64, T)> = owned_rows(&txn, table, &user_prefix(user_id))?;
        let mut evicted = None;
        if cap > 0 && rows.len() >= cap {
            let oldest = rows
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, fav))| fav.date_added())
                .map(|(index, _)| index);
            if let Some(index) = oldest {
                let (row_id, fav) = rows.remove(index);
                delete_key(&mut txn, table.rows, &row_id.to_be_bytes())?;
                delete_key(
                    &mut txn,
                    table.index,
                    favorite_key(user_id, fav.favorite_id()).as_bytes(),
                )?;
                debug!("Evicted oldest {} entry {}", table.label, fav.favorite_id());
                evicted = Some(fav);
            }
        }

        let row_id = self.next_id(&mut txn, table.label)?;
        put_json(
            &mut txn,
            table.rows,
            &row_id.to_be_bytes(),
            &OwnedRow {
                user_id: user_id.to_string(),
                entry: &entry,
            },
        )?;
        txn.put(
            table.index,
            &index_key,
            &row_id.to_be_bytes(),
            WriteFlags::empty(),
        )?;
        txn.commit()?;
        Ok(evicted)
    }

    fn remove_favorite(&self, table: IndexedTable, user_id: &str, id: u32) -> Result<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let index_key = favorite_key(user_id, id);
        let Some(row_id) = get_row_id(&txn, table.index, index_key.as_bytes())? else {
            return Ok(false);
        };
        delete_key(&mut txn, table.rows, &row_id.to_be_bytes())?;
        delete_key(&mut txn, table.index, index_key.as_bytes())?;
        txn.commit()?;
        Ok(true)
    }

    fn favorites<T: DeserializeOwned>(&self, table: IndexedTable, user_id: &str) -> Result<Vec<T>> {
        let txn = self.env.begin_ro_txn()?;
        let rows: Vec<(u64, T)> = owned_rows(&txn, table, &user_prefix(user_id))?;
        Ok(rows.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Match rows of `user_id`, newest first.
    fn matches_newest_first<Txn: Transaction>(
        &self,
        txn: &Txn,
        user_id: &str,
    ) -> Result<Vec<(u64, CachedMatch)>> {
        let mut rows: Vec<(u64, CachedMatch)> =
            owned_rows(txn, self.match_cache, &user_prefix(user_id))?;
        rows.sort_by(|(a_id, a), (b_id, b)| {
            b.cached_at.cmp(&a.cached_at).then_with(|| b_id.cmp(a_id))
        });
        Ok(rows)
    }

    fn trim_matches(
        &self,
        txn: &mut RwTransaction<'_>,
        user_id: &str,
        keep: usize,
    ) -> Result<usize> {
        let rows = self.matches_newest_first(&*txn, user_id)?;
        let mut removed = 0;
        for (row_id, entry) in rows.into_iter().skip(keep) {
            delete_key(txn, self.match_cache.rows, &row_id.to_be_bytes())?;
            delete_key(
                txn,
                self.match_cache.index,
                match_key(user_id, entry.match_id).as_bytes(),
            )?;
            removed += 1;
        }
        Ok(removed)
    }

    fn put_setting_record(&self, record: &SettingRecord) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        put_json(&mut txn, self.settings, record.key.as_bytes(), record)?;
        txn.commit()?;
        Ok(())
    }

    fn put_value(&self, db: Database, key: &[u8], value: &impl Serialize) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        put_json(&mut txn, db, key, value)?;
        txn.commit()?;
        Ok(())
    }

    fn get_value<T: DeserializeOwned>(&self, db: Database, key: &[u8]) -> Result<Option<T>> {
        let txn = self.env.begin_ro_txn()?;
        get_json(&txn, db, key)
    }

    fn delete_value(&self, db: Database, key: &[u8]) -> Result<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = delete_key(&mut txn, db, key)?;
        txn.commit()?;
        Ok(removed)
    }
}

impl PersistenceBackend for StructuredStore {
    fn backend_name(&self) -> &'static str {
        "lmdb"
    }

    fn get_profile(&self, steam_id: Option<&str>) -> Result<Option<UserProfile>> {
        match steam_id {
            Some(id) => self.get_value(self.user_profiles, id.as_bytes()),
            None => {
                let txn = self.env.begin_ro_txn()?;
                let first = scan_prefix(&txn, self.user_profiles, b"")?.into_iter().next();
                match first {
                    Some((_, bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
                    None => Ok(None),
                }
            }
        }
    }

    fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        profile.validate()?;
        self.put_value(self.user_profiles, profile.steam_id.as_bytes(), profile)?;
        debug!("Saved profile {} to lmdb", profile.steam_id);
        Ok(())
    }

    fn delete_profile(&self, steam_id: &str) -> Result<bool> {
        self.delete_value(self.user_profiles, steam_id.as_bytes())
    }

    fn add_favorite_hero(&self, user_id: &str, hero: FavoriteHero) -> Result<Option<FavoriteHero>> {
        self.add_favorite(self.hero_favorites, user_id, hero, MAX_FAVORITE_HEROES)
    }

    fn remove_favorite_hero(&self, user_id: &str, hero_id: u32) -> Result<bool> {
        self.remove_favorite(self.hero_favorites, user_id, hero_id)
    }

    fn get_favorite_heroes(&self, user_id: &str) -> Result<Vec<FavoriteHero>> {
        self.favorites(self.hero_favorites, user_id)
    }

    fn add_favorite_item(&self, user_id: &str, item: FavoriteItem) -> Result<Option<FavoriteItem>> {
        self.add_favorite(self.item_favorites, user_id, item, MAX_FAVORITE_ITEMS)
    }

    fn remove_favorite_item(&self, user_id: &str, item_id: u32) -> Result<bool> {
        self.remove_favorite(self.item_favorites, user_id, item_id)
    }

    fn get_favorite_items(&self, user_id: &str) -> Result<Vec<FavoriteItem>> {
        self.favorites(self.item_favorites, user_id)
    }

    fn save_custom_build(&self, user_id: &str, build: CustomBuild) -> Result<CustomBuild> {
        let table = self.custom_builds;
        let mut txn = self.env.begin_rw_txn()?;

        let previous: Option<OwnedRow<CustomBuild>> = if build.id.is_empty() {
            None
        } else {
            get_json(&txn, table.rows, build.id.as_bytes())?
        };
        let stored = build.stamped(previous.as_ref().map(|row| &row.entry));

        if let Some(previous) = &previous {
            delete_key(
                &mut txn,
                table.index,
                build_key(&previous.user_id, previous.entry.hero_id, &previous.entry.id).as_bytes(),
            )?;
        }

        put_json(
            &mut txn,
            table.rows,
            stored.id.as_bytes(),
            &OwnedRow {
                user_id: user_id.to_string(),
                entry: &stored,
            },
        )?;
        txn.put(
            table.index,
            &build_key(user_id, stored.hero_id, &stored.id),
            &stored.id,
            WriteFlags::empty(),
        )?;
        txn.commit()?;
        Ok(stored)
    }

    fn get_custom_builds(&self, user_id: &str, hero_id: Option<u32>) -> Result<Vec<CustomBuild>> {
        let table = self.custom_builds;
        let prefix = match hero_id {
            Some(hero_id) => format!("{}{:010}{KEY_SEPARATOR}", user_prefix(user_id), hero_id),
            None => user_prefix(user_id),
        };

        let txn = self.env.begin_ro_txn()?;
        let mut builds = Vec::new();
        for (_, build_id) in scan_prefix(&txn, table.index, prefix.as_bytes())? {
            if let Some(row) = get_json::<OwnedRow<CustomBuild>, _>(&txn, table.rows, &build_id)? {
                builds.push(row.entry);
            }
        }
        builds.sort_by(|a, b| a.date_created.cmp(&b.date_created));
        Ok(builds)
    }

    fn delete_custom_build(&self, build_id: &str) -> Result<bool> {
        let table = self.custom_builds;
        let mut txn = self.env.begin_rw_txn()?;
        let Some(row) = get_json::<OwnedRow<CustomBuild>, _>(&txn, table.rows, build_id.as_bytes())?
        else {
            return Ok(false);
        };
        delete_key(&mut txn, table.rows, build_id.as_bytes())?;
        delete_key(
            &mut txn,
            table.index,
            build_key(&row.user_id, row.entry.hero_id, build_id).as_bytes(),
        )?;
        txn.commit()?;
        Ok(true)
    }

    fn cache_match(&self, user_id: &str, entry: CachedMatch) -> Result<()> {
        let table = self.match_cache;
        let mut txn = self.env.begin_rw_txn()?;

        let index_key = match_key(user_id, entry.match_id);
        if let Some(row_id) = get_row_id(&txn, table.index, index_key.as_bytes())? {
            delete_key(&mut txn, table.rows, &row_id.to_be_bytes())?;
        }

        let row_id = self.next_id(&mut txn, table.label)?;
        put_json(
            &mut txn,
            table.rows,
            &row_id.to_be_bytes(),
            &OwnedRow {
                user_id: user_id.to_string(),
                entry: &entry,
            },
        )?;
        txn.put(table.index, &index_key, &row_id.to_be_bytes(), WriteFlags::empty())?;

        let removed = self.trim_matches(&mut txn, user_id, MAX_CACHED_MATCHES)?;
        txn.commit()?;
        if removed > 0 {
            debug!("Match cache for {user_id} trimmed by {removed}");
        }
        Ok(())
    }

    fn get_cached_matches(&self, user_id: &str, limit: usize) -> Result<Vec<CachedMatch>> {
        let txn = self.env.begin_ro_txn()?;
        Ok(self
            .matches_newest_first(&txn, user_id)?
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry)
            .collect())
    }

    fn clear_old_matches(&self, user_id: &str, keep: usize) -> Result<usize> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = self.trim_matches(&mut txn, user_id, keep)?;
        txn.commit()?;
        Ok(removed)
    }

    fn get_setting(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self
            .get_value::<SettingRecord>(self.settings, key.as_bytes())?
            .map(|record| record.value))
    }

    fn set_setting(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.put_setting_record(&SettingRecord {
            key: key.to_string(),
            value: value.clone(),
            updated_at: Utc::now(),
        })
    }

    fn delete_setting(&self, key: &str) -> Result<bool> {
        self.delete_value(self.settings, key.as_bytes())
    }

    fn list_settings(&self) -> Result<BTreeMap<String, JsonValue>> {
        let txn = self.env.begin_ro_txn()?;
        let mut settings = BTreeMap::new();
        for (_, bytes) in scan_prefix(&txn, self.settings, b"")? {
            let record: SettingRecord = serde_json::from_slice(&bytes)?;
            if record.key != HEALTH_SENTINEL_KEY {
                settings.insert(record.key, record.value);
            }
        }
        Ok(settings)
    }

    /// Write, read back and delete a sentinel setting.
    fn health_check(&self) -> Result<()> {
        let probe = JsonValue::from(Utc::now().timestamp_millis());
        self.set_setting(HEALTH_SENTINEL_KEY, &probe)?;
        let read_back = self.get_setting(HEALTH_SENTINEL_KEY)?;
        self.delete_setting(HEALTH_SENTINEL_KEY)?;

        if read_back.as_ref() != Some(&probe) {
            return Err(CompanionError::Database(
                "health check sentinel did not round-trip".to_string(),
            ));
        }
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        for db in [
            self.user_profiles,
            self.hero_favorites.rows,
            self.hero_favorites.index,
            self.item_favorites.rows,
            self.item_favorites.index,
            self.custom_builds.rows,
            self.custom_builds.index,
            self.match_cache.rows,
            self.match_cache.index,
            self.settings,
            self.hero_cache,
            self.player_cache,
            self.match_detail_cache,
            self.response_cache,
            self.cache_metadata,
            self.failed_requests,
        ] {
            txn.clear_db(db)?;
        }
        txn.commit()?;
        info!("Cleared every collection in {}", self.path.display());
        Ok(())
    }
}

impl OfflineStore for StructuredStore {
    /// Upserts each hero by its `id`; entries without one are skipped.
    fn put_heroes(&self, heroes: &[JsonValue]) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        let mut stored = 0;
        for hero in heroes {
            match hero.get("id").and_then(JsonValue::as_u64) {
                Some(id) => {
                    put_json(&mut txn, self.hero_cache, &id.to_be_bytes(), hero)?;
                    stored += 1;
                }
                None => debug!("Skipping hero record without id"),
            }
        }
        txn.commit()?;
        debug!("Hero cache upserted {stored} records");
        Ok(())
    }

    fn get_heroes(&self) -> Result<Vec<JsonValue>> {
        let txn = self.env.begin_ro_txn()?;
        scan_prefix(&txn, self.hero_cache, b"")?
            .into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }

    fn put_player(&self, account_id: u64, body: &JsonValue) -> Result<()> {
        self.put_value(self.player_cache, &account_id.to_be_bytes(), body)
    }

    fn get_player(&self, account_id: u64) -> Result<Option<JsonValue>> {
        self.get_value(self.player_cache, &account_id.to_be_bytes())
    }

    fn put_match_detail(&self, match_id: u64, body: &JsonValue) -> Result<()> {
        self.put_value(self.match_detail_cache, &match_id.to_be_bytes(), body)
    }

    fn get_match_detail(&self, match_id: u64) -> Result<Option<JsonValue>> {
        self.get_value(self.match_detail_cache, &match_id.to_be_bytes())
    }

    fn put_response(&self, key: &str, body: &JsonValue) -> Result<()> {
        self.put_value(self.response_cache, key.as_bytes(), body)
    }

    fn get_response(&self, key: &str) -> Result<Option<JsonValue>> {
        self.get_value(self.response_cache, key.as_bytes())
    }

    fn put_metadata(&self, meta: &CacheMetadata) -> Result<()> {
        self.put_value(self.cache_metadata, meta.key.as_bytes(), meta)
    }

    fn get_metadata(&self, key: &str) -> Result<Option<CacheMetadata>> {
        self.get_value(self.cache_metadata, key.as_bytes())
    }

    fn delete_expired_metadata(&self, now_ms: i64) -> Result<usize> {
        let mut txn = self.env.begin_rw_txn()?;
        let mut expired = Vec::new();
        for (key, bytes) in scan_prefix(&txn, self.cache_metadata, b"")? {
            let meta: CacheMetadata = serde_json::from_slice(&bytes)?;
            if meta.is_expired_at(now_ms) {
                expired.push(key);
            }
        }
        for key in &expired {
            delete_key(&mut txn, self.cache_metadata, key)?;
        }
        txn.commit()?;
        Ok(expired.len())
    }

    fn insert_failed_request(&self, mut request: FailedRequest) -> Result<FailedRequest> {
        let mut txn = self.env.begin_rw_txn()?;
        request.id = self.next_id(&mut txn, "failed_requests")?;
        put_json(&mut txn, self.failed_requests, &request.id.to_be_bytes(), &request)?;
        txn.commit()?;
        Ok(request)
    }

    fn list_failed_requests(&self) -> Result<Vec<FailedRequest>> {
        let txn = self.env.begin_ro_txn()?;
        scan_prefix(&txn, self.failed_requests, b"")?
            .into_iter()
            .map(|(_, bytes)| Ok(serde_json::from_slice(&bytes)?))
            .collect()
    }

    /// A row that is no longer stored stays deleted.
    fn update_failed_request(&self, request: &FailedRequest) -> Result<()> {
        let key = request.id.to_be_bytes();
        let mut txn = self.env.begin_rw_txn()?;
        let stored: Option<FailedRequest> = get_json(&txn, self.failed_requests, &key)?;
        if stored.is_some() {
            put_json(&mut txn, self.failed_requests, &key, request)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_failed_request(&self, id: u64) -> Result<bool> {
        self.delete_value(self.failed_requests, &id.to_be_bytes())
    }
}

fn read_schema_version(env: &Environment, meta: Database) -> Result<Option<u32>> {
    let txn = env.begin_ro_txn()?;
    match txn.get(meta, &SCHEMA_VERSION_KEY) {
        Ok(bytes) => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| {
                CompanionError::Database("corrupt schema version record".to_string())
            })?;
            Ok(Some(u32::from_be_bytes(raw)))
        }
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn user_prefix(user_id: &str) -> String {
    format!("{user_id}{KEY_SEPARATOR}")
}

fn favorite_key(user_id: &str, id: u32) -> String {
    format!("{}{:010}", user_prefix(user_id), id)
}

fn match_key(user_id: &str, match_id: u64) -> String {
    format!("{}{:020}", user_prefix(user_id), match_id)
}

fn build_key(user_id: &str, hero_id: u32, build_id: &str) -> String {
    format!("{}{:010}{KEY_SEPARATOR}{build_id}", user_prefix(user_id), hero_id)
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CompanionError::Database("corrupt row id".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn get_json<T: DeserializeOwned, Txn: Transaction>(
    txn: &Txn,
    db: Database,
    key: &[u8],
) -> Result<Option<T>> {
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn get_row_id<Txn: Transaction>(txn: &Txn, index: Database, key: &[u8]) -> Result<Option<u64>> {
    match txn.get(index, &key) {
        Ok(bytes) => Ok(Some(decode_u64(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn put_json<T: Serialize + ?Sized>(
    txn: &mut RwTransaction<'_>,
    db: Database,
    key: &[u8],
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    txn.put(db, &key, &bytes, WriteFlags::empty())?;
    Ok(())
}

fn delete_key(txn: &mut RwTransaction<'_>, db: Database, key: &[u8]) -> Result<bool> {
    match txn.del(db, &key, None) {
        Ok(()) => Ok(true),
        Err(lmdb::Error::NotFound) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Copies out every pair whose key starts with `prefix`, in key order.
fn scan_prefix<Txn: Transaction>(
    txn: &Txn,
    db: Database,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut cursor = txn.open_ro_cursor(db)?;
    let rows = cursor
        .iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.to_vec(), value.to_vec()))
        .collect();
    Ok(rows)
}

/// Rows of `table` reachable from index keys under `prefix`, in row-id order.
fn owned_rows<T: DeserializeOwned, Txn: Transaction>(
    txn: &Txn,
    table: IndexedTable,
    prefix: &str,
) -> Result<Vec<(u64, T)>> {
    let mut rows = Vec::new();
    for (_, row_id) in scan_prefix(txn, table.index, prefix.as_bytes())? {
        let row_id = decode_u64(&row_id)?;
        if let Some(row) = get_json::<OwnedRow<T>, _>(txn, table.rows, &row_id.to_be_bytes())? {
            rows.push((row_id, row.entry));
        }
    }
    rows.sort_by_key(|(row_id, _)| *row_id);
    Ok(rows)
}
