//! # Test Suite for the Dota 2 Companion Core
//!
//! This module exercises every layer of the crate, from the plain data
//! model up to the C ABI, against real LMDB environments and flat stores
//! created in temporary directories.
//!
//! ## Test Categories
//!
//! ### 1. Model Tests
//! - Favorite uniqueness and cap eviction
//! - Build stamping and statistics aggregation
//! - Snapshot version validation
//!
//! ### 2. Structured Store Tests
//! - Schema provisioning and re-opening
//! - Secondary-index backed favorites, builds and match cache
//! - Settings, health sentinel and retry rows
//! - Unavailable environment reporting
//!
//! ### 3. Flat Store Tests
//! - Envelope format on disk
//! - Soft failure when the directory is not writable
//! - Quota cleanup and `QuotaExceeded`
//!
//! ### 4. Cache, Retry and Network Tests
//! - TTL boundaries and sweeping
//! - Retry ceiling, reentrancy and the reconnect trigger
//! - Network -> cache -> demo fallback chain and player search
//!
//! ### 5. Facade Tests
//! - Login, reload and flat-mirror takeover
//! - Export/import round trip and health reporting
//!
//! ### 6. Configuration and FFI Tests
//! - TOML and environment overrides
//! - Null pointers, invalid JSON and a full handle lifecycle
//!
//! Upstream traffic goes through [`tests::MockTransport`], which answers from
//! a route table and records every path it was asked for.

#[cfg(test)]
pub mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::ffi::CString;
    use std::os::raw::c_char;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::{json, Value as JsonValue};
    use tempfile::TempDir;

    use crate::app_response::AppResponse;
    use crate::backend::{CompanionBackend, HealthStatus};
    use crate::cache_manager::{cache_key_for, CacheManager, CacheType, ResourceKind};
    use crate::config::{CompanionConfig, ENV_API_URL, ENV_DATA_DIR, ENV_TIMEOUT_MS};
    use crate::connectivity::Connectivity;
    use crate::error::{CompanionError, Result};
    use crate::flat_store::{FlatStore, FLAT_FORMAT_VERSION};
    use crate::local_db_model::{
        push_cached_match, upsert_build, upsert_favorite, CachedMatch, CustomBuild,
        ExportSnapshot, FavoriteHero, FavoriteItem, Kda, MatchResult, PlayerStatistics,
        ProfileUpdate, UserProfile, MAX_CACHED_MATCHES, MAX_FAVORITE_HEROES,
    };
    use crate::local_db_state::{StructuredStore, SCHEMA_VERSION};
    use crate::persistence::{FallbackPersistence, OfflineStore, PersistenceBackend};
    use crate::placeholder::demo_heroes;
    use crate::resilient_api::ResilientApi;
    use crate::retry_queue::{FailedRequest, RetryQueue, DEFAULT_POLL_INTERVAL, MAX_RETRY_ATTEMPTS};
    use crate::upstream::{HttpTransport, UpstreamRequest, UpstreamResponse, UpstreamTransport};
    use crate::{
        add_favorite_hero, close_companion, create_companion, create_companion_from_file,
        export_data, get_cached_matches, get_heroes, get_profile, health_check, import_data,
        login_profile, save_custom_build, search_players, set_online, update_profile,
    };

    const MOCK_BASE: &str = "http://mock.test/api";
    const TEST_MAP_SIZE: usize = 16 * 1024 * 1024;
    const TEST_QUOTA: u64 = 1024 * 1024;
    const STEAM_ID: &str = "76561198047553230";

    /// How the mock answers one route.
    #[derive(Clone)]
    enum Reply {
        Status(u16, JsonValue),
        Slow(Duration, u16, JsonValue),
        Down,
    }

    /// Route table keyed by the path after [`MOCK_BASE`]. Unknown routes
    /// behave like an unreachable host.
    #[derive(Default)]
    pub struct MockTransport {
        routes: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn route(&self, path: &str, reply: Reply) {
            self.routes.lock().unwrap().insert(path.to_string(), reply);
        }

        fn ok(&self, path: &str, body: JsonValue) {
            self.route(path, Reply::Status(200, body));
        }

        fn calls_to(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
            let path = request
                .url
                .strip_prefix(MOCK_BASE)
                .unwrap_or(&request.url)
                .trim_start_matches('/')
                .to_string();
            self.calls.lock().unwrap().push(path.clone());

            let reply = self.routes.lock().unwrap().get(&path).cloned();
            match reply {
                Some(Reply::Status(status, body)) => Ok(UpstreamResponse { status, body }),
                Some(Reply::Slow(delay, status, body)) => {
                    tokio::time::sleep(delay).await;
                    Ok(UpstreamResponse { status, body })
                }
                Some(Reply::Down) | None => {
                    Err(CompanionError::Transport(format!("connection refused: {path}")))
                }
            }
        }
    }

    /// Storage, cache, queue and API wired by hand over one LMDB environment.
    struct NetworkStack {
        cache: Arc<CacheManager>,
        queue: Arc<RetryQueue>,
        api: ResilientApi,
        connectivity: Connectivity,
        transport: Arc<MockTransport>,
        _store: Arc<StructuredStore>,
    }

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn network_stack(dir: &Path) -> NetworkStack {
        let store = Arc::new(StructuredStore::open(dir.join("net.lmdb"), TEST_MAP_SIZE).unwrap());
        let offline: Arc<dyn OfflineStore> = store.clone();
        let transport = Arc::new(MockTransport::default());
        let connectivity = Connectivity::new(true);
        let cache = Arc::new(CacheManager::new(offline.clone()));
        let queue = Arc::new(RetryQueue::new(
            offline,
            cache.clone(),
            transport.clone(),
            connectivity.clone(),
        ));
        let api = ResilientApi::new(
            MOCK_BASE,
            transport.clone(),
            cache.clone(),
            queue.clone(),
            connectivity.clone(),
        );
        NetworkStack {
            cache,
            queue,
            api,
            connectivity,
            transport,
            _store: store,
        }
    }

    fn test_config(dir: &Path) -> CompanionConfig {
        let mut config = CompanionConfig::with_data_dir(dir);
        config.api_base_url = MOCK_BASE.to_string();
        config.lmdb_map_size = TEST_MAP_SIZE;
        config.flat_quota_bytes = TEST_QUOTA;
        config
    }

    fn test_backend(dir: &Path, transport: Arc<MockTransport>) -> CompanionBackend {
        CompanionBackend::new(test_config(dir), transport, Connectivity::new(true))
    }

    fn open_store(dir: &Path) -> StructuredStore {
        StructuredStore::open(dir.join("store.lmdb"), TEST_MAP_SIZE).unwrap()
    }

    /// A flat tier that rejects every call.
    struct BrokenMirror;

    fn refuse<T>() -> Result<T> {
        Err(CompanionError::StorageUnavailable("mirror disk full".to_string()))
    }

    impl PersistenceBackend for BrokenMirror {
        fn backend_name(&self) -> &'static str {
            "broken"
        }
        fn get_profile(&self, _: Option<&str>) -> Result<Option<UserProfile>> {
            refuse()
        }
        fn save_profile(&self, _: &UserProfile) -> Result<()> {
            refuse()
        }
        fn delete_profile(&self, _: &str) -> Result<bool> {
            refuse()
        }
        fn add_favorite_hero(&self, _: &str, _: FavoriteHero) -> Result<Option<FavoriteHero>> {
            refuse()
        }
        fn remove_favorite_hero(&self, _: &str, _: u32) -> Result<bool> {
            refuse()
        }
        fn get_favorite_heroes(&self, _: &str) -> Result<Vec<FavoriteHero>> {
            refuse()
        }
        fn add_favorite_item(&self, _: &str, _: FavoriteItem) -> Result<Option<FavoriteItem>> {
            refuse()
        }
        fn remove_favorite_item(&self, _: &str, _: u32) -> Result<bool> {
            refuse()
        }
        fn get_favorite_items(&self, _: &str) -> Result<Vec<FavoriteItem>> {
            refuse()
        }
        fn save_custom_build(&self, _: &str, _: CustomBuild) -> Result<CustomBuild> {
            refuse()
        }
        fn get_custom_builds(&self, _: &str, _: Option<u32>) -> Result<Vec<CustomBuild>> {
            refuse()
        }
        fn delete_custom_build(&self, _: &str) -> Result<bool> {
            refuse()
        }
        fn cache_match(&self, _: &str, _: CachedMatch) -> Result<()> {
            refuse()
        }
        fn get_cached_matches(&self, _: &str, _: usize) -> Result<Vec<CachedMatch>> {
            refuse()
        }
        fn clear_old_matches(&self, _: &str, _: usize) -> Result<usize> {
            refuse()
        }
        fn get_setting(&self, _: &str) -> Result<Option<JsonValue>> {
            refuse()
        }
        fn set_setting(&self, _: &str, _: &JsonValue) -> Result<()> {
            refuse()
        }
        fn delete_setting(&self, _: &str) -> Result<bool> {
            refuse()
        }
        fn list_settings(&self) -> Result<BTreeMap<String, JsonValue>> {
            refuse()
        }
        fn health_check(&self) -> Result<()> {
            refuse()
        }
        fn clear_all(&self) -> Result<()> {
            refuse()
        }
    }

    fn hero_added(id: u32, minutes_ago: i64) -> FavoriteHero {
        let mut hero = FavoriteHero::new(id, format!("hero-{id}"));
        hero.date_added = Utc::now() - ChronoDuration::minutes(minutes_ago);
        hero
    }

    fn sample_match(match_id: u64, minutes_ago: i64, result: MatchResult) -> CachedMatch {
        CachedMatch {
            match_id,
            hero_id: 1,
            result,
            duration: 2400,
            kda: Kda {
                kills: 8,
                deaths: 2,
                assists: 10,
            },
            items: vec![1, 50, 116],
            cached_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    fn hero_stats_body() -> JsonValue {
        json!([
            {"id": 1, "name": "npc_dota_hero_antimage", "localized_name": "Anti-Mage",
             "primary_attr": "agi", "attack_type": "Melee", "roles": ["Carry"], "pro_pick": 120},
            {"id": 8, "name": "npc_dota_hero_juggernaut", "localized_name": "Juggernaut",
             "primary_attr": "agi", "attack_type": "Melee", "roles": ["Carry", "Pusher"]}
        ])
    }

    /// Takes ownership of an FFI response and decodes the envelope.
    fn take_response(ptr: *const c_char) -> AppResponse {
        assert!(!ptr.is_null(), "FFI functions must always return a response");
        let raw = unsafe { CString::from_raw(ptr as *mut c_char) };
        serde_json::from_str(raw.to_str().unwrap()).unwrap()
    }

    fn ok_payload(response: AppResponse) -> JsonValue {
        match response {
            AppResponse::Ok(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected Ok response, got {other}"),
        }
    }

    // ===============================
    // MODEL TESTS
    // ===============================

    #[test]
    fn test_favorite_upsert_is_unique_by_id() {
        let mut list = Vec::new();
        upsert_favorite(&mut list, FavoriteHero::new(1, "Anti-Mage"), MAX_FAVORITE_HEROES);
        upsert_favorite(&mut list, FavoriteHero::new(2, "Axe"), MAX_FAVORITE_HEROES);
        upsert_favorite(&mut list, FavoriteHero::new(1, "Anti-Mage (mid)"), MAX_FAVORITE_HEROES);

        assert_eq!(list.len(), 2);
        let am = list.iter().find(|h| h.id == 1).unwrap();
        assert_eq!(am.name, "Anti-Mage (mid)");
    }

    #[test]
    fn test_favorite_cap_evicts_oldest() {
        let mut list = Vec::new();
        for id in 1..=10 {
            // hero 1 is the oldest
            upsert_favorite(&mut list, hero_added(id, 100 - i64::from(id)), MAX_FAVORITE_HEROES);
        }
        let evicted = upsert_favorite(&mut list, hero_added(11, 0), MAX_FAVORITE_HEROES);

        assert_eq!(evicted.map(|h| h.id), Some(1));
        assert_eq!(list.len(), MAX_FAVORITE_HEROES);
        assert!(list.iter().any(|h| h.id == 11));
        assert!(!list.iter().any(|h| h.id == 1));
    }

    #[test]
    fn test_build_upsert_keeps_creation_date() {
        let mut builds = Vec::new();
        let mut first = CustomBuild::new(1, "Farm build", vec!["battle_fury".into()]);
        first.date_created = Utc::now() - ChronoDuration::days(3);
        let created = upsert_build(&mut builds, first);
        assert!(created.id.starts_with("build_"));

        let mut edited = created.clone();
        edited.name = "Fight build".to_string();
        edited.date_created = Utc::now();
        let stored = upsert_build(&mut builds, edited);

        assert_eq!(builds.len(), 1);
        assert_eq!(stored.id, created.id);
        assert_eq!(stored.date_created, created.date_created);
        assert!(stored.date_modified >= created.date_modified);
        assert_eq!(builds[0].name, "Fight build");
    }

    #[test]
    fn test_push_cached_match_ring_buffer() {
        let mut list = Vec::new();
        for id in 0..51u64 {
            push_cached_match(&mut list, sample_match(id, 1000 - id as i64, MatchResult::Win), MAX_CACHED_MATCHES);
        }
        assert_eq!(list.len(), MAX_CACHED_MATCHES);
        assert_eq!(list[0].match_id, 50);
        assert!(!list.iter().any(|m| m.match_id == 0));
    }

    #[test]
    fn test_statistics_from_matches() {
        let matches = vec![
            sample_match(5, 10, MatchResult::Loss),
            sample_match(4, 20, MatchResult::Win),
            sample_match(3, 30, MatchResult::Win),
            sample_match(2, 40, MatchResult::Win),
            sample_match(1, 50, MatchResult::Loss),
        ];
        let stats = PlayerStatistics::from_matches(&matches);

        assert_eq!(stats.total_matches, 5);
        assert_eq!(stats.wins, 3);
        assert_eq!(stats.losses, 2);
        assert!((stats.win_rate - 60.0).abs() < 1e-9);
        assert_eq!(stats.current_streak.result, Some(MatchResult::Loss));
        assert_eq!(stats.current_streak.length, 1);
        assert_eq!(stats.longest_win_streak, 3);
        assert!((stats.average_kda - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_statistics_empty_history() {
        let stats = PlayerStatistics::from_matches(&[]);
        assert_eq!(stats.total_matches, 0);
        assert_eq!(stats.win_rate, 0.0);
        assert_eq!(stats.current_streak.result, None);
    }

    #[test]
    fn test_snapshot_rejects_other_major_version() {
        let mut snapshot = ExportSnapshot::empty();
        assert!(snapshot.validate().is_ok());

        snapshot.version = "1.3".to_string();
        assert!(snapshot.validate().is_ok());

        snapshot.version = "2.0".to_string();
        assert!(matches!(snapshot.validate(), Err(CompanionError::Validation(_))));
    }

    #[test]
    fn test_kda_ratio_with_zero_deaths() {
        let kda = Kda {
            kills: 7,
            deaths: 0,
            assists: 3,
        };
        assert_eq!(kda.ratio(), 10.0);
    }

    #[test]
    fn test_kda_ratio_with_extreme_counts() {
        let kda = Kda {
            kills: u32::MAX,
            deaths: 1,
            assists: u32::MAX,
        };
        assert_eq!(kda.ratio(), 2.0 * f64::from(u32::MAX));
    }

    // ===============================
    // STRUCTURED STORE TESTS
    // ===============================

    #[test]
    fn test_schema_version_recorded_and_reopened() {
        init_logger();
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(dir.path());
            assert_eq!(store.schema_version().unwrap(), Some(SCHEMA_VERSION));
            store.set_setting("theme", &json!("dark")).unwrap();
            store.close().unwrap();
        }

        let reopened = open_store(dir.path());
        assert_eq!(reopened.schema_version().unwrap(), Some(SCHEMA_VERSION));
        assert_eq!(reopened.get_setting("theme").unwrap(), Some(json!("dark")));
    }

    #[test]
    fn test_structured_store_unavailable_path() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("blocked.lmdb");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let result = StructuredStore::open(&blocked, TEST_MAP_SIZE);
        assert!(matches!(result, Err(CompanionError::StorageUnavailable(_))));
    }

    #[test]
    fn test_structured_favorites_unique_and_capped() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        for id in 1..=10 {
            assert!(store.add_favorite_hero(STEAM_ID, hero_added(id, 100 - i64::from(id))).unwrap().is_none());
        }
        let evicted = store.add_favorite_hero(STEAM_ID, hero_added(11, 0)).unwrap();
        assert_eq!(evicted.map(|h| h.id), Some(1));

        // re-adding an existing hero replaces it without evicting
        let mut renamed = hero_added(5, 1);
        renamed.name = "renamed".to_string();
        assert!(store.add_favorite_hero(STEAM_ID, renamed).unwrap().is_none());

        let heroes = store.get_favorite_heroes(STEAM_ID).unwrap();
        assert_eq!(heroes.len(), MAX_FAVORITE_HEROES);
        assert_eq!(heroes.iter().filter(|h| h.id == 5).count(), 1);
        assert_eq!(heroes.iter().find(|h| h.id == 5).unwrap().name, "renamed");
        assert!(!heroes.iter().any(|h| h.id == 1));

        assert!(store.remove_favorite_hero(STEAM_ID, 11).unwrap());
        assert!(!store.remove_favorite_hero(STEAM_ID, 11).unwrap());
        assert_eq!(store.get_favorite_heroes(STEAM_ID).unwrap().len(), 9);

        // other users are untouched
        assert!(store.get_favorite_heroes("someone-else").unwrap().is_empty());
    }

    #[test]
    fn test_structured_favorite_items() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.add_favorite_item(STEAM_ID, FavoriteItem::new(116, "Black King Bar")).unwrap();
        store.add_favorite_item(STEAM_ID, FavoriteItem::new(1, "Blink Dagger")).unwrap();
        store.add_favorite_item(STEAM_ID, FavoriteItem::new(116, "BKB")).unwrap();

        let items = store.get_favorite_items(STEAM_ID).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|i| i.id == 116 && i.name == "BKB"));
        assert!(store.remove_favorite_item(STEAM_ID, 1).unwrap());
    }

    #[test]
    fn test_structured_match_cache_keeps_newest_fifty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        for id in 0..51u64 {
            store
                .cache_match(STEAM_ID, sample_match(7_000_000 + id, 1000 - id as i64, MatchResult::Win))
                .unwrap();
        }

        let matches = store.get_cached_matches(STEAM_ID, 100).unwrap();
        assert_eq!(matches.len(), MAX_CACHED_MATCHES);
        assert_eq!(matches[0].match_id, 7_000_050);
        assert!(!matches.iter().any(|m| m.match_id == 7_000_000));
        assert!(matches.windows(2).all(|w| w[0].cached_at >= w[1].cached_at));

        assert_eq!(store.get_cached_matches(STEAM_ID, 5).unwrap().len(), 5);

        let removed = store.clear_old_matches(STEAM_ID, 10).unwrap();
        assert_eq!(removed, 40);
        let kept = store.get_cached_matches(STEAM_ID, 100).unwrap();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0].match_id, 7_000_050);
    }

    #[test]
    fn test_structured_recaching_match_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.cache_match(STEAM_ID, sample_match(42, 30, MatchResult::Loss)).unwrap();
        store.cache_match(STEAM_ID, sample_match(42, 0, MatchResult::Win)).unwrap();

        let matches = store.get_cached_matches(STEAM_ID, 50).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].result, MatchResult::Win);
    }

    #[test]
    fn test_structured_custom_builds() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        let am = store
            .save_custom_build(STEAM_ID, CustomBuild::new(1, "AM farm", vec!["battle_fury".into()]))
            .unwrap();
        let axe = store
            .save_custom_build(STEAM_ID, CustomBuild::new(2, "Axe blink", vec!["blink".into()]))
            .unwrap();
        assert_ne!(am.id, axe.id);

        assert_eq!(store.get_custom_builds(STEAM_ID, None).unwrap().len(), 2);
        let am_builds = store.get_custom_builds(STEAM_ID, Some(1)).unwrap();
        assert_eq!(am_builds.len(), 1);
        assert_eq!(am_builds[0].name, "AM farm");

        let mut edited = am.clone();
        edited.items.push("manta".into());
        let stored = store.save_custom_build(STEAM_ID, edited).unwrap();
        assert_eq!(stored.date_created, am.date_created);
        assert_eq!(store.get_custom_builds(STEAM_ID, Some(1)).unwrap()[0].items.len(), 2);

        assert!(store.delete_custom_build(&am.id).unwrap());
        assert!(!store.delete_custom_build(&am.id).unwrap());
        assert!(store.get_custom_builds(STEAM_ID, Some(1)).unwrap().is_empty());
    }

    #[test]
    fn test_structured_profile_lookup() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        assert!(store.get_profile(None).unwrap().is_none());

        let profile = crate::local_db_model::UserProfile::new(STEAM_ID, "testuser");
        store.save_profile(&profile).unwrap();

        assert_eq!(store.get_profile(None).unwrap().unwrap().steam_id, STEAM_ID);
        assert_eq!(store.get_profile(Some(STEAM_ID)).unwrap(), Some(profile));
        assert!(store.get_profile(Some("missing")).unwrap().is_none());
        assert!(store.delete_profile(STEAM_ID).unwrap());
        assert!(store.get_profile(None).unwrap().is_none());
    }

    #[test]
    fn test_structured_settings_and_health_check() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        store.set_setting("language", &json!("en")).unwrap();
        store.set_setting("refresh", &json!({"minutes": 5})).unwrap();
        store.health_check().unwrap();

        let settings = store.list_settings().unwrap();
        assert_eq!(settings.len(), 2);
        assert_eq!(settings.get("refresh"), Some(&json!({"minutes": 5})));

        assert!(store.delete_setting("language").unwrap());
        assert!(store.get_setting("language").unwrap().is_none());
    }

    #[test]
    fn test_structured_failed_requests_in_insert_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());

        let first = store
            .insert_failed_request(FailedRequest::from_request(&UpstreamRequest::get("http://a/1")))
            .unwrap();
        let second = store
            .insert_failed_request(FailedRequest::from_request(&UpstreamRequest::get("http://a/2")))
            .unwrap();
        assert!(second.id > first.id);

        let mut bumped = first.clone();
        bumped.retry_count = 2;
        store.update_failed_request(&bumped).unwrap();

        let rows = store.list_failed_requests().unwrap();
        assert_eq!(rows.iter().map(|r| r.url.as_str()).collect::<Vec<_>>(), vec!["http://a/1", "http://a/2"]);
        assert_eq!(rows[0].retry_count, 2);

        assert!(store.delete_failed_request(first.id).unwrap());
        assert_eq!(store.list_failed_requests().unwrap().len(), 1);
    }

    #[test]
    fn test_structured_update_does_not_revive_deleted_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let mut row = store
            .insert_failed_request(FailedRequest::from_request(&UpstreamRequest::get("http://a/1")))
            .unwrap();

        assert!(store.delete_failed_request(row.id).unwrap());
        row.retry_count = 1;
        store.update_failed_request(&row).unwrap();

        assert!(store.list_failed_requests().unwrap().is_empty());
    }

    #[test]
    fn test_structured_clear_all_keeps_schema() {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        store.set_setting("k", &json!(1)).unwrap();
        store.add_favorite_hero(STEAM_ID, FavoriteHero::new(1, "Anti-Mage")).unwrap();

        store.clear_all().unwrap();

        assert!(store.list_settings().unwrap().is_empty());
        assert!(store.get_favorite_heroes(STEAM_ID).unwrap().is_empty());
        assert_eq!(store.schema_version().unwrap(), Some(SCHEMA_VERSION));
    }

    // ===============================
    // FLAT STORE TESTS
    // ===============================

    #[test]
    fn test_flat_store_envelope_on_disk() {
        let dir = TempDir::new().unwrap();
        let flat = FlatStore::new(dir.path(), "ns", TEST_QUOTA);
        assert!(flat.is_available());

        assert!(flat.set_item("greeting", &json!({"hello": "world"})).unwrap());

        let raw = std::fs::read_to_string(dir.path().join("ns.greeting.json")).unwrap();
        let envelope: JsonValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["data"], json!({"hello": "world"}));
        assert_eq!(envelope["version"], json!(FLAT_FORMAT_VERSION));
        assert!(envelope["timestamp"].as_i64().unwrap() > 0);

        let value: JsonValue = flat.get_item("greeting", JsonValue::Null);
        assert_eq!(value["hello"], "world");
        assert_eq!(flat.keys(), vec!["greeting".to_string()]);
    }

    #[test]
    fn test_flat_store_defaults_on_missing_or_corrupt() {
        let dir = TempDir::new().unwrap();
        let flat = FlatStore::new(dir.path(), "ns", TEST_QUOTA);

        assert_eq!(flat.get_item("missing", 7u32), 7);

        std::fs::write(dir.path().join("ns.broken.json"), b"{not json").unwrap();
        assert_eq!(flat.get_item("broken", vec![1u32]), vec![1]);
    }

    #[test]
    fn test_flat_store_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let a = FlatStore::new(dir.path(), "a", TEST_QUOTA);
        let b = FlatStore::new(dir.path(), "b", TEST_QUOTA);

        a.set_item("x", &1).unwrap();
        a.set_item("y", &2).unwrap();
        b.set_item("x", &3).unwrap();

        assert!(a.remove_item("y"));
        assert!(!a.remove_item("y"));
        assert_eq!(a.clear(), 1);
        assert!(a.keys().is_empty());
        assert_eq!(b.get_item("x", 0), 3);
        assert_eq!(b.get_storage_usage().keys, 1);
    }

    #[test]
    fn test_flat_store_unavailable_soft_fails() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let flat = FlatStore::new(&not_a_dir, "ns", TEST_QUOTA);
        assert!(!flat.is_available());
        assert!(!flat.set_item("k", &1).unwrap());
        assert_eq!(flat.get_item("k", 5), 5);
        assert!(flat.keys().is_empty());
        assert_eq!(flat.get_storage_usage().used_bytes, 0);

        let result = flat.add_favorite_hero(STEAM_ID, FavoriteHero::new(1, "Anti-Mage"));
        assert!(matches!(result, Err(CompanionError::StorageUnavailable(_))));
    }

    #[test]
    fn test_flat_store_quota_cleanup_then_exceeded() {
        init_logger();
        let dir = TempDir::new().unwrap();
        {
            let seed = FlatStore::new(dir.path(), "ns", TEST_QUOTA);
            for id in 0..50u64 {
                seed.cache_match(STEAM_ID, sample_match(1_000 + id, 500 - id as i64, MatchResult::Win))
                    .unwrap();
            }
        }

        let match_file = std::fs::metadata(dir.path().join("ns.match_cache.json")).unwrap().len();
        let used = FlatStore::new(dir.path(), "ns", TEST_QUOTA).get_storage_usage().used_bytes;

        // half of the match blob fits only once cleanup has trimmed it to 25 entries
        let quota = used + match_file / 4;
        let flat = FlatStore::new(dir.path(), "ns", quota);
        let payload = "x".repeat((match_file / 2) as usize);
        assert!(flat.set_item("notes", &payload).unwrap());

        let matches = flat.get_cached_matches(STEAM_ID, 50).unwrap();
        assert_eq!(matches.len(), 25);
        assert_eq!(matches[0].match_id, 1_049);

        let huge = "y".repeat(quota as usize);
        let result = flat.set_item("huge", &huge);
        assert!(matches!(result, Err(CompanionError::QuotaExceeded(_))));
        assert!(flat.get_storage_usage().used_bytes <= quota);
    }

    #[test]
    fn test_flat_store_cleanup_holds_for_pending_match_write() {
        let dir = TempDir::new().unwrap();
        {
            let seed = FlatStore::new(dir.path(), "ns", TEST_QUOTA);
            for id in 0..50u64 {
                seed.cache_match(STEAM_ID, sample_match(1_000 + id, 500 - id as i64, MatchResult::Win))
                    .unwrap();
            }
        }
        let used = FlatStore::new(dir.path(), "ns", TEST_QUOTA).get_storage_usage().used_bytes;

        // the 51st match only fits once cleanup has trimmed the blob
        let flat = FlatStore::new(dir.path(), "ns", used - used / 10);
        flat.cache_match(STEAM_ID, sample_match(2_000, 1, MatchResult::Loss)).unwrap();

        let matches = flat.get_cached_matches(STEAM_ID, MAX_CACHED_MATCHES).unwrap();
        assert_eq!(matches.len(), 25);
        assert_eq!(matches[0].match_id, 2_000);
        assert_eq!(matches[24].match_id, 1_026);
    }

    #[test]
    fn test_flat_update_does_not_revive_deleted_row() {
        let dir = TempDir::new().unwrap();
        let flat = FlatStore::new(dir.path(), "ns", TEST_QUOTA);
        let mut row = flat
            .insert_failed_request(FailedRequest::from_request(&UpstreamRequest::get("http://a/1")))
            .unwrap();

        flat.clear();
        row.retry_count = 1;
        flat.update_failed_request(&row).unwrap();

        assert!(flat.list_failed_requests().unwrap().is_empty());
    }

    #[test]
    fn test_flat_store_domain_collections() {
        let dir = TempDir::new().unwrap();
        let flat = FlatStore::new(dir.path(), "ns", TEST_QUOTA);

        let profile = crate::local_db_model::UserProfile::new(STEAM_ID, "testuser");
        flat.save_profile(&profile).unwrap();
        assert_eq!(flat.get_profile(None).unwrap().unwrap().steam_id, STEAM_ID);

        flat.add_favorite_hero(STEAM_ID, FavoriteHero::new(14, "Pudge")).unwrap();
        flat.add_favorite_hero(STEAM_ID, FavoriteHero::new(14, "Pudge")).unwrap();
        assert_eq!(flat.get_favorite_heroes(STEAM_ID).unwrap().len(), 1);

        let build = flat
            .save_custom_build(STEAM_ID, CustomBuild::new(14, "Hook", vec!["blink".into()]))
            .unwrap();
        assert_eq!(flat.get_custom_builds(STEAM_ID, Some(14)).unwrap().len(), 1);
        assert!(flat.delete_custom_build(&build.id).unwrap());

        flat.set_setting("theme", &json!("dark")).unwrap();
        assert_eq!(flat.list_settings().unwrap().get("theme"), Some(&json!("dark")));
        flat.health_check().unwrap();
    }

    // ===============================
    // CACHE MANAGER TESTS
    // ===============================

    #[test]
    fn test_cache_ttl_boundary_for_players() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        let key = cache_key_for("http://mock.test/api/players/42");
        let t0 = 1_700_000_000_000;

        assert!(!stack.cache.is_valid_at(&key, CacheType::Players, t0));
        stack.cache.mark_fresh_at(&key, CacheType::Players, t0).unwrap();

        let minute = 60 * 1000;
        assert!(stack.cache.is_valid_at(&key, CacheType::Players, t0 + 29 * minute));
        assert!(!stack.cache.is_valid_at(&key, CacheType::Players, t0 + 31 * minute));
    }

    #[test]
    fn test_cache_type_ttls_and_parse() {
        assert_eq!(CacheType::Heroes.ttl_ms(), 60 * 60 * 1000);
        assert_eq!(CacheType::Matches.ttl_ms(), 24 * 60 * 60 * 1000);
        assert_eq!(CacheType::parse("PLAYERS"), CacheType::Players);
        assert_eq!(CacheType::parse("items"), CacheType::Default);
        assert_eq!(CacheType::Default.ttl_ms(), 15 * 60 * 1000);
    }

    #[test]
    fn test_cache_sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        let t0 = 1_700_000_000_000;

        stack.cache.mark_fresh_at("short", CacheType::Default, t0).unwrap();
        stack.cache.mark_fresh_at("long", CacheType::Matches, t0).unwrap();

        let removed = stack.cache.sweep_expired_at(t0 + 60 * 60 * 1000).unwrap();
        assert_eq!(removed, 1);
        assert!(stack.cache.is_valid_at("long", CacheType::Matches, t0 + 60 * 60 * 1000));
        assert!(!stack.cache.is_valid_at("short", CacheType::Default, t0 + 60 * 1000 * 60));
    }

    #[test]
    fn test_resource_kind_from_url() {
        assert_eq!(ResourceKind::from_url("https://x/api/heroStats"), ResourceKind::HeroList);
        assert_eq!(ResourceKind::from_url("https://x/api/players/42"), ResourceKind::Player(42));
        assert_eq!(ResourceKind::from_url("https://x/api/matches/77"), ResourceKind::MatchDetail(77));
        assert_eq!(
            ResourceKind::from_url("https://x/api/players/42/wl").cache_type(),
            CacheType::Players
        );
        assert_eq!(
            ResourceKind::from_url("https://x/api/search?q=dendi").cache_type(),
            CacheType::Default
        );
        assert_eq!(cache_key_for("https://x/a"), cache_key_for("https://x/a"));
        assert_ne!(cache_key_for("https://x/a"), cache_key_for("https://x/b"));
    }

    #[test]
    fn test_cache_store_and_read_back_by_kind() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        let url = format!("{MOCK_BASE}/players/42");

        assert!(stack.cache.cached_response(&url).unwrap().is_none());
        stack.cache.store_response(&url, &json!({"rank_tier": 70})).unwrap();

        assert_eq!(stack.cache.cached_response(&url).unwrap(), Some(json!({"rank_tier": 70})));
        assert!(stack.cache.is_url_fresh(&url));
    }

    // ===============================
    // RETRY QUEUE TESTS
    // ===============================

    #[tokio::test]
    async fn test_retry_ceiling_drops_after_three_attempts() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.route("players/7", Reply::Down);
        stack
            .queue
            .enqueue(&UpstreamRequest::get(format!("{MOCK_BASE}/players/7")))
            .unwrap();

        for attempt in 1..MAX_RETRY_ATTEMPTS {
            let report = stack.queue.drain().await.unwrap();
            assert_eq!(report.retried, 1);
            assert_eq!(stack.queue.pending().unwrap()[0].retry_count, attempt);
        }

        let report = stack.queue.drain().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(stack.queue.pending().unwrap().is_empty());

        let report = stack.queue.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(stack.transport.calls_to("players/7"), MAX_RETRY_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_drain_delivers_and_caches_reads() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        let url = format!("{MOCK_BASE}/players/42");
        stack.queue.enqueue(&UpstreamRequest::get(&url)).unwrap();
        stack.transport.ok("players/42", json!({"profile": {"account_id": 42}}));

        let report = stack.queue.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(stack.queue.pending_count(), 0);
        assert_eq!(
            stack.cache.cached_response(&url).unwrap(),
            Some(json!({"profile": {"account_id": 42}}))
        );
    }

    #[tokio::test]
    async fn test_drain_non_success_status_counts_as_failure() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.route("heroStats", Reply::Status(503, json!({})));
        stack
            .queue
            .enqueue(&UpstreamRequest::get(format!("{MOCK_BASE}/heroStats")))
            .unwrap();

        let report = stack.queue.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(stack.queue.pending().unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_drain_skipped_while_offline() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack
            .queue
            .enqueue(&UpstreamRequest::get(format!("{MOCK_BASE}/heroStats")))
            .unwrap();
        stack.connectivity.set_online(false);

        let report = stack.queue.drain().await.unwrap();
        assert!(report.skipped_offline);
        assert_eq!(stack.transport.total_calls(), 0);
        assert_eq!(stack.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_is_not_reentrant() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.route(
            "heroStats",
            Reply::Slow(Duration::from_millis(200), 200, hero_stats_body()),
        );
        stack
            .queue
            .enqueue(&UpstreamRequest::get(format!("{MOCK_BASE}/heroStats")))
            .unwrap();

        let queue = stack.queue.clone();
        let first = tokio::spawn(async move { queue.drain().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(stack.queue.is_draining());
        let second = stack.queue.drain().await.unwrap();
        assert!(second.already_running);
        assert_eq!(second.attempted, 0);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.delivered, 1);
        assert!(!stack.queue.is_draining());
        assert_eq!(stack.transport.calls_to("heroStats"), 1);
    }

    #[tokio::test]
    async fn test_scheduler_drains_when_back_online() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.connectivity.set_online(false);
        stack.transport.ok("players/42", json!({"profile": {"account_id": 42}}));
        stack
            .queue
            .enqueue(&UpstreamRequest::get(format!("{MOCK_BASE}/players/42")))
            .unwrap();

        let task = stack.queue.spawn_scheduler(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stack.queue.pending_count(), 1);

        stack.connectivity.set_online(true);
        let mut drained = false;
        for _ in 0..200 {
            if stack.queue.pending_count() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert!(drained, "reconnect should trigger a drain");
        assert_eq!(stack.transport.calls_to("players/42"), 1);
    }

    #[test]
    fn test_failed_request_round_trips_to_request() {
        let request = UpstreamRequest::get("http://mock.test/api/heroStats");
        let failed = FailedRequest::from_request(&request);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.to_request(), request);

        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("retryCount").is_some());
    }

    // ===============================
    // RESILIENT API TESTS
    // ===============================

    #[tokio::test]
    async fn test_heroes_live_then_cached_on_failure() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.ok("heroStats", hero_stats_body());

        let live = stack.api.get_heroes().await;
        assert!(!live.cached && !live.is_demo);
        assert_eq!(live.data.len(), 2);
        assert_eq!(live.data[0].extra.get("pro_pick"), Some(&json!(120)));

        stack.transport.route("heroStats", Reply::Down);
        let cached = stack.api.get_heroes().await;
        assert!(cached.cached);
        assert!(!cached.is_demo);
        assert!(!cached.stale);
        assert_eq!(cached.data, live.data);
        assert_eq!(stack.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_heroes_demo_when_cold_and_unreachable() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());

        let heroes = stack.api.get_heroes().await;
        assert!(heroes.is_demo);
        assert!(!heroes.cached);
        assert_eq!(heroes.data, demo_heroes());
    }

    #[tokio::test]
    async fn test_stale_cache_is_flagged() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.ok("heroStats", hero_stats_body());
        stack.api.get_heroes().await;

        let url = format!("{MOCK_BASE}/heroStats");
        let two_hours_ago = (Utc::now() - ChronoDuration::hours(2)).timestamp_millis();
        stack
            .cache
            .mark_fresh_at(&cache_key_for(&url), CacheType::Heroes, two_hours_ago)
            .unwrap();
        stack.transport.route("heroStats", Reply::Down);

        let heroes = stack.api.get_heroes().await;
        assert!(heroes.cached);
        assert!(heroes.stale);
    }

    #[tokio::test]
    async fn test_offline_reads_skip_transport() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.connectivity.set_online(false);

        let heroes = stack.api.get_heroes().await;
        assert!(heroes.is_demo);
        assert_eq!(stack.transport.total_calls(), 0);
        assert_eq!(stack.queue.pending_count(), 1);
        assert!(!stack.api.ping().await);
    }

    #[tokio::test]
    async fn test_match_not_found_is_not_queued() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.route("matches/123", Reply::Status(404, json!({"error": "Not Found"})));

        let result = stack.api.get_match(123).await;
        assert!(matches!(result, Err(CompanionError::UpstreamNotFound(_))));
        assert_eq!(stack.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_falls_back_to_cache_without_queueing() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.ok("matches/9", json!({"match_id": 9, "duration": 1800}));
        stack.api.get_match(9).await.unwrap();

        stack.transport.route("matches/9", Reply::Status(500, json!({})));
        let detail = stack.api.get_match(9).await.unwrap();
        assert!(detail.cached);
        assert_eq!(detail.data.duration, Some(1800));
        assert_eq!(stack.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_player_demo_fallback_keeps_account_id() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());

        let player = stack.api.get_player(555).await.unwrap();
        assert!(player.is_demo);
        assert_eq!(player.data.profile.unwrap().account_id, 555);

        let wl = stack.api.get_player_win_loss(555).await.unwrap();
        assert!(wl.is_demo);
    }

    #[tokio::test]
    async fn test_search_numeric_query() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.ok(
            "players/87287966",
            json!({"profile": {"account_id": 87287966, "personaname": "Dendi"}, "rank_tier": 80}),
        );
        stack.transport.route("players/1234", Reply::Status(404, json!({})));

        let found = stack.api.search_players("87287966").await;
        assert!(!found.is_demo);
        assert_eq!(found.data.len(), 1);
        assert_eq!(found.data[0].account_id, 87_287_966);
        assert_eq!(found.data[0].personaname.as_deref(), Some("Dendi"));

        let missing = stack.api.search_players("1234").await;
        assert!(missing.data.is_empty());
        assert!(!missing.is_demo);
        assert_eq!(stack.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_search_by_name() {
        let dir = TempDir::new().unwrap();
        let stack = network_stack(dir.path());
        stack.transport.ok(
            "search?q=Black%20Hole",
            json!([{"account_id": 1, "personaname": "Black Hole", "similarity": 0.9}]),
        );

        let hits = stack.api.search_players("  Black Hole ").await;
        assert_eq!(hits.data.len(), 1);
        assert_eq!(hits.data[0].similarity, Some(0.9));

        let empty = stack.api.search_players("   ").await;
        assert!(empty.data.is_empty());
        assert_eq!(stack.transport.total_calls(), 1);

        let demo = stack.api.search_players("Demo Carry").await;
        assert!(demo.is_demo);
        assert_eq!(demo.data.len(), 1);
    }

    #[tokio::test]
    async fn test_http_timeout_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/heroStats", listener.local_addr().unwrap());
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let err = transport.fetch(&UpstreamRequest::get(url)).await.unwrap_err();

        assert!(matches!(err, CompanionError::Transport(_)), "{err:?}");
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }

    // ===============================
    // FALLBACK PERSISTENCE TESTS
    // ===============================

    #[test]
    fn test_mirror_failure_does_not_fail_primary_write() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let primary: Arc<dyn PersistenceBackend> = Arc::new(open_store(dir.path()));
        let persistence = FallbackPersistence::new(Some(primary), Arc::new(BrokenMirror));

        persistence.save_profile(&UserProfile::new(STEAM_ID, "testuser")).unwrap();
        persistence.add_favorite_hero(STEAM_ID, FavoriteHero::new(1, "Anti-Mage")).unwrap();
        let build = persistence
            .save_custom_build(STEAM_ID, CustomBuild::new(1, "AM farm", vec!["bfury".into()]))
            .unwrap();
        persistence.cache_match(STEAM_ID, sample_match(1, 5, MatchResult::Win)).unwrap();
        persistence.set_setting("theme", &json!("dark")).unwrap();

        assert_eq!(persistence.get_profile(None).unwrap().unwrap().steam_id, STEAM_ID);
        assert_eq!(persistence.get_favorite_heroes(STEAM_ID).unwrap().len(), 1);
        assert_eq!(persistence.get_custom_builds(STEAM_ID, None).unwrap()[0].id, build.id);
        assert_eq!(persistence.get_cached_matches(STEAM_ID, 10).unwrap().len(), 1);
        assert_eq!(persistence.get_setting("theme").unwrap(), Some(json!("dark")));
        persistence.health_check().unwrap();
    }

    #[test]
    fn test_mirror_errors_propagate_without_primary() {
        let persistence = FallbackPersistence::new(None, Arc::new(BrokenMirror));

        let result = persistence.save_profile(&UserProfile::new(STEAM_ID, "testuser"));
        assert!(matches!(result, Err(CompanionError::StorageUnavailable(_))));
        assert!(persistence.get_favorite_heroes(STEAM_ID).is_err());
        assert!(!persistence.reconcile().unwrap());
    }

    // ===============================
    // FACADE TESTS
    // ===============================

    #[tokio::test]
    async fn test_login_reload_and_flat_takeover() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        {
            let backend = test_backend(dir.path(), transport.clone());
            backend.get_or_create_profile("testuser", "testuser").await.unwrap();
            backend.add_favorite_hero(FavoriteHero::new(1, "Anti-Mage")).await.unwrap();
            assert_eq!(backend.has_structured_store(), Some(true));
        }

        // the LMDB tier alone still has everything
        {
            let config = test_config(dir.path());
            let store = StructuredStore::open(config.structured_path(), TEST_MAP_SIZE).unwrap();
            let heroes = store.get_favorite_heroes("testuser").unwrap();
            assert_eq!(heroes.len(), 1);
            assert_eq!(heroes[0].name, "Anti-Mage");
            let profile = store.get_profile(Some("testuser")).unwrap().unwrap();
            assert_eq!(profile.favorite_heroes[0].id, 1);
        }

        // LMDB cannot open: the flat mirror answers
        let mut blocked = test_config(dir.path());
        blocked.database_name = "blocked".to_string();
        std::fs::write(blocked.structured_path(), b"not a directory").unwrap();

        let fallback = CompanionBackend::new(blocked, transport, Connectivity::new(true));
        fallback.initialize().await.unwrap();
        assert_eq!(fallback.has_structured_store(), Some(false));

        let heroes = fallback.get_favorite_heroes().await.unwrap();
        assert_eq!(heroes.len(), 1);
        assert_eq!(heroes[0].name, "Anti-Mage");
        let profile = fallback.get_profile(Some("testuser")).await.unwrap().unwrap();
        assert_eq!(profile.favorite_heroes[0].id, 1);
    }

    #[tokio::test]
    async fn test_flat_only_session_carried_into_lmdb() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let config = test_config(dir.path());
        std::fs::write(config.structured_path(), b"not a directory").unwrap();

        let build_id = {
            let backend = test_backend(dir.path(), transport.clone());
            backend.initialize().await.unwrap();
            assert_eq!(backend.has_structured_store(), Some(false));
            backend.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();
            backend.add_favorite_hero(FavoriteHero::new(1, "Anti-Mage")).await.unwrap();
            backend.add_favorite_item(FavoriteItem::new(116, "Black King Bar")).await.unwrap();
            backend.cache_match(sample_match(7, 5, MatchResult::Win)).await.unwrap();
            backend.set_setting("theme", &json!("dark")).await.unwrap();
            backend
                .save_custom_build(CustomBuild::new(1, "AM farm", vec!["battle_fury".into()]))
                .await
                .unwrap()
                .id
        };

        std::fs::remove_file(config.structured_path()).unwrap();
        let backend = test_backend(dir.path(), transport);
        backend.initialize().await.unwrap();
        assert_eq!(backend.has_structured_store(), Some(true));

        let heroes = backend.get_favorite_heroes().await.unwrap();
        assert_eq!(heroes.len(), 1);
        assert_eq!(heroes[0].id, 1);
        assert_eq!(backend.get_favorite_items().await.unwrap().len(), 1);
        let builds = backend.get_custom_builds(None).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].id, build_id);
        assert_eq!(backend.get_cached_matches(10).await.unwrap()[0].match_id, 7);
        assert_eq!(backend.get_setting("theme").await.unwrap(), Some(json!("dark")));

        let exported = backend.export_data().await.unwrap();
        assert_eq!(exported.favorite_heroes.len(), 1);
        assert_eq!(
            exported.favorite_heroes.len(),
            exported.profile.unwrap().favorite_heroes.len()
        );

        // the rows now live in LMDB itself
        drop(backend);
        let store = StructuredStore::open(config.structured_path(), TEST_MAP_SIZE).unwrap();
        assert_eq!(store.get_favorite_heroes(STEAM_ID).unwrap().len(), 1);
        assert_eq!(store.get_custom_builds(STEAM_ID, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_flat_profile_replaces_lmdb_rows() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let config = test_config(dir.path());
        {
            let backend = test_backend(dir.path(), transport.clone());
            backend.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();
            backend.add_favorite_hero(FavoriteHero::new(1, "Anti-Mage")).await.unwrap();
            backend.cache_match(sample_match(1, 30, MatchResult::Loss)).await.unwrap();
        }

        // LMDB goes missing for one session
        let lmdb_path = config.structured_path();
        let parked = dir.path().join("parked.lmdb");
        std::fs::rename(&lmdb_path, &parked).unwrap();
        std::fs::write(&lmdb_path, b"not a directory").unwrap();
        {
            let backend = test_backend(dir.path(), transport.clone());
            assert!(backend.remove_favorite_hero(1).await.unwrap());
            backend.add_favorite_hero(FavoriteHero::new(74, "Invoker")).await.unwrap();
            backend.cache_match(sample_match(2, 10, MatchResult::Win)).await.unwrap();
            assert_eq!(backend.has_structured_store(), Some(false));
        }
        std::fs::remove_file(&lmdb_path).unwrap();
        std::fs::rename(&parked, &lmdb_path).unwrap();

        let backend = test_backend(dir.path(), transport);
        let heroes = backend.get_favorite_heroes().await.unwrap();
        assert_eq!(heroes.iter().map(|h| h.id).collect::<Vec<_>>(), vec![74]);
        let matches = backend.get_cached_matches(10).await.unwrap();
        assert_eq!(matches.iter().map(|m| m.match_id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(backend.has_structured_store(), Some(true));
    }

    #[tokio::test]
    async fn test_login_as_someone_else_replaces_profile() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));

        let first = backend.get_or_create_profile("1", "one").await.unwrap();
        let again = backend.get_or_create_profile("1", "ignored").await.unwrap();
        assert_eq!(again.persona_name, first.persona_name);

        backend.get_or_create_profile("2", "two").await.unwrap();
        assert!(backend.get_profile(Some("1")).await.unwrap().is_none());
        assert_eq!(backend.get_profile(None).await.unwrap().unwrap().steam_id, "2");
    }

    #[tokio::test]
    async fn test_profile_required_before_user_data() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));

        let result = backend.add_favorite_hero(FavoriteHero::new(1, "Anti-Mage")).await;
        assert!(matches!(result, Err(CompanionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_profile_merges_fields() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));
        let created = backend.get_or_create_profile(STEAM_ID, "before").await.unwrap();

        let updated = backend
            .update_profile(ProfileUpdate {
                persona_name: Some("after".to_string()),
                ..ProfileUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.persona_name, "after");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(backend.get_profile(None).await.unwrap().unwrap().persona_name, "after");
    }

    #[tokio::test]
    async fn test_facade_builds_and_favorites_stay_in_profile() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));
        backend.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();

        let build = backend
            .save_custom_build(CustomBuild::new(74, "Quas-Wex", vec!["hand_of_midas".into()]))
            .await
            .unwrap();
        backend.add_favorite_item(FavoriteItem::new(1, "Blink Dagger")).await.unwrap();

        let profile = backend.get_profile(None).await.unwrap().unwrap();
        assert_eq!(profile.custom_builds.len(), 1);
        assert_eq!(profile.custom_builds[0].id, build.id);
        assert_eq!(profile.favorite_items.len(), 1);

        assert!(backend.delete_custom_build(&build.id).await.unwrap());
        assert!(backend.remove_favorite_item(1).await.unwrap());
        let profile = backend.get_profile(None).await.unwrap().unwrap();
        assert!(profile.custom_builds.is_empty());
        assert!(profile.favorite_items.is_empty());
        assert!(backend.get_custom_builds(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let source_dir = TempDir::new().unwrap();
        let source = test_backend(source_dir.path(), Arc::new(MockTransport::default()));
        source.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();
        source.add_favorite_hero(FavoriteHero::new(1, "Anti-Mage")).await.unwrap();
        source.add_favorite_hero(FavoriteHero::new(74, "Invoker")).await.unwrap();
        source.add_favorite_item(FavoriteItem::new(116, "Black King Bar")).await.unwrap();
        source
            .save_custom_build(CustomBuild::new(1, "AM farm", vec!["battle_fury".into()]))
            .await
            .unwrap();
        for id in 0..3 {
            source
                .cache_match(sample_match(100 + id, 60 - id as i64 * 10, MatchResult::Win))
                .await
                .unwrap();
        }
        source.set_setting("theme", &json!("dark")).await.unwrap();

        let exported = source.export_data().await.unwrap();
        let wire = serde_json::to_string(&exported).unwrap();
        let parsed: ExportSnapshot = serde_json::from_str(&wire).unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = test_backend(target_dir.path(), Arc::new(MockTransport::default()));
        target.import_data(&parsed).await.unwrap();
        let reexported = target.export_data().await.unwrap();

        assert_eq!(reexported.profile, exported.profile);
        assert_eq!(reexported.favorite_heroes, exported.favorite_heroes);
        assert_eq!(reexported.favorite_items, exported.favorite_items);
        assert_eq!(reexported.cached_matches, exported.cached_matches);
        assert_eq!(reexported.settings, exported.settings);
        assert_eq!(reexported.custom_builds.len(), 1);
        let (before, after) = (&exported.custom_builds[0], &reexported.custom_builds[0]);
        assert_eq!(after.id, before.id);
        assert_eq!(after.items, before.items);
        assert_eq!(after.date_created, before.date_created);
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));
        let mut snapshot = ExportSnapshot::empty();
        snapshot.version = "9.0".to_string();

        let result = backend.import_data(&snapshot).await;
        assert!(matches!(result, Err(CompanionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sync_recent_matches_updates_statistics() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap().timestamp();
        transport.ok(
            "players/42/recentMatches",
            json!([
                {"match_id": 3, "hero_id": 1, "player_slot": 0, "radiant_win": true,
                 "duration": 2000, "kills": 10, "deaths": 2, "assists": 5, "start_time": start + 7200},
                {"match_id": 2, "hero_id": 1, "player_slot": 130, "radiant_win": false,
                 "duration": 2100, "kills": 4, "deaths": 4, "assists": 4, "start_time": start + 3600},
                {"match_id": 1, "hero_id": 2, "player_slot": 1, "radiant_win": false,
                 "duration": 1900, "kills": 1, "deaths": 9, "assists": 3, "start_time": start}
            ]),
        );
        let backend = test_backend(dir.path(), transport);
        backend.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();

        let stats = backend.sync_recent_matches(42).await.unwrap();
        assert!(!stats.cached);
        assert_eq!(stats.data.total_matches, 3);
        assert_eq!(stats.data.wins, 2);
        assert_eq!(stats.data.current_streak.length, 2);

        let cached = backend.get_cached_matches(10).await.unwrap();
        assert_eq!(cached.iter().map(|m| m.match_id).collect::<Vec<_>>(), vec![3, 2, 1]);
        let profile = backend.get_profile(None).await.unwrap().unwrap();
        assert_eq!(profile.statistics.wins, 2);
    }

    #[tokio::test]
    async fn test_health_report_states() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        transport.ok("health", json!({"status": "ok"}));
        let backend = test_backend(dir.path(), transport);

        let healthy = backend.health_check().await;
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert!(healthy.storage.ok && healthy.network);
        assert_eq!(healthy.storage.backend, "lmdb");

        backend.connectivity().set_online(false);
        let degraded = backend.health_check().await;
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert!(!degraded.network);
    }

    #[tokio::test]
    async fn test_health_degraded_without_structured_store() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        transport.ok("health", json!({}));
        let mut config = test_config(dir.path());
        config.database_name = "blocked".to_string();
        std::fs::write(config.structured_path(), b"x").unwrap();

        let backend = CompanionBackend::new(config, transport, Connectivity::new(true));
        let report = backend.health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.storage.structured_available);
        assert!(report.storage.flat_available);
        assert_eq!(report.storage.backend, "flat");
    }

    #[tokio::test]
    async fn test_clear_all_data_wipes_both_tiers() {
        let dir = TempDir::new().unwrap();
        let backend = test_backend(dir.path(), Arc::new(MockTransport::default()));
        backend.get_or_create_profile(STEAM_ID, "testuser").await.unwrap();
        backend.set_setting("theme", &json!("dark")).await.unwrap();
        assert_eq!(backend.pending_retries().await.unwrap(), 0);
        backend.get_heroes().await.unwrap();
        assert_eq!(backend.pending_retries().await.unwrap(), 1);

        backend.clear_all_data().await.unwrap();

        assert!(backend.get_profile(None).await.unwrap().is_none());
        assert!(backend.get_setting("theme").await.unwrap().is_none());
        assert_eq!(backend.pending_retries().await.unwrap(), 0);
    }

    // ===============================
    // CONFIGURATION TESTS
    // ===============================

    #[test]
    fn test_config_toml_with_defaults() {
        let config = CompanionConfig::from_toml_str(
            r#"
            data_dir = "/tmp/companion"
            request_timeout_ms = 2500
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, Path::new("/tmp/companion"));
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
        assert_eq!(config.structured_path(), Path::new("/tmp/companion/dota2_companion.lmdb"));
        config.validate().unwrap();

        assert!(CompanionConfig::from_toml_str("request_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_config_environment_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DATA_DIR, "/data/override"),
            (ENV_API_URL, "http://localhost:8080/api"),
            (ENV_TIMEOUT_MS, "750"),
        ]
        .into_iter()
        .collect();

        let mut config = CompanionConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.data_dir, Path::new("/data/override"));
        assert_eq!(config.api_base_url, "http://localhost:8080/api");
        assert_eq!(config.request_timeout_ms, 750);

        let mut bad = CompanionConfig::default();
        let result = bad.apply_overrides(|name| (name == ENV_TIMEOUT_MS).then(|| "fast".to_string()));
        assert!(matches!(result, Err(CompanionError::Validation(_))));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("companion.toml");
        std::fs::write(
            &path,
            format!(
                "data_dir = {:?}\napi_base_url = \"http://localhost:9000/api\"\n",
                dir.path().join("data")
            ),
        )
        .unwrap();

        let config = CompanionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, dir.path().join("data"));
        assert_eq!(config.api_base_url, "http://localhost:9000/api");
        assert_eq!(config.retry_interval(), DEFAULT_POLL_INTERVAL);

        assert!(CompanionConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
        std::fs::write(&path, "api_base_url = \"gopher://x\"").unwrap();
        assert!(matches!(
            CompanionConfig::load(Some(&path)),
            Err(CompanionError::Validation(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config = CompanionConfig::from_json_str(r#"{"request_timeout_ms": 900}"#).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(900));
        assert_eq!(config.database_name, CompanionConfig::default().database_name);

        assert!(CompanionConfig::from_json_str("{oops").is_err());
        assert!(CompanionConfig::from_json_str(r#"{"retry_interval_secs": 0}"#).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CompanionConfig::default();
        config.api_base_url = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        let mut config = CompanionConfig::default();
        config.retry_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    // ===============================
    // ERROR MAPPING TESTS
    // ===============================

    #[test]
    fn test_error_categories() {
        assert!(CompanionError::Transport("x".into()).is_retryable());
        assert!(CompanionError::Offline("x".into()).is_retryable());
        assert!(!CompanionError::UpstreamNotFound("x".into()).is_retryable());
        assert!(!CompanionError::Upstream { status: 500, path: "x".into() }.is_retryable());

        assert!(matches!(
            AppResponse::from(CompanionError::QuotaExceeded("x".into())),
            AppResponse::QuotaExceeded(_)
        ));
        assert!(matches!(
            AppResponse::from(CompanionError::Offline("x".into())),
            AppResponse::NetworkError(_)
        ));
        assert!(matches!(
            AppResponse::from(CompanionError::UpstreamNotFound("x".into())),
            AppResponse::NotFound(_)
        ));
    }

    // ===============================
    // FFI FUNCTION TESTS
    // ===============================

    #[test]
    fn test_ffi_null_handle() {
        let null = std::ptr::null_mut();
        assert!(matches!(take_response(get_profile(null)), AppResponse::BadRequest(_)));
        assert!(matches!(take_response(export_data(null)), AppResponse::BadRequest(_)));
        assert!(matches!(take_response(health_check(null)), AppResponse::BadRequest(_)));
        assert!(matches!(take_response(set_online(null, true)), AppResponse::BadRequest(_)));
        assert!(matches!(take_response(close_companion(null)), AppResponse::BadRequest(_)));
    }

    #[test]
    fn test_ffi_invalid_config() {
        let bad_json = CString::new("{not json").unwrap();
        assert!(create_companion(bad_json.as_ptr()).is_null());

        let invalid_utf8: [u8; 3] = [0xFF, 0xFE, 0x00];
        assert!(create_companion(invalid_utf8.as_ptr() as *const c_char).is_null());

        let bad_url = CString::new(r#"{"api_base_url":"not-a-url"}"#).unwrap();
        assert!(create_companion(bad_url.as_ptr()).is_null());
    }

    #[test]
    fn test_ffi_create_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("companion.toml");
        std::fs::write(&path, format!("data_dir = {:?}\n", dir.path().join("data"))).unwrap();

        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        let handle = create_companion_from_file(c_path.as_ptr());
        assert!(!handle.is_null());
        assert!(dir.path().join("data").join("dota2_companion.lmdb").exists());
        assert!(matches!(take_response(close_companion(handle)), AppResponse::Ok(_)));

        let missing = CString::new(dir.path().join("nope.toml").to_str().unwrap()).unwrap();
        assert!(create_companion_from_file(missing.as_ptr()).is_null());
        assert!(create_companion_from_file(std::ptr::null()).is_null());
    }

    #[test]
    fn test_ffi_lifecycle() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let config = json!({
            "data_dir": dir.path(),
            "api_base_url": "http://127.0.0.1:9/api",
            "request_timeout_ms": 500,
            "lmdb_map_size": TEST_MAP_SIZE,
        });
        let config = CString::new(config.to_string()).unwrap();
        let handle = create_companion(config.as_ptr());
        assert!(!handle.is_null());

        // keep the test off the network entirely
        assert!(take_response(set_online(handle, false)).is_ok());

        assert!(matches!(take_response(get_profile(handle)), AppResponse::NotFound(_)));

        let steam_id = CString::new(STEAM_ID).unwrap();
        let name = CString::new("testuser").unwrap();
        let profile = ok_payload(take_response(login_profile(handle, steam_id.as_ptr(), name.as_ptr())));
        assert_eq!(profile["steamId"], STEAM_ID);

        assert!(matches!(
            take_response(login_profile(handle, std::ptr::null(), name.as_ptr())),
            AppResponse::BadRequest(_)
        ));

        let hero = CString::new(r#"{"id": 14, "name": "Pudge"}"#).unwrap();
        let profile = ok_payload(take_response(add_favorite_hero(handle, hero.as_ptr())));
        assert_eq!(profile["favoriteHeroes"][0]["id"], 14);

        let broken = CString::new("{\"id\": }").unwrap();
        assert!(matches!(
            take_response(add_favorite_hero(handle, broken.as_ptr())),
            AppResponse::SerializationError(_)
        ));

        let build = CString::new(r#"{"heroId": 14, "name": "Hook", "items": ["blink"]}"#).unwrap();
        let stored = ok_payload(take_response(save_custom_build(handle, build.as_ptr())));
        assert!(stored["id"].as_str().unwrap().starts_with("build_"));

        let update = CString::new(r#"{"personaName": "renamed"}"#).unwrap();
        let profile = ok_payload(take_response(update_profile(handle, update.as_ptr())));
        assert_eq!(profile["personaName"], "renamed");

        let heroes = ok_payload(take_response(get_heroes(handle)));
        assert_eq!(heroes["isDemo"], true);

        let query = CString::new("Demo").unwrap();
        let hits = ok_payload(take_response(search_players(handle, query.as_ptr())));
        assert_eq!(hits["isDemo"], true);

        let matches = ok_payload(take_response(get_cached_matches(handle, 10)));
        assert_eq!(matches, json!([]));

        let report = ok_payload(take_response(health_check(handle)));
        assert_eq!(report["status"], "degraded");
        assert_eq!(report["network"], false);

        let snapshot = match take_response(export_data(handle)) {
            AppResponse::Ok(json) => json,
            other => panic!("export failed: {other}"),
        };
        let snapshot_c = CString::new(snapshot).unwrap();
        assert!(take_response(import_data(handle, snapshot_c.as_ptr())).is_ok());

        assert!(take_response(close_companion(handle)).is_ok());
    }
}
