//! The single entry point the UI talks to.
//!
//! [`CompanionBackend`] wires the storage tiers, the cache manager, the
//! retry queue and the resilient API together on first use. Every public
//! method initializes the graph if needed, so callers never have to.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::cache_manager::CacheManager;
use crate::config::CompanionConfig;
use crate::connectivity::Connectivity;
use crate::error::{CompanionError, Result};
use crate::flat_store::FlatStore;
use crate::local_db_model::{
    CachedMatch, CustomBuild, ExportSnapshot, FavoriteHero, FavoriteItem, Kda, MatchResult,
    PlayerStatistics, ProfileUpdate, UserProfile, MAX_CACHED_MATCHES,
};
use crate::local_db_state::StructuredStore;
use crate::network_model::{
    Fetched, HeroStat, MatchDetail, PlayerSearchResult, PlayerSummary, RecentMatch, WinLoss,
};
use crate::persistence::{FallbackPersistence, OfflineStore, PersistenceBackend};
use crate::resilient_api::ResilientApi;
use crate::retry_queue::{DrainReport, RetryQueue};
use crate::upstream::{HttpTransport, UpstreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHealth {
    pub backend: String,
    pub structured_available: bool,
    pub flat_available: bool,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub storage: StorageHealth,
    /// The upstream answered its health endpoint.
    pub network: bool,
    pub pending_retries: usize,
    pub checked_at: DateTime<Utc>,
}

struct Services {
    structured: Option<Arc<StructuredStore>>,
    flat: Arc<FlatStore>,
    persistence: Arc<FallbackPersistence>,
    cache: Arc<CacheManager>,
    queue: Arc<RetryQueue>,
    api: ResilientApi,
}

pub struct CompanionBackend {
    config: CompanionConfig,
    connectivity: Connectivity,
    transport: Arc<dyn UpstreamTransport>,
    services: OnceCell<Services>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CompanionBackend {
    pub fn new(
        config: CompanionConfig,
        transport: Arc<dyn UpstreamTransport>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            config,
            connectivity,
            transport,
            services: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Production wiring: `reqwest` transport with the configured timeout.
    pub fn from_config(config: CompanionConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        Ok(Self::new(config, transport, Connectivity::default()))
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Builds the service graph once. Later calls are no-ops.
    pub async fn initialize(&self) -> Result<()> {
        self.services().await.map(|_| ())
    }

    /// Whether the LMDB tier opened; `None` before initialization.
    pub fn has_structured_store(&self) -> Option<bool> {
        self.services.get().map(|s| s.structured.is_some())
    }

    async fn services(&self) -> Result<&Services> {
        self.services
            .get_or_try_init(|| async { self.build_services() })
            .await
    }

    fn build_services(&self) -> Result<Services> {
        let config = &self.config;
        let flat = Arc::new(FlatStore::new(
            config.flat_dir(),
            config.flat_namespace.clone(),
            config.flat_quota_bytes,
        ));

        let structured = match StructuredStore::open(
            config.structured_path(),
            config.lmdb_map_size,
        ) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("{e}; continuing on the flat store");
                None
            }
        };

        if structured.is_none() && !flat.is_available() {
            return Err(CompanionError::StorageUnavailable(format!(
                "no usable storage under {}",
                config.data_dir.display()
            )));
        }

        let primary = structured
            .clone()
            .map(|store| store as Arc<dyn PersistenceBackend>);
        let persistence = Arc::new(FallbackPersistence::new(primary, flat.clone()));
        match persistence.reconcile() {
            Ok(true) => info!("Carried flat-store data over into the structured store"),
            Ok(false) => {}
            Err(e) => warn!("Could not carry flat-store data over: {e}"),
        }

        let offline: Arc<dyn OfflineStore> = match &structured {
            Some(store) => store.clone(),
            None => flat.clone(),
        };
        let cache = Arc::new(CacheManager::new(offline.clone()));
        let queue = Arc::new(RetryQueue::new(
            offline,
            cache.clone(),
            self.transport.clone(),
            self.connectivity.clone(),
        ));
        let api = ResilientApi::new(
            config.api_base_url.clone(),
            self.transport.clone(),
            cache.clone(),
            queue.clone(),
            self.connectivity.clone(),
        );

        info!(
            "Companion backend ready ({})",
            persistence.backend_name()
        );
        Ok(Services {
            structured,
            flat,
            persistence,
            cache,
            queue,
            api,
        })
    }

    /// Starts the retry scheduler and the cache sweeper on the current runtime.
    pub async fn start_background_tasks(&self) -> Result<()> {
        let services = self.services().await?;
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return Ok(());
        }
        tasks.push(services.queue.spawn_scheduler(self.config.retry_interval()));
        tasks.push(services.cache.spawn_sweeper(self.config.cache_sweep_interval()));
        info!("Started retry scheduler and cache sweeper");
        Ok(())
    }

    /// Stops background tasks and flushes the structured store.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Some(structured) = self.services.get().and_then(|s| s.structured.as_ref()) {
            if let Err(e) = structured.close() {
                warn!("Failed to flush structured store: {e}");
            }
        }
    }

    // ---- profile ----

    pub async fn get_profile(&self, steam_id: Option<&str>) -> Result<Option<UserProfile>> {
        self.services().await?.persistence.get_profile(steam_id)
    }

    pub async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        self.services().await?.persistence.save_profile(profile)
    }

    /// Returns the resident profile for `steam_id`, creating it on first login.
    ///
    /// Only one profile is kept: logging in as someone else replaces it.
    pub async fn get_or_create_profile(
        &self,
        steam_id: &str,
        persona_name: &str,
    ) -> Result<UserProfile> {
        let persistence = &self.services().await?.persistence;

        match persistence.get_profile(None)? {
            Some(existing) if existing.steam_id == steam_id => return Ok(existing),
            Some(other) => {
                info!("Replacing resident profile {} with {steam_id}", other.steam_id);
                persistence.delete_profile(&other.steam_id)?;
            }
            None => {}
        }

        let profile = UserProfile::new(steam_id, persona_name);
        persistence.save_profile(&profile)?;
        info!("Created profile for {steam_id}");
        Ok(profile)
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile> {
        let mut profile = self.current_profile().await?;
        profile.apply(update);
        self.save_profile(&profile).await?;
        Ok(profile)
    }

    async fn current_profile(&self) -> Result<UserProfile> {
        self.get_profile(None)
            .await?
            .ok_or_else(|| CompanionError::NotFound("no profile; log in first".to_string()))
    }

    // ---- favorites ----

    pub async fn add_favorite_hero(&self, hero: FavoriteHero) -> Result<UserProfile> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        persistence.add_favorite_hero(&profile.steam_id, hero.clone())?;
        if let Some(evicted) = profile.add_favorite_hero(hero) {
            debug!("Favorite hero {} evicted to stay under the cap", evicted.id);
        }
        profile.touch();
        persistence.save_profile(&profile)?;
        Ok(profile)
    }

    pub async fn remove_favorite_hero(&self, hero_id: u32) -> Result<bool> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        let removed = persistence.remove_favorite_hero(&profile.steam_id, hero_id)?;
        if profile.remove_favorite_hero(hero_id) || removed {
            profile.touch();
            persistence.save_profile(&profile)?;
        }
        Ok(removed)
    }

    pub async fn get_favorite_heroes(&self) -> Result<Vec<FavoriteHero>> {
        let profile = self.current_profile().await?;
        self.services()
            .await?
            .persistence
            .get_favorite_heroes(&profile.steam_id)
    }

    pub async fn add_favorite_item(&self, item: FavoriteItem) -> Result<UserProfile> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        persistence.add_favorite_item(&profile.steam_id, item.clone())?;
        if let Some(evicted) = profile.add_favorite_item(item) {
            debug!("Favorite item {} evicted to stay under the cap", evicted.id);
        }
        profile.touch();
        persistence.save_profile(&profile)?;
        Ok(profile)
    }

    pub async fn remove_favorite_item(&self, item_id: u32) -> Result<bool> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        let removed = persistence.remove_favorite_item(&profile.steam_id, item_id)?;
        if profile.remove_favorite_item(item_id) || removed {
            profile.touch();
            persistence.save_profile(&profile)?;
        }
        Ok(removed)
    }

    pub async fn get_favorite_items(&self) -> Result<Vec<FavoriteItem>> {
        let profile = self.current_profile().await?;
        self.services()
            .await?
            .persistence
            .get_favorite_items(&profile.steam_id)
    }

    // ---- builds ----

    pub async fn save_custom_build(&self, build: CustomBuild) -> Result<CustomBuild> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        let stored = persistence.save_custom_build(&profile.steam_id, build)?;
        profile.put_build(stored.clone());
        profile.touch();
        persistence.save_profile(&profile)?;
        Ok(stored)
    }

    pub async fn get_custom_builds(&self, hero_id: Option<u32>) -> Result<Vec<CustomBuild>> {
        let profile = self.current_profile().await?;
        self.services()
            .await?
            .persistence
            .get_custom_builds(&profile.steam_id, hero_id)
    }

    pub async fn delete_custom_build(&self, build_id: &str) -> Result<bool> {
        let persistence = &self.services().await?.persistence;
        let mut profile = self.current_profile().await?;

        let removed = persistence.delete_custom_build(build_id)?;
        if profile.delete_build(build_id) || removed {
            profile.touch();
            persistence.save_profile(&profile)?;
        }
        Ok(removed)
    }

    // ---- matches ----

    pub async fn cache_match(&self, entry: CachedMatch) -> Result<()> {
        let profile = self.current_profile().await?;
        self.services()
            .await?
            .persistence
            .cache_match(&profile.steam_id, entry)
    }

    pub async fn get_cached_matches(&self, limit: usize) -> Result<Vec<CachedMatch>> {
        let profile = self.current_profile().await?;
        self.services()
            .await?
            .persistence
            .get_cached_matches(&profile.steam_id, limit)
    }

    /// Pulls recent matches into the match cache and recomputes the profile
    /// statistics from everything cached.
    pub async fn sync_recent_matches(&self, account_id: u64) -> Result<Fetched<PlayerStatistics>> {
        let services = self.services().await?;
        let mut profile = self.current_profile().await?;

        let fetched = services.api.get_recent_matches(account_id).await?;
        for recent in &fetched.data {
            services
                .persistence
                .cache_match(&profile.steam_id, cached_match_from(recent))?;
        }

        let history = services
            .persistence
            .get_cached_matches(&profile.steam_id, MAX_CACHED_MATCHES)?;
        let statistics = PlayerStatistics::from_matches(&history);
        profile.statistics = statistics.clone();
        profile.touch();
        services.persistence.save_profile(&profile)?;

        Ok(fetched.map(|_| statistics))
    }

    // ---- settings ----

    pub async fn get_setting(&self, key: &str) -> Result<Option<JsonValue>> {
        self.services().await?.persistence.get_setting(key)
    }

    pub async fn set_setting(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.services().await?.persistence.set_setting(key, value)
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool> {
        self.services().await?.persistence.delete_setting(key)
    }

    // ---- export / import ----

    pub async fn export_data(&self) -> Result<ExportSnapshot> {
        self.services().await?.persistence.export_data()
    }

    pub async fn import_data(&self, snapshot: &ExportSnapshot) -> Result<()> {
        self.services().await?.persistence.import_data(snapshot)
    }

    /// Wipes both storage tiers, including cached network data and the retry queue.
    pub async fn clear_all_data(&self) -> Result<()> {
        let services = self.services().await?;
        services.persistence.clear_all()?;
        info!("All local data cleared");
        Ok(())
    }

    // ---- network reads ----

    pub async fn get_heroes(&self) -> Result<Fetched<Vec<HeroStat>>> {
        Ok(self.services().await?.api.get_heroes().await)
    }

    pub async fn get_player(&self, account_id: u64) -> Result<Fetched<PlayerSummary>> {
        self.services().await?.api.get_player(account_id).await
    }

    pub async fn get_player_win_loss(&self, account_id: u64) -> Result<Fetched<WinLoss>> {
        self.services().await?.api.get_player_win_loss(account_id).await
    }

    pub async fn get_recent_matches(&self, account_id: u64) -> Result<Fetched<Vec<RecentMatch>>> {
        self.services().await?.api.get_recent_matches(account_id).await
    }

    pub async fn get_match(&self, match_id: u64) -> Result<Fetched<MatchDetail>> {
        self.services().await?.api.get_match(match_id).await
    }

    pub async fn search_players(&self, query: &str) -> Result<Fetched<Vec<PlayerSearchResult>>> {
        Ok(self.services().await?.api.search_players(query).await)
    }

    // ---- retry queue ----

    pub async fn pending_retries(&self) -> Result<usize> {
        Ok(self.services().await?.queue.pending()?.len())
    }

    pub async fn drain_retry_queue(&self) -> Result<DrainReport> {
        self.services().await?.queue.drain().await
    }

    // ---- health ----

    /// Never fails; problems are reported in the returned status.
    pub async fn health_check(&self) -> HealthReport {
        let services = match self.services().await {
            Ok(services) => services,
            Err(e) => {
                return HealthReport {
                    status: HealthStatus::Error,
                    storage: StorageHealth {
                        backend: "none".to_string(),
                        structured_available: false,
                        flat_available: false,
                        ok: false,
                        error: Some(e.to_string()),
                    },
                    network: false,
                    pending_retries: 0,
                    checked_at: Utc::now(),
                }
            }
        };

        let storage_result = services.persistence.health_check();
        let storage = StorageHealth {
            backend: services.persistence.backend_name().to_string(),
            structured_available: services.structured.is_some(),
            flat_available: services.flat.is_available(),
            ok: storage_result.is_ok(),
            error: storage_result.err().map(|e| e.to_string()),
        };
        let network = services.api.ping().await;

        let status = if !storage.ok {
            HealthStatus::Error
        } else if !network || !storage.structured_available {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            storage,
            network,
            pending_retries: services.queue.pending_count(),
            checked_at: Utc::now(),
        }
    }
}

impl Drop for CompanionBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `cached_at` is the match start time so the cache orders by when matches were played.
fn cached_match_from(recent: &RecentMatch) -> CachedMatch {
    CachedMatch {
        match_id: recent.match_id,
        hero_id: recent.hero_id,
        result: if recent.won() {
            MatchResult::Win
        } else {
            MatchResult::Loss
        },
        duration: recent.duration,
        kda: Kda {
            kills: recent.kills,
            deaths: recent.deaths,
            assists: recent.assists,
        },
        items: Vec::new(),
        cached_at: Utc
            .timestamp_opt(recent.start_time, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}
