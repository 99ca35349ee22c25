//! Freshness bookkeeping for network-sourced data.
//!
//! Each cached upstream resource gets one [`CacheMetadata`] row keyed by a
//! stable encoding of its URL. The cached bodies themselves live in the
//! [`OfflineStore`], routed by the shape of the URL (hero list, single
//! player, single match, anything else).

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::persistence::OfflineStore;

const MINUTE_MS: i64 = 60 * 1000;

/// Freshness class of a cached resource. The TTLs are fixed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Heroes,
    Players,
    Matches,
    Default,
}

impl CacheType {
    pub fn ttl_ms(&self) -> i64 {
        match self {
            CacheType::Heroes => 60 * MINUTE_MS,
            CacheType::Players => 30 * MINUTE_MS,
            CacheType::Matches => 24 * 60 * MINUTE_MS,
            CacheType::Default => 15 * MINUTE_MS,
        }
    }

    /// Unknown names fall back to [`CacheType::Default`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "heroes" => CacheType::Heroes,
            "players" => CacheType::Players,
            "matches" => CacheType::Matches,
            _ => CacheType::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub key: String,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Epoch milliseconds when the resource was last stored.
    pub timestamp: i64,
    /// Epoch milliseconds after which the row is swept.
    pub expiry: i64,
}

impl CacheMetadata {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expiry
    }
}

/// Deterministic, reversible key for a request URL.
pub fn cache_key_for(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}

/// What an upstream URL points at, as far as caching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    HeroList,
    Player(u64),
    MatchDetail(u64),
    Other(CacheType),
}

impl ResourceKind {
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            [.., "heroStats"] => ResourceKind::HeroList,
            [.., "players", id] => id
                .parse()
                .map(ResourceKind::Player)
                .unwrap_or(ResourceKind::Other(CacheType::Players)),
            [.., "matches", id] => id
                .parse()
                .map(ResourceKind::MatchDetail)
                .unwrap_or(ResourceKind::Other(CacheType::Matches)),
            [.., "players", _, _] => ResourceKind::Other(CacheType::Players),
            _ => ResourceKind::Other(CacheType::Default),
        }
    }

    pub fn cache_type(&self) -> CacheType {
        match self {
            ResourceKind::HeroList => CacheType::Heroes,
            ResourceKind::Player(_) => CacheType::Players,
            ResourceKind::MatchDetail(_) => CacheType::Matches,
            ResourceKind::Other(cache_type) => *cache_type,
        }
    }
}

pub struct CacheManager {
    store: Arc<dyn OfflineStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn OfflineStore>) -> Self {
        Self { store }
    }

    pub fn is_valid(&self, key: &str, cache_type: CacheType) -> bool {
        self.is_valid_at(key, cache_type, Utc::now().timestamp_millis())
    }

    /// `now - stored timestamp < ttl(cache_type)`; `false` without a row.
    pub fn is_valid_at(&self, key: &str, cache_type: CacheType, now_ms: i64) -> bool {
        match self.store.get_metadata(key) {
            Ok(Some(meta)) => now_ms - meta.timestamp < cache_type.ttl_ms(),
            Ok(None) => false,
            Err(e) => {
                warn!("Cache metadata lookup failed for {key}: {e}");
                false
            }
        }
    }

    pub fn mark_fresh(&self, key: &str, cache_type: CacheType) -> Result<CacheMetadata> {
        self.mark_fresh_at(key, cache_type, Utc::now().timestamp_millis())
    }

    pub fn mark_fresh_at(
        &self,
        key: &str,
        cache_type: CacheType,
        now_ms: i64,
    ) -> Result<CacheMetadata> {
        let meta = CacheMetadata {
            key: key.to_string(),
            cache_type,
            timestamp: now_ms,
            expiry: now_ms + cache_type.ttl_ms(),
        };
        self.store.put_metadata(&meta)?;
        Ok(meta)
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now().timestamp_millis())
    }

    /// Deletes every metadata row whose expiry lies before `now_ms`.
    pub fn sweep_expired_at(&self, now_ms: i64) -> Result<usize> {
        let removed = self.store.delete_expired_metadata(now_ms)?;
        if removed > 0 {
            info!("Cache sweep removed {removed} expired metadata rows");
        }
        Ok(removed)
    }

    /// Writes an upstream body into the typed cache for its URL and marks it fresh.
    pub fn store_response(&self, url: &str, body: &JsonValue) -> Result<()> {
        let kind = ResourceKind::from_url(url);
        let key = cache_key_for(url);

        match kind {
            ResourceKind::HeroList => match body.as_array() {
                Some(heroes) => self.store.put_heroes(heroes)?,
                None => self.store.put_response(&key, body)?,
            },
            ResourceKind::Player(account_id) => self.store.put_player(account_id, body)?,
            ResourceKind::MatchDetail(match_id) => self.store.put_match_detail(match_id, body)?,
            ResourceKind::Other(_) => self.store.put_response(&key, body)?,
        }

        self.mark_fresh(&key, kind.cache_type())?;
        debug!("Cached upstream response for {url} as {:?}", kind);
        Ok(())
    }

    /// Previously stored body for exactly this resource, if any.
    pub fn cached_response(&self, url: &str) -> Result<Option<JsonValue>> {
        let key = cache_key_for(url);
        match ResourceKind::from_url(url) {
            ResourceKind::HeroList => {
                let heroes = self.store.get_heroes()?;
                if heroes.is_empty() {
                    self.store.get_response(&key)
                } else {
                    Ok(Some(JsonValue::Array(heroes)))
                }
            }
            ResourceKind::Player(account_id) => self.store.get_player(account_id),
            ResourceKind::MatchDetail(match_id) => self.store.get_match_detail(match_id),
            ResourceKind::Other(_) => self.store.get_response(&key),
        }
    }

    pub fn is_url_fresh(&self, url: &str) -> bool {
        self.is_valid(&cache_key_for(url), ResourceKind::from_url(url).cache_type())
    }

    /// Runs [`CacheManager::sweep_expired`] every `every`; the first sweep happens immediately.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.sweep_expired() {
                    warn!("Cache sweep failed: {e}");
                }
            }
        })
    }
}
