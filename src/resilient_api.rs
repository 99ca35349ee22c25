//! Best-effort reads against the upstream stats API.
//!
//! Every read goes network first. A successful body is written to the
//! cache. A failed read is queued for replay when the failure was about
//! connectivity, and then answered from the cache for that exact resource
//! when possible. The hero list, player summary and player search go one
//! step further and fall back to built-in demo records, so those calls
//! never fail for connectivity reasons.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::cache_manager::CacheManager;
use crate::connectivity::Connectivity;
use crate::error::{CompanionError, Result};
use crate::network_model::{
    Fetched, HeroStat, MatchDetail, PlayerSearchResult, PlayerSummary, RecentMatch, WinLoss,
};
use crate::placeholder;
use crate::retry_queue::RetryQueue;
use crate::upstream::{UpstreamRequest, UpstreamTransport};

pub struct ResilientApi {
    base_url: String,
    transport: Arc<dyn UpstreamTransport>,
    cache: Arc<CacheManager>,
    queue: Arc<RetryQueue>,
    connectivity: Connectivity,
}

impl ResilientApi {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn UpstreamTransport>,
        cache: Arc<CacheManager>,
        queue: Arc<RetryQueue>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            cache,
            queue,
            connectivity,
        }
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Network first, then the cached copy of the same resource.
    ///
    /// Offline and transport failures are queued for replay; upstream status
    /// errors are not. The original error is returned when nothing is cached.
    pub async fn fetch_resource(&self, path: &str) -> Result<Fetched<JsonValue>> {
        let url = self.url_for(path);

        let err = match self.fetch_live(&url).await {
            Ok(body) => return Ok(Fetched::live(body)),
            Err(err) => err,
        };

        if err.is_retryable() {
            if let Err(e) = self.queue.enqueue(&UpstreamRequest::get(&url)) {
                warn!("Could not queue {url} for retry: {e}");
            }
        }

        match self.cache.cached_response(&url) {
            Ok(Some(body)) => {
                let fresh = self.cache.is_url_fresh(&url);
                let age = if fresh { "fresh" } else { "stale" };
                info!("Serving cached {url} ({age}) after: {err}");
                Ok(Fetched::cached(body, fresh))
            }
            Ok(None) => {
                debug!("No cached copy of {url}");
                Err(err)
            }
            Err(cache_err) => {
                warn!("Cache lookup for {url} failed: {cache_err}");
                Err(err)
            }
        }
    }

    async fn fetch_live(&self, url: &str) -> Result<JsonValue> {
        if !self.connectivity.is_online() {
            return Err(CompanionError::Offline(format!("skipped request to {url}")));
        }

        let response = self.transport.fetch(&UpstreamRequest::get(url)).await?;
        match response.status {
            status if (200..300).contains(&status) => {
                if let Err(e) = self.cache.store_response(url, &response.body) {
                    warn!("Fetched {url} but caching failed: {e}");
                }
                Ok(response.body)
            }
            404 => Err(CompanionError::UpstreamNotFound(url.to_string())),
            status => Err(CompanionError::Upstream {
                status,
                path: url.to_string(),
            }),
        }
    }

    async fn fetch_typed<T: DeserializeOwned>(&self, path: &str) -> Result<Fetched<T>> {
        let fetched = self.fetch_resource(path).await?;
        decode(fetched)
    }

    /// Never fails: live, cached or demo heroes.
    pub async fn get_heroes(&self) -> Fetched<Vec<HeroStat>> {
        match self.fetch_typed("heroStats").await {
            Ok(heroes) => heroes,
            Err(e) => {
                warn!("Hero list unavailable ({e}); using demo heroes");
                Fetched::demo(placeholder::demo_heroes())
            }
        }
    }

    /// Falls back to a demo summary unless the upstream reports the player absent.
    pub async fn get_player(&self, account_id: u64) -> Result<Fetched<PlayerSummary>> {
        match self.fetch_typed(&format!("players/{account_id}")).await {
            Ok(summary) => Ok(summary),
            Err(e @ CompanionError::UpstreamNotFound(_)) => Err(e),
            Err(e) => {
                warn!("Player {account_id} unavailable ({e}); using demo profile");
                Ok(Fetched::demo(placeholder::demo_player(account_id)))
            }
        }
    }

    pub async fn get_player_win_loss(&self, account_id: u64) -> Result<Fetched<WinLoss>> {
        match self.fetch_typed(&format!("players/{account_id}/wl")).await {
            Ok(win_loss) => Ok(win_loss),
            Err(e @ CompanionError::UpstreamNotFound(_)) => Err(e),
            Err(e) => {
                warn!("Win/loss for {account_id} unavailable ({e}); using demo record");
                Ok(Fetched::demo(placeholder::demo_win_loss()))
            }
        }
    }

    pub async fn get_recent_matches(&self, account_id: u64) -> Result<Fetched<Vec<RecentMatch>>> {
        self.fetch_typed(&format!("players/{account_id}/recentMatches"))
            .await
    }

    /// [`CompanionError::UpstreamNotFound`] when the match does not exist and
    /// no copy is cached.
    pub async fn get_match(&self, match_id: u64) -> Result<Fetched<MatchDetail>> {
        self.fetch_typed(&format!("matches/{match_id}")).await
    }

    /// A numeric query is an account id lookup; anything else is a name search.
    ///
    /// A 404 yields an empty result. Other failures yield demo hits.
    pub async fn search_players(&self, query: &str) -> Fetched<Vec<PlayerSearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Fetched::live(Vec::new());
        }

        let result: Result<Fetched<Vec<PlayerSearchResult>>> = match query.parse::<u64>() {
            Ok(account_id) => self
                .fetch_typed::<PlayerSummary>(&format!("players/{account_id}"))
                .await
                .map(|fetched| {
                    fetched.map(|summary| {
                        PlayerSearchResult::from_summary(&summary)
                            .into_iter()
                            .collect()
                    })
                }),
            Err(_) => {
                self.fetch_typed(&format!("search?q={}", urlencoding::encode(query)))
                    .await
            }
        };

        match result {
            Ok(hits) => hits,
            Err(CompanionError::UpstreamNotFound(_)) => {
                debug!("No player matches '{query}'");
                Fetched::live(Vec::new())
            }
            Err(e) => {
                warn!("Player search for '{query}' unavailable ({e}); using demo results");
                Fetched::demo(placeholder::demo_search_results(query))
            }
        }
    }

    /// `GET /health` straight through the transport; never queued or cached.
    pub async fn ping(&self) -> bool {
        if !self.connectivity.is_online() {
            return false;
        }
        match self
            .transport
            .fetch(&UpstreamRequest::get(self.url_for("health")))
            .await
        {
            Ok(response) => response.is_success(),
            Err(e) => {
                debug!("Upstream health probe failed: {e}");
                false
            }
        }
    }
}

fn decode<T: DeserializeOwned>(fetched: Fetched<JsonValue>) -> Result<Fetched<T>> {
    let Fetched {
        data,
        cached,
        is_demo,
        stale,
    } = fetched;
    Ok(Fetched {
        data: serde_json::from_value(data)?,
        cached,
        is_demo,
        stale,
    })
}
