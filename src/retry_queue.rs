//! Durable queue of upstream requests that failed for connectivity reasons.
//!
//! Rows move through `pending(0) -> pending(n) -> abandoned` on failed
//! replays, or are deleted as delivered on the first successful replay.
//! Abandonment is silent: the original caller already got a degraded answer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache_manager::CacheManager;
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::persistence::OfflineStore;
use crate::upstream::{UpstreamRequest, UpstreamTransport};

/// A row is dropped once its retry count reaches this value.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// Polling interval for the background drain while online.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRequest {
    /// Assigned by the store on insert.
    #[serde(default)]
    pub id: u64,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
}

impl FailedRequest {
    pub fn from_request(request: &UpstreamRequest) -> Self {
        Self {
            id: 0,
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timestamp: Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    pub fn to_request(&self) -> UpstreamRequest {
        UpstreamRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// What one call to [`RetryQueue::drain`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub skipped_offline: bool,
    pub already_running: bool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetryQueue {
    store: Arc<dyn OfflineStore>,
    cache: Arc<CacheManager>,
    transport: Arc<dyn UpstreamTransport>,
    connectivity: Connectivity,
    draining: AtomicBool,
}

impl RetryQueue {
    pub fn new(
        store: Arc<dyn OfflineStore>,
        cache: Arc<CacheManager>,
        transport: Arc<dyn UpstreamTransport>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            cache,
            transport,
            connectivity,
            draining: AtomicBool::new(false),
        }
    }

    /// Parks a request for later replay. Duplicate URLs are not collapsed.
    pub fn enqueue(&self, request: &UpstreamRequest) -> Result<FailedRequest> {
        let stored = self
            .store
            .insert_failed_request(FailedRequest::from_request(request))?;
        info!(
            "Queued {} {} for retry (id {})",
            stored.method, stored.url, stored.id
        );
        Ok(stored)
    }

    pub fn pending(&self) -> Result<Vec<FailedRequest>> {
        self.store.list_failed_requests()
    }

    pub fn pending_count(&self) -> usize {
        match self.store.list_failed_requests() {
            Ok(rows) => rows.len(),
            Err(e) => {
                warn!("Could not count queued requests: {e}");
                0
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replays every queued request once.
    ///
    /// Does nothing while offline, and returns immediately with
    /// `already_running` if another drain is in progress.
    pub async fn drain(&self) -> Result<DrainReport> {
        if !self.connectivity.is_online() {
            debug!("Skipping retry drain while offline");
            return Ok(DrainReport {
                skipped_offline: true,
                ..DrainReport::default()
            });
        }

        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Retry drain already in progress");
            return Ok(DrainReport {
                already_running: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        for mut failed in self.store.list_failed_requests()? {
            if !self.connectivity.is_online() {
                info!("Connectivity lost during drain; stopping early");
                break;
            }

            report.attempted += 1;
            let request = failed.to_request();

            let failure = match self.transport.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    self.store.delete_failed_request(failed.id)?;
                    report.delivered += 1;
                    if request.is_read() {
                        if let Err(e) = self.cache.store_response(&failed.url, &response.body) {
                            warn!("Replayed {} but caching the body failed: {e}", failed.url);
                        }
                    }
                    debug!("Delivered queued request {}", failed.id);
                    continue;
                }
                Ok(response) => format!("HTTP {}", response.status),
                Err(e) => e.to_string(),
            };

            failed.retry_count += 1;
            if failed.retry_count >= MAX_RETRY_ATTEMPTS {
                self.store.delete_failed_request(failed.id)?;
                report.abandoned += 1;
                info!(
                    "Abandoning {} {} after {} attempts ({failure})",
                    failed.method, failed.url, failed.retry_count
                );
            } else {
                self.store.update_failed_request(&failed)?;
                report.retried += 1;
                debug!(
                    "Replay of {} failed ({failure}); retry {}/{}",
                    failed.url, failed.retry_count, MAX_RETRY_ATTEMPTS
                );
            }
        }

        Ok(report)
    }

    /// Drains on every tick of `every` and on every offline -> online transition.
    ///
    /// Both triggers share [`RetryQueue::drain`], so they never overlap.
    pub fn spawn_scheduler(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut online = queue.connectivity.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            continue;
                        }
                        info!("Back online; draining retry queue");
                    }
                }

                match queue.drain().await {
                    Ok(report) if report.attempted > 0 => info!(
                        "Retry drain: {} delivered, {} retried, {} abandoned",
                        report.delivered, report.retried, report.abandoned
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Retry drain failed: {e}"),
                }
            }
        })
    }
}
