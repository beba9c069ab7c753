//! The discovery-source contract and the poller that drives it.
//!
//! A [`Discovery`] only knows how to fetch and translate one backend's
//! records. The [`Poller`] owns the lifecycle shared by every variant:
//!
//! ```text
//! Idle → Fetching → Enriching → Publishing → Sleeping → Fetching …
//!                ↘ Failed ──────────────────↗
//! ```
//!
//! Cancellation of the governing token ends the loop from any state;
//! an interrupted cycle publishes nothing.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OutputConfig;
use crate::enrich::Enricher;
use crate::error::DiscoveryError;
use crate::models::{TargetGroup, METRICS_LABEL};
use crate::status::{new_handle, StatusHandle};

/// One configured discovery source.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Instance name from the config file.
    fn name(&self) -> &str;

    /// Output settings: poll interval and publish target.
    fn output(&self) -> &OutputConfig;

    /// Every `metrics_label` value this source can emit.
    fn metrics_labels(&self) -> Vec<String>;

    /// Lists the backend and translates records into target groups.
    ///
    /// Records that are not yet provisioned are left out. An empty result is
    /// not an error.
    async fn fetch(&self) -> Result<Vec<TargetGroup>, DiscoveryError>;

    /// Ownership enrichment for the fetched groups, if this source has one.
    fn enricher(&self) -> Option<&Enricher> {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Target selection
// ═══════════════════════════════════════════════════════════════════════

/// Which address of a record becomes the scrape target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSelection {
    #[default]
    Primary,
    Management,
    /// Addresses of the interface with this name.
    Interface(String),
}

/// Raw `target:` value: a name, or one of the legacy numeric codes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TargetSpec {
    Code(u8),
    Name(String),
}

impl Default for TargetSpec {
    fn default() -> Self {
        TargetSpec::Code(1)
    }
}

impl TargetSelection {
    pub fn parse(spec: &TargetSpec) -> Result<Self, DiscoveryError> {
        match spec {
            TargetSpec::Code(1) => Ok(TargetSelection::Primary),
            TargetSpec::Code(2) => Ok(TargetSelection::Management),
            TargetSpec::Code(3) => Ok(TargetSelection::Interface("Loopback10".to_string())),
            TargetSpec::Code(n) => Err(DiscoveryError::UnsupportedTarget(n.to_string())),
            TargetSpec::Name(name) => {
                let lowered = name.trim().to_ascii_lowercase();
                match lowered.as_str() {
                    "primary" => Ok(TargetSelection::Primary),
                    "management" | "mgmt" => Ok(TargetSelection::Management),
                    _ => match name.trim().split_once(':') {
                        Some((kind, iface))
                            if kind.eq_ignore_ascii_case("interface") && !iface.trim().is_empty() =>
                        {
                            Ok(TargetSelection::Interface(iface.trim().to_string()))
                        }
                        _ => Err(DiscoveryError::UnsupportedTarget(name.clone())),
                    },
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Poller
// ═══════════════════════════════════════════════════════════════════════

/// Groups per metrics label. Every declared label is present, zero included.
pub fn count_by_metrics_label(declared: &[String], batch: &[TargetGroup]) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = declared.iter().map(|l| (l.clone(), 0)).collect();
    for group in batch {
        if let Some(label) = group.label(METRICS_LABEL) {
            *counts.entry(label.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

pub struct Poller {
    discovery: Arc<dyn Discovery>,
    status: StatusHandle,
}

impl Poller {
    /// Status starts out down until the first successful cycle.
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            status: new_handle(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn name(&self) -> &str {
        self.discovery.name()
    }

    /// Fetches and, if the source supports it, enriches one batch.
    pub async fn poll_once(&self) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let name = self.discovery.name();
        debug!(discovery = %name, "fetching");
        let mut batch = self.discovery.fetch().await?;

        if let Some(enricher) = self.discovery.enricher() {
            debug!(discovery = %name, groups = batch.len(), "enriching");
            let enriched = enricher.enrich(&mut batch).await;
            debug!(discovery = %name, enriched, "enrichment done");
        }
        Ok(batch)
    }

    /// Polls until `token` is cancelled or the receiving side goes away.
    pub async fn run(self, tx: mpsc::Sender<Vec<TargetGroup>>, token: CancellationToken) {
        let name = self.discovery.name().to_string();
        let declared = self.discovery.metrics_labels();
        let mut ticker = tokio::time::interval(self.discovery.output().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(discovery = %name, interval_secs = self.discovery.output().refresh_interval, "poller started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.poll_once() => result,
            };

            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    error!(discovery = %name, error = %e, "discovery failed");
                    self.status.lock().up = false;
                    continue;
                }
            };

            if batch.is_empty() {
                info!(discovery = %name, "no targets discovered");
            }
            let counts = count_by_metrics_label(&declared, &batch);
            let groups = batch.len();

            tokio::select! {
                _ = token.cancelled() => break,
                sent = tx.send(batch) => {
                    if sent.is_err() {
                        warn!(discovery = %name, "reconciler stopped, ending poller");
                        break;
                    }
                }
            }

            {
                let mut status = self.status.lock();
                status.up = true;
                status.target_counts = counts;
            }
            debug!(discovery = %name, groups, "published batch");
        }

        info!(discovery = %name, "poller stopped");
    }
}
