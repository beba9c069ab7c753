//! Prometheus gauges exported on `/metrics`.
//!
//! Values are copied from the [`StatusAggregator`] on every scrape, so a
//! failing source keeps its last target counts and only flips `_sd_up`.

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

use crate::status::StatusAggregator;

pub struct Metrics {
    registry: Registry,
    version: String,
    up: IntGaugeVec,
    targets: IntGaugeVec,
}

impl Metrics {
    pub fn new(prefix: &str, version: impl Into<String>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let up = IntGaugeVec::new(
            Opts::new(format!("{}_sd_up", prefix), "Whether the last discovery cycle succeeded"),
            &["version", "discovery"],
        )?;
        let targets = IntGaugeVec::new(
            Opts::new(format!("{}_targets", prefix), "Number of published target groups per metrics label"),
            &["module"],
        )?;
        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(targets.clone()))?;

        Ok(Self {
            registry,
            version: version.into(),
            up,
            targets,
        })
    }

    /// Copies the current status of every source into the gauges. A source
    /// is up only when its adapter under the same name is up as well.
    pub fn refresh(&self, status: &StatusAggregator) {
        let report = status.report();

        let adapters: BTreeMap<&str, bool> = report
            .adapters
            .iter()
            .map(|(name, status)| (name.as_str(), status.up))
            .collect();

        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for (name, source) in &report.sources {
            // A source without a registered adapter counts on its own status.
            let written = adapters.get(name.as_str()).copied().unwrap_or(true);
            self.up
                .with_label_values(&[self.version.as_str(), name.as_str()])
                .set(i64::from(source.up && written));
            for (label, count) in &source.target_counts {
                *totals.entry(label.clone()).or_insert(0) += count;
            }
        }
        for (label, count) in totals {
            self.targets.with_label_values(&[label.as_str()]).set(count);
        }
    }

    /// Text exposition of everything registered.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
