//! Change-driven publishing of discovery batches.
//!
//! A [`Reconciler`] sits between one poller and one [`OutputWriter`]. It
//! turns every batch into a [`Snapshot`], compares it with the last one it
//! published and writes only when they differ.
//!
//! Keys are `"<source name>:<group source>:<n>"` where `n` counts groups
//! sharing the same source key. Batches are put into a canonical order
//! before keys are assigned so the same groups in a different order map to
//! the same snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WriteError;
use crate::models::{CustomSdEntry, Snapshot, TargetGroup};
use crate::status::{new_handle, StatusHandle};
use crate::writer::OutputWriter;

/// Placeholder key seeded when output from an earlier run already exists.
const DUMMY_KEY: &str = "dummy";

pub struct Reconciler {
    name: String,
    key: String,
    writer: Arc<dyn OutputWriter>,
    snapshot: Snapshot,
    seeded: bool,
    status: StatusHandle,
}

impl Reconciler {
    /// `key` is the file name or config object data key written to.
    pub fn new(name: impl Into<String>, key: impl Into<String>, writer: Arc<dyn OutputWriter>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            writer,
            snapshot: Snapshot::new(),
            seeded: false,
            status: new_handle(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks at what an earlier process left behind. Non-empty output gets a
    /// dummy entry so the first live batch, even an empty one, is written.
    /// A failed read is tried again on the next publish.
    async fn seed(&mut self) {
        match self.writer.read(&self.key).await {
            Ok(existing) => {
                if !existing.trim().is_empty() {
                    debug!(adapter = %self.name, key = %self.key, "found previous output, seeding snapshot");
                    self.snapshot.insert(DUMMY_KEY.to_string(), CustomSdEntry::default());
                }
                self.seeded = true;
            }
            Err(e) => warn!(adapter = %self.name, error = %e, "could not read previous output"),
        }
    }

    /// Publishes `batch` if it differs from the last published snapshot.
    ///
    /// Returns whether a write happened. A failed write leaves the retained
    /// snapshot as it was, so the next identical batch is written again.
    pub async fn publish(&mut self, batch: &[TargetGroup]) -> Result<bool, WriteError> {
        if !self.seeded {
            self.seed().await;
        }

        let next = build_snapshot(&self.name, batch);
        if next == self.snapshot {
            debug!(adapter = %self.name, groups = next.len(), "snapshot unchanged, skipping write");
            self.status.lock().up = true;
            return Ok(false);
        }

        let result = match render(&next) {
            Ok(payload) => self.writer.write(&self.key, &payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    adapter = %self.name,
                    destination = %self.writer.describe(),
                    key = %self.key,
                    groups = next.len(),
                    "wrote targets"
                );
                self.snapshot = next;
                // our own output now replaces whatever was there before
                self.seeded = true;
                self.status.lock().up = true;
                Ok(true)
            }
            Err(e) => {
                self.status.lock().up = false;
                Err(e)
            }
        }
    }

    /// Publishes every batch received until `token` is cancelled or all
    /// senders are gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Vec<TargetGroup>>, token: CancellationToken) {
        info!(adapter = %self.name, destination = %self.writer.describe(), "reconciler started");
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if let Err(e) = self.publish(&batch).await {
                error!(adapter = %self.name, error = %e, "failed to write targets");
            }
        }
        info!(adapter = %self.name, "reconciler stopped");
    }
}

/// Keys every group of `batch` and converts it to an output entry.
pub fn build_snapshot(name: &str, batch: &[TargetGroup]) -> Snapshot {
    let mut ordered: Vec<(&TargetGroup, Vec<&str>)> = batch
        .iter()
        .map(|g| {
            let mut addresses: Vec<&str> = g.addresses().collect();
            addresses.sort_unstable();
            (g, addresses)
        })
        .collect();
    ordered.sort_by(|(a, a_addr), (b, b_addr)| {
        a.source
            .cmp(&b.source)
            .then_with(|| a.labels.cmp(&b.labels))
            .then_with(|| a_addr.cmp(b_addr))
    });

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    let mut snapshot = Snapshot::new();
    for (group, _) in ordered {
        let n = seen.entry(group.source.as_str()).or_insert(0);
        snapshot.insert(format!("{}:{}:{}", name, group.source, n), CustomSdEntry::from_group(group));
        *n += 1;
    }
    snapshot
}

/// Compact `file_sd` JSON array in key order.
pub fn render(snapshot: &Snapshot) -> Result<String, WriteError> {
    let entries: Vec<&CustomSdEntry> = snapshot.values().collect();
    Ok(serde_json::to_string(&entries)?)
}
