//! # Atlas service discovery
//!
//! Polls infrastructure inventories (OpenStack Ironic, NetBox, NetBox
//! switch inventory), turns their records into Prometheus target groups,
//! enriches them with ownership labels and publishes a `file_sd` JSON
//! document to a local file or a Kubernetes ConfigMap whenever it changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────┐   ┌────────────┐   ┌──────────────┐
//! │  Discovery   │──▶│  Poller  │──▶│ Reconciler │──▶│ OutputWriter │
//! │ ironic/netbox│   │ + enrich │   │ (diff)     │   │ file / cm    │
//! └──────────────┘   └────┬─────┘   └─────┬──────┘   └──────────────┘
//!                         │               │
//!                         ▼               ▼
//!                    ┌──────────────────────────┐
//!                    │ StatusAggregator → HTTP  │
//!                    │ /healthz /metrics        │
//!                    └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | CLI options, YAML config, template rendering |
//! | [`models`] | Target groups, output entries, snapshots |
//! | [`error`] | Error types |
//! | [`registry`] | Name → discovery factory |
//! | [`discovery`] | Discovery contract and poller |
//! | [`discovery_ironic`] | Bare-metal nodes |
//! | [`discovery_netbox`] | NetBox devices and VMs |
//! | [`discovery_switch`] | Network switches |
//! | [`enrich`] | Ownership enrichment |
//! | [`netbox`] | NetBox REST client |
//! | [`openstack`] | Keystone, Ironic, Nova clients |
//! | [`reconciler`] | Snapshot diff and publish |
//! | [`writer`] | Output writer trait |
//! | [`writer_file`] | Atomic file output |
//! | [`writer_configmap`] | ConfigMap output |
//! | [`retry`] | Conflict retry with backoff |
//! | [`status`] | Health state |
//! | [`metrics`] | Prometheus gauges |
//! | [`server`] | HTTP endpoints |
//! | [`service`] | Process wiring |

pub mod config;
pub mod discovery;
pub mod discovery_ironic;
pub mod discovery_netbox;
pub mod discovery_switch;
pub mod enrich;
pub mod error;
pub mod metrics;
pub mod models;
pub mod netbox;
pub mod openstack;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod server;
pub mod service;
pub mod status;
pub mod writer;
pub mod writer_configmap;
pub mod writer_file;
