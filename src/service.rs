//! Process wiring: config → sources → pollers → reconcilers → HTTP.
//!
//! ```text
//!  Registry ──create──▶ Discovery ──▶ Poller ──mpsc──▶ Reconciler ──▶ OutputWriter
//!                                       │                  │
//!                                       └──── Status ──────┴──▶ StatusAggregator ──▶ /healthz, /metrics
//! ```
//!
//! Everything runs under one root [`CancellationToken`]. SIGINT, SIGTERM
//! and `POST /-/reload` cancel it; every task is joined before
//! [`Service::run`] returns.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, Options, OutputConfig, WriteTo};
use crate::discovery::{Discovery, Poller};
use crate::error::WriteError;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::registry::{Registry, SharedDeps};
use crate::server::{self, AppState};
use crate::status::StatusAggregator;
use crate::writer::OutputWriter;
use crate::writer_configmap::{ConfigMapWriter, KubeConfigMaps};
use crate::writer_file::FileWriter;

/// Batches a poller may queue before it waits for its reconciler.
const CHANNEL_CAPACITY: usize = 1;

pub struct Service {
    options: Options,
    config: Config,
    registry: Registry,
    shutdown: CancellationToken,
}

impl Service {
    pub fn new(options: Options, config: Config, registry: Registry) -> Self {
        Self {
            options,
            config,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until a signal or reload request, serving HTTP on `listener`.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let deps = SharedDeps::new(self.options.clone());
        let sources = create_sources(&self.registry, &self.config, &deps).await;
        if sources.is_empty() {
            warn!("no discovery source could be created, health will report unhealthy");
        }

        let mut writers = Writers::new(&self.options);
        let mut status = StatusAggregator::new();
        let mut tasks = JoinSet::new();

        for discovery in sources {
            let name = discovery.name().to_string();
            let writer = match writers.for_output(discovery.output()).await {
                Ok(writer) => writer,
                Err(e) => {
                    error!(discovery = %name, error = %e, "no output writer, skipping discovery");
                    continue;
                }
            };

            let poller = Poller::new(discovery.clone());
            let reconciler = Reconciler::new(&name, &discovery.output().targets_file_name, writer);
            status.add_source(&name, poller.status());
            status.add_adapter(&name, reconciler.status());

            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            tasks.spawn(poller.run(tx, self.shutdown.clone()));
            tasks.spawn(reconciler.run(rx, self.shutdown.clone()));
            info!(discovery = %name, "discovery started");
        }

        let metrics = Metrics::new(&self.options.metrics_prefix, &self.options.version)
            .context("Failed to register metrics")?;
        let state = AppState {
            status: Arc::new(status),
            metrics: Arc::new(metrics),
            reload: self.shutdown.clone(),
        };
        let mut server = tokio::spawn(server::serve(listener, state, self.shutdown.clone()));

        tokio::select! {
            _ = self.shutdown.cancelled() => info!("reload requested"),
            _ = wait_for_signal() => info!("signal received"),
            result = &mut server => {
                match result {
                    Ok(Ok(())) => warn!("http server exited"),
                    Ok(Err(e)) => error!(error = %e, "http server failed"),
                    Err(e) => error!(error = %e, "http server task panicked"),
                }
            }
        }
        self.shutdown.cancel();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task panicked");
            }
        }
        if !server.is_finished() {
            server.await.context("HTTP server task failed")??;
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Creates every configured source. A source that fails is logged and left
/// out; the others still run.
pub async fn create_sources(registry: &Registry, config: &Config, deps: &SharedDeps) -> Vec<Arc<dyn Discovery>> {
    let mut sources = Vec::new();
    for (name, fragment) in &config.discoveries {
        let kind = Config::discovery_type(name, fragment);
        match registry.create(kind, name, fragment, deps).await {
            Ok(discovery) => sources.push(discovery),
            Err(e) => error!(discovery = %name, error = %e, "failed to create discovery"),
        }
    }
    sources
}

/// Picks and caches the writer for each source's output settings.
struct Writers {
    namespace: String,
    write_to: WriteTo,
    default_configmap: Option<String>,
    file: Arc<FileWriter>,
    configmaps: Option<Arc<KubeConfigMaps>>,
}

impl Writers {
    fn new(options: &Options) -> Self {
        Self {
            namespace: options.namespace.clone(),
            write_to: options.write_to,
            default_configmap: options.configmap_name.clone(),
            file: Arc::new(FileWriter::new(options.output_dir.clone())),
            configmaps: None,
        }
    }

    async fn for_output(&mut self, output: &OutputConfig) -> Result<Arc<dyn OutputWriter>, WriteError> {
        let configmap = match (&output.configmap_name, self.write_to) {
            (Some(name), _) => name.clone(),
            (None, WriteTo::File) => return Ok(self.file.clone()),
            (None, WriteTo::Configmap) => self
                .default_configmap
                .clone()
                .ok_or_else(|| WriteError::Api("no config map name configured".to_string()))?,
        };
        let api = self.configmaps().await?;
        Ok(Arc::new(ConfigMapWriter::new(api, configmap)))
    }

    async fn configmaps(&mut self) -> Result<Arc<KubeConfigMaps>, WriteError> {
        if let Some(api) = &self.configmaps {
            return Ok(api.clone());
        }
        let api = Arc::new(KubeConfigMaps::connect(&self.namespace).await?);
        self.configmaps = Some(api.clone());
        Ok(api)
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(configmap: Option<&str>) -> OutputConfig {
        OutputConfig {
            refresh_interval: 60,
            targets_file_name: "t.json".into(),
            configmap_name: configmap.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn file_output_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            output_dir: dir.path().to_path_buf(),
            ..Options::default()
        };
        let mut writers = Writers::new(&options);
        let writer = writers.for_output(&output(None)).await.unwrap();
        assert!(writer.describe().contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn configmap_output_needs_a_name() {
        let options = Options {
            write_to: WriteTo::Configmap,
            configmap_name: None,
            ..Options::default()
        };
        let mut writers = Writers::new(&options);
        assert!(writers.for_output(&output(None)).await.is_err());
    }

    #[tokio::test]
    async fn broken_sources_are_left_out() {
        let config: Config = serde_yaml::from_str(
            "discoveries:\n  vcenter: {targets_file_name: v.json}\n  netbox: {netbox_host: nb}\n",
        )
        .unwrap();
        let deps = SharedDeps::new(Options::default());
        let sources = create_sources(&Registry::with_builtins(), &config, &deps).await;
        assert!(sources.is_empty());
    }
}
