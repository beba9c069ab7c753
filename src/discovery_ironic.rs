//! Bare-metal discovery from OpenStack Ironic.
//!
//! Every managed node becomes a group targeting its BMC: either the IPMI
//! address Ironic knows, or the management-interface addresses NetBox has
//! for the device of the same name. Nodes with an instance get their
//! ownership labels from Nova and Keystone.
//!
//! # Configuration
//!
//! ```yaml
//! discoveries:
//!   ironic:
//!     refresh_interval: 600
//!     targets_file_name: ironic.json
//!     metrics_label: baremetal
//!     target: management          # primary (default) | management
//!     netbox_host: netbox.example.com
//!     netbox_api_token: secret
//!     os_auth:
//!       auth_url: https://identity-3.{{ .Region }}.example.com/v3
//!       user: ipmi_sd
//!       password: secret
//!       domain_name: Default
//!       project_name: service
//!       project_domain_name: Default
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::config::{decode_discovery_config, OutputConfig};
use crate::discovery::{Discovery, TargetSelection, TargetSpec};
use crate::enrich::{Enricher, OwnershipLookup, DEFAULT_CONCURRENCY};
use crate::error::DiscoveryError;
use crate::models::{LabelSet, TargetGroup, METRICS_LABEL, SERVER_ID_LABEL};
use crate::netbox::{InterfaceFilter, NetboxApi, NetboxClient};
use crate::openstack::{BareMetalApi, IronicClient, IronicNode, OpenStackOwnership, OpenStackSession, OsAuth};
use crate::registry::{DiscoveryFactory, SharedDeps};

fn default_enrich() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IronicConfig {
    pub os_auth: OsAuth,
    #[serde(default)]
    pub netbox_host: Option<String>,
    #[serde(default)]
    pub netbox_api_token: Option<String>,
    #[serde(default)]
    pub target: Option<TargetSpec>,
    /// Legacy switch for `target: management`.
    #[serde(default)]
    pub mgmt_interface_ips: Option<bool>,
    #[serde(default)]
    pub metrics_label: String,
    #[serde(default = "default_enrich")]
    pub enrich: bool,
    #[serde(flatten)]
    pub output: OutputConfig,
}

impl IronicConfig {
    fn selection(&self, name: &str) -> Result<TargetSelection, DiscoveryError> {
        if self.mgmt_interface_ips == Some(true) {
            return Ok(TargetSelection::Management);
        }
        let selection = match &self.target {
            Some(spec) => TargetSelection::parse(spec)?,
            None => TargetSelection::Primary,
        };
        match selection {
            TargetSelection::Interface(iface) => Err(DiscoveryError::UnsupportedTarget(format!(
                "interface:{} (discovery '{}' supports primary and management)",
                iface, name
            ))),
            other => Ok(other),
        }
    }
}

/// Turns a node into its scrape addresses. Cloned into every lookup task.
#[derive(Clone)]
struct AddressResolver {
    discovery: String,
    selection: TargetSelection,
    netbox: Option<Arc<dyn NetboxApi>>,
}

impl AddressResolver {
    async fn addresses(&self, node: &IronicNode) -> Result<Vec<String>, DiscoveryError> {
        match &self.selection {
            TargetSelection::Primary => match node.driver_info.ipmi_address.as_deref() {
                Some(addr) if !addr.is_empty() => Ok(vec![addr.to_string()]),
                _ => Err(DiscoveryError::UnsupportedRecord {
                    id: node.uuid.clone(),
                    reason: "no ipmi_address in driver_info".into(),
                }),
            },
            TargetSelection::Management => {
                let netbox = self.netbox.as_ref().ok_or_else(|| {
                    DiscoveryError::config(&self.discovery, "management targets need netbox")
                })?;
                let name = node.name.as_deref().ok_or_else(|| DiscoveryError::UnsupportedRecord {
                    id: node.uuid.clone(),
                    reason: "node has no name to look up in netbox".into(),
                })?;
                let device = netbox.device_by_name(name).await?.ok_or_else(|| {
                    DiscoveryError::UnsupportedRecord {
                        id: node.uuid.clone(),
                        reason: format!("no netbox device named '{}'", name),
                    }
                })?;
                netbox
                    .interface_ips(device.id, &InterfaceFilter::ManagementOnly)
                    .await
            }
            TargetSelection::Interface(iface) => Err(DiscoveryError::UnsupportedTarget(iface.clone())),
        }
    }
}

pub struct IronicDiscovery {
    name: String,
    output: OutputConfig,
    metrics_label: String,
    resolver: AddressResolver,
    nodes: Arc<dyn BareMetalApi>,
    enricher: Option<Enricher>,
    concurrency: usize,
}

impl IronicDiscovery {
    pub fn new(
        name: impl Into<String>,
        output: OutputConfig,
        metrics_label: impl Into<String>,
        selection: TargetSelection,
        nodes: Arc<dyn BareMetalApi>,
        netbox: Option<Arc<dyn NetboxApi>>,
        ownership: Option<Arc<dyn OwnershipLookup>>,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        output.validate(&name)?;
        if selection == TargetSelection::Management && netbox.is_none() {
            return Err(DiscoveryError::config(
                &name,
                "management targets need netbox_host and netbox_api_token",
            ));
        }
        Ok(Self {
            resolver: AddressResolver {
                discovery: name.clone(),
                selection,
                netbox,
            },
            name,
            output,
            metrics_label: metrics_label.into(),
            nodes,
            enricher: ownership.map(Enricher::new),
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    /// Upper bound on NetBox lookups in flight during one fetch.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn node_labels(&self, node: &IronicNode) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert(
            "server_name".into(),
            node.name.clone().unwrap_or_else(|| node.uuid.clone()),
        );
        labels.insert("provision_state".into(), node.provision_state.clone());
        labels.insert("maintenance".into(), node.maintenance.to_string());
        labels.insert(
            "serial".into(),
            node.properties.serial_number.clone().unwrap_or_default(),
        );
        labels.insert(
            "manufacturer".into(),
            node.properties.manufacturer.clone().unwrap_or_default(),
        );
        labels.insert("model".into(), node.properties.model.clone().unwrap_or_default());
        labels.insert(METRICS_LABEL.into(), self.metrics_label.clone());
        if let Some(instance) = node.instance_uuid.as_ref().filter(|i| !i.is_empty()) {
            labels.insert(SERVER_ID_LABEL.into(), instance.clone());
        }
        labels
    }
}

#[async_trait]
impl Discovery for IronicDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> &OutputConfig {
        &self.output
    }

    fn metrics_labels(&self) -> Vec<String> {
        vec![self.metrics_label.clone()]
    }

    async fn fetch(&self) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let nodes = self.nodes.list_nodes().await?;
        debug!(discovery = %self.name, nodes = nodes.len(), "listed ironic nodes");

        let nodes: Vec<IronicNode> = nodes.into_iter().filter(|n| !n.is_enrolling()).collect();

        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for (index, node) in nodes.iter().enumerate() {
            let resolver = self.resolver.clone();
            let limiter = limiter.clone();
            let node = node.clone();
            set.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                (index, resolver.addresses(&node).await)
            });
        }

        let mut per_node: Vec<Option<Result<Vec<String>, DiscoveryError>>> = Vec::new();
        per_node.resize_with(nodes.len(), || None);
        while let Some(joined) = set.join_next().await {
            let (index, result) =
                joined.map_err(|e| DiscoveryError::Backend(format!("ironic address task failed: {}", e)))?;
            per_node[index] = Some(result);
        }

        let mut groups = Vec::new();
        for (node, result) in nodes.iter().zip(per_node) {
            let addresses = match result {
                Some(Ok(addresses)) => addresses,
                Some(Err(e @ DiscoveryError::UnsupportedRecord { .. })) => {
                    error!(discovery = %self.name, node = %node.uuid, error = %e, "skipping node");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => continue,
            };
            let labels = self.node_labels(node);
            for address in addresses {
                groups.push(TargetGroup::single(address.clone(), address, labels.clone()));
            }
        }
        Ok(groups)
    }

    fn enricher(&self) -> Option<&Enricher> {
        self.enricher.as_ref()
    }
}

pub struct IronicFactory;

#[async_trait]
impl DiscoveryFactory for IronicFactory {
    async fn create(
        &self,
        name: &str,
        raw: &serde_yaml::Value,
        deps: &SharedDeps,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError> {
        let cfg: IronicConfig = decode_discovery_config(name, raw, &deps.template)?;
        cfg.output.validate(name)?;
        let selection = cfg.selection(name)?;

        let netbox: Option<Arc<dyn NetboxApi>> = match &cfg.netbox_host {
            Some(host) if !host.is_empty() => Some(Arc::new(NetboxClient::new(
                host,
                cfg.netbox_api_token.as_deref().unwrap_or_default(),
            )?)),
            _ => None,
        };

        let session = OpenStackSession::connect(cfg.os_auth.clone()).await?;
        let nodes = Arc::new(IronicClient::new(session.clone())?);
        let ownership: Option<Arc<dyn OwnershipLookup>> = if cfg.enrich {
            Some(Arc::new(OpenStackOwnership::new(session)))
        } else {
            None
        };

        let discovery = IronicDiscovery::new(
            name,
            cfg.output,
            cfg.metrics_label,
            selection,
            nodes,
            netbox,
            ownership,
        )?;
        Ok(Arc::new(discovery))
    }
}
