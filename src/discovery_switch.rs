//! Network switch inventory from NetBox.
//!
//! Each query names the exporter `module` its devices are scraped with.
//! A `ctx` list fans one device out into one group per context, e.g.
//! `module: qa-de-1-asr` with `ctx: -edge,-core` yields the modules
//! `asr-edge` and `asr-core`. VM queries ignore `ctx` and publish under the
//! module or platform slug alone. Only active devices with a primary IP
//! become targets.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::{decode_discovery_config, OutputConfig};
use crate::discovery::Discovery;
use crate::discovery_netbox::RecordKind;
use crate::error::DiscoveryError;
use crate::models::{LabelSet, TargetGroup, METRICS_LABEL, SERVER_ID_LABEL};
use crate::netbox::{query_from_yaml, strip_prefix_len, Device, NetboxApi, NetboxClient, QueryParams, VirtualMachine};
use crate::registry::{DiscoveryFactory, SharedDeps};

const ACTIVE: &str = "active";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SwitchQueryConfig {
    #[serde(default)]
    pub module: Option<String>,
    /// Comma-separated suffixes appended to `module`. Device queries only.
    #[serde(default)]
    pub ctx: Option<String>,
    #[serde(default)]
    pub metrics_label: Option<String>,
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    pub netbox_host: String,
    #[serde(default)]
    pub netbox_api_token: String,
    #[serde(default)]
    pub dcim: Vec<SwitchQueryConfig>,
    #[serde(default)]
    pub vm: Vec<SwitchQueryConfig>,
    #[serde(flatten)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone)]
pub struct SwitchQuery {
    pub params: QueryParams,
    /// `None` only for VM queries, which fall back to the platform slug.
    pub module: Option<String>,
    /// Always empty for VM queries.
    pub contexts: Vec<String>,
    pub metrics_label: Option<String>,
}

impl SwitchQuery {
    fn from_config(name: &str, kind: RecordKind, cfg: &SwitchQueryConfig) -> Result<Self, DiscoveryError> {
        let module = cfg.module.clone().filter(|m| !m.trim().is_empty());
        if kind == RecordKind::Device && module.is_none() {
            return Err(DiscoveryError::config(name, "dcim query without module"));
        }
        let contexts = match (kind, cfg.ctx.as_deref()) {
            (RecordKind::Device, Some(c)) => {
                c.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }
            (RecordKind::VirtualMachine, Some(c)) if !c.trim().is_empty() => {
                debug!(discovery = %name, ctx = %c, "ctx is ignored on vm queries");
                Vec::new()
            }
            _ => Vec::new(),
        };
        Ok(Self {
            params: query_from_yaml(&cfg.params).map_err(|e| DiscoveryError::config(name, e))?,
            module,
            contexts,
            metrics_label: cfg.metrics_label.clone().filter(|l| !l.is_empty()),
        })
    }

    /// Module names a record is published under.
    fn modules(&self, fallback: Option<&str>) -> Vec<String> {
        let Some(base) = self.module.as_deref().or(fallback) else {
            return Vec::new();
        };
        if self.contexts.is_empty() {
            vec![base.to_string()]
        } else {
            self.contexts.iter().map(|c| format!("{}{}", base, c)).collect()
        }
    }
}

pub struct SwitchDiscovery {
    name: String,
    output: OutputConfig,
    region: String,
    api: Arc<dyn NetboxApi>,
    devices: Vec<SwitchQuery>,
    vms: Vec<SwitchQuery>,
}

impl SwitchDiscovery {
    pub fn new(
        name: impl Into<String>,
        output: OutputConfig,
        region: impl Into<String>,
        api: Arc<dyn NetboxApi>,
        devices: Vec<SwitchQuery>,
        vms: Vec<SwitchQuery>,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        output.validate(&name)?;
        Ok(Self {
            name,
            output,
            region: region.into(),
            api,
            devices,
            vms,
        })
    }

    fn module_label(&self, module: &str) -> String {
        module.replacen(&format!("{}-", self.region), "", 1)
    }

    fn group(&self, module: &str, address: &str, mut labels: LabelSet, query: &SwitchQuery) -> TargetGroup {
        labels.insert("module".into(), self.module_label(module));
        if let Some(metrics_label) = &query.metrics_label {
            labels.insert(METRICS_LABEL.into(), metrics_label.clone());
        }
        TargetGroup::single(address, address, labels)
    }

    fn device_groups(&self, device: &Device, query: &SwitchQuery) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let address = device
            .primary_ip
            .as_ref()
            .map(|ip| strip_prefix_len(&ip.address).to_string())
            .ok_or_else(|| DiscoveryError::UnsupportedRecord {
                id: device.id.to_string(),
                reason: "no primary ip".into(),
            })?;
        let device_type = device.device_type.clone().unwrap_or_default();

        let mut labels = LabelSet::new();
        labels.insert(
            "server_name".into(),
            device
                .display
                .clone()
                .or_else(|| device.name.clone())
                .unwrap_or_else(|| device.id.to_string()),
        );
        labels.insert(
            "state".into(),
            device.status.as_ref().map(|s| s.label.clone()).unwrap_or_default(),
        );
        labels.insert(
            "manufacturer".into(),
            device_type.manufacturer.and_then(|m| m.name).unwrap_or_default(),
        );
        labels.insert("model".into(), device_type.model);
        labels.insert(SERVER_ID_LABEL.into(), device.id.to_string());
        labels.insert(
            "role".into(),
            device.role().and_then(|r| r.slug.clone()).unwrap_or_default(),
        );

        Ok(query
            .modules(None)
            .iter()
            .map(|module| self.group(module, &address, labels.clone(), query))
            .collect())
    }

    fn vm_groups(&self, vm: &VirtualMachine, query: &SwitchQuery) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let address = vm
            .primary_ip
            .as_ref()
            .map(|ip| strip_prefix_len(&ip.address).to_string())
            .ok_or_else(|| DiscoveryError::UnsupportedRecord {
                id: vm.id.to_string(),
                reason: "no primary ip".into(),
            })?;
        let platform = vm.platform.as_ref().and_then(|p| p.slug.clone());
        let modules = query.modules(platform.as_deref());
        if modules.is_empty() {
            return Err(DiscoveryError::UnsupportedRecord {
                id: vm.id.to_string(),
                reason: "no module and no platform".into(),
            });
        }

        let mut labels = LabelSet::new();
        labels.insert(
            "server_name".into(),
            vm.name.clone().unwrap_or_else(|| vm.id.to_string()),
        );
        labels.insert(
            "state".into(),
            vm.status.as_ref().map(|s| s.label.clone()).unwrap_or_default(),
        );
        labels.insert(SERVER_ID_LABEL.into(), vm.id.to_string());
        labels.insert(
            "role".into(),
            vm.role.as_ref().and_then(|r| r.slug.clone()).unwrap_or_default(),
        );

        Ok(modules
            .iter()
            .map(|module| self.group(module, &address, labels.clone(), query))
            .collect())
    }
}

#[async_trait]
impl Discovery for SwitchDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> &OutputConfig {
        &self.output
    }

    fn metrics_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .devices
            .iter()
            .chain(&self.vms)
            .filter_map(|q| q.metrics_label.clone())
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }

    async fn fetch(&self) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let mut groups = Vec::new();

        for query in &self.devices {
            let devices = self.api.devices(&query.params).await?;
            debug!(discovery = %self.name, devices = devices.len(), "listed switches");
            for device in devices.iter().filter(|d| d.status_value() == ACTIVE) {
                match self.device_groups(device, query) {
                    Ok(mut g) => groups.append(&mut g),
                    Err(e) => error!(discovery = %self.name, error = %e, "skipping switch"),
                }
            }
        }

        for query in &self.vms {
            let vms = self.api.virtual_machines(&query.params).await?;
            debug!(discovery = %self.name, vms = vms.len(), "listed virtual switches");
            for vm in vms.iter().filter(|v| v.status_value() == ACTIVE) {
                match self.vm_groups(vm, query) {
                    Ok(mut g) => groups.append(&mut g),
                    Err(e) => error!(discovery = %self.name, error = %e, "skipping virtual switch"),
                }
            }
        }

        Ok(groups)
    }
}

pub struct SwitchFactory;

#[async_trait]
impl DiscoveryFactory for SwitchFactory {
    async fn create(
        &self,
        name: &str,
        raw: &serde_yaml::Value,
        deps: &SharedDeps,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError> {
        let cfg: SwitchConfig = decode_discovery_config(name, raw, &deps.template)?;
        cfg.output.validate(name)?;

        let devices = cfg
            .dcim
            .iter()
            .map(|q| SwitchQuery::from_config(name, RecordKind::Device, q))
            .collect::<Result<Vec<_>, _>>()?;
        let vms = cfg
            .vm
            .iter()
            .map(|q| SwitchQuery::from_config(name, RecordKind::VirtualMachine, q))
            .collect::<Result<Vec<_>, _>>()?;

        let api = Arc::new(NetboxClient::new(&cfg.netbox_host, &cfg.netbox_api_token)?);
        let discovery = SwitchDiscovery::new(name, cfg.output, &deps.options.region, api, devices, vms)?;
        Ok(Arc::new(discovery))
    }
}
