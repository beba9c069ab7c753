//! CMDB/IPAM discovery from NetBox devices and virtual machines.
//!
//! Each configured query is a NetBox list filter plus the labels and target
//! policy for the records it returns. All queries of a cycle run
//! concurrently; one failing list call fails the cycle so the previously
//! published targets stay in place.
//!
//! ```yaml
//! discoveries:
//!   netbox:
//!     netbox_host: netbox.example.com
//!     netbox_api_token: secret
//!     refresh_interval: 300
//!     targets_file_name: netbox.json
//!     rate_limit: 50              # ms between per-device address lookups
//!     dcim:
//!       devices:
//!         - role: server
//!           region: "{{ .Region }}"
//!           target: management
//!           metrics_label: bm_mgmt
//!           custom_labels: { job: bmc }
//!     virtualization:
//!       vm:
//!         - tag: monitoring
//!           metrics_label: vm
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::{decode_discovery_config, OutputConfig};
use crate::discovery::{Discovery, TargetSelection, TargetSpec};
use crate::error::DiscoveryError;
use crate::models::{LabelSet, TargetGroup, METRICS_LABEL, SERVER_ID_LABEL};
use crate::netbox::{
    query_from_yaml, strip_prefix_len, Device, InterfaceFilter, NetboxApi, NetboxClient, QueryParams,
    VirtualMachine,
};
use crate::registry::{DiscoveryFactory, SharedDeps};

/// Records in this state are not in service yet.
const PLANNED: &str = "planned";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryConfig {
    #[serde(default)]
    pub custom_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub target: TargetSpec,
    #[serde(default)]
    pub metrics_label: String,
    /// NetBox list filters, e.g. `role`, `region`, `tag`.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DcimQueries {
    #[serde(default)]
    pub devices: Vec<QueryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VirtualizationQueries {
    #[serde(default)]
    pub vm: Vec<QueryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetboxConfig {
    pub netbox_host: String,
    #[serde(default)]
    pub netbox_api_token: String,
    /// Milliseconds between address lookups; 0 disables throttling.
    #[serde(default)]
    pub rate_limit: u64,
    #[serde(default)]
    pub dcim: DcimQueries,
    #[serde(default)]
    pub virtualization: VirtualizationQueries,
    #[serde(flatten)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Device,
    VirtualMachine,
}

/// A validated query, ready to run.
#[derive(Debug, Clone)]
pub struct Query {
    pub kind: RecordKind,
    pub params: QueryParams,
    pub custom_labels: LabelSet,
    pub selection: TargetSelection,
    pub metrics_label: String,
}

impl Query {
    fn from_config(name: &str, kind: RecordKind, cfg: &QueryConfig) -> Result<Self, DiscoveryError> {
        let selection = TargetSelection::parse(&cfg.target)?;
        if kind == RecordKind::VirtualMachine && selection != TargetSelection::Primary {
            return Err(DiscoveryError::UnsupportedTarget(format!(
                "{:?} for virtual machines (discovery '{}' supports primary only)",
                selection, name
            )));
        }
        let params = query_from_yaml(&cfg.params).map_err(|e| DiscoveryError::config(name, e))?;
        Ok(Self {
            kind,
            params,
            custom_labels: cfg.custom_labels.clone(),
            selection,
            metrics_label: cfg.metrics_label.clone(),
        })
    }
}

/// Spaces out calls by a fixed minimum period, shared across queries.
struct RateLimiter {
    period: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.period.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.period).await;
        }
        *last = Some(Instant::now());
    }
}

pub struct NetboxDiscovery {
    name: String,
    output: OutputConfig,
    api: Arc<dyn NetboxApi>,
    queries: Vec<Arc<Query>>,
    limiter: Arc<RateLimiter>,
}

impl NetboxDiscovery {
    pub fn new(
        name: impl Into<String>,
        output: OutputConfig,
        api: Arc<dyn NetboxApi>,
        queries: Vec<Query>,
        rate_limit: Duration,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        output.validate(&name)?;
        Ok(Self {
            name,
            output,
            api,
            queries: queries.into_iter().map(Arc::new).collect(),
            limiter: Arc::new(RateLimiter::new(rate_limit)),
        })
    }
}

fn device_labels(device: &Device, query: &Query) -> LabelSet {
    let server_name = device.name.clone().unwrap_or_else(|| device.id.to_string());
    let device_type = device.device_type.clone().unwrap_or_default();

    let mut labels = LabelSet::new();
    labels.insert(
        "name".into(),
        device.display.clone().unwrap_or_else(|| server_name.clone()),
    );
    labels.insert("server_name".into(), server_name);
    labels.insert(
        "manufacturer".into(),
        device_type.manufacturer.and_then(|m| m.name).unwrap_or_default(),
    );
    labels.insert(
        "status".into(),
        device.status.as_ref().map(|s| s.label.clone()).unwrap_or_default(),
    );
    labels.insert("serial".into(), device.serial.clone());
    labels.insert("model".into(), device_type.model);
    labels.insert(SERVER_ID_LABEL.into(), device.id.to_string());
    labels.insert(
        "role".into(),
        device.role().and_then(|r| r.slug.clone()).unwrap_or_default(),
    );
    labels.insert(METRICS_LABEL.into(), query.metrics_label.clone());
    if let Some(site) = device.site.as_ref().and_then(|s| s.slug.clone()) {
        labels.insert("site".into(), site);
    }
    if let Some(cluster) = device.cluster.as_ref().and_then(|c| c.name.clone()) {
        labels.insert("cluster".into(), cluster);
    }
    labels.extend(query.custom_labels.clone());
    labels
}

fn vm_labels(vm: &VirtualMachine, query: &Query) -> LabelSet {
    let mut labels = LabelSet::new();
    labels.insert(
        "state".into(),
        vm.status.as_ref().map(|s| s.label.clone()).unwrap_or_default(),
    );
    labels.insert(
        "server_name".into(),
        vm.name.clone().unwrap_or_else(|| vm.id.to_string()),
    );
    labels.insert(SERVER_ID_LABEL.into(), vm.id.to_string());
    labels.insert(
        "role".into(),
        vm.role.as_ref().and_then(|r| r.slug.clone()).unwrap_or_default(),
    );
    labels.insert(METRICS_LABEL.into(), query.metrics_label.clone());
    labels.extend(query.custom_labels.clone());
    labels
}

async fn device_addresses(
    api: &dyn NetboxApi,
    limiter: &RateLimiter,
    device: &Device,
    selection: &TargetSelection,
) -> Result<Vec<String>, DiscoveryError> {
    match selection {
        TargetSelection::Primary => device
            .primary_ip
            .as_ref()
            .map(|ip| vec![strip_prefix_len(&ip.address).to_string()])
            .ok_or_else(|| DiscoveryError::UnsupportedRecord {
                id: device.id.to_string(),
                reason: "no primary ip".into(),
            }),
        TargetSelection::Management => {
            limiter.wait().await;
            api.interface_ips(device.id, &InterfaceFilter::ManagementOnly).await
        }
        TargetSelection::Interface(name) => {
            limiter.wait().await;
            api.interface_ips(device.id, &InterfaceFilter::Named(name.clone()))
                .await
        }
    }
}

fn push_groups(groups: &mut Vec<TargetGroup>, addresses: Vec<String>, labels: LabelSet) {
    for address in addresses {
        groups.push(TargetGroup::single(address.clone(), address, labels.clone()));
    }
}

async fn run_query(
    discovery: &str,
    api: &dyn NetboxApi,
    limiter: &RateLimiter,
    query: &Query,
) -> Result<Vec<TargetGroup>, DiscoveryError> {
    let mut groups = Vec::new();
    match query.kind {
        RecordKind::Device => {
            let devices = api.devices(&query.params).await?;
            debug!(discovery, devices = devices.len(), "listed netbox devices");
            for device in devices.iter().filter(|d| d.status_value() != PLANNED) {
                match device_addresses(api, limiter, device, &query.selection).await {
                    Ok(addresses) => push_groups(&mut groups, addresses, device_labels(device, query)),
                    Err(e) => error!(discovery, device = device.id, error = %e, "skipping device"),
                }
            }
        }
        RecordKind::VirtualMachine => {
            let vms = api.virtual_machines(&query.params).await?;
            debug!(discovery, vms = vms.len(), "listed netbox virtual machines");
            for vm in vms.iter().filter(|v| v.status_value() != PLANNED) {
                match &vm.primary_ip {
                    Some(ip) => push_groups(
                        &mut groups,
                        vec![strip_prefix_len(&ip.address).to_string()],
                        vm_labels(vm, query),
                    ),
                    None => error!(discovery, vm = vm.id, "skipping virtual machine without primary ip"),
                }
            }
        }
    }
    Ok(groups)
}

#[async_trait]
impl Discovery for NetboxDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> &OutputConfig {
        &self.output
    }

    fn metrics_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.queries.iter().map(|q| q.metrics_label.clone()).collect();
        labels.sort();
        labels.dedup();
        labels
    }

    async fn fetch(&self) -> Result<Vec<TargetGroup>, DiscoveryError> {
        let mut set = JoinSet::new();
        for (index, query) in self.queries.iter().enumerate() {
            let name = self.name.clone();
            let api = self.api.clone();
            let limiter = self.limiter.clone();
            let query = query.clone();
            set.spawn(async move { (index, run_query(&name, api.as_ref(), &limiter, &query).await) });
        }

        let mut per_query: Vec<Vec<TargetGroup>> = vec![Vec::new(); self.queries.len()];
        while let Some(joined) = set.join_next().await {
            let (index, result) =
                joined.map_err(|e| DiscoveryError::Backend(format!("netbox query task failed: {}", e)))?;
            per_query[index] = result?;
        }
        Ok(per_query.into_iter().flatten().collect())
    }
}

pub struct NetboxFactory;

#[async_trait]
impl DiscoveryFactory for NetboxFactory {
    async fn create(
        &self,
        name: &str,
        raw: &serde_yaml::Value,
        deps: &SharedDeps,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError> {
        let cfg: NetboxConfig = decode_discovery_config(name, raw, &deps.template)?;
        cfg.output.validate(name)?;

        let mut queries = Vec::new();
        for q in &cfg.dcim.devices {
            queries.push(Query::from_config(name, RecordKind::Device, q)?);
        }
        for q in &cfg.virtualization.vm {
            queries.push(Query::from_config(name, RecordKind::VirtualMachine, q)?);
        }
        if queries.is_empty() {
            return Err(DiscoveryError::config(name, "no dcim.devices or virtualization.vm queries"));
        }

        let api = Arc::new(NetboxClient::new(&cfg.netbox_host, &cfg.netbox_api_token)?);
        let discovery = NetboxDiscovery::new(
            name,
            cfg.output,
            api,
            queries,
            Duration::from_millis(cfg.rate_limit),
        )?;
        Ok(Arc::new(discovery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Options, TemplateValues};
    use crate::netbox::{Choice, DeviceType, IpRef, NestedRef};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNetbox {
        devices: Vec<Device>,
        vms: Vec<VirtualMachine>,
        interface_ips: HashMap<(i64, String), Vec<String>>,
        fail_vms: bool,
    }

    #[async_trait]
    impl NetboxApi for FakeNetbox {
        async fn devices(&self, _query: &QueryParams) -> Result<Vec<Device>, DiscoveryError> {
            Ok(self.devices.clone())
        }
        async fn virtual_machines(&self, _query: &QueryParams) -> Result<Vec<VirtualMachine>, DiscoveryError> {
            if self.fail_vms {
                return Err(DiscoveryError::Backend("502 Bad Gateway".into()));
            }
            Ok(self.vms.clone())
        }
        async fn device_by_name(&self, _name: &str) -> Result<Option<Device>, DiscoveryError> {
            Ok(None)
        }
        async fn interface_ips(&self, device_id: i64, filter: &InterfaceFilter) -> Result<Vec<String>, DiscoveryError> {
            let key = match filter {
                InterfaceFilter::ManagementOnly => (device_id, "mgmt".to_string()),
                InterfaceFilter::Named(n) => (device_id, n.clone()),
            };
            Ok(self.interface_ips.get(&key).cloned().unwrap_or_default())
        }
    }

    fn device(id: i64, status: &str, primary: Option<&str>) -> Device {
        Device {
            id,
            name: Some(format!("node{id:03}")),
            display: Some(format!("node{id:03}")),
            device_type: Some(DeviceType {
                manufacturer: Some(NestedRef {
                    id: 1,
                    name: Some("Dell".into()),
                    slug: Some("dell".into()),
                }),
                model: "R640".into(),
                slug: None,
            }),
            role: Some(NestedRef {
                id: 2,
                name: Some("Server".into()),
                slug: Some("server".into()),
            }),
            status: Some(Choice {
                value: status.into(),
                label: status[..1].to_uppercase() + &status[1..],
            }),
            serial: format!("SN{id}"),
            site: Some(NestedRef {
                id: 3,
                name: Some("BB091".into()),
                slug: Some("bb091".into()),
            }),
            primary_ip: primary.map(|a| IpRef { id: 9, address: a.into() }),
            ..Default::default()
        }
    }

    fn query(kind: RecordKind, selection: TargetSelection) -> Query {
        Query {
            kind,
            params: vec![("role".into(), "server".into())],
            custom_labels: LabelSet::from([("job".to_string(), "node".to_string()), ("role".to_string(), "bm".to_string())]),
            selection,
            metrics_label: "bm".into(),
        }
    }

    fn output() -> OutputConfig {
        OutputConfig {
            refresh_interval: 60,
            targets_file_name: "netbox.json".into(),
            configmap_name: None,
        }
    }

    #[tokio::test]
    async fn planned_devices_are_not_targets() {
        let fake = FakeNetbox {
            devices: vec![
                device(1, "planned", Some("10.0.0.1/24")),
                device(2, "active", Some("10.0.0.2/24")),
            ],
            ..Default::default()
        };
        let d = NetboxDiscovery::new(
            "netbox",
            output(),
            Arc::new(fake),
            vec![query(RecordKind::Device, TargetSelection::Primary)],
            Duration::ZERO,
        )
        .unwrap();

        let groups = d.fetch().await.unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.source, "10.0.0.2");
        assert_eq!(g.label("server_name"), Some("node002"));
        assert_eq!(g.label("status"), Some("Active"));
        assert_eq!(g.label("manufacturer"), Some("Dell"));
        assert_eq!(g.label("site"), Some("bb091"));
        assert_eq!(g.label(SERVER_ID_LABEL), Some("2"));
        assert_eq!(g.label(METRICS_LABEL), Some("bm"));
        // custom labels win
        assert_eq!(g.label("role"), Some("bm"));
        assert_eq!(g.label("job"), Some("node"));
    }

    #[tokio::test]
    async fn named_interface_targets() {
        let mut fake = FakeNetbox {
            devices: vec![device(1, "active", None), device(2, "active", None)],
            ..Default::default()
        };
        fake.interface_ips
            .insert((1, "Loopback10".into()), vec!["10.10.0.1".into()]);
        let d = NetboxDiscovery::new(
            "netbox",
            output(),
            Arc::new(fake),
            vec![query(RecordKind::Device, TargetSelection::Interface("Loopback10".into()))],
            Duration::from_millis(1),
        )
        .unwrap();

        let groups = d.fetch().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].addresses().collect::<Vec<_>>(), vec!["10.10.0.1"]);
    }

    #[tokio::test]
    async fn vm_queries_use_primary_ip() {
        let fake = FakeNetbox {
            vms: vec![VirtualMachine {
                id: 5,
                name: Some("vm005".into()),
                status: Some(Choice {
                    value: "active".into(),
                    label: "Active".into(),
                }),
                primary_ip: Some(IpRef {
                    id: 1,
                    address: "10.5.0.5/32".into(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let d = NetboxDiscovery::new(
            "netbox",
            output(),
            Arc::new(fake),
            vec![query(RecordKind::VirtualMachine, TargetSelection::Primary)],
            Duration::ZERO,
        )
        .unwrap();
        let groups = d.fetch().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].label("state"), Some("Active"));
        assert_eq!(groups[0].label("server_name"), Some("vm005"));
        assert_eq!(groups[0].source, "10.5.0.5");
    }

    #[tokio::test]
    async fn failing_query_fails_the_fetch() {
        let fake = FakeNetbox {
            devices: vec![device(2, "active", Some("10.0.0.2/24"))],
            fail_vms: true,
            ..Default::default()
        };
        let d = NetboxDiscovery::new(
            "netbox",
            output(),
            Arc::new(fake),
            vec![
                query(RecordKind::Device, TargetSelection::Primary),
                query(RecordKind::VirtualMachine, TargetSelection::Primary),
            ],
            Duration::ZERO,
        )
        .unwrap();
        assert!(d.fetch().await.is_err());
    }

    #[test]
    fn decodes_queries_with_free_form_filters() {
        let raw: serde_yaml::Value = serde_yaml::from_str(
            r#"
netbox_host: netbox.example.com
netbox_api_token: t
targets_file_name: netbox.json
dcim:
  devices:
    - role: server
      region: "{{ .Region }}"
      target: 2
      metrics_label: bm_mgmt
      custom_labels: {job: bmc}
virtualization:
  vm:
    - tag: monitoring
"#,
        )
        .unwrap();
        let values = TemplateValues::from_options(&Options::default());
        let cfg: NetboxConfig = decode_discovery_config("netbox", &raw, &values).unwrap();
        let q = Query::from_config("netbox", RecordKind::Device, &cfg.dcim.devices[0]).unwrap();
        assert_eq!(q.selection, TargetSelection::Management);
        assert_eq!(
            q.params,
            vec![
                ("region".to_string(), "qa-de-1".to_string()),
                ("role".to_string(), "server".to_string()),
            ]
        );
        assert_eq!(q.custom_labels["job"], "bmc");
        assert_eq!(cfg.virtualization.vm.len(), 1);
    }

    #[test]
    fn unsupported_target_is_rejected_at_construction() {
        let cfg = QueryConfig {
            target: TargetSpec::Code(9),
            ..Default::default()
        };
        assert!(Query::from_config("netbox", RecordKind::Device, &cfg).is_err());

        let cfg = QueryConfig {
            target: TargetSpec::Name("management".into()),
            ..Default::default()
        };
        assert!(Query::from_config("netbox", RecordKind::VirtualMachine, &cfg).is_err());
    }

    #[test]
    fn metrics_labels_are_deduplicated() {
        let d = NetboxDiscovery::new(
            "netbox",
            output(),
            Arc::new(FakeNetbox::default()),
            vec![
                query(RecordKind::Device, TargetSelection::Primary),
                query(RecordKind::VirtualMachine, TargetSelection::Primary),
            ],
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(d.metrics_labels(), vec!["bm".to_string()]);
    }
}
