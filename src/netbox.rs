//! NetBox REST client.
//!
//! Only the endpoints the discovery sources need: device and VM listing with
//! arbitrary filter parameters, interface listing and IP address listing.
//! List endpoints are paginated with `limit`/`offset`; the client follows
//! `next` until the server stops returning one.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::error::DiscoveryError;

const PAGE_SIZE: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Filter parameters passed verbatim as query string. Keys may repeat.
pub type QueryParams = Vec<(String, String)>;

// ═══════════════════════════════════════════════════════════════════════
// Models
// ═══════════════════════════════════════════════════════════════════════

/// Nested reference to another object (site, role, platform …).
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct NestedRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct DeviceType {
    #[serde(default)]
    pub manufacturer: Option<NestedRef>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct IpRef {
    pub id: i64,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Device {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    /// NetBox 4.x.
    #[serde(default)]
    pub role: Option<NestedRef>,
    /// NetBox 3.x.
    #[serde(default)]
    pub device_role: Option<NestedRef>,
    #[serde(default)]
    pub status: Option<Choice>,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub site: Option<NestedRef>,
    #[serde(default)]
    pub cluster: Option<NestedRef>,
    #[serde(default)]
    pub platform: Option<NestedRef>,
    #[serde(default)]
    pub primary_ip: Option<IpRef>,
}

impl Device {
    pub fn role(&self) -> Option<&NestedRef> {
        self.role.as_ref().or(self.device_role.as_ref())
    }

    pub fn status_value(&self) -> &str {
        self.status.as_ref().map(|s| s.value.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct VirtualMachine {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<Choice>,
    #[serde(default)]
    pub role: Option<NestedRef>,
    #[serde(default)]
    pub site: Option<NestedRef>,
    #[serde(default)]
    pub cluster: Option<NestedRef>,
    #[serde(default)]
    pub platform: Option<NestedRef>,
    #[serde(default)]
    pub primary_ip: Option<IpRef>,
}

impl VirtualMachine {
    pub fn status_value(&self) -> &str {
        self.status.as_ref().map(|s| s.value.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Interface {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct IpAddress {
    address: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    results: Vec<T>,
}

/// Which interfaces of a device to collect addresses from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceFilter {
    ManagementOnly,
    Named(String),
}

/// Turns free-form YAML filter values into query pairs. Sequences become
/// repeated keys.
pub fn query_from_yaml(params: &BTreeMap<String, serde_yaml::Value>) -> Result<QueryParams, String> {
    fn scalar(key: &str, value: &serde_yaml::Value) -> Result<String, String> {
        match value {
            serde_yaml::Value::String(s) => Ok(s.clone()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            _ => Err(format!("unsupported value for query parameter '{}'", key)),
        }
    }

    let mut query = QueryParams::new();
    for (key, value) in params {
        match value {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    query.push((key.clone(), scalar(key, item)?));
                }
            }
            other => query.push((key.clone(), scalar(key, other)?)),
        }
    }
    Ok(query)
}

/// `10.0.0.1/24` → `10.0.0.1`.
pub fn strip_prefix_len(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

// ═══════════════════════════════════════════════════════════════════════
// API surface
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait NetboxApi: Send + Sync {
    async fn devices(&self, query: &QueryParams) -> Result<Vec<Device>, DiscoveryError>;

    async fn virtual_machines(&self, query: &QueryParams) -> Result<Vec<VirtualMachine>, DiscoveryError>;

    async fn device_by_name(&self, name: &str) -> Result<Option<Device>, DiscoveryError>;

    /// Addresses (prefix length stripped) on the matching interfaces.
    async fn interface_ips(&self, device_id: i64, filter: &InterfaceFilter) -> Result<Vec<String>, DiscoveryError>;
}

pub struct NetboxClient {
    http: Client,
    base_url: String,
    token: String,
}

impl NetboxClient {
    /// `host` may be a bare host name (https is assumed) or a full URL.
    pub fn new(host: &str, token: &str) -> Result<Self, DiscoveryError> {
        if host.trim().is_empty() {
            return Err(DiscoveryError::Setup("netbox host is empty".to_string()));
        }
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Setup(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    async fn list<T: DeserializeOwned + Send>(&self, path: &str, query: &QueryParams) -> Result<Vec<T>, DiscoveryError> {
        let mut params = query.clone();
        params.push(("limit".to_string(), PAGE_SIZE.to_string()));

        let mut results = Vec::new();
        let mut request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&params);

        loop {
            let page: Page<T> = request
                .header("Authorization", format!("Token {}", self.token))
                .header("Accept", "application/json")
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            results.extend(page.results);

            match page.next {
                Some(next) if !next.is_empty() => {
                    debug!(url = %next, "following netbox page");
                    request = self.http.get(next);
                }
                _ => break,
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl NetboxApi for NetboxClient {
    async fn devices(&self, query: &QueryParams) -> Result<Vec<Device>, DiscoveryError> {
        self.list("/api/dcim/devices/", query).await
    }

    async fn virtual_machines(&self, query: &QueryParams) -> Result<Vec<VirtualMachine>, DiscoveryError> {
        self.list("/api/virtualization/virtual-machines/", query).await
    }

    async fn device_by_name(&self, name: &str) -> Result<Option<Device>, DiscoveryError> {
        let query = vec![("name".to_string(), name.to_string())];
        let mut devices: Vec<Device> = self.list("/api/dcim/devices/", &query).await?;
        Ok(if devices.is_empty() { None } else { Some(devices.swap_remove(0)) })
    }

    async fn interface_ips(&self, device_id: i64, filter: &InterfaceFilter) -> Result<Vec<String>, DiscoveryError> {
        let mut query = vec![("device_id".to_string(), device_id.to_string())];
        match filter {
            InterfaceFilter::ManagementOnly => query.push(("mgmt_only".to_string(), "true".to_string())),
            InterfaceFilter::Named(name) => query.push(("name".to_string(), name.clone())),
        }
        let interfaces: Vec<Interface> = self.list("/api/dcim/interfaces/", &query).await?;

        let mut ips = Vec::new();
        for interface in interfaces {
            let query = vec![("interface_id".to_string(), interface.id.to_string())];
            let addresses: Vec<IpAddress> = self.list("/api/ipam/ip-addresses/", &query).await?;
            ips.extend(addresses.iter().map(|a| strip_prefix_len(&a.address).to_string()));
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_length() {
        assert_eq!(strip_prefix_len("10.0.0.1/24"), "10.0.0.1");
        assert_eq!(strip_prefix_len("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_prefix_len("2001:db8::1/64"), "2001:db8::1");
    }

    #[test]
    fn decodes_device_from_either_netbox_generation() {
        let v3 = r#"{
            "id": 7, "name": "node001-bb091", "display": "node001-bb091",
            "device_type": {"manufacturer": {"id": 1, "name": "Dell", "slug": "dell"}, "model": "R640"},
            "device_role": {"id": 2, "name": "Server", "slug": "server"},
            "status": {"value": "active", "label": "Active"},
            "serial": "ABC123",
            "primary_ip": {"id": 9, "address": "10.0.0.7/24"}
        }"#;
        let device: Device = serde_json::from_str(v3).unwrap();
        assert_eq!(device.role().and_then(|r| r.slug.as_deref()), Some("server"));
        assert_eq!(device.status_value(), "active");

        let v4 = r#"{"id": 8, "role": {"id": 3, "slug": "switch"}, "serial": ""}"#;
        let device: Device = serde_json::from_str(v4).unwrap();
        assert_eq!(device.role().and_then(|r| r.slug.as_deref()), Some("switch"));
        assert_eq!(device.status_value(), "");
    }

    #[test]
    fn yaml_filters_become_query_pairs() {
        let params: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(
            "region: qa-de-1\nsite_id: 12\nstatus: [active, staged]\nhas_primary_ip: true\ntag: ~\n",
        )
        .unwrap();
        let query = query_from_yaml(&params).unwrap();
        assert_eq!(
            query,
            vec![
                ("has_primary_ip".to_string(), "true".to_string()),
                ("region".to_string(), "qa-de-1".to_string()),
                ("site_id".to_string(), "12".to_string()),
                ("status".to_string(), "active".to_string()),
                ("status".to_string(), "staged".to_string()),
            ]
        );

        let nested: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str("cf: {a: 1}\n").unwrap();
        assert!(query_from_yaml(&nested).is_err());
    }

    #[test]
    fn host_without_scheme_defaults_to_https() {
        let client = NetboxClient::new("netbox.example.com/", "t").unwrap();
        assert_eq!(client.base_url, "https://netbox.example.com");
        let client = NetboxClient::new("http://127.0.0.1:8000", "t").unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:8000");
        assert!(NetboxClient::new(" ", "t").is_err());
    }
}
