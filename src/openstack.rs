//! OpenStack clients: Keystone password authentication with a service
//! catalog, Ironic node listing, and the Nova/Keystone lookups used for
//! ownership enrichment.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::enrich::OwnershipLookup;
use crate::error::{DiscoveryError, LookupError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const IRONIC_API_VERSION: &str = "1.37";

/// Keystone v3 password credentials, `os_auth` in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct OsAuth {
    pub auth_url: String,
    pub user: String,
    pub password: String,
    pub domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Default)]
struct Credentials {
    token: String,
    catalog: Vec<CatalogEntry>,
}

/// An authenticated Keystone session. Re-authenticates once on a 401.
///
/// Concurrent requests that hit a 401 with the same token share a single
/// re-authentication.
pub struct OpenStackSession {
    http: Client,
    auth: OsAuth,
    credentials: RwLock<Credentials>,
    refresh: Mutex<()>,
}

impl OpenStackSession {
    /// Authenticates immediately so bad credentials fail at startup.
    pub async fn connect(auth: OsAuth) -> Result<Arc<Self>, DiscoveryError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Setup(format!("failed to build HTTP client: {}", e)))?;
        let session = Arc::new(Self {
            http,
            auth,
            credentials: RwLock::new(Credentials::default()),
            refresh: Mutex::new(()),
        });
        session.authenticate().await?;
        Ok(session)
    }

    async fn authenticate(&self) -> Result<(), DiscoveryError> {
        let url = format!("{}/auth/tokens", self.auth.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.auth.user,
                            "domain": { "name": self.auth.domain_name },
                            "password": self.auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.auth.project_name,
                        "domain": { "name": self.auth.project_domain_name },
                    }
                }
            }
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Setup(format!("keystone authentication failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Setup(format!(
                "keystone authentication failed: {}",
                response.status()
            )));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::Setup("keystone response carries no X-Subject-Token".to_string()))?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Setup(format!("invalid keystone token response: {}", e)))?;

        info!(user = %self.auth.user, project = %self.auth.project_name, "authenticated against keystone");
        *self.credentials.write() = Credentials {
            token,
            catalog: body.token.catalog,
        };
        Ok(())
    }

    /// Replaces the `stale` token unless another request already did.
    async fn reauthenticate(&self, stale: &str) -> Result<(), DiscoveryError> {
        let _refreshing = self.refresh.lock().await;
        let replaced = self.credentials.read().token != stale;
        if replaced {
            debug!("keystone token already refreshed");
            return Ok(());
        }
        debug!("keystone token rejected, re-authenticating");
        self.authenticate().await
    }

    /// Public endpoint of `service_type`, honoring the configured region.
    pub fn endpoint(&self, service_type: &str) -> Option<String> {
        let credentials = self.credentials.read();
        let entry = credentials
            .catalog
            .iter()
            .find(|e| e.service_type == service_type)?;
        entry
            .endpoints
            .iter()
            .filter(|e| e.interface == "public")
            .find(|e| match &self.auth.region {
                Some(region) => {
                    e.region_id.as_deref() == Some(region.as_str()) || e.region.as_deref() == Some(region.as_str())
                }
                None => true,
            })
            .map(|e| e.url.trim_end_matches('/').to_string())
    }

    fn require_endpoint(&self, service_type: &str) -> Result<String, LookupError> {
        self.endpoint(service_type)
            .ok_or_else(|| LookupError::Failed(format!("no public '{}' endpoint in catalog", service_type)))
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, url: &str, headers: &[(&str, &str)]) -> Result<T, LookupError> {
        let mut reauthenticated = false;
        loop {
            let token = self.credentials.read().token.clone();
            let mut request = self.http.get(url).header("X-Auth-Token", token.as_str());
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            let response = request.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                self.reauthenticate(&token)
                    .await
                    .map_err(|e| LookupError::Failed(e.to_string()))?;
                reauthenticated = true;
                continue;
            }
            return Ok(response.error_for_status()?.json().await?);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ironic
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct DriverInfo {
    #[serde(default)]
    pub ipmi_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct NodeProperties {
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct IronicNode {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provision_state: String,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(default)]
    pub instance_uuid: Option<String>,
    #[serde(default)]
    pub driver_info: DriverInfo,
    #[serde(default)]
    pub properties: NodeProperties,
}

impl IronicNode {
    /// Freshly enrolled nodes are not yet managed and have no usable BMC.
    pub fn is_enrolling(&self) -> bool {
        self.provision_state == "enroll"
    }
}

#[derive(Debug, Deserialize)]
struct NodePage {
    nodes: Vec<IronicNode>,
    #[serde(default)]
    next: Option<String>,
}

#[async_trait]
pub trait BareMetalApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<IronicNode>, DiscoveryError>;
}

pub struct IronicClient {
    session: Arc<OpenStackSession>,
}

impl IronicClient {
    pub fn new(session: Arc<OpenStackSession>) -> Result<Self, DiscoveryError> {
        if session.endpoint("baremetal").is_none() {
            return Err(DiscoveryError::Setup("no public 'baremetal' endpoint in catalog".to_string()));
        }
        Ok(Self { session })
    }
}

#[async_trait]
impl BareMetalApi for IronicClient {
    async fn list_nodes(&self) -> Result<Vec<IronicNode>, DiscoveryError> {
        let headers = [("X-OpenStack-Ironic-API-Version", IRONIC_API_VERSION)];
        let base = self
            .session
            .require_endpoint("baremetal")
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let mut nodes = Vec::new();
        let mut url = format!("{}/v1/nodes/detail", base);
        loop {
            let page: NodePage = self
                .session
                .get_json(&url, &headers)
                .await
                .map_err(|e| DiscoveryError::Backend(e.to_string()))?;
            nodes.extend(page.nodes);
            match page.next {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }
        Ok(nodes)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ownership (Nova + Keystone)
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    #[serde(default)]
    tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    project: Project,
}

#[derive(Debug, Deserialize)]
struct Project {
    domain_id: String,
}

/// Server → project via Nova, project → domain via Keystone.
pub struct OpenStackOwnership {
    session: Arc<OpenStackSession>,
}

impl OpenStackOwnership {
    pub fn new(session: Arc<OpenStackSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl OwnershipLookup for OpenStackOwnership {
    async fn server_tenant(&self, record_id: &str) -> Result<Option<String>, LookupError> {
        let base = self.session.require_endpoint("compute")?;
        let response: ServerResponse = self
            .session
            .get_json(&format!("{}/servers/{}", base, record_id), &[])
            .await?;
        Ok(response.server.tenant_id.filter(|t| !t.is_empty()))
    }

    async fn tenant_domain(&self, tenant_id: &str) -> Result<String, LookupError> {
        let base = self.session.require_endpoint("identity")?;
        let base = base.trim_end_matches("/v3");
        let response: ProjectResponse = self
            .session
            .get_json(&format!("{}/v3/projects/{}", base, tenant_id), &[])
            .await?;
        Ok(response.project.domain_id)
    }
}
