//! Ownership enrichment: adds `project_id` and `domain_id` labels to groups
//! that carry a `server_id`.
//!
//! Two fan-out stages run one after the other. Stage one resolves every
//! distinct server id to its owning tenant; stage two resolves every
//! distinct tenant to its domain, so a tenant owning many servers is looked
//! up once. Each stage is a [`JoinSet`] bounded by a semaphore and joined
//! before the next stage starts.
//!
//! The first lookup of a stage runs alone. A permission-denied answer there
//! means the service account lacks the role for this kind of lookup, and the
//! whole stage is skipped for the cycle.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::LookupError;
use crate::models::{EnrichmentResult, TargetGroup, DOMAIN_ID_LABEL, PROJECT_ID_LABEL, SERVER_ID_LABEL};

pub const DEFAULT_CONCURRENCY: usize = 16;

/// Ownership backend.
#[async_trait]
pub trait OwnershipLookup: Send + Sync {
    /// Tenant owning the record, or `None` if it has no owner.
    async fn server_tenant(&self, record_id: &str) -> Result<Option<String>, LookupError>;

    /// Domain the tenant belongs to.
    async fn tenant_domain(&self, tenant_id: &str) -> Result<String, LookupError>;
}

pub struct Enricher {
    lookup: Arc<dyn OwnershipLookup>,
    concurrency: usize,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn OwnershipLookup>) -> Self {
        Self {
            lookup,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Resolves ownership for `record_ids`. Records without an owner, or
    /// whose lookup failed, are absent from the result.
    pub async fn resolve(&self, record_ids: &[String]) -> BTreeMap<String, EnrichmentResult> {
        let ids: Vec<String> = record_ids
            .iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let Some(tenants) = self
            .fan_out("server tenant", ids, |lookup, id| async move {
                lookup.server_tenant(&id).await
            })
            .await
        else {
            return BTreeMap::new();
        };
        let tenants: BTreeMap<String, String> = tenants
            .into_iter()
            .filter_map(|(id, tenant)| tenant.map(|t| (id, t)))
            .collect();

        let distinct: Vec<String> = tenants
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let domains = self
            .fan_out("tenant domain", distinct, |lookup, tenant| async move {
                lookup.tenant_domain(&tenant).await
            })
            .await
            .unwrap_or_default();

        tenants
            .into_iter()
            .map(|(record_id, tenant_id)| {
                let domain_id = domains.get(&tenant_id).cloned();
                (
                    record_id.clone(),
                    EnrichmentResult {
                        record_id,
                        tenant_id,
                        domain_id,
                    },
                )
            })
            .collect()
    }

    /// Adds ownership labels to every group whose `server_id` resolved.
    /// Returns the number of groups that gained labels.
    pub async fn enrich(&self, groups: &mut [TargetGroup]) -> usize {
        let ids: Vec<String> = groups
            .iter()
            .filter_map(|g| g.label(SERVER_ID_LABEL).map(str::to_string))
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let results = self.resolve(&ids).await;
        merge(groups, &results)
    }

    /// Runs `f` once per key. `None` when the first call was denied.
    async fn fan_out<T, F, Fut>(&self, stage: &str, keys: Vec<String>, f: F) -> Option<BTreeMap<String, T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn OwnershipLookup>, String) -> Fut,
        Fut: Future<Output = Result<T, LookupError>> + Send + 'static,
    {
        let mut results = BTreeMap::new();
        let mut keys = keys.into_iter();
        let Some(first) = keys.next() else {
            return Some(results);
        };

        match f(self.lookup.clone(), first.clone()).await {
            Ok(value) => {
                results.insert(first, value);
            }
            Err(LookupError::PermissionDenied(e)) => {
                warn!(stage, error = %e, "missing role for ownership lookup, skipping enrichment this cycle");
                return None;
            }
            Err(e) => log_failure(stage, &first, &e),
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for key in keys {
            let call = f(self.lookup.clone(), key.clone());
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (key, call.await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, Ok(value))) => {
                    results.insert(key, value);
                }
                Ok((key, Err(e))) => log_failure(stage, &key, &e),
                Err(e) => warn!(stage, error = %e, "ownership lookup task failed"),
            }
        }
        Some(results)
    }
}

fn log_failure(stage: &str, key: &str, e: &LookupError) {
    match e {
        LookupError::NotFound(_) => debug!(stage, key, "no ownership record"),
        _ => warn!(stage, key, error = %e, "ownership lookup failed"),
    }
}

/// Writes ownership labels onto groups by `server_id` match.
pub fn merge(groups: &mut [TargetGroup], results: &BTreeMap<String, EnrichmentResult>) -> usize {
    let mut enriched = 0;
    for group in groups.iter_mut() {
        let Some(result) = group.label(SERVER_ID_LABEL).and_then(|id| results.get(id)) else {
            continue;
        };
        let result = result.clone();
        group
            .labels
            .insert(PROJECT_ID_LABEL.to_string(), result.tenant_id);
        if let Some(domain) = result.domain_id {
            group.labels.insert(DOMAIN_ID_LABEL.to_string(), domain);
        }
        enriched += 1;
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LabelSet;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeOwnership {
        tenants: HashMap<String, Result<Option<String>, LookupError>>,
        domains: HashMap<String, Result<String, LookupError>>,
        tenant_calls: Mutex<Vec<String>>,
        domain_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OwnershipLookup for FakeOwnership {
        async fn server_tenant(&self, record_id: &str) -> Result<Option<String>, LookupError> {
            self.tenant_calls.lock().push(record_id.to_string());
            self.tenants
                .get(record_id)
                .cloned()
                .unwrap_or_else(|| Err(LookupError::NotFound(record_id.to_string())))
        }

        async fn tenant_domain(&self, tenant_id: &str) -> Result<String, LookupError> {
            self.domain_calls.lock().push(tenant_id.to_string());
            self.domains
                .get(tenant_id)
                .cloned()
                .unwrap_or_else(|| Err(LookupError::NotFound(tenant_id.to_string())))
        }
    }

    fn group(server_id: &str) -> TargetGroup {
        let mut labels = LabelSet::new();
        labels.insert(SERVER_ID_LABEL.into(), server_id.into());
        TargetGroup::single(server_id, format!("{server_id}:9100"), labels)
    }

    #[tokio::test]
    async fn failed_lookup_leaves_group_unlabelled() {
        let mut fake = FakeOwnership::default();
        fake.tenants.insert("a".into(), Err(LookupError::Failed("500".into())));
        fake.tenants.insert("b".into(), Ok(Some("p1".into())));
        fake.domains.insert("p1".into(), Ok("d1".into()));
        let enricher = Enricher::new(Arc::new(fake));

        let mut groups = vec![group("a"), group("b")];
        assert_eq!(enricher.enrich(&mut groups).await, 1);

        assert_eq!(groups.len(), 2);
        assert!(groups[0].label(PROJECT_ID_LABEL).is_none());
        assert_eq!(groups[1].label(PROJECT_ID_LABEL), Some("p1"));
        assert_eq!(groups[1].label(DOMAIN_ID_LABEL), Some("d1"));
    }

    #[tokio::test]
    async fn permission_denied_on_first_call_skips_cycle() {
        let mut fake = FakeOwnership::default();
        fake.tenants.insert("a".into(), Err(LookupError::PermissionDenied("403".into())));
        fake.tenants.insert("b".into(), Ok(Some("p1".into())));
        fake.tenants.insert("c".into(), Ok(Some("p1".into())));
        let fake = Arc::new(fake);
        let enricher = Enricher::new(fake.clone());

        let mut groups = vec![group("c"), group("b"), group("a")];
        assert_eq!(enricher.enrich(&mut groups).await, 0);

        assert!(groups.iter().all(|g| g.label(PROJECT_ID_LABEL).is_none()));
        assert_eq!(*fake.tenant_calls.lock(), vec!["a".to_string()]);
        assert!(fake.domain_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn domain_is_looked_up_once_per_tenant() {
        let mut fake = FakeOwnership::default();
        for id in ["a", "b", "c"] {
            fake.tenants.insert(id.into(), Ok(Some("p1".into())));
        }
        fake.tenants.insert("d".into(), Ok(Some("p2".into())));
        fake.domains.insert("p1".into(), Ok("d1".into()));
        fake.domains.insert("p2".into(), Err(LookupError::Failed("boom".into())));
        let fake = Arc::new(fake);
        let enricher = Enricher::new(fake.clone()).with_concurrency(2);

        let results = enricher
            .resolve(&["a".into(), "b".into(), "c".into(), "d".into(), "a".into()])
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results["a"].domain_id.as_deref(), Some("d1"));
        assert_eq!(results["d"].tenant_id, "p2");
        assert!(results["d"].domain_id.is_none());

        let mut domain_calls = fake.domain_calls.lock().clone();
        domain_calls.sort();
        assert_eq!(domain_calls, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(fake.tenant_calls.lock().len(), 4);
    }

    #[tokio::test]
    async fn unowned_records_are_skipped() {
        let mut fake = FakeOwnership::default();
        fake.tenants.insert("a".into(), Ok(None));
        let enricher = Enricher::new(Arc::new(fake));
        let mut groups = vec![group("a")];
        assert_eq!(enricher.enrich(&mut groups).await, 0);
        assert!(groups[0].label(PROJECT_ID_LABEL).is_none());
    }

    #[tokio::test]
    async fn groups_without_server_id_are_untouched() {
        let fake = Arc::new(FakeOwnership::default());
        let enricher = Enricher::new(fake.clone());
        let mut groups = vec![TargetGroup::single("x", "10.0.0.9:9100", LabelSet::new())];
        assert_eq!(enricher.enrich(&mut groups).await, 0);
        assert!(fake.tenant_calls.lock().is_empty());
    }
}
