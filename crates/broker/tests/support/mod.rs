#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use charter_broker::{BrokerSettings, ServiceBroker};
use charter_catalog::ChartCatalog;
use charter_core::{Chart, Document, Plan, Value};
use charter_credstore::{CredStore, MemoryCredStore};
use charter_kubehub::{Cluster, ClusterFactory, RegistryCredentials, ServiceAccountInstaller};
use charter_release::{Readiness, ReleaseClient, ReleaseClientFactory, ReleaseError, ReleaseInfo, ReleaseResult, ReleaseStatus};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::config::Kubeconfig;

/// Shared, ordered log of every collaborator call.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, s: impl Into<String>) { self.0.lock().unwrap().push(s.into()); }
    pub fn all(&self) -> Vec<String> { self.0.lock().unwrap().clone() }
    pub fn is_empty(&self) -> bool { self.0.lock().unwrap().is_empty() }
    pub fn count(&self, prefix: &str) -> usize { self.all().iter().filter(|c| c.starts_with(prefix)).count() }
    pub fn position(&self, prefix: &str) -> Option<usize> { self.all().iter().position(|c| c.starts_with(prefix)) }
}

pub const DEDICATED_KUBECONFIG: &str = "apiVersion: v1\nkind: Config\nclusters:\n- name: dedicated\n  cluster:\n    server: https://10.1.0.1\n";

pub fn plan(name: &str, values: &str) -> Plan {
    Plan {
        name: name.into(),
        description: format!("{} plan", name),
        bindable: true,
        free: true,
        values: values.as_bytes().to_vec(),
        ..Default::default()
    }
}

pub fn chart(name: &str, plans: Vec<Plan>) -> Chart {
    Chart {
        name: name.into(),
        version: "1.0.0".into(),
        description: format!("{} service", name),
        path: format!("/charts/{}", name).into(),
        plans: plans.into_iter().map(|p| (p.name.clone(), p)).collect(),
        ..Default::default()
    }
}

pub fn dedicated_plan(name: &str) -> Plan {
    let mut p = plan(name, "replicas: 1\n");
    p.cluster_config = Some(Kubeconfig::from_yaml(DEDICATED_KUBECONFIG).unwrap());
    p
}

pub struct FakeCatalog {
    pub charts: Mutex<Vec<Chart>>,
    pub log: CallLog,
}

#[async_trait::async_trait]
impl ChartCatalog for FakeCatalog {
    async fn charts(&self) -> Result<Vec<Chart>> {
        self.log.push("catalog.charts");
        Ok(self.charts.lock().unwrap().clone())
    }

    async fn clear_cache(&self) -> Result<()> {
        self.log.push("catalog.clear_cache");
        Ok(())
    }

    async fn refresh_plans(&self, chart: &Chart) -> Result<Chart> {
        self.log.push(format!("catalog.refresh_plans {}", chart.name));
        Ok(chart.clone())
    }
}

pub struct FakeCluster {
    pub name: String,
    pub kubeconfig: Option<Kubeconfig>,
    pub log: CallLog,
    pub live: Mutex<Document>,
    pub fail_namespace_delete: bool,
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    fn kubeconfig(&self) -> Option<&Kubeconfig> { self.kubeconfig.as_ref() }

    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.log.push(format!("{}.ensure_namespace {} [{}]", self.name, name, labels.join(",")));
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.log.push(format!("{}.delete_namespace {}", self.name, name));
        if self.fail_namespace_delete {
            return Err(anyhow!("namespace {} is stuck", name));
        }
        Ok(())
    }

    async fn secrets_and_services(&self, namespace: &str) -> Result<Document> {
        self.log.push(format!("{}.secrets_and_services {}", self.name, namespace));
        Ok(self.live.lock().unwrap().clone())
    }

    async fn list_pods(&self, _namespace: &str) -> Result<Vec<Pod>> { Ok(Vec::new()) }

    async fn list_services(&self, _namespace: &str) -> Result<Vec<Service>> { Ok(Vec::new()) }

    async fn ensure_registry_secret(&self, namespace: &str, registry: &RegistryCredentials) -> Result<()> {
        self.log.push(format!("{}.ensure_registry_secret {} {}", self.name, namespace, registry.server));
        Ok(())
    }
}

pub struct FakeClusterFactory {
    pub default: Arc<FakeCluster>,
    pub dedicated: Arc<FakeCluster>,
    pub log: CallLog,
}

#[async_trait::async_trait]
impl ClusterFactory for FakeClusterFactory {
    async fn default_cluster(&self) -> Result<Arc<dyn Cluster>> {
        self.log.push("clusters.default");
        Ok(self.default.clone())
    }

    async fn cluster_from_config(&self, config: &Kubeconfig) -> Result<Arc<dyn Cluster>> {
        let name = config.clusters.first().map(|c| c.name.clone()).unwrap_or_default();
        self.log.push(format!("clusters.from_config {}", name));
        Ok(self.dedicated.clone())
    }
}

/// Release manager state shared by every client the factory hands out.
#[derive(Default)]
pub struct ReleaseState {
    pub statuses: Mutex<HashMap<String, ReleaseStatus>>,
    pub readiness: Mutex<Option<Readiness>>,
    pub fail_delete: Mutex<bool>,
    pub panic_delete: Mutex<bool>,
}

pub struct FakeReleaseFactory {
    pub state: Arc<ReleaseState>,
    pub log: CallLog,
}

impl ReleaseClientFactory for FakeReleaseFactory {
    fn release_client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn ReleaseClient> {
        let target = if cluster.kubeconfig().is_some() { "dedicated" } else { "default" };
        Arc::new(FakeReleases { target: target.into(), state: self.state.clone(), log: self.log.clone() })
    }
}

pub struct FakeReleases {
    target: String,
    state: Arc<ReleaseState>,
    log: CallLog,
}

#[async_trait::async_trait]
impl ReleaseClient for FakeReleases {
    async fn install(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()> {
        let values = serde_json::to_string(values).map_err(anyhow::Error::from)?;
        self.log.push(format!("{}.install {} {} {} {}", self.target, chart.name, namespace, release, values));
        self.state.statuses.lock().unwrap().insert(release.to_string(), ReleaseStatus::PendingInstall);
        Ok(())
    }

    async fn upgrade(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()> {
        let values = serde_json::to_string(values).map_err(anyhow::Error::from)?;
        self.log.push(format!("{}.upgrade {} {} {} {}", self.target, chart.name, namespace, release, values));
        self.state.statuses.lock().unwrap().insert(release.to_string(), ReleaseStatus::PendingUpgrade);
        Ok(())
    }

    async fn delete(&self, namespace: &str, release: &str) -> ReleaseResult<()> {
        self.log.push(format!("{}.delete {} {}", self.target, namespace, release));
        let panics = *self.state.panic_delete.lock().unwrap();
        if panics {
            panic!("helm crashed deleting {}", release);
        }
        if *self.state.fail_delete.lock().unwrap() {
            return Err(ReleaseError::Command { command: "helm uninstall".into(), stderr: "boom".into() });
        }
        self.state.statuses.lock().unwrap().insert(release.to_string(), ReleaseStatus::Deleted);
        Ok(())
    }

    async fn status(&self, namespace: &str, release: &str) -> ReleaseResult<ReleaseInfo> {
        self.log.push(format!("{}.status {} {}", self.target, namespace, release));
        match self.state.statuses.lock().unwrap().get(release) {
            Some(s) => Ok(ReleaseInfo { name: release.into(), status: *s, description: String::new() }),
            None => Err(ReleaseError::NotFound(release.into())),
        }
    }

    async fn resource_readiness(&self, namespace: &str) -> ReleaseResult<Readiness> {
        self.log.push(format!("{}.resource_readiness {}", self.target, namespace));
        Ok(self.state.readiness.lock().unwrap().clone().unwrap_or_else(Readiness::ready))
    }
}

pub struct FakeInstaller {
    pub log: CallLog,
}

#[async_trait::async_trait]
impl ServiceAccountInstaller for FakeInstaller {
    async fn install(&self, _cluster: &dyn Cluster) -> Result<()> {
        self.log.push("sa.install");
        Ok(())
    }
}

/// Memory store that logs calls and can refuse revocations.
pub struct LoggingStore {
    pub inner: MemoryCredStore,
    pub log: CallLog,
    pub fail_revoke: bool,
}

#[async_trait::async_trait]
impl CredStore for LoggingStore {
    async fn get(&self, path: &str) -> Result<String> {
        self.log.push(format!("store.get {}", path));
        self.inner.get(path).await
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        self.log.push(format!("store.put {}", path));
        self.inner.put(path, value).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.log.push(format!("store.delete {}", path));
        self.inner.delete(path).await
    }

    async fn add_permission(&self, path: &str, actor: &str, operations: &[&str]) -> Result<()> {
        self.log.push(format!("store.add_permission {} {}", path, actor));
        self.inner.add_permission(path, actor, operations).await
    }

    async fn delete_permission(&self, path: &str) -> Result<()> {
        self.log.push(format!("store.delete_permission {}", path));
        if self.fail_revoke {
            return Err(anyhow!("permission service unavailable"));
        }
        self.inner.delete_permission(path).await
    }
}

pub struct Harness {
    pub broker: ServiceBroker,
    pub log: CallLog,
    pub catalog: Arc<FakeCatalog>,
    pub releases: Arc<ReleaseState>,
    pub default_cluster: Arc<FakeCluster>,
    pub store: Option<Arc<LoggingStore>>,
}

#[derive(Default)]
pub struct HarnessBuilder {
    charts: Vec<Chart>,
    store: bool,
    fail_revoke: bool,
    fail_namespace_delete: bool,
    settings: Option<BrokerSettings>,
    live: Document,
}

impl HarnessBuilder {
    pub fn chart(mut self, c: Chart) -> Self {
        self.charts.push(c);
        self
    }

    pub fn with_store(mut self) -> Self {
        self.store = true;
        self
    }

    pub fn failing_revoke(mut self) -> Self {
        self.fail_revoke = true;
        self
    }

    pub fn failing_namespace_delete(mut self) -> Self {
        self.fail_namespace_delete = true;
        self
    }

    pub fn settings(mut self, s: BrokerSettings) -> Self {
        self.settings = Some(s);
        self
    }

    pub fn live(mut self, doc: serde_json::Value) -> Self {
        self.live = Value::from(doc).into_map().unwrap();
        self
    }

    pub fn build(self) -> Harness {
        let log = CallLog::default();
        let catalog = Arc::new(FakeCatalog { charts: Mutex::new(self.charts), log: log.clone() });
        let default_cluster = Arc::new(FakeCluster {
            name: "default".into(),
            kubeconfig: None,
            log: log.clone(),
            live: Mutex::new(self.live.clone()),
            fail_namespace_delete: self.fail_namespace_delete,
        });
        let dedicated = Arc::new(FakeCluster {
            name: "dedicated".into(),
            kubeconfig: Some(Kubeconfig::from_yaml(DEDICATED_KUBECONFIG).unwrap()),
            log: log.clone(),
            live: Mutex::new(self.live),
            fail_namespace_delete: self.fail_namespace_delete,
        });
        let clusters = Arc::new(FakeClusterFactory { default: default_cluster.clone(), dedicated, log: log.clone() });
        let releases = Arc::new(ReleaseState::default());
        let release_factory = Arc::new(FakeReleaseFactory { state: releases.clone(), log: log.clone() });
        let installer = Arc::new(FakeInstaller { log: log.clone() });
        let store = self.store.then(|| {
            Arc::new(LoggingStore { inner: MemoryCredStore::new(), log: log.clone(), fail_revoke: self.fail_revoke })
        });
        let broker = ServiceBroker::new(
            catalog.clone(),
            clusters,
            release_factory,
            installer,
            store.clone().map(|s| s as Arc<dyn CredStore>),
            self.settings.unwrap_or_default(),
        );
        Harness { broker, log, catalog, releases, default_cluster, store }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder { HarnessBuilder::default() }

    pub fn set_status(&self, release: &str, status: ReleaseStatus) {
        self.releases.statuses.lock().unwrap().insert(release.to_string(), status);
    }

    pub fn set_readiness(&self, r: Readiness) { *self.releases.readiness.lock().unwrap() = Some(r); }

    pub fn store(&self) -> &LoggingStore { self.store.as_deref().unwrap() }

    /// Seed a store entry without logging it.
    pub async fn seed(&self, path: &str, value: &str) {
        self.store().inner.put(path, &Value::String(value.into())).await.unwrap();
    }
}
