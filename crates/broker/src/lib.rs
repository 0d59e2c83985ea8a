//! Charter service broker.
//!
//! Turns provisioning-protocol calls into namespaces, releases and optional
//! dedicated clusters, and answers operation polls by reading the live
//! release status. The broker keeps no state between calls: chart, plan and
//! cluster are resolved afresh each time from the catalog, the credential
//! store and the cluster itself.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use charter_catalog::ChartCatalog;
use charter_core::{naming, LastOperation, OperationKind, OperationState};
use charter_credstore::CredStore;
use charter_kubehub::{ClusterFactory, ServiceAccountInstaller};
use charter_release::{ReleaseClientFactory, ReleaseError};
use tracing::{debug, info, warn};

pub mod credentials;
pub mod error;
pub mod orchestrate;
pub mod prepare;
pub mod protocol;
pub mod resolve;
pub mod settings;
pub mod status;

pub use error::{BrokerError, BrokerResult};
pub use orchestrate::{InstanceLabels, TeardownHandle};
pub use protocol::*;
pub use settings::{BrokerSettings, DEFAULT_IDENTITY};

use credentials::CredentialPipeline;
use orchestrate::{install_values, ReleaseOrchestrator};
use prepare::ClusterPreparer;
use resolve::ClusterResolver;

/// Accepted deprovision plus a handle on the detached teardown.
pub struct Deprovisioned {
    pub spec: AsyncSpec,
    pub teardown: TeardownHandle,
}

/// The provisioning protocol surface.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn catalog(&self) -> BrokerResult<Vec<CatalogService>>;

    async fn provision(&self, instance_id: &str, details: ProvisionDetails, async_allowed: bool) -> BrokerResult<AsyncSpec>;

    async fn deprovision(&self, instance_id: &str, details: DeprovisionDetails, async_allowed: bool) -> BrokerResult<Deprovisioned>;

    async fn bind(&self, instance_id: &str, binding_id: &str, details: BindDetails) -> BrokerResult<Binding>;

    async fn unbind(&self, instance_id: &str, binding_id: &str, details: UnbindDetails) -> BrokerResult<UnbindSpec>;

    async fn update(&self, instance_id: &str, details: UpdateDetails, async_allowed: bool) -> BrokerResult<AsyncSpec>;

    async fn last_operation(&self, instance_id: &str, details: PollDetails) -> BrokerResult<LastOperation>;

    async fn get_instance(&self, _instance_id: &str) -> BrokerResult<()> {
        Err(BrokerError::internal("get_instance is not supported"))
    }

    async fn get_binding(&self, _instance_id: &str, _binding_id: &str) -> BrokerResult<()> {
        Err(BrokerError::internal("get_binding is not supported"))
    }

    async fn last_binding_operation(&self, _instance_id: &str, _binding_id: &str) -> BrokerResult<LastOperation> {
        Err(BrokerError::internal("asynchronous bindings are not supported"))
    }

    /// Drop cached chart descriptors.
    async fn flush_cache(&self) -> BrokerResult<()>;
}

struct Inner {
    catalog: Arc<dyn ChartCatalog>,
    releases: Arc<dyn ReleaseClientFactory>,
    resolver: ClusterResolver,
    preparer: ClusterPreparer,
    orchestrator: ReleaseOrchestrator,
    credentials: CredentialPipeline,
}

/// Broker composed from its collaborators. Cheap to clone.
#[derive(Clone)]
pub struct ServiceBroker {
    inner: Arc<Inner>,
}

impl ServiceBroker {
    pub fn new(
        catalog: Arc<dyn ChartCatalog>,
        clusters: Arc<dyn ClusterFactory>,
        releases: Arc<dyn ReleaseClientFactory>,
        installer: Arc<dyn ServiceAccountInstaller>,
        credstore: Option<Arc<dyn CredStore>>,
        settings: BrokerSettings,
    ) -> Self {
        let BrokerSettings { identity, operators, registry } = settings;
        let inner = Inner {
            catalog: catalog.clone(),
            releases,
            resolver: ClusterResolver { catalog, clusters, credstore: credstore.clone(), identity: identity.clone() },
            preparer: ClusterPreparer { installer, operators: operators.into() },
            orchestrator: ReleaseOrchestrator { registry },
            credentials: CredentialPipeline { credstore, identity },
        };
        Self { inner: Arc::new(inner) }
    }

    fn require_async(op: OperationKind, async_allowed: bool) -> BrokerResult<()> {
        if async_allowed {
            return Ok(());
        }
        warn!(op = %op, "rejected synchronous request");
        Err(BrokerError::AsyncRequired)
    }
}

fn record<T>(ok: &'static str, err: &'static str, res: &BrokerResult<T>) {
    match res {
        Ok(_) => metrics::counter!(ok, 1u64),
        Err(e) => {
            metrics::counter!(err, 1u64);
            debug!(error = %e, "broker call failed");
        }
    }
}

impl ServiceBroker {
    async fn do_provision(&self, instance_id: &str, details: ProvisionDetails) -> BrokerResult<AsyncSpec> {
        let inner = &self.inner;
        let resolved = inner.resolver.chart(&details.service_id, &details.plan_id).await?;
        let cluster = inner.resolver.cluster(&resolved).await?;
        let releases = inner.releases.release_client(cluster.clone());
        let plan = resolved.plan()?;
        if plan.has_cluster() {
            inner.preparer.prepare(cluster.as_ref(), releases.as_ref()).await?;
        }
        let values = install_values(&plan.values, details.parameters.as_ref())?;
        let labels = InstanceLabels {
            service_id: details.service_id.clone(),
            plan_id: details.plan_id.clone(),
            organization_guid: details.organization_guid.clone(),
            space_guid: details.space_guid.clone(),
            instance_id: instance_id.to_string(),
        };
        inner
            .orchestrator
            .install(cluster.as_ref(), releases.as_ref(), &resolved.chart, &labels, &values)
            .await?;
        Ok(AsyncSpec::accepted(OperationKind::Provision))
    }

    async fn do_deprovision(&self, instance_id: &str, details: DeprovisionDetails) -> BrokerResult<Deprovisioned> {
        let inner = &self.inner;
        let resolved = inner.resolver.chart(&details.service_id, &details.plan_id).await?;
        let cluster = inner.resolver.cluster(&resolved).await?;
        let releases = inner.releases.release_client(cluster.clone());
        let teardown = inner.orchestrator.teardown(cluster, releases, instance_id);
        info!(instance = %instance_id, chart = %resolved.chart.name, "deprovision accepted");
        Ok(Deprovisioned { spec: AsyncSpec::accepted(OperationKind::Deprovision), teardown })
    }

    async fn do_bind(&self, instance_id: &str, binding_id: &str, details: BindDetails) -> BrokerResult<Binding> {
        let inner = &self.inner;
        if inner.credentials.escrows() && details.app_guid.as_deref().map_or(true, str::is_empty) {
            return Err(BrokerError::MissingAppGuid);
        }
        let resolved = inner.resolver.chart(&details.service_id, &details.plan_id).await?;
        let cluster = inner.resolver.cluster(&resolved).await?;
        let credentials = inner
            .credentials
            .bind(
                cluster.as_ref(),
                instance_id,
                &resolved.chart.name,
                binding_id,
                resolved.chart.bind_template.as_deref(),
                details.app_guid.as_deref(),
            )
            .await?;
        info!(instance = %instance_id, binding = %binding_id, "bound");
        Ok(Binding { credentials })
    }

    async fn do_unbind(&self, instance_id: &str, binding_id: &str, details: UnbindDetails) -> BrokerResult<UnbindSpec> {
        let inner = &self.inner;
        if inner.credentials.escrows() {
            let charts = inner.catalog.charts().await.map_err(|e| BrokerError::from(e.context("listing charts")))?;
            let chart = charts
                .iter()
                .find(|c| c.service_id() == details.service_id)
                .ok_or_else(|| BrokerError::internal(format!("service {} not found", details.service_id)))?;
            inner.credentials.unbind(&chart.name, binding_id).await?;
        }
        info!(instance = %instance_id, binding = %binding_id, "unbound");
        Ok(UnbindSpec { is_async: false })
    }

    async fn do_update(&self, instance_id: &str, details: UpdateDetails) -> BrokerResult<AsyncSpec> {
        let Some(params) = details.parameters.as_ref() else {
            // nothing to change; accepted without touching the cluster
            debug!(instance = %instance_id, "update without parameters");
            return Ok(AsyncSpec::accepted(OperationKind::Update));
        };
        let inner = &self.inner;
        let resolved = inner.resolver.chart(&details.service_id, &details.plan_id).await?;
        let cluster = inner.resolver.cluster(&resolved).await?;
        let releases = inner.releases.release_client(cluster);
        let values = install_values(&resolved.plan()?.values, Some(params))?;
        inner.orchestrator.upgrade(releases.as_ref(), &resolved.chart, instance_id, &values).await?;
        Ok(AsyncSpec::accepted(OperationKind::Update))
    }

    async fn do_last_operation(&self, instance_id: &str, details: PollDetails) -> BrokerResult<LastOperation> {
        let kind: OperationKind = details.operation_data.parse()?;
        let inner = &self.inner;
        let (cluster, from_plan) = match inner.resolver.chart(&details.service_id, &details.plan_id).await {
            Ok(resolved) => (inner.resolver.cluster(&resolved).await?, true),
            Err(e) => {
                info!(instance = %instance_id, error = %format!("{:#}", e), "could not load chart, using default cluster");
                (inner.resolver.default_cluster().await?, false)
            }
        };
        let releases = inner.releases.release_client(cluster);
        let namespace = naming::namespace(instance_id);
        let release = naming::release_name(instance_id);
        let info = match releases.status(&namespace, &release).await {
            Ok(info) => info,
            // release records go away with the namespace; on the fallback
            // cluster a missing release says nothing about the real one
            Err(ReleaseError::NotFound(_)) if kind == OperationKind::Deprovision && from_plan => {
                return Ok(LastOperation::new(OperationState::Succeeded, "gone"));
            }
            Err(e) => return Err(e.into()),
        };
        let mapped = status::map_release_status(kind, info.status);
        if !status::needs_readiness(kind, &mapped) {
            return Ok(mapped);
        }
        let readiness = releases.resource_readiness(&namespace).await?;
        status::apply_readiness(mapped, readiness)
    }
}

#[async_trait::async_trait]
impl Broker for ServiceBroker {
    async fn catalog(&self) -> BrokerResult<Vec<CatalogService>> {
        let charts = self.inner.catalog.charts().await.map_err(|e| BrokerError::from(e.context("listing charts")))?;
        let services: Vec<CatalogService> = charts.iter().map(CatalogService::from).collect();
        metrics::counter!("broker_catalog_total", 1u64);
        debug!(services = services.len(), "catalog served");
        Ok(services)
    }

    async fn provision(&self, instance_id: &str, details: ProvisionDetails, async_allowed: bool) -> BrokerResult<AsyncSpec> {
        Self::require_async(OperationKind::Provision, async_allowed)?;
        info!(instance = %instance_id, service = %details.service_id, plan = %details.plan_id, "provision requested");
        let res = self.do_provision(instance_id, details).await;
        record("broker_provision_total", "broker_provision_err", &res);
        res
    }

    async fn deprovision(&self, instance_id: &str, details: DeprovisionDetails, async_allowed: bool) -> BrokerResult<Deprovisioned> {
        Self::require_async(OperationKind::Deprovision, async_allowed)?;
        info!(instance = %instance_id, service = %details.service_id, plan = %details.plan_id, "deprovision requested");
        let res = self.do_deprovision(instance_id, details).await;
        record("broker_deprovision_total", "broker_deprovision_err", &res);
        res
    }

    async fn bind(&self, instance_id: &str, binding_id: &str, details: BindDetails) -> BrokerResult<Binding> {
        let res = self.do_bind(instance_id, binding_id, details).await;
        record("broker_bind_total", "broker_bind_err", &res);
        res
    }

    async fn unbind(&self, instance_id: &str, binding_id: &str, details: UnbindDetails) -> BrokerResult<UnbindSpec> {
        let res = self.do_unbind(instance_id, binding_id, details).await;
        record("broker_unbind_total", "broker_unbind_err", &res);
        res
    }

    async fn update(&self, instance_id: &str, details: UpdateDetails, async_allowed: bool) -> BrokerResult<AsyncSpec> {
        Self::require_async(OperationKind::Update, async_allowed)?;
        info!(instance = %instance_id, plan = %details.plan_id, "update requested");
        let res = self.do_update(instance_id, details).await;
        record("broker_update_total", "broker_update_err", &res);
        res
    }

    async fn last_operation(&self, instance_id: &str, details: PollDetails) -> BrokerResult<LastOperation> {
        let t0 = Instant::now();
        let res = self.do_last_operation(instance_id, details).await;
        metrics::histogram!("broker_poll_ms", t0.elapsed().as_secs_f64() * 1_000.0);
        record("broker_poll_total", "broker_poll_err", &res);
        if let Ok(op) = &res {
            debug!(instance = %instance_id, state = %op.state, description = %op.description, "polled");
        }
        res
    }

    async fn flush_cache(&self) -> BrokerResult<()> {
        self.inner.catalog.clear_cache().await?;
        Ok(())
    }
}
