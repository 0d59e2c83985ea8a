//! Chart, plan and cluster resolution. Every protocol call resolves afresh.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use charter_catalog::ChartCatalog;
use charter_core::{naming, Chart, Plan};
use charter_credstore::CredStore;
use charter_kubehub::{Cluster, ClusterFactory};
use kube::config::Kubeconfig;
use tracing::debug;

/// Chart and plan picked for one request, plan values already overridden.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub chart: Chart,
    pub plan_name: String,
}

impl Resolved {
    pub fn plan(&self) -> Result<&Plan> {
        self.chart
            .plan(&self.plan_name)
            .ok_or_else(|| anyhow!("plan {} not found in chart {}", self.plan_name, self.chart.name))
    }
}

pub struct ClusterResolver {
    pub(crate) catalog: Arc<dyn ChartCatalog>,
    pub(crate) clusters: Arc<dyn ClusterFactory>,
    pub(crate) credstore: Option<Arc<dyn CredStore>>,
    pub(crate) identity: String,
}

impl ClusterResolver {
    /// Find the chart for `service_id` and load fresh plan values for `plan_id`:
    /// from the credential store when one is configured, else from the catalog.
    pub async fn chart(&self, service_id: &str, plan_id: &str) -> Result<Resolved> {
        let charts = self.catalog.charts().await.context("listing charts")?;
        let chart = charts
            .into_iter()
            .find(|c| c.service_id() == service_id)
            .ok_or_else(|| anyhow!("chart not found for service {}", service_id))?;
        let plan_name = naming::plan_name(plan_id, service_id).to_string();
        let chart = match &self.credstore {
            Some(store) => {
                let path = naming::plan_values_path(&self.identity, &chart.name, &plan_name);
                let values = store.get(&path).await.with_context(|| format!("reading plan values {}", path))?;
                let mut chart = chart;
                let plan = chart
                    .plans
                    .get_mut(&plan_name)
                    .ok_or_else(|| anyhow!("plan {} not found in chart {}", plan_name, chart.name))?;
                plan.values = values.into_bytes();
                chart
            }
            None => self
                .catalog
                .refresh_plans(&chart)
                .await
                .with_context(|| format!("loading plans of chart {}", chart.name))?,
        };
        let resolved = Resolved { chart, plan_name };
        resolved.plan()?;
        debug!(chart = %resolved.chart.name, plan = %resolved.plan_name, "chart resolved");
        Ok(resolved)
    }

    /// Default cluster unless the plan names its own; dedicated cluster access
    /// comes from the credential store when one is configured.
    pub async fn cluster(&self, resolved: &Resolved) -> Result<Arc<dyn Cluster>> {
        let plan = resolved.plan()?;
        if !plan.has_cluster() {
            return self.clusters.default_cluster().await.context("connecting to default cluster");
        }
        let config = match &self.credstore {
            Some(store) => {
                let path = naming::cluster_credentials_path(&self.identity, &resolved.chart.name, &resolved.plan_name);
                let raw = store.get(&path).await.with_context(|| format!("reading cluster credentials {}", path))?;
                Kubeconfig::from_yaml(&raw).with_context(|| format!("parsing cluster credentials {}", path))?
            }
            None => plan
                .cluster_config
                .clone()
                .ok_or_else(|| anyhow!("plan {} has no cluster configuration", resolved.plan_name))?,
        };
        debug!(chart = %resolved.chart.name, plan = %resolved.plan_name, "using dedicated cluster");
        self.clusters
            .cluster_from_config(&config)
            .await
            .with_context(|| format!("connecting to cluster of plan {}", resolved.plan_name))
    }

    pub async fn default_cluster(&self) -> Result<Arc<dyn Cluster>> {
        self.clusters.default_cluster().await.context("connecting to default cluster")
    }
}
