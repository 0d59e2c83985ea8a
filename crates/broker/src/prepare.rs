//! Bootstrap of dedicated clusters: service account, then operator charts.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use charter_core::Chart;
use charter_kubehub::{Cluster, ServiceAccountInstaller};
use charter_release::{merge_values, ReleaseClient, ReleaseError};
use tracing::info;

pub struct ClusterPreparer {
    pub(crate) installer: Arc<dyn ServiceAccountInstaller>,
    pub(crate) operators: Arc<[Chart]>,
}

/// Operators install with the values of their first plan, if any.
fn operator_values(chart: &Chart) -> Result<serde_yaml::Value> {
    let plan_values = chart.plans.values().next().map(|p| p.values.as_slice()).unwrap_or_default();
    merge_values(plan_values, None).with_context(|| format!("values of operator {}", chart.name))
}

impl ClusterPreparer {
    /// Idempotent: an operator already present is upgraded in place.
    pub async fn prepare(&self, cluster: &dyn Cluster, releases: &dyn ReleaseClient) -> Result<()> {
        self.installer.install(cluster).await.context("installing service account")?;
        for op in self.operators.iter() {
            let values = operator_values(op)?;
            // operators live in a namespace and release named after the chart
            match releases.status(&op.name, &op.name).await {
                Ok(_) => {
                    releases
                        .upgrade(op, &op.name, &op.name, &values)
                        .await
                        .with_context(|| format!("upgrading operator {}", op.name))?;
                    info!(operator = %op.name, "operator upgraded");
                }
                Err(ReleaseError::NotFound(_)) => {
                    cluster
                        .ensure_namespace(&op.name, &BTreeMap::new())
                        .await
                        .with_context(|| format!("creating namespace for operator {}", op.name))?;
                    releases
                        .install(op, &op.name, &op.name, &values)
                        .await
                        .with_context(|| format!("installing operator {}", op.name))?;
                    info!(operator = %op.name, "operator installed");
                }
                Err(e) => return Err(anyhow::Error::new(e).context(format!("checking operator {}", op.name))),
            }
        }
        Ok(())
    }
}
