//! Release install/upgrade and the detached deprovision teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use charter_core::{naming, Chart};
use charter_kubehub::{Cluster, RegistryCredentials};
use charter_release::{merge_values, params_to_values, ReleaseClient};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Traceability labels on instance namespaces.
#[derive(Debug, Clone, Default)]
pub struct InstanceLabels {
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub instance_id: String,
}

impl InstanceLabels {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("serviceID".to_string(), self.service_id.clone()),
            ("planID".to_string(), self.plan_id.clone()),
            ("organizationGUID".to_string(), self.organization_guid.clone()),
            ("spaceGUID".to_string(), self.space_guid.clone()),
            ("instanceID".to_string(), self.instance_id.clone()),
        ])
    }
}

/// Plan defaults overlaid with caller parameters.
pub fn install_values(plan_values: &[u8], params: Option<&serde_json::Value>) -> Result<serde_yaml::Value> {
    let overrides = params.map(params_to_values).transpose()?;
    merge_values(plan_values, overrides.as_ref())
}

pub struct ReleaseOrchestrator {
    pub(crate) registry: Option<RegistryCredentials>,
}

impl ReleaseOrchestrator {
    /// Declare the labelled namespace, seed the pull secret, install.
    pub async fn install(
        &self,
        cluster: &dyn Cluster,
        releases: &dyn ReleaseClient,
        chart: &Chart,
        labels: &InstanceLabels,
        values: &serde_yaml::Value,
    ) -> Result<()> {
        let namespace = naming::namespace(&labels.instance_id);
        let release = naming::release_name(&labels.instance_id);
        cluster
            .ensure_namespace(&namespace, &labels.to_map())
            .await
            .with_context(|| format!("creating namespace {}", namespace))?;
        if let Some(registry) = &self.registry {
            cluster
                .ensure_registry_secret(&namespace, registry)
                .await
                .with_context(|| format!("seeding registry secret in {}", namespace))?;
        }
        releases
            .install(chart, &namespace, &release, values)
            .await
            .with_context(|| format!("installing {} as {}", chart.name, release))?;
        info!(instance = %labels.instance_id, release = %release, namespace = %namespace, chart = %chart.name, "install started");
        Ok(())
    }

    pub async fn upgrade(
        &self,
        releases: &dyn ReleaseClient,
        chart: &Chart,
        instance_id: &str,
        values: &serde_yaml::Value,
    ) -> Result<()> {
        let namespace = naming::namespace(instance_id);
        let release = naming::release_name(instance_id);
        releases
            .upgrade(chart, &namespace, &release, values)
            .await
            .with_context(|| format!("upgrading {}", release))?;
        info!(instance = %instance_id, release = %release, "upgrade started");
        Ok(())
    }

    /// Delete the release, then the namespace, on a detached task.
    /// Failures of either step are logged and never retried.
    pub fn teardown(&self, cluster: Arc<dyn Cluster>, releases: Arc<dyn ReleaseClient>, instance_id: &str) -> TeardownHandle {
        let instance = instance_id.to_string();
        let namespace = naming::namespace(instance_id);
        let release = naming::release_name(instance_id);
        let (tx, mut rx) = mpsc::unbounded_channel::<anyhow::Error>();

        let work = tokio::spawn(async move {
            if let Err(e) = releases.delete(&namespace, &release).await {
                let _ = tx.send(anyhow::Error::new(e).context(format!("deleting release {}", release)));
            }
            if let Err(e) = cluster.delete_namespace(&namespace).await {
                let _ = tx.send(e.context(format!("deleting namespace {}", namespace)));
            }
            info!(instance = %instance, namespace = %namespace, "teardown finished");
        });
        let drain = tokio::spawn(async move {
            while let Some(e) = rx.recv().await {
                metrics::counter!("broker_teardown_err", 1u64);
                error!(error = %format!("{:#}", e), "teardown step failed");
            }
        });
        TeardownHandle { work: Some(work), drain: Some(drain) }
    }
}

/// Handle on a detached teardown. Dropping or cancelling it never stops the
/// teardown; it only gives up the ability to wait for it.
pub struct TeardownHandle {
    work: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
}

impl TeardownHandle {
    /// Detach. The teardown keeps running in the background.
    pub fn cancel(mut self) {
        self.work.take();
        self.drain.take();
    }

    /// Wait until both teardown steps ran and their errors were logged.
    pub async fn finished(mut self) {
        if let Some(w) = self.work.take() {
            if let Err(e) = w.await {
                metrics::counter!("broker_teardown_err", 1u64);
                error!(error = %e, "teardown task aborted");
            }
        }
        if let Some(d) = self.drain.take() {
            if let Err(e) = d.await {
                error!(error = %e, "teardown error drain aborted");
            }
        }
    }
}
