//! Charter release client: chart install/upgrade/delete, release status and
//! resource readiness of an instance namespace.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use charter_core::Chart;
use charter_kubehub::Cluster;
use k8s_openapi::api::core::v1::{Pod, Service};
use serde::{Deserialize, Serialize};

mod helm;
mod values;

pub use helm::{HelmCli, HelmClientFactory};
pub use values::{merge_values, params_to_values};

/// Lifecycle status of a release as reported by the release manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseStatus {
    Unknown,
    Deployed,
    Deleted,
    Superseded,
    Failed,
    Deleting,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    pub const ALL: [ReleaseStatus; 9] = [
        ReleaseStatus::Unknown,
        ReleaseStatus::Deployed,
        ReleaseStatus::Deleted,
        ReleaseStatus::Superseded,
        ReleaseStatus::Failed,
        ReleaseStatus::Deleting,
        ReleaseStatus::PendingInstall,
        ReleaseStatus::PendingUpgrade,
        ReleaseStatus::PendingRollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Deleted => "uninstalled",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Deleting => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ReleaseStatus {
    type Err = std::convert::Infallible;

    /// Helm status strings; anything unrecognised is `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "uninstalled" | "deleted" => ReleaseStatus::Deleted,
            "superseded" => ReleaseStatus::Superseded,
            "failed" => ReleaseStatus::Failed,
            "uninstalling" | "deleting" => ReleaseStatus::Deleting,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        })
    }
}

/// Current state of one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub status: ReleaseStatus,
    pub description: String,
}

/// Outcome of probing live resources in an instance namespace.
/// `Deployed` means ready, `PendingInstall` means still coming up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub status: ReleaseStatus,
    pub message: Option<String>,
}

impl Readiness {
    pub fn ready() -> Self { Self { status: ReleaseStatus::Deployed, message: None } }

    pub fn pending(message: impl Into<String>) -> Self {
        Self { status: ReleaseStatus::PendingInstall, message: Some(message.into()) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("release {0} not found")]
    NotFound(String),
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// Release manager bound to one cluster.
#[async_trait::async_trait]
pub trait ReleaseClient: Send + Sync {
    /// Install `chart` as `release` into an existing `namespace`.
    async fn install(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()>;

    /// Upgrade an existing release with fresh values.
    async fn upgrade(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()>;

    async fn delete(&self, namespace: &str, release: &str) -> ReleaseResult<()>;

    async fn status(&self, namespace: &str, release: &str) -> ReleaseResult<ReleaseInfo>;

    /// Probe whether the workloads in `namespace` are actually usable.
    async fn resource_readiness(&self, namespace: &str) -> ReleaseResult<Readiness>;
}

/// Binds release clients to clusters.
pub trait ReleaseClientFactory: Send + Sync {
    fn release_client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn ReleaseClient>;
}

/// Ready when every LoadBalancer service has an ingress and every pod either
/// completed or reports `Ready=True`. Services are checked first.
pub fn assess_readiness(pods: &[Pod], services: &[Service]) -> Readiness {
    for svc in services {
        let is_lb = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
        if !is_lb {
            continue;
        }
        let has_ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|i| !i.is_empty())
            .unwrap_or(false);
        if !has_ingress {
            let name = svc.metadata.name.as_deref().unwrap_or("<unnamed>");
            return Readiness::pending(format!("waiting for load balancer on service {}", name));
        }
    }
    for pod in pods {
        let status = pod.status.as_ref();
        if status.and_then(|s| s.phase.as_deref()) == Some("Succeeded") {
            continue;
        }
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
        if !ready {
            let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
            return Readiness::pending(format!("waiting for pod {} to become ready", name));
        }
    }
    Readiness::ready()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, PodCondition, PodStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, phase: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True".into() } else { "False".into() },
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn lb(name: &str, ingress: bool) -> Service {
        Service {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            spec: Some(ServiceSpec { type_: Some("LoadBalancer".into()), ..Default::default() }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: if ingress {
                        Some(vec![LoadBalancerIngress { ip: Some("198.51.100.4".into()), ..Default::default() }])
                    } else {
                        None
                    },
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn parses_helm_status_strings() {
        assert_eq!("deployed".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Deployed);
        assert_eq!("uninstalled".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Deleted);
        assert_eq!("uninstalling".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Deleting);
        assert_eq!("pending-install".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::PendingInstall);
        assert_eq!("PENDING_UPGRADE".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::PendingUpgrade);
        assert_eq!("something-new".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Unknown);
        for s in ReleaseStatus::ALL {
            assert_eq!(s.as_str().parse::<ReleaseStatus>().unwrap(), s);
        }
    }

    #[test]
    fn empty_namespace_is_ready() {
        assert_eq!(assess_readiness(&[], &[]), Readiness::ready());
    }

    #[test]
    fn load_balancer_without_ingress_is_pending() {
        let r = assess_readiness(&[pod("a", "Running", true)], &[lb("db", false)]);
        assert_eq!(r.status, ReleaseStatus::PendingInstall);
        assert_eq!(r.message.as_deref(), Some("waiting for load balancer on service db"));
        assert_eq!(assess_readiness(&[pod("a", "Running", true)], &[lb("db", true)]), Readiness::ready());
    }

    #[test]
    fn unready_pod_is_pending_but_completed_pod_is_not() {
        let r = assess_readiness(&[pod("ok", "Running", true), pod("slow", "Pending", false)], &[]);
        assert_eq!(r.message.as_deref(), Some("waiting for pod slow to become ready"));
        assert_eq!(assess_readiness(&[pod("job", "Succeeded", false)], &[]), Readiness::ready());
    }
}
