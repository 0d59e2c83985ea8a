//! Helm 3 CLI backed release client.

use std::ffi::OsString;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use charter_core::Chart;
use charter_kubehub::Cluster;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{assess_readiness, Readiness, ReleaseClient, ReleaseClientFactory, ReleaseError, ReleaseInfo, ReleaseResult, ReleaseStatus};

/// Creates `HelmCli` clients for resolved clusters.
#[derive(Debug, Clone)]
pub struct HelmClientFactory {
    binary: PathBuf,
}

impl HelmClientFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self { Self { binary: binary.into() } }
}

impl ReleaseClientFactory for HelmClientFactory {
    fn release_client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn ReleaseClient> {
        Arc::new(HelmCli { binary: self.binary.clone(), cluster })
    }
}

/// Runs `helm` against one cluster. Dedicated clusters get their kubeconfig
/// written to a temp file for the duration of each command.
pub struct HelmCli {
    binary: PathBuf,
    cluster: Arc<dyn Cluster>,
}

#[derive(Debug, Deserialize)]
struct HelmStatus {
    name: String,
    info: HelmStatusInfo,
}

#[derive(Debug, Deserialize)]
struct HelmStatusInfo {
    status: String,
    #[serde(default)]
    description: String,
}

fn temp_yaml<T: serde::Serialize>(value: &T, what: &str) -> anyhow::Result<NamedTempFile> {
    let mut file = NamedTempFile::new().with_context(|| format!("creating {} temp file", what))?;
    let body = serde_yaml::to_string(value).with_context(|| format!("serializing {}", what))?;
    file.write_all(body.as_bytes()).with_context(|| format!("writing {}", what))?;
    file.flush()?;
    Ok(file)
}

/// Helm's own wording for a release it has no record of.
const MISSING_RELEASE: &str = "release: not found";

/// Failed helm invocation as a release error. Only `status` and `uninstall`
/// can report a missing release; install/upgrade failures mentioning
/// "not found" (chart paths, namespaces) stay command errors.
fn command_error(verb: &str, release: &str, stderr: String) -> ReleaseError {
    let reports_missing = matches!(verb, "status" | "uninstall");
    if reports_missing && stderr.contains(MISSING_RELEASE) {
        return ReleaseError::NotFound(release.to_string());
    }
    ReleaseError::Command { command: format!("helm {}", verb), stderr }
}

impl HelmCli {
    async fn run(&self, release: &str, mut args: Vec<OsString>, values: Option<&serde_yaml::Value>) -> ReleaseResult<Vec<u8>> {
        // temp files must outlive the child process
        let values_file = match values {
            Some(v) => Some(temp_yaml(v, "values")?),
            None => None,
        };
        let kube_file = match self.cluster.kubeconfig() {
            Some(kc) => Some(temp_yaml(kc, "kubeconfig")?),
            None => None,
        };
        if let Some(f) = &values_file {
            args.push("--values".into());
            args.push(f.path().into());
        }
        if let Some(f) = &kube_file {
            args.push("--kubeconfig".into());
            args.push(f.path().into());
        }
        let verb = args.first().map(|a| a.to_string_lossy().into_owned()).unwrap_or_default();
        debug!(binary = %self.binary.display(), verb = %verb, release = %release, "helm invoked");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.binary.display()))?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(command_error(&verb, release, stderr))
    }
}

fn os(args: &[&str]) -> Vec<OsString> {
    args.iter().map(|a| OsString::from(*a)).collect()
}

#[async_trait::async_trait]
impl ReleaseClient for HelmCli {
    async fn install(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()> {
        let mut args = os(&["install", release]);
        args.push(chart.path.clone().into());
        args.extend(os(&["--namespace", namespace]));
        self.run(release, args, Some(values)).await?;
        metrics::counter!("helm_install_total", 1u64);
        info!(release = %release, namespace = %namespace, chart = %chart.name, "release installed");
        Ok(())
    }

    async fn upgrade(&self, chart: &Chart, namespace: &str, release: &str, values: &serde_yaml::Value) -> ReleaseResult<()> {
        let mut args = os(&["upgrade", release]);
        args.push(chart.path.clone().into());
        args.extend(os(&["--namespace", namespace]));
        self.run(release, args, Some(values)).await?;
        metrics::counter!("helm_upgrade_total", 1u64);
        info!(release = %release, namespace = %namespace, chart = %chart.name, "release upgraded");
        Ok(())
    }

    async fn delete(&self, namespace: &str, release: &str) -> ReleaseResult<()> {
        // history is kept so a later status reads "uninstalled"
        self.run(release, os(&["uninstall", release, "--namespace", namespace, "--keep-history"]), None).await?;
        info!(release = %release, namespace = %namespace, "release uninstalled");
        Ok(())
    }

    async fn status(&self, namespace: &str, release: &str) -> ReleaseResult<ReleaseInfo> {
        let out = self.run(release, os(&["status", release, "--namespace", namespace, "--output", "json"]), None).await?;
        parse_status(&out).map_err(ReleaseError::Other)
    }

    async fn resource_readiness(&self, namespace: &str) -> ReleaseResult<Readiness> {
        let (services, pods) =
            futures::try_join!(self.cluster.list_services(namespace), self.cluster.list_pods(namespace))?;
        let readiness = assess_readiness(&pods, &services);
        if readiness.status != ReleaseStatus::Deployed {
            debug!(namespace = %namespace, message = ?readiness.message, "namespace not ready");
        }
        Ok(readiness)
    }
}

fn parse_status(out: &[u8]) -> anyhow::Result<ReleaseInfo> {
    let parsed: HelmStatus = serde_json::from_slice(out).context("parsing helm status output")?;
    let status: ReleaseStatus = parsed.info.status.parse().map_err(|_| anyhow!("unparseable status"))?;
    if status == ReleaseStatus::Unknown {
        warn!(release = %parsed.name, raw = %parsed.info.status, "unrecognised helm status");
    }
    Ok(ReleaseInfo { name: parsed.name, status, description: parsed.info.description })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helm_status_json() {
        let out = br#"{"name":"r-nluceuit","namespace":"charter-my-instance","version":1,
            "info":{"status":"pending-install","description":"Initial install underway","first_deployed":"2024-01-01T00:00:00Z"}}"#;
        let info = parse_status(out).unwrap();
        assert_eq!(info.name, "r-nluceuit");
        assert_eq!(info.status, ReleaseStatus::PendingInstall);
        assert_eq!(info.description, "Initial install underway");
    }

    #[test]
    fn status_without_description_is_accepted() {
        let info = parse_status(br#"{"name":"r","info":{"status":"uninstalled"}}"#).unwrap();
        assert_eq!(info.status, ReleaseStatus::Deleted);
        assert_eq!(info.description, "");
    }

    #[test]
    fn garbage_status_output_errors() {
        assert!(parse_status(b"Error: oops").is_err());
    }

    fn is_missing(e: &ReleaseError) -> bool { matches!(e, ReleaseError::NotFound(r) if r == "r-x") }

    #[test]
    fn status_and_uninstall_recognise_missing_releases() {
        assert!(is_missing(&command_error("status", "r-x", "Error: release: not found".into())));
        assert!(is_missing(&command_error(
            "uninstall",
            "r-x",
            "Error: uninstall: Release not loaded: r-x: release: not found".into()
        )));
        assert!(!is_missing(&command_error("status", "r-x", "Error: Kubernetes cluster unreachable".into())));
    }

    #[test]
    fn install_and_upgrade_failures_stay_command_errors() {
        let cases = [
            ("install", r#"Error: INSTALLATION FAILED: path "/charts/mysql" not found"#),
            ("install", r#"Error: INSTALLATION FAILED: create: failed to create: namespaces "charter-i" not found"#),
            ("upgrade", r#"Error: UPGRADE FAILED: "r-x" has no deployed releases: release: not found"#),
            ("install", "Error: INSTALLATION FAILED: timed out"),
        ];
        for (verb, stderr) in cases {
            match command_error(verb, "r-x", stderr.to_string()) {
                ReleaseError::Command { command, stderr: kept } => {
                    assert_eq!(command, format!("helm {}", verb));
                    assert_eq!(kept, stderr);
                }
                other => panic!("{} failure mapped to {:?}", verb, other),
            }
        }
    }
}
