use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use charter_broker::{
    BindDetails, Broker, BrokerSettings, DeprovisionDetails, PollDetails, ProvisionDetails, ServiceBroker, UnbindDetails,
    UpdateDetails, DEFAULT_IDENTITY,
};
use charter_catalog::{load_charts, FsCatalog};
use charter_core::naming;
use charter_credstore::{CredHubConfig, CredHubStore, CredStore};
use charter_kubehub::{KubeClusterFactory, KubeServiceAccountInstaller, RegistryCredentials};
use charter_release::HelmClientFactory;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "charterctl", version, about = "Charter service broker CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct Config {
    /// Directory of unpacked charts offered as services
    #[arg(long = "charts-dir", env = "CHARTER_CHARTS_DIR", global = true, default_value = "charts")]
    charts_dir: PathBuf,

    /// Directory of operator charts installed on dedicated clusters
    #[arg(long = "operators-dir", env = "CHARTER_OPERATORS_DIR", global = true)]
    operators_dir: Option<PathBuf>,

    /// Broker identity used in credential store paths
    #[arg(long = "identity", env = "CHARTER_IDENTITY", global = true, default_value = DEFAULT_IDENTITY)]
    identity: String,

    #[arg(long = "helm-bin", env = "CHARTER_HELM_BIN", global = true, default_value = "helm")]
    helm_bin: PathBuf,

    #[arg(long = "credhub-url", env = "CHARTER_CREDHUB_URL", global = true)]
    credhub_url: Option<String>,

    #[arg(long = "uaa-url", env = "CHARTER_UAA_URL", global = true)]
    uaa_url: Option<String>,

    #[arg(long = "credhub-client-id", env = "CHARTER_CREDHUB_CLIENT_ID", global = true)]
    credhub_client_id: Option<String>,

    #[arg(long = "credhub-client-secret", env = "CHARTER_CREDHUB_CLIENT_SECRET", global = true, hide_env_values = true)]
    credhub_client_secret: Option<String>,

    #[arg(long = "credhub-skip-tls-verify", env = "CHARTER_CREDHUB_SKIP_TLS_VERIFY", global = true, action = ArgAction::SetTrue)]
    credhub_skip_tls_verify: bool,

    #[arg(long = "registry-server", env = "CHARTER_REGISTRY_SERVER", global = true)]
    registry_server: Option<String>,

    #[arg(long = "registry-user", env = "CHARTER_REGISTRY_USER", global = true)]
    registry_user: Option<String>,

    #[arg(long = "registry-password", env = "CHARTER_REGISTRY_PASSWORD", global = true, hide_env_values = true)]
    registry_password: Option<String>,

    #[arg(long = "registry-email", env = "CHARTER_REGISTRY_EMAIL", global = true)]
    registry_email: Option<String>,
}

/// Service and plan of an instance; names or ids are both accepted.
#[derive(Args, Debug)]
struct Target {
    /// Chart name or service id
    #[arg(long = "service")]
    service: String,
    /// Plan name or plan id
    #[arg(long = "plan")]
    plan: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List services and plans
    Catalog,
    /// Provision an instance
    Provision {
        instance: String,
        #[command(flatten)]
        target: Target,
        #[arg(long = "org", default_value = "")]
        org: String,
        #[arg(long = "space", default_value = "")]
        space: String,
        /// Install parameters as a JSON object
        #[arg(long = "params")]
        params: Option<String>,
    },
    /// Deprovision an instance and wait for the teardown
    Deprovision {
        instance: String,
        #[command(flatten)]
        target: Target,
        /// Return without waiting for the teardown
        #[arg(long = "detach", action = ArgAction::SetTrue)]
        detach: bool,
    },
    /// Create a binding
    Bind {
        instance: String,
        binding: String,
        #[command(flatten)]
        target: Target,
        #[arg(long = "app-guid")]
        app_guid: Option<String>,
    },
    /// Remove a binding
    Unbind {
        instance: String,
        binding: String,
        #[command(flatten)]
        target: Target,
    },
    /// Update an instance with new parameters
    Update {
        instance: String,
        #[command(flatten)]
        target: Target,
        #[arg(long = "params")]
        params: Option<String>,
    },
    /// Poll the state of an asynchronous operation
    LastOperation {
        instance: String,
        #[command(flatten)]
        target: Target,
        /// provision, deprovision or update
        #[arg(long = "operation")]
        operation: String,
    },
    /// Drop the cached chart catalog
    FlushCache,
}

fn init_tracing() {
    let env = std::env::var("CHARTER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CHARTER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CHARTER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Service id from a chart name or an id; plan id from a plan name or an id.
fn resolve_target(target: &Target) -> (String, String) {
    let service_id = if uuid::Uuid::parse_str(&target.service).is_ok() {
        target.service.clone()
    } else {
        naming::service_id(&target.service)
    };
    let plan_name = naming::plan_name(&target.plan, &service_id);
    let plan_id = naming::plan_id(&service_id, plan_name);
    (service_id, plan_id)
}

fn parse_params(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    let Some(raw) = raw else { return Ok(None) };
    let value: serde_json::Value = serde_json::from_str(raw).context("parsing --params as JSON")?;
    if !value.is_object() {
        return Err(anyhow!("--params must be a JSON object"));
    }
    Ok(Some(value))
}

impl Config {
    fn credstore(&self) -> Result<Option<Arc<dyn CredStore>>> {
        let Some(url) = &self.credhub_url else { return Ok(None) };
        let need = |v: &Option<String>, flag: &str| v.clone().ok_or_else(|| anyhow!("{} is required with --credhub-url", flag));
        let config = CredHubConfig {
            url: url.clone(),
            uaa_url: need(&self.uaa_url, "--uaa-url")?,
            client_id: need(&self.credhub_client_id, "--credhub-client-id")?,
            client_secret: need(&self.credhub_client_secret, "--credhub-client-secret")?,
            skip_tls_verify: self.credhub_skip_tls_verify,
        };
        let store: Arc<dyn CredStore> = Arc::new(CredHubStore::new(config)?);
        info!(url = %url, "using credhub credential store");
        Ok(Some(store))
    }

    fn registry(&self) -> Option<RegistryCredentials> {
        let server = self.registry_server.clone()?;
        Some(RegistryCredentials {
            server,
            username: self.registry_user.clone().unwrap_or_default(),
            password: self.registry_password.clone().unwrap_or_default(),
            email: self.registry_email.clone(),
        })
    }

    fn settings(&self) -> Result<BrokerSettings> {
        let operators = match &self.operators_dir {
            Some(dir) => load_charts(dir).with_context(|| format!("loading operators from {}", dir.display()))?,
            None => Vec::new(),
        };
        info!(operators = operators.len(), identity = %self.identity, "broker settings loaded");
        Ok(BrokerSettings::default()
            .with_identity(self.identity.clone())
            .with_operators(operators)
            .with_registry(self.registry()))
    }

    fn broker(&self) -> Result<ServiceBroker> {
        Ok(ServiceBroker::new(
            Arc::new(FsCatalog::new(&self.charts_dir)),
            Arc::new(KubeClusterFactory::new()),
            Arc::new(HelmClientFactory::new(&self.helm_bin)),
            Arc::new(KubeServiceAccountInstaller::new()),
            self.credstore()?,
            self.settings()?,
        ))
    }
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let broker = cli.config.broker()?;
    let out = cli.output;

    match cli.command {
        Commands::Catalog => {
            let services = broker.catalog().await?;
            emit(out, &services, |services| {
                for s in services {
                    println!("{}  {}", s.id, s.name);
                    for p in &s.plans {
                        println!("    {}  {}  bindable={} free={}", p.id, p.name, p.bindable, p.free);
                    }
                }
            })?;
        }
        Commands::Provision { instance, target, org, space, params } => {
            let (service_id, plan_id) = resolve_target(&target);
            let details = ProvisionDetails {
                service_id,
                plan_id,
                organization_guid: org,
                space_guid: space,
                parameters: parse_params(params.as_deref())?,
            };
            let spec = broker.provision(&instance, details, true).await?;
            emit(out, &spec, |s| println!("accepted: {}", s.operation_data))?;
        }
        Commands::Deprovision { instance, target, detach } => {
            let (service_id, plan_id) = resolve_target(&target);
            let accepted = broker.deprovision(&instance, DeprovisionDetails { service_id, plan_id }, true).await?;
            if detach {
                accepted.teardown.cancel();
            } else {
                accepted.teardown.finished().await;
            }
            emit(out, &accepted.spec, |s| println!("accepted: {}", s.operation_data))?;
        }
        Commands::Bind { instance, binding, target, app_guid } => {
            let (service_id, plan_id) = resolve_target(&target);
            let details = BindDetails { service_id, plan_id, app_guid, parameters: None };
            let bound = broker.bind(&instance, &binding, details).await?;
            // credentials are always printed as JSON
            println!("{}", serde_json::to_string_pretty(&bound)?);
        }
        Commands::Unbind { instance, binding, target } => {
            let (service_id, plan_id) = resolve_target(&target);
            let spec = broker.unbind(&instance, &binding, UnbindDetails { service_id, plan_id }).await?;
            emit(out, &spec, |_| println!("unbound {}", binding))?;
        }
        Commands::Update { instance, target, params } => {
            let (service_id, plan_id) = resolve_target(&target);
            let details = UpdateDetails { service_id, plan_id, parameters: parse_params(params.as_deref())? };
            let spec = broker.update(&instance, details, true).await?;
            emit(out, &spec, |s| println!("accepted: {}", s.operation_data))?;
        }
        Commands::LastOperation { instance, target, operation } => {
            let (service_id, plan_id) = resolve_target(&target);
            let details = PollDetails { service_id, plan_id, operation_data: operation };
            let op = broker.last_operation(&instance, details).await?;
            emit(out, &op, |op| println!("{}: {}", op.state, op.description))?;
        }
        Commands::FlushCache => {
            broker.flush_cache().await?;
            emit(out, &serde_json::json!({"flushed": true}), |_| println!("catalog cache flushed"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn targets_accept_names_or_ids() {
        let by_name = Target { service: "mysql".into(), plan: "small".into() };
        let (sid, pid) = resolve_target(&by_name);
        assert_eq!(sid, "c76ed0a4-9a04-5710-90c2-75e955697b08");
        assert_eq!(pid, "c76ed0a4-9a04-5710-90c2-75e955697b08-small");

        let by_id = Target { service: sid.clone(), plan: pid.clone() };
        assert_eq!(resolve_target(&by_id), (sid, pid));
    }

    #[test]
    fn params_must_be_a_json_object() {
        assert_eq!(parse_params(None).unwrap(), None);
        assert_eq!(parse_params(Some(r#"{"a":1}"#)).unwrap(), Some(serde_json::json!({"a": 1})));
        assert!(parse_params(Some("[1]")).is_err());
        assert!(parse_params(Some("{nope")).is_err());
    }

    #[test]
    fn parses_last_operation_invocation() {
        let cli = Cli::try_parse_from([
            "charterctl", "-o", "json", "last-operation", "instance-1", "--service", "mysql", "--plan", "small", "--operation",
            "provision",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::LastOperation { ref operation, .. } if operation == "provision"));
    }
}
