//! Charter kubehub: cluster handles and the namespace-level kube operations the broker needs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use charter_core::{Document, Value};
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, Node, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "charter";
/// Image pull secret created in instance namespaces.
pub const REGISTRY_SECRET_NAME: &str = "registry-secret";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
/// Service account the broker operates through on dedicated clusters.
pub const SERVICE_ACCOUNT_NAME: &str = "charter";
pub const SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";

const SA_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Private registry credentials handed to every instance namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

impl RegistryCredentials {
    /// Body of a `kubernetes.io/dockerconfigjson` secret.
    pub fn docker_config_json(&self) -> serde_json::Value {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password));
        serde_json::json!({
            "auths": {
                self.server.clone(): {
                    "username": self.username,
                    "password": self.password,
                    "email": self.email.clone().unwrap_or_default(),
                    "auth": auth,
                }
            }
        })
    }
}

/// A live cluster the broker can install into.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Access configuration for out-of-process tools; `None` means the ambient default.
    fn kubeconfig(&self) -> Option<&Kubeconfig>;

    /// Underlying kube client, when the handle has one.
    fn kube_client(&self) -> Option<Client> { None }

    /// Create or update a namespace with the given labels.
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Delete a namespace; a missing namespace is not an error.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Secrets and Services of a namespace as one document:
    /// `{"secrets": [{name, data}], "services": [{name, spec, status}]}`.
    async fn secrets_and_services(&self, namespace: &str) -> Result<Document>;

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    /// Create the registry pull secret and attach it to the `default` service account.
    async fn ensure_registry_secret(&self, namespace: &str, registry: &RegistryCredentials) -> Result<()>;
}

/// Produces cluster handles.
#[async_trait::async_trait]
pub trait ClusterFactory: Send + Sync {
    /// The cluster the broker itself runs against.
    async fn default_cluster(&self) -> Result<Arc<dyn Cluster>>;

    /// A cluster reached through an explicit access configuration.
    async fn cluster_from_config(&self, config: &Kubeconfig) -> Result<Arc<dyn Cluster>>;
}

/// Installs the broker's service account and its admin binding on a cluster.
#[async_trait::async_trait]
pub trait ServiceAccountInstaller: Send + Sync {
    async fn install(&self, cluster: &dyn Cluster) -> Result<()>;
}

/// Cluster handle backed by kube-rs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    kubeconfig: Option<Kubeconfig>,
}

impl KubeCluster {
    pub fn new(client: Client, kubeconfig: Option<Kubeconfig>) -> Self { Self { client, kubeconfig } }

    async fn node_external_ips(&self) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await.context("listing nodes")?;
        let mut ips = Vec::new();
        for node in list.items {
            let addrs = node.status.and_then(|s| s.addresses).unwrap_or_default();
            ips.extend(addrs.into_iter().filter(|a| a.type_ == "ExternalIP").map(|a| a.address));
        }
        Ok(ips)
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    fn kubeconfig(&self) -> Option<&Kubeconfig> { self.kubeconfig.as_ref() }

    fn kube_client(&self) -> Option<Client> { Some(self.client.clone()) }

    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&ns))
            .await
            .with_context(|| format!("applying namespace {}", name))?;
        info!(namespace = %name, "namespace ensured");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => { info!(namespace = %name, "namespace deletion requested"); Ok(()) }
            Err(kube::Error::Api(ae)) if ae.code == 404 => { debug!(namespace = %name, "namespace already gone"); Ok(()) }
            Err(e) => Err(anyhow!("deleting namespace {}: {}", name, e)),
        }
    }

    async fn secrets_and_services(&self, namespace: &str) -> Result<Document> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let secret_list = secrets.list(&ListParams::default()).await.with_context(|| format!("listing secrets in {}", namespace))?;
        let service_list = services.list(&ListParams::default()).await.with_context(|| format!("listing services in {}", namespace))?;
        let needs_nodes = service_list.items.iter().any(is_node_port);
        let node_ips = if needs_nodes { self.node_external_ips().await? } else { Vec::new() };
        Ok(secrets_and_services_document(secret_list.items, service_list.items, &node_ips))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await.with_context(|| format!("listing pods in {}", namespace))?.items)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await.with_context(|| format!("listing services in {}", namespace))?.items)
    }

    async fn ensure_registry_secret(&self, namespace: &str, registry: &RegistryCredentials) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::to_vec(&registry.docker_config_json())?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(REGISTRY_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            data: Some(BTreeMap::from([(".dockerconfigjson".to_string(), ByteString(body))])),
            ..Default::default()
        };
        secrets
            .patch(REGISTRY_SECRET_NAME, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .with_context(|| format!("applying registry secret in {}", namespace))?;

        // the default account may not exist yet; apply creates or merges
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        accounts
            .patch(DEFAULT_SERVICE_ACCOUNT, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&pull_secret_account(namespace)))
            .await
            .with_context(|| format!("attaching registry secret to default service account in {}", namespace))?;
        debug!(namespace = %namespace, server = %registry.server, "registry secret ensured");
        Ok(())
    }
}

/// The namespace's `default` service account, pulling with the registry secret.
pub fn pull_secret_account(namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(DEFAULT_SERVICE_ACCOUNT.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        image_pull_secrets: Some(vec![LocalObjectReference { name: Some(REGISTRY_SECRET_NAME.to_string()) }]),
        ..Default::default()
    }
}

fn is_node_port(svc: &Service) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("NodePort")
}

/// Shape secrets and services into the document handed to bind templates.
/// Service-account token secrets are left out; NodePort services get the
/// nodes' external IPs.
pub fn secrets_and_services_document(secrets: Vec<Secret>, services: Vec<Service>, node_ips: &[String]) -> Document {
    let mut secret_docs = Vec::new();
    for secret in secrets {
        if secret.type_.as_deref() == Some(SA_TOKEN_TYPE) {
            continue;
        }
        let data: Document = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, Value::String(String::from_utf8_lossy(&v.0).into_owned())))
            .collect();
        let mut doc = Document::new();
        doc.insert("name".into(), Value::String(secret.metadata.name.unwrap_or_default()));
        doc.insert("data".into(), Value::Map(data));
        secret_docs.push(Value::Map(doc));
    }

    let mut service_docs = Vec::new();
    for mut svc in services {
        if is_node_port(&svc) && !node_ips.is_empty() {
            if let Some(spec) = svc.spec.as_mut() {
                spec.external_ips = Some(node_ips.to_vec());
            }
        }
        let mut doc = Document::new();
        doc.insert("name".into(), Value::String(svc.metadata.name.clone().unwrap_or_default()));
        doc.insert("spec".into(), to_value(&svc.spec));
        doc.insert("status".into(), to_value(&svc.status));
        service_docs.push(Value::Map(doc));
    }

    let mut out = Document::new();
    out.insert("secrets".into(), Value::List(secret_docs));
    out.insert("services".into(), Value::List(service_docs));
    out
}

fn to_value<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).map(Value::from).unwrap_or(Value::Null)
}

/// Factory for kube-rs cluster handles. The default cluster is resolved once.
#[derive(Default)]
pub struct KubeClusterFactory {
    default: OnceCell<Arc<KubeCluster>>,
}

impl KubeClusterFactory {
    pub fn new() -> Self { Self::default() }
}

#[async_trait::async_trait]
impl ClusterFactory for KubeClusterFactory {
    async fn default_cluster(&self) -> Result<Arc<dyn Cluster>> {
        let cluster = self
            .default
            .get_or_try_init(|| async {
                let client = Client::try_default().await.context("inferring default kube config")?;
                Ok::<_, anyhow::Error>(Arc::new(KubeCluster::new(client, None)))
            })
            .await?;
        Ok(cluster.clone() as Arc<dyn Cluster>)
    }

    async fn cluster_from_config(&self, config: &Kubeconfig) -> Result<Arc<dyn Cluster>> {
        let cfg = Config::from_custom_kubeconfig(config.clone(), &KubeConfigOptions::default())
            .await
            .context("loading cluster access config")?;
        let client = Client::try_from(cfg).context("building kube client")?;
        Ok(Arc::new(KubeCluster::new(client, Some(config.clone()))))
    }
}

/// Applies the `charter` service account bound to `cluster-admin`.
#[derive(Debug, Default, Clone)]
pub struct KubeServiceAccountInstaller;

impl KubeServiceAccountInstaller {
    pub fn new() -> Self { Self }
}

/// Binding of the broker service account to `cluster-admin`.
pub fn admin_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-cluster-admin", SERVICE_ACCOUNT_NAME)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(SERVICE_ACCOUNT_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

#[async_trait::async_trait]
impl ServiceAccountInstaller for KubeServiceAccountInstaller {
    async fn install(&self, cluster: &dyn Cluster) -> Result<()> {
        let client = cluster.kube_client().ok_or_else(|| anyhow!("cluster handle has no kube client"))?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();

        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), SERVICE_ACCOUNT_NAMESPACE);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                namespace: Some(SERVICE_ACCOUNT_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        accounts
            .patch(SERVICE_ACCOUNT_NAME, &pp, &Patch::Apply(&account))
            .await
            .context("applying broker service account")?;

        let bindings: Api<ClusterRoleBinding> = Api::all(client);
        let binding = admin_binding();
        let name = binding.metadata.name.clone().unwrap_or_default();
        bindings.patch(&name, &pp, &Patch::Apply(&binding)).await.context("applying broker cluster role binding")?;
        metrics::counter!("kubehub_service_account_installs", 1u64);
        info!(account = SERVICE_ACCOUNT_NAME, binding = %name, "service account ensured");
        Ok(())
    }
}
