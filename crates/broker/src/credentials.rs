//! Binding credentials: live secrets/services, optional bind template,
//! optional escrow in the credential store.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use charter_core::{naming, Document, Value};
use charter_credstore::CredStore;
use charter_kubehub::Cluster;
use minijinja::{Environment, UndefinedBehavior};
use tracing::{info, warn};

/// Render a bind template against the secrets/services document. The
/// document's top-level keys are the template variables; the output must
/// be a JSON (or YAML) mapping.
pub fn render_bind_template(template: &str, data: &Document) -> Result<Document> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let ctx = minijinja::Value::from_serialize(data);
    let rendered = env.render_str(template, ctx).context("rendering bind template")?;
    let parsed: serde_json::Value = serde_yaml::from_str(&rendered).context("parsing rendered bind template")?;
    match Value::from(parsed) {
        Value::Map(doc) => Ok(doc),
        _ => bail!("bind template must render to a mapping"),
    }
}

pub struct CredentialPipeline {
    pub(crate) credstore: Option<Arc<dyn CredStore>>,
    pub(crate) identity: String,
}

impl CredentialPipeline {
    pub fn escrows(&self) -> bool { self.credstore.is_some() }

    /// Credentials for one binding. With a credential store the real
    /// document is escrowed and only a reference is returned.
    pub async fn bind(
        &self,
        cluster: &dyn Cluster,
        instance_id: &str,
        service: &str,
        binding_id: &str,
        template: Option<&str>,
        app_guid: Option<&str>,
    ) -> Result<Document> {
        let namespace = naming::namespace(instance_id);
        let live = cluster
            .secrets_and_services(&namespace)
            .await
            .with_context(|| format!("reading secrets and services in {}", namespace))?;
        let document = match template {
            Some(t) => render_bind_template(t, &live)?,
            None => live,
        };
        let Some(store) = &self.credstore else {
            return Ok(document);
        };
        let app = app_guid.ok_or_else(|| anyhow!("missing app_guid"))?;
        let path = naming::binding_credentials_path(&self.identity, service, binding_id);
        store
            .put(&path, &Value::Map(document))
            .await
            .with_context(|| format!("storing binding credentials {}", path))?;
        store
            .add_permission(&path, &naming::app_actor(app), &["read"])
            .await
            .with_context(|| format!("granting read on {}", path))?;
        info!(binding = %binding_id, path = %path, "binding credentials escrowed");
        let mut reference = Document::new();
        reference.insert(naming::CREDENTIAL_REF_KEY.to_string(), Value::String(path));
        Ok(reference)
    }

    /// Revoke then delete escrowed credentials. Revocation is best-effort.
    pub async fn unbind(&self, service: &str, binding_id: &str) -> Result<()> {
        let Some(store) = &self.credstore else {
            return Ok(());
        };
        let path = naming::binding_credentials_path(&self.identity, service, binding_id);
        if let Err(e) = store.delete_permission(&path).await {
            warn!(path = %path, error = %format!("{:#}", e), "failed to revoke binding permissions");
        }
        store
            .delete(&path)
            .await
            .with_context(|| format!("deleting binding credentials {}", path))?;
        info!(binding = %binding_id, path = %path, "binding credentials removed");
        Ok(())
    }
}
