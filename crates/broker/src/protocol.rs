//! Request and response shapes of the provisioning protocol. Field names
//! follow the Open Service Broker wire format.

use charter_core::{naming, Chart, Document, OperationKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub metadata: ServiceMetadata,
    pub plans: Vec<CatalogPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "documentationUrl", skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub metadata: PlanMetadata,
    pub bindable: bool,
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub bullets: Vec<String>,
}

impl From<&Chart> for CatalogService {
    fn from(chart: &Chart) -> Self {
        let sid = chart.service_id();
        let plans = chart
            .plans
            .values()
            .map(|p| CatalogPlan {
                id: naming::plan_id(&sid, &p.name),
                name: p.name.clone(),
                description: p.description.clone(),
                metadata: PlanMetadata { display_name: p.name.clone(), bullets: p.catalog_bullets() },
                bindable: p.bindable,
                free: p.free,
            })
            .collect();
        CatalogService {
            id: sid,
            name: chart.name.clone(),
            description: chart.description.clone(),
            bindable: true,
            metadata: ServiceMetadata {
                display_name: chart.name.clone(),
                image_url: chart.icon.clone(),
                documentation_url: chart.home.clone(),
            },
            plans,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub space_guid: String,
    /// Raw caller parameters; `None` when the request carried none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionDetails {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnbindDetails {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollDetails {
    pub service_id: String,
    pub plan_id: String,
    /// Opaque operation token handed out by provision/deprovision/update.
    pub operation_data: String,
}

/// Acceptance of an asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncSpec {
    pub is_async: bool,
    pub operation_data: String,
}

impl AsyncSpec {
    pub fn accepted(kind: OperationKind) -> Self {
        Self { is_async: true, operation_data: kind.as_str().to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub credentials: Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindSpec {
    pub is_async: bool,
}
