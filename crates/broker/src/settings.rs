use charter_core::Chart;
use charter_kubehub::RegistryCredentials;

/// Broker identity used in credential-store paths when none is configured.
pub const DEFAULT_IDENTITY: &str = "charter";

/// Construction-time configuration shared read-only by every call.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub identity: String,
    /// Charts installed on every dedicated cluster before the first release.
    pub operators: Vec<Chart>,
    /// Pull credentials seeded into each instance namespace.
    pub registry: Option<RegistryCredentials>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self { identity: DEFAULT_IDENTITY.to_string(), operators: Vec::new(), registry: None }
    }
}

impl BrokerSettings {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_operators(mut self, operators: Vec<Chart>) -> Self {
        self.operators = operators;
        self
    }

    pub fn with_registry(mut self, registry: Option<RegistryCredentials>) -> Self {
        self.registry = registry;
        self
    }
}
