//! Deterministic names derived from chart names and instance identifiers.
//!
//! Nothing here consults state: the same input always yields the same name,
//! across processes and restarts.

use data_encoding::BASE32;
use md5::{Digest, Md5};
use uuid::Uuid;

/// Prefix for instance namespaces.
pub const NAMESPACE_PREFIX: &str = "charter-";
/// Prefix for release names; the remainder is a short digest.
pub const RELEASE_PREFIX: &str = "r-";
/// Number of base32 characters kept from the instance digest.
pub const RELEASE_DIGEST_LEN: usize = 8;
/// Key of the reference returned instead of escrowed credentials.
pub const CREDENTIAL_REF_KEY: &str = "credhub-ref";

/// Name-based (v5, OID namespace) UUID of a chart name.
pub fn service_id(chart_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chart_name.as_bytes()).to_string()
}

/// External plan identity: `<service-id>-<plan-name>`.
pub fn plan_id(service_id: &str, plan_name: &str) -> String {
    format!("{}-{}", service_id, plan_name)
}

/// Inverse of [`plan_id`]; ids without the service prefix are taken verbatim.
pub fn plan_name<'a>(plan_id: &'a str, service_id: &str) -> &'a str {
    plan_id
        .strip_prefix(service_id)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(plan_id)
}

pub fn namespace(instance_id: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, instance_id)
}

/// Release names are length/charset constrained, so the instance id is
/// hashed and truncated: `r-` + 8 lowercase base32 chars of md5(instance).
pub fn release_name(instance_id: &str) -> String {
    let digest = Md5::digest(instance_id.as_bytes());
    let encoded = BASE32.encode(&digest);
    format!("{}{}", RELEASE_PREFIX, encoded[..RELEASE_DIGEST_LEN].to_ascii_lowercase())
}

/// Store path of plan values overriding the chart's plan files.
pub fn plan_values_path(identity: &str, chart: &str, plan: &str) -> String {
    format!("/c/{}/{}/{}/values", identity, chart, plan)
}

/// Store path of a dedicated cluster's access configuration.
pub fn cluster_credentials_path(identity: &str, chart: &str, plan: &str) -> String {
    format!("/c/{}/{}/{}/cluster-creds", identity, chart, plan)
}

/// Store path of an escrowed binding document.
pub fn binding_credentials_path(identity: &str, service: &str, binding_id: &str) -> String {
    format!("/c/{}/{}/{}/secrets-and-services", identity, service, binding_id)
}

/// Store actor of the application consuming a binding.
pub fn app_actor(app_guid: &str) -> String {
    format!("mtls-app:{}", app_guid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_is_stable_name_based_uuid() {
        assert_eq!(service_id("mysql"), "c76ed0a4-9a04-5710-90c2-75e955697b08");
        assert_eq!(service_id("redis"), "6a15c66e-77c6-521b-a559-91f9931bc8d4");
        assert_eq!(service_id("mysql"), service_id("mysql"));
        assert_ne!(service_id("mysql"), service_id("redis"));
    }

    #[test]
    fn plan_id_round_trips_through_plan_name() {
        let sid = service_id("mysql");
        let pid = plan_id(&sid, "small");
        assert_eq!(pid, format!("{}-small", sid));
        assert_eq!(plan_name(&pid, &sid), "small");
        // hyphenated plan names keep their hyphens
        assert_eq!(plan_name(&plan_id(&sid, "extra-large"), &sid), "extra-large");
        assert_eq!(plan_name("small", &sid), "small");
    }

    #[test]
    fn release_names_match_known_digests() {
        assert_eq!(release_name("my-instance"), "r-nluceuit");
        assert_eq!(release_name("instance-1"), "r-2t62w3u5");
        assert_eq!(release_name("instance-2"), "r-e5ln2ce4");
    }

    #[test]
    fn release_names_fit_helm_constraints() {
        let re = regex::Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
        for id in ["a", "6f1c2b9e-9d3e-4c2e-8a55-0e8f2f6b9a11", "UPPER_case id with spaces", ""] {
            let name = release_name(id);
            assert_eq!(name.len(), RELEASE_PREFIX.len() + RELEASE_DIGEST_LEN);
            assert!(re.is_match(&name), "{} is not a valid release name", name);
            assert!(name.len() <= 53);
        }
    }

    #[test]
    fn distinct_instances_get_distinct_names() {
        let ids: Vec<String> = (0..500).map(|i| format!("instance-{}", i)).collect();
        let mut releases: Vec<String> = ids.iter().map(|i| release_name(i)).collect();
        let mut namespaces: Vec<String> = ids.iter().map(|i| namespace(i)).collect();
        releases.sort();
        releases.dedup();
        namespaces.sort();
        namespaces.dedup();
        assert_eq!(releases.len(), ids.len());
        assert_eq!(namespaces.len(), ids.len());
    }

    #[test]
    fn store_paths_are_keyed_by_identity() {
        assert_eq!(plan_values_path("charter", "mysql", "small"), "/c/charter/mysql/small/values");
        assert_eq!(cluster_credentials_path("charter", "mysql", "small"), "/c/charter/mysql/small/cluster-creds");
        assert_eq!(binding_credentials_path("charter", "mysql", "b-1"), "/c/charter/mysql/b-1/secrets-and-services");
        assert_eq!(app_actor("app-1"), "mtls-app:app-1");
        assert_eq!(namespace("abc"), "charter-abc");
    }
}
