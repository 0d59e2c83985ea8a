//! Install values: plan defaults overlaid with caller parameters.

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value as Yaml};

/// Caller parameters arrive as JSON; the release manager wants YAML.
pub fn params_to_values(params: &serde_json::Value) -> Result<Yaml> {
    serde_yaml::to_value(params).context("converting parameters to YAML")
}

/// Merge plan default values with caller overrides. Overrides win; nested
/// maps are merged key by key, everything else is replaced wholesale.
pub fn merge_values(plan_values: &[u8], overrides: Option<&Yaml>) -> Result<Yaml> {
    let mut base: Yaml = if plan_values.iter().all(|b| b.is_ascii_whitespace()) {
        Yaml::Mapping(Mapping::new())
    } else {
        serde_yaml::from_slice(plan_values).context("parsing plan values")?
    };
    if base.is_null() {
        base = Yaml::Mapping(Mapping::new());
    }
    if let Some(o) = overrides {
        overlay(&mut base, o);
    }
    Ok(base)
}

fn overlay(base: &mut Yaml, top: &Yaml) {
    match (base, top) {
        (Yaml::Mapping(b), Yaml::Mapping(t)) => {
            for (k, tv) in t {
                match b.get_mut(k) {
                    Some(bv) => overlay(bv, tv),
                    None => { b.insert(k.clone(), tv.clone()); }
                }
            }
        }
        (b, t) => *b = t.clone(),
    }
}
