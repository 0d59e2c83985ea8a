//! Charter chart catalog: resolves chart directories into `Chart` descriptors.
//!
//! A chart directory looks like:
//!
//! ```text
//! mysql/
//!   Chart.yaml          name, version, description, icon, home
//!   values.yaml         chart defaults (read by the release client)
//!   plans.yaml          plan list
//!   plans/small.yaml    plan values referenced by `file:`
//!   plans/kube.yaml     dedicated cluster access referenced by `credentials:`
//!   bind.yaml           optional bind template
//! ```

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwapOption;
use charter_core::{Chart, Plan};
use kube::config::Kubeconfig;
use serde::Deserialize;
use tracing::{debug, info};

/// Scratch directory name skipped while scanning.
const WORKSPACE_TMP: &str = "workspace_tmp";

fn max_yaml_bytes() -> u64 {
    std::env::var("CHARTER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(1_048_576) // 1 MiB default
}

/// Source of charts and their plans.
#[async_trait::async_trait]
pub trait ChartCatalog: Send + Sync {
    /// All charts currently offered.
    async fn charts(&self) -> Result<Vec<Chart>>;

    /// Drop any cached chart descriptors; the next `charts()` reloads.
    async fn clear_cache(&self) -> Result<()>;

    /// Re-read plan definitions for one chart.
    async fn refresh_plans(&self, chart: &Chart) -> Result<Chart> { Ok(chart.clone()) }
}

/// Catalog backed by a directory of unpacked charts.
pub struct FsCatalog {
    dir: PathBuf,
    cache: ArcSwapOption<Vec<Chart>>,
}

impl FsCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), cache: ArcSwapOption::empty() }
    }
}

#[async_trait::async_trait]
impl ChartCatalog for FsCatalog {
    async fn charts(&self) -> Result<Vec<Chart>> {
        if let Some(cached) = self.cache.load_full() {
            return Ok((*cached).clone());
        }
        let dir = self.dir.clone();
        let charts = tokio::task::spawn_blocking(move || load_charts(&dir))
            .await
            .context("chart loader task")??;
        info!(dir = %self.dir.display(), count = charts.len(), "catalog loaded");
        self.cache.store(Some(Arc::new(charts.clone())));
        Ok(charts)
    }

    async fn clear_cache(&self) -> Result<()> {
        info!(dir = %self.dir.display(), "catalog cache cleared");
        self.cache.store(None);
        Ok(())
    }

    async fn refresh_plans(&self, chart: &Chart) -> Result<Chart> {
        let mut fresh = chart.clone();
        let dir = chart.path.clone();
        fresh.plans = tokio::task::spawn_blocking(move || load_plans(&dir))
            .await
            .context("plan loader task")??;
        Ok(fresh)
    }
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    home: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanMeta {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    bullets: Option<Vec<String>>,
    /// Values file under `plans/`.
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    bindable: Option<bool>,
    #[serde(default)]
    free: Option<bool>,
    /// Kubeconfig file under `plans/` for a dedicated cluster.
    #[serde(default)]
    credentials: Option<String>,
}

/// Load every chart under `dir`. A directory that is itself a chart yields one chart.
pub fn load_charts(dir: &Path) -> Result<Vec<Chart>> {
    if dir.join("Chart.yaml").is_file() {
        return Ok(vec![load_chart(dir)?]);
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading chart directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();
    let mut charts = Vec::new();
    for sub in entries {
        if sub.file_name().map(|n| n == WORKSPACE_TMP).unwrap_or(false) {
            continue;
        }
        if !sub.join("Chart.yaml").is_file() {
            info!(path = %sub.display(), "no Chart.yaml, skipping");
            continue;
        }
        charts.push(load_chart(&sub)?);
    }
    Ok(charts)
}

/// Load one unpacked chart directory.
pub fn load_chart(dir: &Path) -> Result<Chart> {
    let meta: ChartMeta = read_yaml(&dir.join("Chart.yaml"))?;
    if meta.name.trim().is_empty() {
        bail!("chart at {} has an empty name", dir.display());
    }
    let bind_path = dir.join("bind.yaml");
    let bind_template = if bind_path.is_file() {
        Some(read_text(&bind_path)?)
    } else {
        None
    };
    let plans = load_plans(dir).with_context(|| format!("loading plans for chart {}", meta.name))?;
    debug!(chart = %meta.name, plans = plans.len(), bind_template = bind_template.is_some(), "chart loaded");
    Ok(Chart {
        name: meta.name,
        version: meta.version.unwrap_or_default(),
        description: meta.description.unwrap_or_default(),
        icon: meta.icon,
        home: meta.home,
        path: dir.to_path_buf(),
        plans,
        bind_template,
    })
}

/// Load `plans.yaml` and the files it references. Charts without one get a
/// single `default` plan.
pub fn load_plans(chart_dir: &Path) -> Result<BTreeMap<String, Plan>> {
    let index = chart_dir.join("plans.yaml");
    let mut plans = BTreeMap::new();
    if !index.is_file() {
        plans.insert("default".to_string(), Plan {
            name: "default".to_string(),
            description: "default plan".to_string(),
            bindable: true,
            free: true,
            ..Default::default()
        });
        return Ok(plans);
    }
    let metas: Vec<PlanMeta> = read_yaml(&index)?;
    let plans_dir = chart_dir.join("plans");
    for meta in metas {
        if meta.name.trim().is_empty() {
            bail!("plan with empty name in {}", index.display());
        }
        let values = match &meta.file {
            Some(f) => read_bytes(&plans_dir.join(f))?,
            None => Vec::new(),
        };
        let cluster_config = match &meta.credentials {
            Some(f) => {
                let text = read_text(&plans_dir.join(f))?;
                Some(Kubeconfig::from_yaml(&text).with_context(|| format!("parsing cluster credentials {} for plan {}", f, meta.name))?)
            }
            None => None,
        };
        let plan = Plan {
            name: meta.name.clone(),
            description: meta.description.unwrap_or_default(),
            bullets: meta.bullets,
            bindable: meta.bindable.unwrap_or(true),
            free: meta.free.unwrap_or(true),
            values,
            cluster_config,
        };
        if plans.insert(meta.name.clone(), plan).is_some() {
            bail!("duplicate plan {} in {}", meta.name, index.display());
        }
    }
    Ok(plans)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let len = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?.len();
    if len > max_yaml_bytes() {
        return Err(anyhow!("{} too large (>{} bytes)", path.display(), max_yaml_bytes()));
    }
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn read_text(path: &Path) -> Result<String> {
    String::from_utf8(read_bytes(path)?).with_context(|| format!("{} is not valid UTF-8", path.display()))
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read_text(path)?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
