//! Run configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::controller::DependencyPolicy;
use crate::core::filter::{Filter, FilterSet, Selection};
use crate::run::RunOptions;

/// Run configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Run only the tests matched by `include`; their descendants are not
    /// pulled in automatically.
    pub exact_filter: bool,

    /// Report dynamic steps started from test code as skipped.
    pub skip_dynamic_steps: bool,

    /// Dry run: report every selected test as skipped.
    pub skip_execution: bool,

    pub dependency_policy: DependencyPolicy,

    /// How often per-thread default contexts of exited threads are dropped.
    pub thread_cleanup_interval_secs: u64,

    /// Filter expressions such as `id:login` or `name:/^smoke/`.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exact_filter: false,
            skip_dynamic_steps: false,
            skip_execution: false,
            dependency_policy: DependencyPolicy::default(),
            thread_cleanup_interval_secs: 60,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thread_cleanup_interval_secs == 0 {
            return Err(anyhow!("thread_cleanup_interval_secs must be > 0"));
        }
        self.filter_set()?;
        Ok(())
    }

    pub fn filter_set(&self) -> Result<FilterSet> {
        let mut set = FilterSet::new();
        for expr in &self.include {
            set = set.include(Filter::parse(expr).with_context(|| format!("include '{expr}'"))?);
        }
        for expr in &self.exclude {
            set = set.exclude(Filter::parse(expr).with_context(|| format!("exclude '{expr}'"))?);
        }
        Ok(set)
    }

    pub fn selection(&self) -> Result<Selection> {
        Ok(Selection {
            filter: self.filter_set()?,
            exact_filter: self.exact_filter,
            skip_dynamic_tests: self.skip_dynamic_steps,
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dependency_policy: self.dependency_policy,
            skip_execution: self.skip_execution,
            thread_cleanup_interval: Duration::from_secs(self.thread_cleanup_interval_secs),
            ..RunOptions::default()
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
