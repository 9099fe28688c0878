use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use crate::installation::is_valid_root;
use crate::local_settings::LOCAL_SETTINGS_FILE;

pub const INSTALL_PATH_ENV: &str = "MW_INSTALL_PATH";
pub const CONFIG_ENV: &str = "MWEXT_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub installation_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub installation_root: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub installation_root_valid: bool,
    pub local_settings_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "installation_root={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.installation_root),
            self.root_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> RuntimeStatus {
    let installation_root_valid = is_valid_root(&paths.installation_root);
    let local_settings_exists = paths.installation_root.join(LOCAL_SETTINGS_FILE).is_file();
    let config_exists = paths.config_path.is_file();

    let mut warnings = Vec::new();
    if !installation_root_valid {
        warnings.push(format!(
            "{} is not a MediaWiki installation root",
            normalize_for_display(&paths.installation_root)
        ));
    } else if !local_settings_exists {
        warnings.push(format!(
            "{LOCAL_SETTINGS_FILE} not found under {}",
            normalize_for_display(&paths.installation_root)
        ));
    }
    if !config_exists && paths.config_source != ValueSource::Default {
        warnings.push(format!(
            "config file {} does not exist",
            normalize_for_display(&paths.config_path)
        ));
    }

    RuntimeStatus {
        installation_root_valid,
        local_settings_exists,
        config_exists,
        warnings,
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (installation_root, root_source) = resolve_installation_root(context, overrides, &lookup_env);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty_env(&lookup_env, CONFIG_ENV) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (
            context.cwd.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
            ValueSource::Default,
        )
    };

    Ok(ResolvedPaths {
        installation_root,
        config_path,
        root_source,
        config_source,
    })
}

fn resolve_installation_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.installation_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_empty_env(lookup_env, INSTALL_PATH_ENV) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    match detect_installation_root(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

fn non_empty_env<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Nearest ancestor of `cwd` (itself included) that looks like an
/// installation root.
fn detect_installation_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| is_valid_root(candidate))
        .map(Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
