use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::extract::{
    include_references, is_comment_line, load_calls, site_name_assignment, version_assignment,
    version_define,
};
use crate::name::{ExtensionKind, ExtensionName};

pub const LOCAL_SETTINGS_FILE: &str = "LocalSettings.php";

const DEFAULT_SETTINGS_PATH: [&str; 2] = ["includes", "DefaultSettings.php"];
const DEFINES_PATH: [&str; 2] = ["includes", "Defines.php"];

/// A package mentioned in `LocalSettings.php`, at the line it first appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalSettingsReference {
    pub name: ExtensionName,
    pub line_number: usize,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalSiteInfo {
    pub site_name: Option<String>,
    pub version: Option<String>,
}

impl LocalSiteInfo {
    /// Values from `later` replace ours where `later` has them.
    fn overlay(self, later: LocalSiteInfo) -> Self {
        Self {
            site_name: later.site_name.or(self.site_name),
            version: later.version.or(self.version),
        }
    }
}

/// Accepts either the settings file or the folder holding it.
pub fn resolve_local_settings_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(LOCAL_SETTINGS_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Extensions and skins referenced by a `LocalSettings.php`, in order of
/// first appearance. Package paths are reported relative to the folder that
/// holds the settings file.
pub fn parse_local_settings(
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<LocalSettingsReference>> {
    let path = resolve_local_settings_path(path);
    let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let install_root = path.parent().unwrap_or_else(|| Path::new("."));
    read_references(BufReader::new(file), install_root, cancel)
        .with_context(|| format!("failed to scan {}", path.display()))
}

pub fn read_references<R: BufRead>(
    reader: R,
    install_root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<LocalSettingsReference>> {
    let mut first_seen: HashMap<(ExtensionKind, String), usize> = HashMap::new();
    let mut references = Vec::new();

    for (index, line) in lossy_lines(reader).enumerate() {
        cancel.check()?;
        let line = line.context("failed to read line")?;
        let line_number = index + 1;
        if is_comment_line(&line) {
            continue;
        }

        for (kind, name) in load_calls(&line)
            .into_iter()
            .chain(include_references(&line))
        {
            if let Some(first) = first_seen.get(&(kind, name.clone())) {
                tracing::debug!(
                    "{kind}:{name} on line {line_number} was already referenced on line {first}"
                );
                continue;
            }
            let Some(folder) = kind.folder_name() else {
                continue;
            };
            let local_path = install_root.join(folder).join(&name);
            let extension_name = ExtensionName::new(name.clone(), kind)?;
            first_seen.insert((kind, name), line_number);
            references.push(LocalSettingsReference {
                name: extension_name,
                line_number,
                local_path,
            });
        }
    }
    Ok(references)
}

/// Site name and MediaWiki version of the installation at `root`.
///
/// `includes/DefaultSettings.php` must exist. `includes/Defines.php` and
/// `LocalSettings.php` are read when present, each overriding the values
/// found before it.
pub fn read_site_info(root: &Path, cancel: &CancellationToken) -> Result<LocalSiteInfo> {
    let base_path = DEFAULT_SETTINGS_PATH
        .iter()
        .fold(root.to_path_buf(), |path, part| path.join(part));
    if !base_path.is_file() {
        bail!("cannot find {}", base_path.display());
    }
    let mut info = read_site_settings(&base_path, cancel)?;

    let defines_path = DEFINES_PATH
        .iter()
        .fold(root.to_path_buf(), |path, part| path.join(part));
    if defines_path.is_file() {
        info = info.overlay(read_site_settings(&defines_path, cancel)?);
    }

    let local_path = root.join(LOCAL_SETTINGS_FILE);
    if local_path.is_file() {
        info = info.overlay(read_site_settings(&local_path, cancel)?);
    } else {
        tracing::warn!("cannot find {}; using defaults only", local_path.display());
    }
    Ok(info)
}

fn read_site_settings(path: &Path, cancel: &CancellationToken) -> Result<LocalSiteInfo> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    scan_site_settings(BufReader::new(file), cancel)
        .with_context(|| format!("failed to scan {}", path.display()))
}

/// Last assignment of each value in the file wins.
fn scan_site_settings<R: BufRead>(reader: R, cancel: &CancellationToken) -> Result<LocalSiteInfo> {
    let mut info = LocalSiteInfo::default();
    for line in lossy_lines(reader) {
        cancel.check()?;
        let line = line.context("failed to read line")?;
        if is_comment_line(&line) {
            continue;
        }
        if let Some(site_name) = site_name_assignment(&line) {
            info.site_name = Some(site_name);
        }
        if let Some(version) = version_assignment(&line).or_else(|| version_define(&line)) {
            info.version = Some(version);
        }
    }
    Ok(info)
}

/// Lines of `reader` with bytes that are not UTF-8 replaced by U+FFFD.
/// Old settings files are often Latin-1.
pub(crate) fn lossy_lines<R: BufRead>(mut reader: R) -> impl Iterator<Item = io::Result<String>> {
    let mut buffer = Vec::new();
    std::iter::from_fn(move || {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => None,
            Ok(_) => {
                if buffer.last() == Some(&b'\n') {
                    buffer.pop();
                    if buffer.last() == Some(&b'\r') {
                        buffer.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&buffer).into_owned()))
            }
            Err(error) => Some(Err(error)),
        }
    })
}
