use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::extract::extension_page_name;
use crate::local_settings::lossy_lines;
use crate::name::{ExtensionKind, ExtensionName};

/// Sidecar written next to the manifest by packaging tools.
pub const VERSION_FILE_NAME: &str = "version";

const VERSION_FILE_MAX_LINES: usize = 3;

const OFFSET_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%a %b %e %H:%M:%S %Y %z",
];

const NAIVE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%a %b %e %H:%M:%S %Y",
];

/// One installed extension or skin folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalExtensionInfo {
    pub name: ExtensionName,
    pub local_path: PathBuf,
    pub branch: Option<String>,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub revision_time: Option<DateTime<Utc>>,
    /// Earliest modification time among the files directly in the folder.
    pub last_modified: DateTime<Utc>,
}

/// Name sources for one folder, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NameCandidates {
    sidecar: Option<String>,
    page_url: Option<String>,
    manifest: Option<String>,
    folder: Option<String>,
}

impl NameCandidates {
    fn resolve(&self) -> Option<&str> {
        [&self.sidecar, &self.page_url, &self.manifest, &self.folder]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VersionFile {
    name: Option<String>,
    branch: Option<String>,
    revision_time: Option<DateTime<Utc>>,
    revision: Option<String>,
}

/// Reads the package installed in `folder`.
///
/// Returns `Ok(None)` when the folder has no `extension.json` / `skin.json`
/// for `kind`; such folders are not packages. A manifest that is not valid
/// JSON, or a sidecar with an unreadable timestamp, is an error for this
/// folder only.
pub fn read_local_extension(
    folder: &Path,
    kind: ExtensionKind,
    cancel: &CancellationToken,
) -> Result<Option<LocalExtensionInfo>> {
    let Some(manifest_name) = kind.manifest_file_name() else {
        bail!("cannot read a package of unknown kind at {}", folder.display());
    };
    cancel.check()?;

    let manifest_path = folder.join(manifest_name);
    if !manifest_path.is_file() {
        tracing::debug!(path = %folder.display(), "cannot find {manifest_name}; skipping folder");
        return Ok(None);
    }
    tracing::debug!(path = %folder.display(), "loading {manifest_name}");
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

    let version_path = folder.join(VERSION_FILE_NAME);
    let sidecar = if version_path.is_file() {
        read_version_file(&version_path, cancel)?
    } else {
        tracing::debug!(path = %folder.display(), "no {VERSION_FILE_NAME} file");
        VersionFile::default()
    };

    let candidates = NameCandidates {
        sidecar: sidecar.name.clone(),
        page_url: manifest_string(&manifest, "url")
            .as_deref()
            .and_then(extension_page_name),
        manifest: manifest_string(&manifest, "name"),
        folder: folder
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    };
    let Some(resolved) = candidates.resolve() else {
        bail!("cannot determine a package name for {}", folder.display());
    };
    let name = ExtensionName::new(resolved, kind)?;

    Ok(Some(LocalExtensionInfo {
        name,
        local_path: folder.to_path_buf(),
        branch: sidecar.branch,
        version: manifest_string(&manifest, "version"),
        revision: sidecar.revision,
        revision_time: sidecar.revision_time,
        last_modified: earliest_file_time(folder),
    }))
}

/// Parses a sidecar revision timestamp. Values without an offset are UTC.
pub fn parse_revision_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_TIME_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_TIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }
    bail!("unrecognized revision timestamp {value:?}")
}

fn read_version_file(path: &Path, cancel: &CancellationToken) -> Result<VersionFile> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = Vec::with_capacity(VERSION_FILE_MAX_LINES);
    for line in lossy_lines(BufReader::new(file)) {
        cancel.check()?;
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(trimmed.to_string());
        if lines.len() == VERSION_FILE_MAX_LINES {
            break;
        }
    }

    let mut parsed = VersionFile::default();
    if let Some(first) = lines.first() {
        let (name, branch) = match first.split_once(':') {
            Some((name, branch)) => (name, Some(branch)),
            None => (first.as_str(), None),
        };
        parsed.name = non_empty(name);
        parsed.branch = branch.and_then(non_empty);
    }
    if let Some(time) = lines.get(1) {
        let revision_time = parse_revision_time(time)
            .with_context(|| format!("invalid revision time in {}", path.display()))?;
        parsed.revision_time = Some(revision_time);
    }
    if let Some(revision) = lines.get(2) {
        parsed.revision = non_empty(revision);
    }
    Ok(parsed)
}

/// Earliest modification time of the regular files directly inside
/// `folder`, or `DateTime::<Utc>::MIN_UTC` when it holds none. Entries that
/// cannot be inspected, such as dangling links, are skipped.
pub fn earliest_file_time(folder: &Path) -> DateTime<Utc> {
    let mut earliest: Option<DateTime<Utc>> = None;
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::debug!("skipping entry in {}: {error}", folder.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata() {
            Ok(metadata) => metadata.modified(),
            Err(error) => Err(error.into()),
        };
        let modified = match modified {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(error) => {
                tracing::debug!("skipping mtime of {}: {error}", entry.path().display());
                continue;
            }
        };
        earliest = Some(earliest.map_or(modified, |current| current.min(modified)));
    }
    earliest.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn manifest_string(manifest: &Value, key: &str) -> Option<String> {
    manifest.get(key).and_then(Value::as_str).and_then(non_empty)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
