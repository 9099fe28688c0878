use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::error::{MwError, is_cancelled};
use crate::local_settings::{LocalSiteInfo, read_site_info};
use crate::manifest::{LocalExtensionInfo, read_local_extension};
use crate::name::ExtensionKind;

pub const ENTRY_POINT_FILE: &str = "index.php";

/// Receives per-folder progress while an installation is scanned.
pub trait ProgressSink {
    fn on_progress(&mut self, current: usize, total: usize, label: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&mut self, _current: usize, _total: usize, _label: &str) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(usize, usize, &str),
{
    fn on_progress(&mut self, current: usize, total: usize, label: &str) {
        self(current, total, label)
    }
}

/// A folder is an installation root when it holds `index.php` together with
/// `extensions/` and `skins/`. `includes/` is not required here.
pub fn is_valid_root(path: &Path) -> bool {
    path.join(ENTRY_POINT_FILE).is_file()
        && path.join("extensions").is_dir()
        && path.join("skins").is_dir()
}

pub fn assert_valid_root(path: &Path) -> Result<()> {
    if is_valid_root(path) {
        return Ok(());
    }
    Err(MwError::NotAnInstallationRoot {
        path: path.to_path_buf(),
    }
    .into())
}

/// A local MediaWiki installation whose root has been validated.
#[derive(Debug, Clone)]
pub struct MediaWikiInstallation {
    root: PathBuf,
}

impl MediaWikiInstallation {
    pub fn open(root: &Path) -> Result<Self> {
        assert_valid_root(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan_extensions(
        &self,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalExtensionInfo>> {
        self.scan_kind(ExtensionKind::Extension, progress, cancel)
    }

    pub fn scan_skins(
        &self,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalExtensionInfo>> {
        self.scan_kind(ExtensionKind::Skin, progress, cancel)
    }

    /// Extensions then skins, or only the kind asked for.
    pub fn scan(
        &self,
        filter: ExtensionKind,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalExtensionInfo>> {
        let mut installed = Vec::new();
        if filter.admits(ExtensionKind::Extension) {
            installed.extend(self.scan_extensions(progress, cancel)?);
        }
        if filter.admits(ExtensionKind::Skin) {
            installed.extend(self.scan_skins(progress, cancel)?);
        }
        Ok(installed)
    }

    pub fn site_info(&self, cancel: &CancellationToken) -> Result<LocalSiteInfo> {
        read_site_info(&self.root, cancel)
    }

    fn scan_kind(
        &self,
        kind: ExtensionKind,
        progress: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<LocalExtensionInfo>> {
        let Some(folder_name) = kind.folder_name() else {
            return Ok(Vec::new());
        };
        let base = self.root.join(folder_name);
        let folders = package_folders(&base)?;
        let total = folders.len();

        let mut installed = Vec::new();
        for (index, folder) in folders.iter().enumerate() {
            cancel.check()?;
            let label = folder
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            progress.on_progress(index + 1, total, &label);

            match read_local_extension(folder, kind, cancel) {
                Ok(Some(info)) => installed.push(info),
                Ok(None) => {}
                Err(error) if is_cancelled(&error) => return Err(error),
                Err(error) => {
                    tracing::warn!(path = %folder.display(), "skipping {kind} folder: {error:#}");
                }
            }
        }
        Ok(installed)
    }
}

impl fmt::Display for MediaWikiInstallation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

/// Immediate subdirectories of `base`, in enumeration order. Children that
/// cannot be read, such as dangling links, are skipped with a warning.
fn package_folders(base: &Path) -> Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in WalkDir::new(base)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) if error.depth() > 0 => {
                tracing::warn!("skipping unreadable entry in {}: {error}", base.display());
                continue;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to walk {}", base.display()));
            }
        };
        if entry.file_type().is_dir() {
            folders.push(entry.into_path());
        }
    }
    Ok(folders)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{MediaWikiInstallation, NoopProgress, is_valid_root};
    use crate::cancel::CancellationToken;
    use crate::error::{MwError, is_cancelled};
    use crate::name::ExtensionKind;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(path, content).expect("write file");
    }

    fn installation(root: &Path) {
        write_file(&root.join("index.php"), "<?php");
        write_file(&root.join("extensions/Cite/extension.json"), r#"{"name": "Cite"}"#);
        write_file(&root.join("extensions/Broken/extension.json"), "{ nope");
        write_file(&root.join("extensions/README"), "not a folder");
        fs::create_dir_all(root.join("extensions/Empty")).expect("create empty");
        write_file(&root.join("skins/Vector/skin.json"), r#"{"name": "Vector"}"#);
        write_file(&root.join("skins/Vector/extension.json"), r#"{"name": "Wrong"}"#);
    }

    #[test]
    fn root_predicate_requires_entry_point_and_both_folders() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        assert!(!is_valid_root(root));
        write_file(&root.join("index.php"), "<?php");
        fs::create_dir_all(root.join("extensions")).expect("extensions");
        assert!(!is_valid_root(root));
        fs::create_dir_all(root.join("skins")).expect("skins");
        assert!(is_valid_root(root));
    }

    #[test]
    fn open_rejects_invalid_root() {
        let temp = tempdir().expect("tempdir");
        let error = MediaWikiInstallation::open(temp.path()).expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<MwError>(),
            Some(MwError::NotAnInstallationRoot { .. })
        ));
    }

    #[test]
    fn scan_keeps_packages_and_drops_broken_or_empty_folders() {
        let temp = tempdir().expect("tempdir");
        installation(temp.path());
        let installation = MediaWikiInstallation::open(temp.path()).expect("open");
        let cancel = CancellationToken::new();

        let extensions = installation
            .scan_extensions(&mut NoopProgress, &cancel)
            .expect("scan extensions");
        let names = extensions
            .iter()
            .map(|info| info.name.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Extension:Cite".to_string()]);

        let skins = installation
            .scan_skins(&mut NoopProgress, &cancel)
            .expect("scan skins");
        assert_eq!(skins.len(), 1);
        assert_eq!(skins[0].name.to_string(), "Skin:Vector");

        let all = installation
            .scan(ExtensionKind::Unknown, &mut NoopProgress, &cancel)
            .expect("scan all");
        assert_eq!(all.len(), 2);
        let only_skins = installation
            .scan(ExtensionKind::Skin, &mut NoopProgress, &cancel)
            .expect("scan skins only");
        assert_eq!(only_skins.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_link_in_extensions_folder_is_skipped() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("index.php"), "<?php");
        write_file(&root.join("extensions/Cite/extension.json"), r#"{"name": "Cite"}"#);
        fs::create_dir_all(root.join("skins")).expect("skins");
        std::os::unix::fs::symlink(root.join("missing"), root.join("extensions/Stale"))
            .expect("create dangling link");

        let installation = MediaWikiInstallation::open(root).expect("open");
        let extensions = installation
            .scan_extensions(&mut NoopProgress, &CancellationToken::new())
            .expect("scan extensions");
        let names = extensions
            .iter()
            .map(|info| info.name.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Extension:Cite".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_link_inside_package_keeps_package() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        installation(root);
        std::os::unix::fs::symlink(root.join("missing"), root.join("extensions/Cite/link.php"))
            .expect("create dangling link");

        let installation = MediaWikiInstallation::open(root).expect("open");
        let extensions = installation
            .scan_extensions(&mut NoopProgress, &CancellationToken::new())
            .expect("scan extensions");
        assert_eq!(extensions.len(), 1);
    }

    #[test]
    fn progress_counts_every_folder() {
        let temp = tempdir().expect("tempdir");
        installation(temp.path());
        let installation = MediaWikiInstallation::open(temp.path()).expect("open");

        let mut seen = Vec::new();
        let mut sink = |current: usize, total: usize, label: &str| {
            seen.push((current, total, label.to_string()));
        };
        installation
            .scan_extensions(&mut sink, &CancellationToken::new())
            .expect("scan");
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(_, total, _)| *total == 3));
        assert_eq!(seen.last().map(|(current, _, _)| *current), Some(3));
    }

    #[test]
    fn cancellation_aborts_scan() {
        let temp = tempdir().expect("tempdir");
        installation(temp.path());
        let installation = MediaWikiInstallation::open(temp.path()).expect("open");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = installation
            .scan_extensions(&mut NoopProgress, &cancel)
            .expect_err("must fail");
        assert!(is_cancelled(&error));
    }
}
