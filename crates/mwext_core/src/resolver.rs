use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::extract::download_redirect_targets;
use crate::name::{ExtensionKind, ExtensionName, RemoteExtensionDescriptor};
use crate::registry::{ExtensionBranch, PackageBranches, RegistryApi};

/// Distinct names per registry query.
pub const BATCH_SIZE: usize = 30;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Wanted branch names. Empty means "latest REL branch" unless
    /// `all_branches` is set, in which case it means "no filter".
    pub branches: Vec<String>,
    pub all_branches: bool,
    pub suppress_redirect: bool,
    pub batch_size: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            all_branches: false,
            suppress_redirect: false,
            batch_size: BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    NoMatchingBranch,
    NoMatchingRelBranch,
    NoBranch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    pub name: ExtensionName,
    pub kind: WarningKind,
    pub available_branches: Vec<String>,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let available = self.available_branches.join(", ");
        match self.kind {
            WarningKind::NoMatchingBranch => write!(
                f,
                "No matching branch for extension \"{}\". Available branches: {available}.",
                self.name
            ),
            WarningKind::NoMatchingRelBranch => write!(
                f,
                "No matching REL branch for extension \"{}\". Available branches: {available}.",
                self.name
            ),
            WarningKind::NoBranch => write!(f, "No branch found for extension \"{}\".", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionEvent {
    Branch(ExtensionBranch),
    Warning(ResolutionWarning),
    Redirected {
        from: ExtensionName,
        to: ExtensionName,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionStats {
    pub names: usize,
    pub batches: usize,
    pub branches: usize,
    pub warnings: usize,
    pub redirects: usize,
}

/// Runs one resolution against a borrowed registry session.
pub struct BranchResolver<'a, A: RegistryApi + ?Sized> {
    api: &'a mut A,
    options: ResolverOptions,
}

impl<'a, A: RegistryApi + ?Sized> BranchResolver<'a, A> {
    pub fn new(api: &'a mut A, options: ResolverOptions) -> Self {
        Self { api, options }
    }

    /// Streams a branch or warning for every distinct input name. Batches are
    /// queried one after another; within a batch, results follow registry
    /// order.
    pub fn resolve<I, F>(
        &mut self,
        names: I,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<ResolutionStats>
    where
        I: IntoIterator<Item = ExtensionName>,
        F: FnMut(ResolutionEvent),
    {
        let batch_size = self.options.batch_size.max(1);
        let mut stats = ResolutionStats::default();
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(batch_size);

        for name in names {
            cancel.check()?;
            if !seen.insert(name.clone()) {
                continue;
            }
            stats.names += 1;
            batch.push(name);
            if batch.len() >= batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                self.process_batch(full, cancel, &mut on_event, &mut stats)?;
            }
        }
        if !batch.is_empty() {
            self.process_batch(batch, cancel, &mut on_event, &mut stats)?;
        }
        Ok(stats)
    }

    fn process_batch(
        &mut self,
        batch: Vec<ExtensionName>,
        cancel: &CancellationToken,
        on_event: &mut dyn FnMut(ResolutionEvent),
        stats: &mut ResolutionStats,
    ) -> Result<()> {
        stats.batches += 1;
        tracing::debug!("querying branches for {} names", batch.len());
        let packages = self.query_branches(&batch, cancel)?;
        let mut unresolved = batch;
        self.apply_policy(&packages, &mut unresolved, on_event, stats);

        if !unresolved.is_empty() && !self.options.suppress_redirect {
            let redirected = self.discover_redirects(&mut unresolved, cancel, on_event, stats)?;
            if !redirected.is_empty() {
                let packages = self.query_branches(&redirected, cancel)?;
                for target in redirected {
                    if !unresolved.contains(&target) {
                        unresolved.push(target);
                    }
                }
                self.apply_policy(&packages, &mut unresolved, on_event, stats);
            }
        }

        for name in unresolved {
            emit_warning(on_event, stats, name, WarningKind::NoBranch, Vec::new());
        }
        Ok(())
    }

    fn query_branches(
        &mut self,
        names: &[ExtensionName],
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageBranches>> {
        cancel.check()?;
        let packages = self.api.get_extension_branches(names)?;
        cancel.check()?;
        Ok(packages)
    }

    /// Emits results for every package the registry knows branches for and
    /// drops it, and its Unknown-kind alias, from `unresolved`.
    fn apply_policy(
        &self,
        packages: &[PackageBranches],
        unresolved: &mut Vec<ExtensionName>,
        on_event: &mut dyn FnMut(ResolutionEvent),
        stats: &mut ResolutionStats,
    ) {
        for package in packages {
            if package.branches.is_empty() {
                continue;
            }
            match self.select(package) {
                Ok(selected) => {
                    for branch in selected {
                        stats.branches += 1;
                        on_event(ResolutionEvent::Branch(branch));
                    }
                }
                Err(kind) => {
                    let available = package
                        .branch_names()
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    emit_warning(on_event, stats, package.name.clone(), kind, available);
                }
            }
            let alias = package.name.with_kind(ExtensionKind::Unknown);
            unresolved.retain(|name| *name != package.name && *name != alias);
        }
    }

    fn select(&self, package: &PackageBranches) -> Result<Vec<ExtensionBranch>, WarningKind> {
        let wanted = &self.options.branches;
        if self.options.all_branches {
            let selected = package
                .branches
                .iter()
                .filter(|branch| {
                    wanted.is_empty()
                        || wanted
                            .iter()
                            .any(|name| name.eq_ignore_ascii_case(&branch.branch_name))
                })
                .cloned()
                .collect::<Vec<_>>();
            if selected.is_empty() {
                return Err(WarningKind::NoMatchingBranch);
            }
            return Ok(selected);
        }

        if !wanted.is_empty() {
            return wanted
                .iter()
                .find_map(|name| {
                    package
                        .branches
                        .iter()
                        .find(|branch| branch.branch_name == *name)
                })
                .map(|branch| vec![branch.clone()])
                .ok_or(WarningKind::NoMatchingBranch);
        }

        package
            .branches
            .iter()
            .filter(|branch| branch.branch_name.starts_with("REL"))
            .max_by(|left, right| left.branch_name.cmp(&right.branch_name))
            .map(|branch| vec![branch.clone()])
            .ok_or(WarningKind::NoMatchingRelBranch)
    }

    /// Looks for download templates on the documentation pages of the names
    /// still in `unresolved`. Returns the distinct redirect targets.
    fn discover_redirects(
        &mut self,
        unresolved: &mut Vec<ExtensionName>,
        cancel: &CancellationToken,
        on_event: &mut dyn FnMut(ResolutionEvent),
        stats: &mut ResolutionStats,
    ) -> Result<Vec<ExtensionName>> {
        let mut candidates = Vec::new();
        for name in unresolved.iter() {
            match name.kind() {
                ExtensionKind::Unknown => {
                    for kind in [ExtensionKind::Extension, ExtensionKind::Skin] {
                        if let Some(title) = name.with_kind(kind).page_title() {
                            candidates.push((name.clone(), title));
                        }
                    }
                }
                _ => {
                    if let Some(title) = name.page_title() {
                        candidates.push((name.clone(), title));
                    }
                }
            }
        }
        let titles = candidates
            .iter()
            .map(|(_, title)| title.clone())
            .collect::<Vec<_>>();

        cancel.check()?;
        let pages = self.api.get_page_contents(&titles)?;
        cancel.check()?;
        let pages = pages
            .into_iter()
            .map(|page| (page.requested_title.clone(), page))
            .collect::<HashMap<_, _>>();

        let mut redirected = Vec::new();
        for (original, title) in candidates {
            let Some(page) = pages.get(&title).filter(|page| page.exists) else {
                tracing::debug!("no documentation page for {original} at {title}");
                continue;
            };
            for target in download_redirect_targets(&page.content) {
                if target.name() == original.name() && original.kind().admits(target.kind()) {
                    continue;
                }
                tracing::info!("Redirected {original} to {target}.");
                stats.redirects += 1;
                on_event(ResolutionEvent::Redirected {
                    from: original.clone(),
                    to: target.clone(),
                });
                unresolved.retain(|name| *name != original);
                if !redirected.contains(&target) {
                    redirected.push(target);
                }
            }
        }
        Ok(redirected)
    }
}

fn emit_warning(
    on_event: &mut dyn FnMut(ResolutionEvent),
    stats: &mut ResolutionStats,
    name: ExtensionName,
    kind: WarningKind,
    available_branches: Vec<String>,
) {
    stats.warnings += 1;
    on_event(ResolutionEvent::Warning(ResolutionWarning {
        name,
        kind,
        available_branches,
    }));
}

/// Every package in the registry's repository list admitted by `filter`.
pub fn list_known_extensions<A: RegistryApi + ?Sized>(
    api: &mut A,
    filter: ExtensionKind,
    cancel: &CancellationToken,
) -> Result<Vec<RemoteExtensionDescriptor>> {
    cancel.check()?;
    let names = api.get_known_extensions()?;
    cancel.check()?;
    Ok(names
        .into_iter()
        .filter(|name| filter.admits(name.kind()))
        .map(|name| RemoteExtensionDescriptor { name })
        .collect())
}

/// A resolution running on a worker thread.
pub struct ResolutionTask {
    cancel: CancellationToken,
    events: Receiver<ResolutionEvent>,
    handle: JoinHandle<Result<ResolutionStats>>,
}

impl ResolutionTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Events in emission order. Iteration ends once the worker has finished.
    pub fn events(&self) -> &Receiver<ResolutionEvent> {
        &self.events
    }

    pub fn join(self) -> Result<ResolutionStats> {
        self.handle
            .join()
            .map_err(|_| anyhow!("resolution worker panicked"))?
    }
}

pub fn spawn_resolution<A>(
    mut api: A,
    options: ResolverOptions,
    names: Vec<ExtensionName>,
) -> ResolutionTask
where
    A: RegistryApi + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (sender, events) = mpsc::channel();
    let worker_cancel = cancel.clone();
    let handle = thread::spawn(move || {
        let mut resolver = BranchResolver::new(&mut api, options);
        resolver.resolve(names, &worker_cancel, |event| {
            // A dropped receiver only means nobody is listening any more.
            let _ = sender.send(event);
        })
    });
    ResolutionTask {
        cancel,
        events,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc;

    use anyhow::Result;

    use super::{
        BranchResolver, ResolutionEvent, ResolverOptions, WarningKind, list_known_extensions,
        spawn_resolution,
    };
    use crate::cancel::CancellationToken;
    use crate::error::is_cancelled;
    use crate::name::{ExtensionKind, ExtensionName};
    use crate::registry::{ExtensionBranch, PackageBranches, RegistryApi, RemotePage};

    #[derive(Default)]
    struct MockRegistry {
        branches: HashMap<ExtensionName, Vec<String>>,
        pages: HashMap<String, String>,
        branch_calls: Vec<Vec<ExtensionName>>,
        page_calls: Vec<Vec<String>>,
        cancel_after_query: Option<CancellationToken>,
        /// Held before answering every branch query after the first.
        release: Option<mpsc::Receiver<()>>,
    }

    impl MockRegistry {
        fn with_branches(mut self, name: &str, branches: &[&str]) -> Self {
            self.branches.insert(
                ExtensionName::parse(name).expect("name"),
                branches.iter().map(|branch| branch.to_string()).collect(),
            );
            self
        }

        fn with_page(mut self, title: &str, content: &str) -> Self {
            self.pages.insert(title.to_string(), content.to_string());
            self
        }
    }

    impl RegistryApi for MockRegistry {
        fn get_known_extensions(&mut self) -> Result<Vec<ExtensionName>> {
            let mut names = self.branches.keys().cloned().collect::<Vec<_>>();
            names.sort();
            Ok(names)
        }

        fn get_extension_branches(
            &mut self,
            names: &[ExtensionName],
        ) -> Result<Vec<PackageBranches>> {
            self.branch_calls.push(names.to_vec());
            if let Some(cancel) = &self.cancel_after_query {
                cancel.cancel();
            }
            if self.branch_calls.len() > 1 {
                if let Some(release) = &self.release {
                    // A dropped sender releases as well.
                    let _ = release.recv();
                }
            }
            let mut packages = Vec::new();
            for requested in names {
                for kind in [ExtensionKind::Extension, ExtensionKind::Skin] {
                    if !requested.kind().admits(kind) {
                        continue;
                    }
                    let name = requested.with_kind(kind);
                    if let Some(branches) = self.branches.get(&name) {
                        packages.push(PackageBranches {
                            name: name.clone(),
                            branches: branches
                                .iter()
                                .map(|branch| ExtensionBranch {
                                    extension_name: name.clone(),
                                    branch_name: branch.clone(),
                                    download_url: format!(
                                        "https://dl.example/{}-{branch}.tar.gz",
                                        name.name()
                                    ),
                                })
                                .collect(),
                        });
                    }
                }
            }
            Ok(packages)
        }

        fn get_page_contents(&mut self, titles: &[String]) -> Result<Vec<RemotePage>> {
            self.page_calls.push(titles.to_vec());
            Ok(titles
                .iter()
                .map(|title| {
                    let content = self.pages.get(title);
                    RemotePage {
                        requested_title: title.clone(),
                        title: title.clone(),
                        exists: content.is_some(),
                        content: content.cloned().unwrap_or_default(),
                    }
                })
                .collect())
        }

        fn request_count(&self) -> usize {
            self.branch_calls.len() + self.page_calls.len()
        }
    }

    fn name(text: &str) -> ExtensionName {
        ExtensionName::parse(text).expect("name")
    }

    fn run(
        registry: &mut MockRegistry,
        options: ResolverOptions,
        names: &[&str],
    ) -> Vec<ResolutionEvent> {
        let mut events = Vec::new();
        BranchResolver::new(registry, options)
            .resolve(
                names.iter().map(|text| name(text)),
                &CancellationToken::new(),
                |event| events.push(event),
            )
            .expect("resolve");
        events
    }

    fn branch_summary(events: &[ResolutionEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|event| match event {
                ResolutionEvent::Branch(branch) => Some((
                    branch.extension_name.to_string(),
                    branch.branch_name.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    fn warnings(events: &[ResolutionEvent]) -> Vec<(String, WarningKind)> {
        events
            .iter()
            .filter_map(|event| match event {
                ResolutionEvent::Warning(warning) => {
                    Some((warning.name.to_string(), warning.kind))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn default_policy_picks_greatest_rel_branch() {
        let mut registry = MockRegistry::default().with_branches(
            "Extension:Echo",
            &["REL1_31", "REL1_32", "REL1_33", "master", "source"],
        );
        let events = run(&mut registry, ResolverOptions::default(), &["Extension:Echo"]);
        assert_eq!(
            branch_summary(&events),
            vec![("Extension:Echo".to_string(), "REL1_33".to_string())]
        );
        assert!(warnings(&events).is_empty());
    }

    #[test]
    fn explicit_branches_follow_caller_order() {
        let mut registry = MockRegistry::default()
            .with_branches("Extension:Echo", &["REL1_31", "REL1_33", "master"]);
        let options = ResolverOptions {
            branches: vec!["master".to_string(), "REL1_33".to_string()],
            ..ResolverOptions::default()
        };
        let events = run(&mut registry, options, &["Extension:Echo"]);
        assert_eq!(
            branch_summary(&events),
            vec![("Extension:Echo".to_string(), "master".to_string())]
        );
    }

    #[test]
    fn explicit_branches_are_case_sensitive() {
        let mut registry =
            MockRegistry::default().with_branches("Extension:Echo", &["REL1_31", "master"]);
        let options = ResolverOptions {
            branches: vec!["MASTER".to_string()],
            ..ResolverOptions::default()
        };
        let events = run(&mut registry, options, &["Extension:Echo"]);
        assert!(branch_summary(&events).is_empty());
        let ResolutionEvent::Warning(warning) = &events[0] else {
            panic!("expected a warning, got {events:?}");
        };
        assert_eq!(
            warning.to_string(),
            "No matching branch for extension \"Extension:Echo\". Available branches: REL1_31, master."
        );
    }

    #[test]
    fn missing_rel_branch_has_its_own_warning() {
        let mut registry =
            MockRegistry::default().with_branches("Skin:Timeless", &["master", "wmf/1.40"]);
        let events = run(&mut registry, ResolverOptions::default(), &["Skin:Timeless"]);
        assert_eq!(
            warnings(&events),
            vec![("Skin:Timeless".to_string(), WarningKind::NoMatchingRelBranch)]
        );
    }

    #[test]
    fn all_branches_filter_ignores_case_and_warns_when_empty() {
        let mut registry = MockRegistry::default()
            .with_branches("Extension:Echo", &["REL1_31", "REL1_32", "master"])
            .with_branches("Extension:Cite", &["master"]);
        let options = ResolverOptions {
            branches: vec!["rel1_31".to_string(), "REL1_32".to_string()],
            all_branches: true,
            ..ResolverOptions::default()
        };
        let events = run(&mut registry, options, &["Extension:Echo", "Extension:Cite"]);
        assert_eq!(
            branch_summary(&events),
            vec![
                ("Extension:Echo".to_string(), "REL1_31".to_string()),
                ("Extension:Echo".to_string(), "REL1_32".to_string()),
            ]
        );
        assert_eq!(
            warnings(&events),
            vec![("Extension:Cite".to_string(), WarningKind::NoMatchingBranch)]
        );
    }

    #[test]
    fn all_branches_without_filter_returns_everything() {
        let mut registry =
            MockRegistry::default().with_branches("Extension:Echo", &["REL1_31", "master"]);
        let options = ResolverOptions {
            all_branches: true,
            ..ResolverOptions::default()
        };
        let events = run(&mut registry, options, &["Extension:Echo"]);
        assert_eq!(branch_summary(&events).len(), 2);
    }

    #[test]
    fn unknown_names_match_either_kind() {
        let mut registry = MockRegistry::default()
            .with_branches("Skin:Vector", &["REL1_33"])
            .with_branches("Extension:Cite", &["REL1_33"]);
        let events = run(&mut registry, ResolverOptions::default(), &["Vector", "Cite"]);
        assert_eq!(
            branch_summary(&events),
            vec![
                ("Skin:Vector".to_string(), "REL1_33".to_string()),
                ("Extension:Cite".to_string(), "REL1_33".to_string()),
            ]
        );
        assert!(warnings(&events).is_empty());
    }

    #[test]
    fn every_input_name_yields_an_outcome() {
        let mut registry = MockRegistry::default()
            .with_branches("Extension:Echo", &["REL1_33"])
            .with_branches("Extension:Hollow", &[]);
        let events = run(
            &mut registry,
            ResolverOptions::default(),
            &["Extension:Echo", "Extension:Hollow", "Nowhere", "Extension:Echo"],
        );
        assert_eq!(branch_summary(&events).len(), 1);
        assert_eq!(
            warnings(&events),
            vec![
                ("Extension:Hollow".to_string(), WarningKind::NoBranch),
                ("Nowhere".to_string(), WarningKind::NoBranch),
            ]
        );
        let ResolutionEvent::Warning(warning) = events.last().expect("event") else {
            panic!("expected a warning");
        };
        assert_eq!(warning.to_string(), "No branch found for extension \"Nowhere\".");
    }

    #[test]
    fn batching_does_not_change_results() {
        let mut names = Vec::new();
        let mut registry = MockRegistry::default();
        for index in 0..45 {
            let text = format!("Extension:Pkg{index:02}");
            registry = registry.with_branches(&text, &["REL1_32", "REL1_33"]);
            names.push(text);
        }
        let names = names.iter().map(String::as_str).collect::<Vec<_>>();

        let mut single = MockRegistry {
            branches: registry.branches.clone(),
            ..MockRegistry::default()
        };
        let unbatched = run(
            &mut single,
            ResolverOptions {
                batch_size: 100,
                ..ResolverOptions::default()
            },
            &names,
        );
        let batched = run(&mut registry, ResolverOptions::default(), &names);

        let sorted = |events: &[ResolutionEvent]| {
            let mut summary = branch_summary(events);
            summary.sort();
            summary
        };
        assert_eq!(sorted(&batched), sorted(&unbatched));
        assert_eq!(sorted(&batched).len(), 45);
        let sizes = registry
            .branch_calls
            .iter()
            .map(Vec::len)
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![30, 15]);
        assert_eq!(single.branch_calls.len(), 1);
    }

    #[test]
    fn redirect_resolves_to_target_branches() {
        let mut registry = MockRegistry::default()
            .with_branches("Extension:SyntaxHighlight GeSHi", &["REL1_32", "REL1_33"])
            .with_page(
                "Extension:SyntaxHighlight",
                "{{Extension\n|name=SyntaxHighlight\n}}\n{{WikimediaDownload|SyntaxHighlight GeSHi}}",
            );
        let events = run(&mut registry, ResolverOptions::default(), &["SyntaxHighlight"]);

        assert_eq!(
            events[0],
            ResolutionEvent::Redirected {
                from: name("SyntaxHighlight"),
                to: name("Extension:SyntaxHighlight GeSHi"),
            }
        );
        assert_eq!(
            branch_summary(&events),
            vec![(
                "Extension:SyntaxHighlight GeSHi".to_string(),
                "REL1_33".to_string()
            )]
        );
        assert!(warnings(&events).is_empty());
        assert_eq!(
            registry.page_calls,
            vec![vec![
                "Extension:SyntaxHighlight".to_string(),
                "Skin:SyntaxHighlight".to_string(),
            ]]
        );
        assert_eq!(registry.branch_calls.len(), 2);
    }

    #[test]
    fn redirect_to_missing_target_warns_for_target() {
        let mut registry = MockRegistry::default()
            .with_page("Skin:Old", "{{WikimediaDownloadSkin|New}}");
        let events = run(&mut registry, ResolverOptions::default(), &["Skin:Old"]);
        assert_eq!(
            warnings(&events),
            vec![("Skin:New".to_string(), WarningKind::NoBranch)]
        );
    }

    #[test]
    fn suppressed_redirect_skips_page_lookup() {
        let mut registry = MockRegistry::default()
            .with_page("Extension:Old", "{{WikimediaDownload|New}}")
            .with_branches("Extension:New", &["REL1_33"]);
        let options = ResolverOptions {
            suppress_redirect: true,
            ..ResolverOptions::default()
        };
        let events = run(&mut registry, options, &["Extension:Old"]);
        assert!(registry.page_calls.is_empty());
        assert_eq!(
            warnings(&events),
            vec![("Extension:Old".to_string(), WarningKind::NoBranch)]
        );
    }

    #[test]
    fn cancellation_stops_before_redirect_lookup() {
        let cancel = CancellationToken::new();
        let mut registry = MockRegistry {
            cancel_after_query: Some(cancel.clone()),
            ..MockRegistry::default()
        }
        .with_page("Extension:Old", "{{WikimediaDownload|New}}");

        let mut events = Vec::new();
        let error = BranchResolver::new(&mut registry, ResolverOptions::default())
            .resolve([name("Extension:Old")], &cancel, |event| events.push(event))
            .expect_err("must fail");
        assert!(is_cancelled(&error));
        assert!(registry.page_calls.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn known_extensions_respect_kind_filter() {
        let mut registry = MockRegistry::default()
            .with_branches("Extension:Cite", &["master"])
            .with_branches("Skin:Vector", &["master"]);
        let skins = list_known_extensions(
            &mut registry,
            ExtensionKind::Skin,
            &CancellationToken::new(),
        )
        .expect("list");
        assert_eq!(skins.len(), 1);
        assert_eq!(skins[0].name.to_string(), "Skin:Vector");
        let all = list_known_extensions(
            &mut registry,
            ExtensionKind::Unknown,
            &CancellationToken::new(),
        )
        .expect("list");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn spawned_resolution_streams_events() {
        let registry = MockRegistry::default().with_branches("Extension:Echo", &["REL1_33"]);
        let task = spawn_resolution(
            registry,
            ResolverOptions::default(),
            vec![name("Extension:Echo"), name("Missing")],
        );
        let events = task.events().iter().collect::<Vec<_>>();
        let stats = task.join().expect("join");
        assert_eq!(events.len(), 2);
        assert_eq!(stats.branches, 1);
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.names, 2);
    }

    #[test]
    fn cancelled_task_keeps_delivered_events() {
        let (release_sender, release) = mpsc::channel();
        let mut registry = MockRegistry::default()
            .with_branches("Extension:Echo", &["REL1_33"])
            .with_branches("Extension:Cite", &["REL1_33"]);
        registry.release = Some(release);
        let options = ResolverOptions {
            batch_size: 1,
            ..ResolverOptions::default()
        };

        let task = spawn_resolution(
            registry,
            options,
            vec![name("Extension:Echo"), name("Extension:Cite")],
        );
        let first = task.events().recv().expect("first event");
        task.cancel();
        release_sender.send(()).expect("release second batch");

        let rest = task.events().iter().collect::<Vec<_>>();
        let error = task.join().expect_err("must be cancelled");
        assert!(is_cancelled(&error));
        assert_eq!(
            branch_summary(&[first]),
            vec![("Extension:Echo".to_string(), "REL1_33".to_string())]
        );
        assert!(rest.is_empty());
    }
}
