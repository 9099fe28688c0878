use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use mwext_core::config::load_config;
use mwext_core::error::is_cancelled;
use mwext_core::installation::MediaWikiInstallation;
use mwext_core::local_settings::{parse_local_settings, resolve_local_settings_path};
use mwext_core::registry::{MediaWikiClient, MediaWikiClientConfig, RegistryApi};
use mwext_core::resolver::{ResolutionEvent, ResolverOptions, list_known_extensions, spawn_resolution};
use mwext_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use mwext_core::{CancellationToken, ExtensionKind, ExtensionName};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mwext",
    version,
    about = "Inventory MediaWiki extensions and skins, installed or published"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print records as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List extensions and skins published on the registry")]
    Remote(ListArgs),
    #[command(about = "List extensions and skins installed under a MediaWiki root")]
    Installed(InstallationArgs),
    #[command(
        name = "local-settings",
        about = "List extensions and skins referenced by LocalSettings.php"
    )]
    LocalSettings(InstallationArgs),
    #[command(about = "Resolve download branches for extensions and skins")]
    Branch(BranchArgs),
    #[command(name = "site-info", about = "Show site name and MediaWiki version")]
    SiteInfo(SiteInfoArgs),
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum KindFilter {
    #[default]
    All,
    Extension,
    Skin,
}

impl KindFilter {
    fn as_kind(self) -> ExtensionKind {
        match self {
            Self::All => ExtensionKind::Unknown,
            Self::Extension => ExtensionKind::Extension,
            Self::Skin => ExtensionKind::Skin,
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum, default_value_t = KindFilter::All)]
    kind: KindFilter,
    #[arg(long, help = "Print names without the Extension:/Skin: prefix")]
    bare_name: bool,
}

#[derive(Debug, Args)]
struct InstallationArgs {
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,
    #[command(flatten)]
    list: ListArgs,
}

#[derive(Debug, Args)]
struct BranchArgs {
    #[arg(required = true, value_name = "NAME")]
    names: Vec<String>,
    #[arg(long = "branch", value_name = "BRANCH", help = "Wanted branch; repeat in order of preference")]
    branches: Vec<String>,
    #[arg(long, help = "Return every branch, filtered by --branch when given")]
    all_branches: bool,
    #[arg(long, help = "Do not follow download redirects on documentation pages")]
    suppress_redirect: bool,
}

#[derive(Debug, Args)]
struct SiteInfoArgs {
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RemoteRow {
    name: String,
    kind: ExtensionKind,
}

#[derive(Debug, Serialize)]
struct InstalledRow {
    name: String,
    kind: ExtensionKind,
    local_path: String,
    branch: Option<String>,
    version: Option<String>,
    revision: Option<String>,
    revision_time: Option<DateTime<Utc>>,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ReferenceRow {
    name: String,
    kind: ExtensionKind,
    line_number: usize,
    local_path: String,
}

#[derive(Debug, Serialize)]
struct BranchRow {
    name: String,
    branch: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct SiteInfoRow {
    root: String,
    site_name: Option<String>,
    version: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Remote(args)) => run_remote(&runtime, args),
        Some(Commands::Installed(args)) => run_installed(&runtime, args),
        Some(Commands::LocalSettings(args)) => run_local_settings(&runtime, args),
        Some(Commands::Branch(args)) => run_branch(&runtime, args),
        Some(Commands::SiteInfo(args)) => run_site_info(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_remote(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime, None)?;
    let mut client = registry_client(&paths)?;
    let known = list_known_extensions(&mut client, args.kind.as_kind(), &CancellationToken::new())?;
    tracing::debug!("{} registry requests", client.request_count());

    let rows = known
        .iter()
        .map(|descriptor| RemoteRow {
            name: display_name(&descriptor.name, args.bare_name),
            kind: descriptor.name.kind(),
        })
        .collect::<Vec<_>>();
    if runtime.json {
        print_json(&rows)?;
    } else {
        for row in &rows {
            println!("{}", row.name);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_installed(runtime: &RuntimeOptions, args: InstallationArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime, args.path.as_deref())?;
    let installation = MediaWikiInstallation::open(&paths.installation_root)?;
    let mut progress = |current: usize, total: usize, label: &str| {
        tracing::debug!("[{current}/{total}] {label}");
    };
    let installed = installation.scan(
        args.list.kind.as_kind(),
        &mut progress,
        &CancellationToken::new(),
    )?;

    let rows = installed
        .into_iter()
        .map(|info| InstalledRow {
            name: display_name(&info.name, args.list.bare_name),
            kind: info.name.kind(),
            local_path: normalize_for_display(&info.local_path),
            branch: info.branch,
            version: info.version,
            revision: info.revision,
            revision_time: info.revision_time,
            last_modified: info.last_modified,
        })
        .collect::<Vec<_>>();
    if runtime.json {
        print_json(&rows)?;
    } else {
        for (index, row) in rows.iter().enumerate() {
            if index > 0 {
                println!();
            }
            println!("name: {}", row.name);
            println!("local_path: {}", row.local_path);
            println!("branch: {}", or_none(row.branch.as_deref()));
            println!("version: {}", or_none(row.version.as_deref()));
            println!("revision: {}", or_none(row.revision.as_deref()));
            println!(
                "revision_time: {}",
                row.revision_time
                    .map(|time| time.to_rfc3339())
                    .unwrap_or_else(|| "<none>".to_string())
            );
            println!("last_modified: {}", row.last_modified.to_rfc3339());
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_local_settings(runtime: &RuntimeOptions, args: InstallationArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime, None)?;
    let settings_path = resolve_local_settings_path(
        args.path.as_deref().unwrap_or(paths.installation_root.as_path()),
    );
    let filter = args.list.kind.as_kind();
    let references = parse_local_settings(&settings_path, &CancellationToken::new())?;

    let rows = references
        .into_iter()
        .filter(|reference| filter.admits(reference.name.kind()))
        .map(|reference| ReferenceRow {
            name: display_name(&reference.name, args.list.bare_name),
            kind: reference.name.kind(),
            line_number: reference.line_number,
            local_path: normalize_for_display(&reference.local_path),
        })
        .collect::<Vec<_>>();
    if runtime.json {
        print_json(&rows)?;
    } else {
        for (index, row) in rows.iter().enumerate() {
            if index > 0 {
                println!();
            }
            println!("name: {}", row.name);
            println!("line: {}", row.line_number);
            println!("local_path: {}", row.local_path);
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_branch(runtime: &RuntimeOptions, args: BranchArgs) -> Result<()> {
    let names = args
        .names
        .iter()
        .map(|name| ExtensionName::parse(name))
        .collect::<Result<Vec<_>, _>>()?;
    let paths = resolve_runtime_paths(runtime, None)?;
    let client = registry_client(&paths)?;
    let options = ResolverOptions {
        branches: args.branches,
        all_branches: args.all_branches,
        suppress_redirect: args.suppress_redirect,
        ..ResolverOptions::default()
    };

    let task = spawn_resolution(client, options, names);
    let mut stdout = io::stdout().lock();
    let mut rows = Vec::new();
    let mut output_closed = false;
    for event in task.events() {
        match event {
            ResolutionEvent::Branch(branch) => {
                let row = BranchRow {
                    name: branch.extension_name.to_string(),
                    branch: branch.branch_name,
                    url: branch.download_url,
                };
                if !runtime.json {
                    if let Err(error) = write_branch_row(&mut stdout, &row, !rows.is_empty()) {
                        // Nobody reads the rest, so stop querying the registry.
                        tracing::debug!("stopping branch resolution: {error}");
                        task.cancel();
                        output_closed = true;
                        break;
                    }
                }
                rows.push(row);
            }
            ResolutionEvent::Warning(warning) => eprintln!("warning: {warning}"),
            ResolutionEvent::Redirected { from, to } => {
                eprintln!("warning: Redirected {from} to {to}.");
            }
        }
    }
    drop(stdout);
    if output_closed {
        return match task.join() {
            Err(error) if !is_cancelled(&error) => Err(error),
            _ => Ok(()),
        };
    }
    let stats = task.join()?;
    tracing::debug!(
        "resolved {} names in {} batches: {} branches, {} warnings, {} redirects",
        stats.names,
        stats.batches,
        stats.branches,
        stats.warnings,
        stats.redirects
    );

    if runtime.json {
        print_json(&rows)?;
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_site_info(runtime: &RuntimeOptions, args: SiteInfoArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime, args.path.as_deref())?;
    let installation = MediaWikiInstallation::open(&paths.installation_root)?;
    let info = installation.site_info(&CancellationToken::new())?;

    let row = SiteInfoRow {
        root: normalize_for_display(installation.root()),
        site_name: info.site_name,
        version: info.version,
    };
    if runtime.json {
        print_json(&row)?;
    } else {
        println!("root: {}", row.root);
        println!("site_name: {}", or_none(row.site_name.as_deref()));
        println!("version: {}", or_none(row.version.as_deref()));
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn registry_client(paths: &ResolvedPaths) -> Result<MediaWikiClient> {
    let config = load_config(&paths.config_path)?;
    let client = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config.registry))?;
    tracing::debug!("registry: {}", client.api_url());
    Ok(client)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions, root: Option<&Path>) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        installation_root: root.map(Path::to_path_buf),
        config: runtime.config.clone(),
    };
    resolve_paths(&context, &overrides).context("failed to resolve runtime paths")
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if !runtime.diagnostics {
        return;
    }
    let status = inspect_runtime(paths);
    eprintln!("\n[diagnostics]\n{}", paths.diagnostics());
    eprintln!(
        "installation_root_valid: {}",
        format_flag(status.installation_root_valid)
    );
    eprintln!(
        "local_settings_exists: {}",
        format_flag(status.local_settings_exists)
    );
    eprintln!("config_exists: {}", format_flag(status.config_exists));
    for warning in &status.warnings {
        eprintln!("warning: {warning}");
    }
}

fn write_branch_row(out: &mut impl Write, row: &BranchRow, separate: bool) -> io::Result<()> {
    if separate {
        writeln!(out)?;
    }
    writeln!(out, "name: {}", row.name)?;
    writeln!(out, "branch: {}", row.branch)?;
    writeln!(out, "url: {}", row.url)?;
    out.flush()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn display_name(name: &ExtensionName, bare: bool) -> String {
    if bare {
        name.name().to_string()
    } else {
        name.to_string()
    }
}

fn or_none(value: Option<&str>) -> &str {
    value.unwrap_or("<none>")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
