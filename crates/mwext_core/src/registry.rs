use std::collections::HashMap;
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::name::{ExtensionKind, ExtensionName};

pub const DEFAULT_API_URL: &str = "https://www.mediawiki.org/w/api.php";

const PAGE_BATCH_SIZE: usize = 50;

/// One downloadable version line of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionBranch {
    pub extension_name: ExtensionName,
    pub branch_name: String,
    pub download_url: String,
}

/// Every branch the registry knows for one package, in registry order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageBranches {
    pub name: ExtensionName,
    pub branches: Vec<ExtensionBranch>,
}

impl PackageBranches {
    pub fn branch_names(&self) -> Vec<&str> {
        self.branches
            .iter()
            .map(|branch| branch.branch_name.as_str())
            .collect()
    }
}

/// Content of a documentation page, keyed by the title that was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub requested_title: String,
    pub title: String,
    pub exists: bool,
    pub content: String,
}

pub trait RegistryApi {
    fn get_known_extensions(&mut self) -> Result<Vec<ExtensionName>>;
    /// Branches for `names`; Unknown-kind names are asked for as both kinds.
    fn get_extension_branches(&mut self, names: &[ExtensionName]) -> Result<Vec<PackageBranches>>;
    /// One entry per requested title, in request order. Wiki redirects are
    /// followed.
    fn get_page_contents(&mut self, titles: &[String]) -> Result<Vec<RemotePage>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    /// Settings from the config file, overridden by `MWEXT_*` environment
    /// variables.
    pub fn from_config(config: &crate::config::RegistryConfig) -> Self {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &crate::config::RegistryConfig, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            api_url: env_value(&lookup_env, "MWEXT_API_URL", &config.api_url()),
            user_agent: env_value(&lookup_env, "MWEXT_USER_AGENT", &config.user_agent()),
            timeout_ms: env_value_parsed(&lookup_env, "MWEXT_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_parsed(&lookup_env, "MWEXT_RATE_LIMIT_READ", 300),
            max_retries: env_value_parsed(&lookup_env, "MWEXT_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_parsed(&lookup_env, "MWEXT_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

/// Session with the registry wiki. Construct once and lend it to whatever
/// needs network access.
pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build registry HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid registry API URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("registry API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode registry API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("registry API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call registry API");
                }
            }
        }

        bail!("registry API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_read_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl RegistryApi for MediaWikiClient {
    fn get_known_extensions(&mut self) -> Result<Vec<ExtensionName>> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("list", "extdistrepos".to_string()),
        ])?;
        parse_known_extensions(&response)
    }

    fn get_extension_branches(&mut self, names: &[ExtensionName]) -> Result<Vec<PackageBranches>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("list", "extdistbranches".to_string()),
            ("edbexts", join_names(names, ExtensionKind::Extension)),
            ("edbskins", join_names(names, ExtensionKind::Skin)),
        ])?;
        parse_extension_branches(&response)
    }

    fn get_page_contents(&mut self, titles: &[String]) -> Result<Vec<RemotePage>> {
        let mut pages = Vec::with_capacity(titles.len());
        for batch in titles.chunks(PAGE_BATCH_SIZE) {
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", batch.join("|")),
                ("prop", "revisions".to_string()),
                ("rvprop", "content".to_string()),
                ("rvslots", "main".to_string()),
                ("redirects", "1".to_string()),
            ])?;
            pages.extend(parse_page_contents(&response, batch)?);
        }
        Ok(pages)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn join_names(names: &[ExtensionName], kind: ExtensionKind) -> String {
    names
        .iter()
        .filter(|name| name.kind().admits(kind))
        .map(ExtensionName::name)
        .collect::<Vec<_>>()
        .join("|")
}

pub(crate) fn parse_known_extensions(response: &Value) -> Result<Vec<ExtensionName>> {
    let parsed: RepoListResponse =
        serde_json::from_value(response.clone()).context("failed to decode extdistrepos response")?;
    let repos = parsed.query.extdistrepos;
    let mut names = Vec::with_capacity(repos.extensions.len() + repos.skins.len());
    for name in repos.extensions {
        names.push(ExtensionName::new(name, ExtensionKind::Extension)?);
    }
    for name in repos.skins {
        names.push(ExtensionName::new(name, ExtensionKind::Skin)?);
    }
    Ok(names)
}

/// Keeps the order of the response object, which requires `serde_json`'s
/// `preserve_order` feature.
pub(crate) fn parse_extension_branches(response: &Value) -> Result<Vec<PackageBranches>> {
    let Some(node) = response.pointer("/query/extdistbranches") else {
        bail!("extdistbranches missing from registry response");
    };

    let mut packages = Vec::new();
    for (field, kind) in [
        ("extensions", ExtensionKind::Extension),
        ("skins", ExtensionKind::Skin),
    ] {
        let Some(entries) = node.get(field).and_then(Value::as_object) else {
            continue;
        };
        for (package, branch_map) in entries {
            let name = ExtensionName::new(package.clone(), kind)?;
            let branches = branch_map
                .as_object()
                .map(|map| {
                    map.iter()
                        .filter_map(|(branch_name, url)| {
                            url.as_str().map(|url| ExtensionBranch {
                                extension_name: name.clone(),
                                branch_name: branch_name.clone(),
                                download_url: url.to_string(),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            packages.push(PackageBranches { name, branches });
        }
    }
    Ok(packages)
}

pub(crate) fn parse_page_contents(response: &Value, requested: &[String]) -> Result<Vec<RemotePage>> {
    let parsed: PageQueryResponse =
        serde_json::from_value(response.clone()).context("failed to decode page content response")?;
    let query = parsed.query;

    let renames = query
        .normalized
        .iter()
        .chain(query.redirects.iter())
        .map(|mapping| (mapping.from.as_str(), mapping.to.as_str()))
        .collect::<HashMap<_, _>>();
    let pages = query
        .pages
        .iter()
        .map(|page| (page.title.as_str(), page))
        .collect::<HashMap<_, _>>();

    let mut output = Vec::with_capacity(requested.len());
    for requested_title in requested {
        let mut title = requested_title.as_str();
        // Normalization then at most one redirect hop; the bound stops cycles.
        for _ in 0..4 {
            match renames.get(title) {
                Some(next) if *next != title => title = *next,
                _ => break,
            }
        }
        let page = pages.get(title);
        let content = page
            .and_then(|page| page.revisions.first())
            .and_then(|revision| revision.slots.as_ref())
            .and_then(|slots| slots.main.as_ref())
            .map(|slot| slot.content.clone());
        let exists = page
            .is_some_and(|page| !page.missing.unwrap_or(false) && !page.invalid.unwrap_or(false));
        output.push(RemotePage {
            requested_title: requested_title.clone(),
            title: title.to_string(),
            exists: exists && content.is_some(),
            content: content.unwrap_or_default(),
        });
    }
    Ok(output)
}

fn env_value<F>(lookup_env: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key).unwrap_or_else(|| default.to_string())
}

fn env_value_parsed<F, T>(lookup_env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup_env(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct RepoListResponse {
    #[serde(default)]
    query: RepoListQuery,
}

#[derive(Debug, Deserialize, Default)]
struct RepoListQuery {
    #[serde(default)]
    extdistrepos: RepoListPayload,
}

#[derive(Debug, Deserialize, Default)]
struct RepoListPayload {
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    skins: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryResponse {
    #[serde(default)]
    query: PageQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryPayload {
    #[serde(default)]
    normalized: Vec<TitleMapping>,
    #[serde(default)]
    redirects: Vec<TitleMapping>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct TitleMapping {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}
