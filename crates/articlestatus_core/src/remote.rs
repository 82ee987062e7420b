use std::collections::{BTreeMap, HashMap};
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::catalog::Wiki;
use crate::config::{StatusConfig, resolve_number};

/// Hard per-request limit of the MediaWiki query API for non-bot clients.
const API_BATCH_LIMIT: usize = 50;

/// Current remote metadata for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteRecord {
    pub mw_page_id: i64,
    pub title: String,
    pub namespace: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleQuery {
    pub title: String,
    pub namespace: i32,
}

/// Batched page metadata lookups against one remote wiki.
///
/// `Err` means the call failed as a whole and carries no usable data; pages that
/// do not exist are simply absent from an `Ok` result.
pub trait RemoteLookup {
    fn get_by_page_ids(&mut self, wiki: &Wiki, page_ids: &[i64]) -> Result<Vec<RemoteRecord>>;
    fn get_by_titles(&mut self, wiki: &Wiki, queries: &[TitleQuery]) -> Result<Vec<RemoteRecord>>;
    /// Logical requests issued so far. Retries of one request count once.
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiLookupConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiLookupConfig {
    pub fn from_config(config: &StatusConfig) -> Result<Self> {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    pub(crate) fn from_config_with_lookup<F>(config: &StatusConfig, lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote = &config.remote;
        Ok(Self {
            user_agent: config.user_agent_with_lookup(&lookup_env),
            timeout_ms: resolve_number(
                &lookup_env,
                "WIKI_HTTP_TIMEOUT_MS",
                remote.timeout_ms,
                30_000,
            )?,
            rate_limit_ms: resolve_number(
                &lookup_env,
                "WIKI_RATE_LIMIT_READ",
                remote.rate_limit_ms,
                300,
            )?,
            max_retries: resolve_number(&lookup_env, "WIKI_HTTP_RETRIES", remote.max_retries, 2)?,
            retry_delay_ms: resolve_number(
                &lookup_env,
                "WIKI_HTTP_RETRY_DELAY_MS",
                remote.retry_delay_ms,
                500,
            )?,
        })
    }
}

/// Blocking MediaWiki API client. Not shared between threads; each worker owns one.
pub struct MediaWikiLookup {
    client: Client,
    config: MediaWikiLookupConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    namespace_names: HashMap<i64, BTreeMap<i32, String>>,
}

impl MediaWikiLookup {
    pub fn new(config: MediaWikiLookupConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            namespace_names: HashMap::new(),
        })
    }

    fn request_json_get(&mut self, api_url: &str, params: &[(&str, String)]) -> Result<Value> {
        let base_url =
            Url::parse(api_url).with_context(|| format!("invalid wiki api_url: {api_url}"))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        self.request_count += 1;
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
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
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

    fn namespace_names(&mut self, wiki: &Wiki) -> Result<&BTreeMap<i32, String>> {
        if !self.namespace_names.contains_key(&wiki.id) {
            let response = self.request_json_get(
                &wiki.api_url,
                &[
                    ("action", "query".to_string()),
                    ("meta", "siteinfo".to_string()),
                    ("siprop", "namespaces".to_string()),
                ],
            )?;
            let names = parse_namespace_names(response)
                .with_context(|| format!("failed to decode namespaces for {}", wiki.domain))?;
            self.namespace_names.insert(wiki.id, names);
        }
        self.namespace_names
            .get(&wiki.id)
            .ok_or_else(|| anyhow::anyhow!("namespace cache missing for {}", wiki.domain))
    }
}

impl RemoteLookup for MediaWikiLookup {
    fn get_by_page_ids(&mut self, wiki: &Wiki, page_ids: &[i64]) -> Result<Vec<RemoteRecord>> {
        let mut records = Vec::new();
        for batch in page_ids.chunks(API_BATCH_LIMIT) {
            let ids = batch
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let response = self.request_json_get(
                &wiki.api_url,
                &[("action", "query".to_string()), ("pageids", ids)],
            )?;
            records.extend(parse_page_records(response)?);
        }
        Ok(records)
    }

    fn get_by_titles(&mut self, wiki: &Wiki, queries: &[TitleQuery]) -> Result<Vec<RemoteRecord>> {
        let names = self.namespace_names(wiki)?.clone();
        let mut full_titles = Vec::with_capacity(queries.len());
        for query in queries {
            match prefixed_title(&names, query) {
                Some(title) => full_titles.push(title),
                None => debug!(
                    wiki = %wiki.domain,
                    namespace = query.namespace,
                    title = %query.title,
                    "namespace unknown to remote wiki; skipping title lookup"
                ),
            }
        }

        let mut records = Vec::new();
        for batch in full_titles.chunks(API_BATCH_LIMIT) {
            let response = self.request_json_get(
                &wiki.api_url,
                &[("action", "query".to_string()), ("titles", batch.join("|"))],
            )?;
            records.extend(parse_page_records(response)?);
        }
        Ok(records)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn prefixed_title(names: &BTreeMap<i32, String>, query: &TitleQuery) -> Option<String> {
    if query.namespace == 0 {
        return Some(query.title.clone());
    }
    names
        .get(&query.namespace)
        .filter(|name| !name.is_empty())
        .map(|name| format!("{name}:{}", query.title))
}

/// Existing pages from an `action=query` response; missing and invalid entries are dropped.
fn parse_page_records(response: Value) -> Result<Vec<RemoteRecord>> {
    let parsed: QueryResponse =
        serde_json::from_value(response).context("failed to decode page query response")?;
    let mut records = Vec::new();
    for page in parsed.query.pages {
        if page.missing || page.invalid {
            continue;
        }
        let (Some(page_id), Some(namespace), Some(title)) = (page.pageid, page.ns, page.title)
        else {
            continue;
        };
        records.push(RemoteRecord {
            mw_page_id: page_id,
            title: strip_namespace_prefix(&title, namespace),
            namespace,
        });
    }
    Ok(records)
}

fn parse_namespace_names(response: Value) -> Result<BTreeMap<i32, String>> {
    let parsed: SiteInfoResponse =
        serde_json::from_value(response).context("failed to decode siteinfo response")?;
    Ok(parsed
        .query
        .namespaces
        .into_values()
        .map(|namespace| (namespace.id, namespace.name))
        .collect())
}

fn strip_namespace_prefix(title: &str, namespace: i32) -> String {
    if namespace == 0 {
        return title.to_string();
    }
    match title.split_once(':') {
        Some((_, rest)) => rest.to_string(),
        None => title.to_string(),
    }
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
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    ns: Option<i32>,
    title: Option<String>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
}

#[derive(Debug, Deserialize, Default)]
struct SiteInfoResponse {
    #[serde(default)]
    query: SiteInfoPayload,
}

#[derive(Debug, Deserialize, Default)]
struct SiteInfoPayload {
    #[serde(default)]
    namespaces: BTreeMap<String, NamespaceItem>,
}

#[derive(Debug, Deserialize)]
struct NamespaceItem {
    id: i32,
    #[serde(default)]
    name: String,
}
