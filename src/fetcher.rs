//! Batched ingestion of proxy lists from external sources.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyEndpoint, SourceTag};

/// How a source's response body is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// One `host:port` or `scheme://host:port` per line; `#` comments.
    PlainText,
    /// Rows of `host, port[, scheme[, country]]`.
    Csv,
    /// An array of `"host:port"` strings or objects with `host`/`port`
    /// (optional `scheme`, `country`).
    Json,
    /// Rows matched by a CSS selector; cell texts yield host and port.
    /// Sources that need browser rendering carry a hint the core ignores.
    HtmlTable { selector: String },
}

/// A named external proxy-list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSource {
    pub name: String,
    pub url: String,
    pub format: SourceFormat,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_source_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_source_retries")]
    pub retries: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_source_retries() -> u32 {
    2
}

impl FetchSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, format: SourceFormat) -> Self {
        FetchSource {
            name: name.into(),
            url: url.into(),
            format,
            headers: Vec::new(),
            enabled: true,
            timeout: default_source_timeout(),
            retries: default_source_retries(),
        }
    }
}

/// A candidate scraped from a source, before validation.
#[derive(Debug, Clone)]
pub struct ProxyCandidate {
    pub endpoint: ProxyEndpoint,
    pub country_code: Option<String>,
    pub source: String,
}

impl ProxyCandidate {
    /// Materialize a pool entry tagged with its origin.
    pub fn into_proxy(self) -> Proxy {
        let mut proxy =
            Proxy::new(self.endpoint).with_source(SourceTag::Fetched(self.source));
        proxy.country_code = self.country_code;
        proxy
    }
}

/// Latest outcome of one source, kept for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub fetched_at: DateTime<Utc>,
    pub candidates: usize,
    pub error: Option<String>,
}

/// Pulls proxy lists from all enabled sources, concurrently, with
/// per-source timeout and retry. One broken source never fails the batch.
pub struct Fetcher {
    sources: Vec<FetchSource>,
    client: reqwest::Client,
    outcomes: RwLock<HashMap<String, SourceOutcome>>,
}

impl Fetcher {
    pub fn new(sources: Vec<FetchSource>) -> Self {
        Fetcher {
            sources,
            client: reqwest::Client::new(),
            outcomes: RwLock::new(HashMap::new()),
        }
    }

    /// Query all enabled sources and return the deduplicated candidate
    /// batch. Dedup key is `(host, port)`; the first occurrence wins and
    /// keeps its source annotation.
    pub async fn fetch_all(&self) -> Vec<ProxyCandidate> {
        let enabled: Vec<&FetchSource> = self.sources.iter().filter(|s| s.enabled).collect();
        info!("Fetching proxies from {} sources", enabled.len());

        let batches = future::join_all(
            enabled
                .iter()
                .map(|source| self.fetch_source_with_retry(source)),
        )
        .await;

        let mut seen: HashSet<(String, u16)> = HashSet::new();
        let mut candidates = Vec::new();
        for (source, batch) in enabled.iter().zip(batches) {
            match batch {
                Ok(list) => {
                    info!("Fetched {} candidates from {}", list.len(), source.name);
                    self.record_outcome(&source.name, list.len(), None);
                    for candidate in list {
                        let key = (
                            candidate.endpoint.host.clone(),
                            candidate.endpoint.port,
                        );
                        if seen.insert(key) {
                            candidates.push(candidate);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", source.name, e);
                    self.record_outcome(&source.name, 0, Some(e.to_string()));
                }
            }
        }
        info!("Found {} unique candidates across sources", candidates.len());
        candidates
    }

    /// Latest per-source outcomes.
    pub fn source_outcomes(&self) -> HashMap<String, SourceOutcome> {
        self.outcomes.read().clone()
    }

    fn record_outcome(&self, name: &str, candidates: usize, error: Option<String>) {
        self.outcomes.write().insert(
            name.to_string(),
            SourceOutcome {
                fetched_at: Utc::now(),
                candidates,
                error,
            },
        );
    }

    async fn fetch_source_with_retry(&self, source: &FetchSource) -> Result<Vec<ProxyCandidate>> {
        let mut backoff = Duration::from_millis(250);
        let mut last_err = None;
        for attempt in 0..=source.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.fetch_source_once(source).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) => {
                    debug!(
                        "Source {} attempt {} failed: {}",
                        source.name,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::ValidationError(format!("source {} failed without detail", source.name))
        }))
    }

    async fn fetch_source_once(&self, source: &FetchSource) -> Result<Vec<ProxyCandidate>> {
        let mut request = self.client.get(&source.url).timeout(source.timeout);
        for (name, value) in &source.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ValidationError(format!("{}: {e}", source.name)))?;
        if !response.status().is_success() {
            return Err(Error::ValidationError(format!(
                "{}: status {}",
                source.name,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::ValidationError(format!("{}: {e}", source.name)))?;

        Ok(parse_body(&body, &source.format, &source.name))
    }
}

/// Parse a response body into candidates; entries that do not parse are
/// skipped rather than failing the source.
pub(crate) fn parse_body(
    body: &str,
    format: &SourceFormat,
    source_name: &str,
) -> Vec<ProxyCandidate> {
    match format {
        SourceFormat::PlainText => parse_plain_text(body, source_name),
        SourceFormat::Csv => parse_csv(body, source_name),
        SourceFormat::Json => parse_json(body, source_name),
        SourceFormat::HtmlTable { selector } => parse_html_table(body, selector, source_name),
    }
}

fn parse_plain_text(body: &str, source_name: &str) -> Vec<ProxyCandidate> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            ProxyEndpoint::parse(line).ok().map(|endpoint| ProxyCandidate {
                endpoint,
                country_code: None,
                source: source_name.to_string(),
            })
        })
        .collect()
}

fn parse_csv(body: &str, source_name: &str) -> Vec<ProxyCandidate> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut candidates = Vec::new();
    for record in reader.records().flatten() {
        let host = match record.get(0) {
            Some(host) if !host.is_empty() => host,
            _ => continue,
        };
        // A non-numeric port also skips header rows.
        let port: u16 = match record.get(1).and_then(|p| p.parse().ok()) {
            Some(port) => port,
            None => continue,
        };
        let scheme = record
            .get(2)
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::proxy::ProxyScheme::Http);
        let country = record
            .get(3)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        candidates.push(ProxyCandidate {
            endpoint: ProxyEndpoint::new(scheme, host, port),
            country_code: country,
            source: source_name.to_string(),
        });
    }
    candidates
}

fn parse_json(body: &str, source_name: &str) -> Vec<ProxyCandidate> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    let items = match value.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            if let Some(text) = item.as_str() {
                return ProxyEndpoint::parse(text).ok().map(|endpoint| ProxyCandidate {
                    endpoint,
                    country_code: None,
                    source: source_name.to_string(),
                });
            }
            let object = item.as_object()?;
            let host = object.get("host")?.as_str()?;
            let port = object.get("port")?.as_u64()?;
            if port == 0 || port > u16::MAX as u64 {
                return None;
            }
            let scheme = object
                .get("scheme")
                .and_then(|s| s.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(crate::proxy::ProxyScheme::Http);
            let country = object
                .get("country")
                .or_else(|| object.get("country_code"))
                .and_then(|c| c.as_str())
                .map(str::to_string);

            Some(ProxyCandidate {
                endpoint: ProxyEndpoint::new(scheme, host, port as u16),
                country_code: country,
                source: source_name.to_string(),
            })
        })
        .collect()
}

fn parse_html_table(body: &str, selector: &str, source_name: &str) -> Vec<ProxyCandidate> {
    let document = scraper::Html::parse_document(body);
    let row_selector = match scraper::Selector::parse(selector) {
        Ok(sel) => sel,
        Err(e) => {
            warn!("Bad CSS selector {selector:?} for {source_name}: {e}");
            return Vec::new();
        }
    };
    let cell_selector = match scraper::Selector::parse("td") {
        Ok(sel) => sel,
        Err(_) => return Vec::new(),
    };

    document
        .select(&row_selector)
        .filter_map(|row| {
            let cells: Vec<String> = row
                .select(&cell_selector)
                .map(|cell| cell.text().collect::<String>().trim().to_string())
                .collect();

            let endpoint = if cells.len() >= 2 {
                let port: u16 = cells[1].parse().ok()?;
                Some(ProxyEndpoint::new(
                    crate::proxy::ProxyScheme::Http,
                    cells[0].clone(),
                    port,
                ))
            } else {
                let text = row.text().collect::<String>();
                ProxyEndpoint::parse(text.trim()).ok()
            }?;

            Some(ProxyCandidate {
                endpoint,
                country_code: cells.get(2).filter(|c| c.len() == 2).cloned(),
                source: source_name.to_string(),
            })
        })
        .collect()
}
