use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, SyncPhase,
};
use crate::orchestration::CancellationToken;
use crate::providers::http::HttpClient;
use crate::providers::{
    CatalogBatch, CatalogProvider, FetchSummary, ProgressSink, compare_versions, now_unix,
    send_batch,
};

pub const SPARSE_INDEX_BASE: &str = "https://index.crates.io";
pub const CRATES_IO_API_BASE: &str = "https://crates.io/api/v1";
const SEARCH_PER_PAGE: u32 = 100;
const DEFAULT_BULK_LIMIT: usize = 1_000;

/// Map a crate name to its sparse-index path: `1/`, `2/`, `3/<first>/`,
/// `<first2>/<next2>/` depending on name length.
pub fn sparse_index_prefix(crate_name: &str) -> String {
    let name = crate_name.to_lowercase();
    match name.len() {
        0 => name,
        1 => format!("1/{name}"),
        2 => format!("2/{name}"),
        3 => format!("3/{}/{name}", &name[..1]),
        _ => format!("{}/{}/{name}", &name[..2], &name[2..4]),
    }
}

/// Raw access to the sparse index and the crates.io search API.
#[async_trait]
pub trait CargoIndexSource: Send + Sync {
    /// NDJSON index file for a crate, `None` when the crate does not exist.
    async fn index_file(&self, prefix_path: &str) -> CoreResult<Option<String>>;

    async fn search(&self, query: &str, per_page: u32) -> CoreResult<String>;
}

pub struct HttpCargoIndexSource {
    client: Arc<HttpClient>,
    index_base: String,
    api_base: String,
}

impl HttpCargoIndexSource {
    pub fn new(
        client: Arc<HttpClient>,
        index_base: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            index_base: index_base.into(),
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl CargoIndexSource for HttpCargoIndexSource {
    async fn index_file(&self, prefix_path: &str) -> CoreResult<Option<String>> {
        let url = format!("{}/{prefix_path}", self.index_base);
        self.client.get_text_optional(Manager::Cargo, &url).await
    }

    async fn search(&self, query: &str, per_page: u32) -> CoreResult<String> {
        let url = format!("{}/crates?q={query}&per_page={per_page}", self.api_base);
        self.client.get_text(Manager::Cargo, &url).await
    }
}

/// Lazy provider over crates.io: a bounded popular set via the search API,
/// per-crate detail from the sparse index.
pub struct CargoProvider {
    source: Arc<dyn CargoIndexSource>,
    keywords: Vec<String>,
    bulk_limit: usize,
}

impl CargoProvider {
    pub fn new(source: Arc<dyn CargoIndexSource>, keywords: Vec<String>) -> Self {
        Self {
            source,
            keywords,
            bulk_limit: DEFAULT_BULK_LIMIT,
        }
    }

    pub fn with_bulk_limit(mut self, bulk_limit: usize) -> Self {
        self.bulk_limit = bulk_limit;
        self
    }
}

#[async_trait]
impl CatalogProvider for CargoProvider {
    fn manager(&self) -> Manager {
        Manager::Cargo
    }

    async fn fetch_all(
        &self,
        sink: mpsc::Sender<CatalogBatch>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<FetchSummary> {
        let mut summary = FetchSummary::default();
        let mut seen: HashSet<String> = HashSet::new();

        for (index, keyword) in self.keywords.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            if summary.records as usize >= self.bulk_limit {
                break;
            }

            progress.emit(
                SyncPhase::Fetching,
                summary.records,
                Some(self.bulk_limit as u64),
                &format!(
                    "searching crates.io for '{keyword}' ({}/{})",
                    index + 1,
                    self.keywords.len()
                ),
            );

            let body = self.source.search(keyword, SEARCH_PER_PAGE).await?;
            let (mut records, failures) = parse_search_results(&body)?;
            summary.parse_failures += failures;

            records.retain(|record| seen.insert(record.package_id.clone()));
            let room = self.bulk_limit - summary.records as usize;
            records.truncate(room);
            summary.records += records.len() as u64;

            send_batch(
                Manager::Cargo,
                &sink,
                CatalogBatch {
                    records,
                    versions: Vec::new(),
                },
            )
            .await?;
        }

        debug!(records = summary.records, "cargo popular set assembled");
        Ok(summary)
    }

    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>> {
        let prefix = sparse_index_prefix(package_id);
        let Some(body) = self.source.index_file(&prefix).await? else {
            return Ok(None);
        };
        Ok(parse_index_file(package_id, &body))
    }

    /// crates.io is searched on demand; never auto-refreshed.
    fn is_stale(&self, _last_sync_finished_at: Option<i64>, _now: i64) -> bool {
        false
    }
}

fn cancelled() -> CoreError {
    CoreError::for_manager(
        Manager::Cargo,
        CoreErrorKind::Cancelled,
        "cargo sync cancelled",
    )
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    crates: Vec<SearchCrate>,
}

#[derive(Debug, Deserialize)]
struct SearchCrate {
    name: Option<String>,
    max_version: Option<String>,
    description: Option<String>,
    homepage: Option<String>,
    repository: Option<String>,
}

fn parse_search_results(body: &str) -> CoreResult<(Vec<PackageRecord>, u64)> {
    let envelope: SearchEnvelope = serde_json::from_str(body).map_err(|error| {
        CoreError::for_manager(
            Manager::Cargo,
            CoreErrorKind::ProviderParse,
            format!("malformed crates.io search response: {error}"),
        )
    })?;

    let mut records = Vec::new();
    let mut failures = 0u64;

    for entry in envelope.crates {
        let (Some(name), Some(version)) = (entry.name, entry.max_version) else {
            failures += 1;
            warn!("dropping crates.io search hit without name or version");
            continue;
        };
        let mut record = PackageRecord::new(Manager::Cargo, name.clone(), name, version);
        record.description = entry.description.filter(|text| !text.trim().is_empty());
        record.homepage = entry.homepage.or(entry.repository);
        record.last_seen_at = Some(now_unix());
        record.regenerate_search_tokens();
        records.push(record);
    }

    Ok((records, failures))
}

#[derive(Debug, Deserialize)]
struct IndexLine {
    name: Option<String>,
    vers: Option<String>,
    #[serde(default)]
    yanked: bool,
    #[serde(default)]
    features: std::collections::BTreeMap<String, serde_json::Value>,
}

/// One line per published version; yanked versions are filtered and the
/// highest surviving version wins.
fn parse_index_file(package_id: &str, body: &str) -> Option<PackageRecord> {
    let mut best: Option<IndexLine> = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<IndexLine>(line) else {
            warn!(package_id, "skipping malformed sparse index line");
            continue;
        };
        if parsed.yanked || parsed.vers.is_none() {
            continue;
        }

        best = match best {
            None => Some(parsed),
            Some(current) => {
                let current_version = current.vers.as_deref().unwrap_or_default();
                let candidate_version = parsed.vers.as_deref().unwrap_or_default();
                if compare_versions(candidate_version, current_version)
                    == std::cmp::Ordering::Greater
                {
                    Some(parsed)
                } else {
                    Some(current)
                }
            }
        };
    }

    let best = best?;
    let name = best.name.unwrap_or_else(|| package_id.to_string());
    let version = best.vers.unwrap_or_default();

    let mut record = PackageRecord::new(Manager::Cargo, name.clone(), name, version);
    record.tags = best.features.keys().cloned().collect();
    record.last_seen_at = Some(now_unix());
    record.regenerate_search_tokens();
    Some(record)
}
