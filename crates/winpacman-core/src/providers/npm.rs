use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, SyncPhase,
};
use crate::orchestration::CancellationToken;
use crate::providers::http::HttpClient;
use crate::providers::{
    CatalogBatch, CatalogProvider, FetchSummary, ProgressSink, now_unix, send_batch,
};

pub const REGISTRY_BASE: &str = "https://registry.npmjs.org";
const SEARCH_PAGE_SIZE: u32 = 250;
const DEFAULT_BULK_LIMIT: usize = 1_000;

/// Raw npm registry access. Tests hand back canned JSON.
#[async_trait]
pub trait NpmApi: Send + Sync {
    async fn search(&self, keyword: &str, size: u32) -> CoreResult<String>;

    async fn details(&self, name: &str) -> CoreResult<Option<String>>;
}

pub struct HttpNpmApi {
    client: Arc<HttpClient>,
    registry_base: String,
}

impl HttpNpmApi {
    pub fn new(client: Arc<HttpClient>, registry_base: impl Into<String>) -> Self {
        Self {
            client,
            registry_base: registry_base.into(),
        }
    }
}

#[async_trait]
impl NpmApi for HttpNpmApi {
    async fn search(&self, keyword: &str, size: u32) -> CoreResult<String> {
        let url = format!(
            "{}/-/v1/search?text={}&size={size}",
            self.registry_base,
            urlencode(keyword)
        );
        self.client.get_text(Manager::Npm, &url).await
    }

    async fn details(&self, name: &str) -> CoreResult<Option<String>> {
        let url = format!("{}/{}", self.registry_base, urlencode(name));
        self.client.get_text_optional(Manager::Npm, &url).await
    }
}

/// Lazy provider: the registry holds millions of packages and is never
/// mirrored. `fetch_all` assembles a bounded popular set from keyword
/// searches; details come per package.
pub struct NpmProvider {
    api: Arc<dyn NpmApi>,
    keywords: Vec<String>,
    bulk_limit: usize,
}

impl NpmProvider {
    pub fn new(api: Arc<dyn NpmApi>, keywords: Vec<String>) -> Self {
        Self {
            api,
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
impl CatalogProvider for NpmProvider {
    fn manager(&self) -> Manager {
        Manager::Npm
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
                &format!("searching npm for '{keyword}' ({}/{})", index + 1, self.keywords.len()),
            );

            let body = self.api.search(keyword, SEARCH_PAGE_SIZE).await?;
            let (mut records, failures) = parse_search_results(&body)?;
            summary.parse_failures += failures;

            records.retain(|record| seen.insert(record.package_id.clone()));
            let room = self.bulk_limit - summary.records as usize;
            records.truncate(room);
            summary.records += records.len() as u64;

            send_batch(
                Manager::Npm,
                &sink,
                CatalogBatch {
                    records,
                    versions: Vec::new(),
                },
            )
            .await?;
        }

        debug!(records = summary.records, "npm popular set assembled");
        Ok(summary)
    }

    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>> {
        let Some(body) = self.api.details(package_id).await? else {
            return Ok(None);
        };
        parse_package_details(&body).map(Some)
    }

    /// The npm catalog is assembled on demand only; scheduled refreshes
    /// never consider it stale.
    fn is_stale(&self, _last_sync_finished_at: Option<i64>, _now: i64) -> bool {
        false
    }
}

fn cancelled() -> CoreError {
    CoreError::for_manager(Manager::Npm, CoreErrorKind::Cancelled, "npm sync cancelled")
}

/// `author` and `publisher` arrive as `{name: ...}`, `{username: ...}` or a
/// bare string depending on the endpoint and the package's age.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PersonField {
    Text(String),
    Object {
        name: Option<String>,
        username: Option<String>,
    },
}

impl PersonField {
    fn into_name(self) -> Option<String> {
        match self {
            PersonField::Text(text) => Some(text),
            PersonField::Object { name, username } => name.or(username),
        }
        .filter(|value| !value.trim().is_empty())
    }
}

fn license_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Array(items) => items.first().and_then(license_to_string),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    objects: Vec<SearchObject>,
}

#[derive(Debug, Deserialize)]
struct SearchObject {
    package: Option<SearchPackage>,
}

#[derive(Debug, Deserialize)]
struct SearchPackage {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    /// Occasionally a bare string on old packages instead of a list.
    #[serde(default)]
    keywords: Option<Value>,
    author: Option<PersonField>,
    publisher: Option<PersonField>,
    #[serde(default)]
    maintainers: Vec<PersonField>,
    links: Option<SearchLinks>,
    license: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchLinks {
    homepage: Option<String>,
    repository: Option<String>,
    npm: Option<String>,
}

fn parse_search_results(body: &str) -> CoreResult<(Vec<PackageRecord>, u64)> {
    let envelope: SearchEnvelope = serde_json::from_str(body).map_err(|error| {
        CoreError::for_manager(
            Manager::Npm,
            CoreErrorKind::ProviderParse,
            format!("malformed npm search response: {error}"),
        )
    })?;

    let mut records = Vec::new();
    let mut failures = 0u64;

    for object in envelope.objects {
        let Some(package) = object.package else {
            failures += 1;
            continue;
        };
        let (Some(name), Some(version)) = (package.name, package.version) else {
            failures += 1;
            warn!("dropping npm search hit without name or version");
            continue;
        };

        let author = package
            .author
            .and_then(PersonField::into_name)
            .or_else(|| {
                package
                    .maintainers
                    .into_iter()
                    .next()
                    .and_then(PersonField::into_name)
            });
        let publisher = package
            .publisher
            .and_then(PersonField::into_name)
            .or(author);

        let homepage = package.links.and_then(|links| {
            links.homepage.or(links.repository).or(links.npm)
        });

        let mut record = PackageRecord::new(Manager::Npm, name.clone(), name, version);
        record.description = package.description.filter(|text| !text.trim().is_empty());
        record.publisher = publisher;
        record.homepage = homepage;
        record.license = package.license.as_ref().and_then(license_to_string);
        record.tags = package
            .keywords
            .as_ref()
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        record.last_seen_at = Some(now_unix());
        record.regenerate_search_tokens();
        records.push(record);
    }

    Ok((records, failures))
}

fn parse_package_details(body: &str) -> CoreResult<PackageRecord> {
    let doc: Value = serde_json::from_str(body).map_err(|error| {
        CoreError::for_manager(
            Manager::Npm,
            CoreErrorKind::ProviderParse,
            format!("malformed npm package document: {error}"),
        )
    })?;

    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CoreError::for_manager(
                Manager::Npm,
                CoreErrorKind::ProviderParse,
                "npm package document has no name",
            )
        })?
        .to_string();

    let latest = doc
        .get("dist-tags")
        .and_then(|tags| tags.get("latest"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let latest_doc = doc
        .get("versions")
        .and_then(|versions| versions.get(&latest))
        .cloned()
        .unwrap_or(Value::Null);

    let description = latest_doc
        .get("description")
        .or_else(|| doc.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let author = extract_person(latest_doc.get("author").or_else(|| doc.get("author")))
        .or_else(|| extract_person(doc.get("maintainers").and_then(|m| m.get(0))));

    let homepage = latest_doc
        .get("homepage")
        .or_else(|| doc.get("homepage"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            let repository = doc.get("repository")?;
            match repository {
                Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
                Value::String(url) => Some(url.clone()),
                _ => None,
            }
        });

    let license = latest_doc
        .get("license")
        .or_else(|| doc.get("license"))
        .and_then(license_to_string);

    let keywords = latest_doc
        .get("keywords")
        .or_else(|| doc.get("keywords"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut record = PackageRecord::new(Manager::Npm, name.clone(), name, latest);
    record.description = description;
    record.publisher = author;
    record.homepage = homepage;
    record.license = license;
    record.tags = keywords;
    record.last_seen_at = Some(now_unix());
    record.regenerate_search_tokens();
    Ok(record)
}

fn extract_person(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("username"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
    .filter(|value| !value.trim().is_empty())
}

fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
