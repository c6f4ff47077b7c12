use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, Manager, PackageRecord, SyncPhase,
};
use crate::orchestration::CancellationToken;
use crate::providers::http::HttpClient;
use crate::providers::{
    CatalogBatch, CatalogProvider, FetchSummary, ProgressSink, now_unix, send_batch, stale_by_age,
};

pub const COMMUNITY_FEED_BASE: &str = "https://community.chocolatey.org/api/v2";

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
// Community repository asks for <=10 requests per second.
const PAGE_PACING: Duration = Duration::from_millis(100);

/// Raw access to the OData feed. Production goes through HTTP; tests hand
/// back canned pages.
#[async_trait]
pub trait ChocolateyFeed: Send + Sync {
    async fn fetch_page(&self, url: &str) -> CoreResult<String>;

    /// Optional `/$count` probe used to size progress totals.
    async fn package_count(&self) -> CoreResult<Option<u64>>;
}

pub struct HttpChocolateyFeed {
    client: Arc<HttpClient>,
    base_url: String,
}

impl HttpChocolateyFeed {
    pub fn new(client: Arc<HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ChocolateyFeed for HttpChocolateyFeed {
    async fn fetch_page(&self, url: &str) -> CoreResult<String> {
        self.client.get_text(Manager::Chocolatey, url).await
    }

    async fn package_count(&self) -> CoreResult<Option<u64>> {
        let url = format!(
            "{}/Packages/$count?$filter=IsLatestVersion%20eq%20true",
            self.base_url
        );
        match self.client.get_text(Manager::Chocolatey, &url).await {
            Ok(body) => Ok(body.trim().parse::<u64>().ok()),
            Err(error) => {
                debug!(error = %error, "chocolatey count probe failed, continuing without a total");
                Ok(None)
            }
        }
    }
}

pub struct ChocolateyProvider {
    feed: Arc<dyn ChocolateyFeed>,
    base_url: String,
    max_age: Duration,
}

impl ChocolateyProvider {
    pub fn new(feed: Arc<dyn ChocolateyFeed>, base_url: impl Into<String>) -> Self {
        Self {
            feed,
            base_url: base_url.into(),
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn seed_url(&self) -> String {
        format!(
            "{}/Packages?$filter=IsLatestVersion%20eq%20true&$orderby=Id",
            self.base_url
        )
    }
}

#[async_trait]
impl CatalogProvider for ChocolateyProvider {
    fn manager(&self) -> Manager {
        Manager::Chocolatey
    }

    async fn fetch_all(
        &self,
        sink: mpsc::Sender<CatalogBatch>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> CoreResult<FetchSummary> {
        let total = self.feed.package_count().await?;
        let mut summary = FetchSummary::default();
        let mut url = self.seed_url();
        let mut page_index = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            progress.emit(
                SyncPhase::Fetching,
                summary.records,
                total,
                &format!("fetching page {}", page_index + 1),
            );
            let body = self.feed.fetch_page(&url).await?;

            progress.emit(SyncPhase::Parsing, summary.records, total, "parsing feed page");
            let page = parse_atom_page(&body)?;
            summary.parse_failures += page.parse_failures;

            if !page.records.is_empty() {
                summary.records += page.records.len() as u64;
                send_batch(
                    Manager::Chocolatey,
                    &sink,
                    CatalogBatch {
                        records: page.records,
                        versions: Vec::new(),
                    },
                )
                .await?;
            }

            // Cursor pagination: the feed's next-link is the only way past
            // the `$skip` cap at 10,000, so it is followed exclusively once
            // the first page is in.
            match page.next_link {
                Some(next) => {
                    url = next;
                    page_index += 1;
                    tokio::time::sleep(PAGE_PACING).await;
                }
                None => break,
            }
        }

        debug!(
            records = summary.records,
            parse_failures = summary.parse_failures,
            "chocolatey fetch complete"
        );
        Ok(summary)
    }

    async fn fetch_one(&self, package_id: &str) -> CoreResult<Option<PackageRecord>> {
        let escaped = package_id.replace('\'', "''");
        let url = format!(
            "{}/Packages?$filter=Id%20eq%20'{escaped}'%20and%20IsLatestVersion%20eq%20true",
            self.base_url
        );
        let body = self.feed.fetch_page(&url).await?;
        let page = parse_atom_page(&body)?;
        Ok(page.records.into_iter().next())
    }

    fn is_stale(&self, last_sync_finished_at: Option<i64>, now: i64) -> bool {
        stale_by_age(last_sync_finished_at, now, self.max_age)
    }
}

fn cancelled() -> CoreError {
    CoreError::for_manager(
        Manager::Chocolatey,
        CoreErrorKind::Cancelled,
        "chocolatey sync cancelled",
    )
}

#[derive(Debug, Default)]
pub(crate) struct AtomPage {
    pub records: Vec<PackageRecord>,
    pub next_link: Option<String>,
    pub parse_failures: u64,
}

#[derive(Debug, Default)]
struct RawEntry {
    id: String,
    title: String,
    version: String,
    description: String,
    authors: String,
    project_url: String,
    license_url: String,
    tags: String,
}

/// Parse one page of the NuGet v2 Atom feed: the `<entry>` elements and the
/// feed-level `<link rel="next">`.
pub(crate) fn parse_atom_page(xml: &str) -> CoreResult<AtomPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = AtomPage::default();
    let mut in_entry = false;
    let mut entry = RawEntry::default();
    let mut current_field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                let name = element.name();
                match local_name(name.as_ref()) {
                    b"entry" => {
                        in_entry = true;
                        entry = RawEntry::default();
                    }
                    b"link" if !in_entry => {
                        if let Some(href) = next_link_href(&element) {
                            page.next_link = Some(href);
                        }
                    }
                    other if in_entry => {
                        current_field = Field::for_element(name.as_ref(), other);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(element)) => {
                if local_name(element.name().as_ref()) == b"link"
                    && !in_entry
                    && let Some(href) = next_link_href(&element)
                {
                    page.next_link = Some(href);
                }
            }
            Ok(Event::Text(text)) => {
                if in_entry
                    && let Some(field) = current_field
                {
                    let value = text.unescape().unwrap_or_default();
                    field.assign(&mut entry, value.as_ref());
                }
            }
            Ok(Event::CData(data)) => {
                if in_entry
                    && let Some(field) = current_field
                {
                    let value = String::from_utf8_lossy(&data);
                    field.assign(&mut entry, value.as_ref());
                }
            }
            Ok(Event::End(element)) => {
                if local_name(element.name().as_ref()) == b"entry" {
                    in_entry = false;
                    match finish_entry(std::mem::take(&mut entry)) {
                        Some(record) => page.records.push(record),
                        None => {
                            page.parse_failures += 1;
                            warn!("dropping chocolatey entry without id or version");
                        }
                    }
                }
                current_field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(error) => {
                return Err(CoreError::for_manager(
                    Manager::Chocolatey,
                    CoreErrorKind::ProviderParse,
                    format!("malformed Atom feed: {error}"),
                ));
            }
        }
    }

    Ok(page)
}

#[derive(Clone, Copy, Debug)]
enum Field {
    Id,
    Title,
    Version,
    Description,
    Authors,
    ProjectUrl,
    LicenseUrl,
    Tags,
}

impl Field {
    /// The entry's atom `<title>` carries the package id; the OData
    /// properties use capitalized names under the `d:` prefix.
    fn for_element(qname: &[u8], local: &[u8]) -> Option<Field> {
        match local {
            b"title" => Some(Field::Id),
            b"Title" => Some(Field::Title),
            b"Version" => Some(Field::Version),
            b"Description" => Some(Field::Description),
            b"Authors" => Some(Field::Authors),
            b"ProjectUrl" => Some(Field::ProjectUrl),
            b"LicenseUrl" => Some(Field::LicenseUrl),
            b"Tags" => Some(Field::Tags),
            b"name" if qname == b"name" => Some(Field::Authors),
            _ => None,
        }
    }

    fn assign(self, entry: &mut RawEntry, value: &str) {
        let slot = match self {
            Field::Id => &mut entry.id,
            Field::Title => &mut entry.title,
            Field::Version => &mut entry.version,
            Field::Description => &mut entry.description,
            Field::Authors => &mut entry.authors,
            Field::ProjectUrl => &mut entry.project_url,
            Field::LicenseUrl => &mut entry.license_url,
            Field::Tags => &mut entry.tags,
        };
        if slot.is_empty() {
            *slot = value.trim().to_string();
        }
    }
}

fn finish_entry(entry: RawEntry) -> Option<PackageRecord> {
    if entry.id.is_empty() || entry.version.is_empty() {
        return None;
    }

    let name = if entry.title.is_empty() {
        entry.id.clone()
    } else {
        entry.title.clone()
    };

    let mut record = PackageRecord::new(Manager::Chocolatey, entry.id, name, entry.version);
    record.description = non_empty(entry.description);
    record.publisher = non_empty(entry.authors);
    record.homepage = non_empty(entry.project_url);
    record.license = non_empty(entry.license_url);
    record.tags = entry
        .tags
        .split_whitespace()
        .map(str::to_string)
        .collect();
    record.last_seen_at = Some(now_unix());
    record.regenerate_search_tokens();
    Some(record)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().position(|byte| *byte == b':') {
        Some(index) => &qname[index + 1..],
        None => qname,
    }
}

fn next_link_href(element: &BytesStart<'_>) -> Option<String> {
    let rel = element
        .try_get_attribute("rel")
        .ok()
        .flatten()
        .and_then(|attribute| attribute.unescape_value().ok().map(|value| value.into_owned()))?;
    if rel != "next" {
        return None;
    }
    element
        .try_get_attribute("href")
        .ok()
        .flatten()
        .and_then(|attribute| attribute.unescape_value().ok().map(|value| value.into_owned()))
}
