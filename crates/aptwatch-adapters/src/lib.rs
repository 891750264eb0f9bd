//! Listing source contracts + the apartments.com search adapter.

use std::path::{Path, PathBuf};

use aptwatch_core::{Listing, ListingError, RawListing, SearchProfile};
use aptwatch_storage::{FetchError, HttpClientConfig, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-adapters";

pub const APARTMENTS_SEARCH_URL: &str = "https://www.apartments.com/services/search/";
pub const DEFAULT_MAX_PAGES: usize = 50;

const RESULT_SEED: u32 = 910_660;
const GEOGRAPHY_TYPE_MAP_AREA: u8 = 7;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ScanContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one keyword produced across all of its result pages.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordScan {
    pub keyword: String,
    pub pages: usize,
    pub listings: Vec<Listing>,
    pub malformed: usize,
}

impl KeywordScan {
    fn new(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            pages: 0,
            listings: Vec::new(),
            malformed: 0,
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn max_pages(&self) -> usize {
        DEFAULT_MAX_PAGES
    }

    /// Raw search response body for one page (1-based).
    async fn fetch_page(
        &self,
        ctx: &ScanContext,
        search: &SearchProfile,
        keyword: &str,
        page: usize,
    ) -> Result<Vec<u8>, AdapterError>;

    /// Pages through results for one keyword until the response reports no
    /// next page.
    async fn scan_keyword(
        &self,
        ctx: &ScanContext,
        search: &SearchProfile,
        keyword: &str,
    ) -> Result<KeywordScan, AdapterError> {
        let mut scan = KeywordScan::new(keyword);
        let mut page = 1usize;
        loop {
            info!(source = self.source_id(), keyword, page, "looking up listings");
            let body = self.fetch_page(ctx, search, keyword, page).await?;
            let search_page = parse_search_response(&body)?;
            let parsed = parse_placards(&search_page.html, keyword, capture_time_now())?;
            for err in &parsed.malformed {
                warn!(keyword, page, error = %err, "skipping malformed placard");
            }

            scan.pages += 1;
            scan.malformed += parsed.malformed.len();
            scan.listings.extend(parsed.listings);

            if !search_page.has_more {
                break;
            }
            if page >= self.max_pages() {
                warn!(keyword, page, "page limit reached; stopping early");
                break;
            }
            page += 1;
        }
        info!(
            keyword,
            found = scan.listings.len(),
            pages = scan.pages,
            "keyword scan complete"
        );
        Ok(scan)
    }
}

fn capture_time_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LatLng {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BoxCorners {
    lower_right: LatLng,
    upper_left: LatLng,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MapArea {
    bounding_box: BoxCorners,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Geography {
    geography_type: u8,
    location: LatLng,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListingFilter<'a> {
    min_rent_amount: u32,
    max_rent_amount: u32,
    min_beds: u32,
    max_beds: u32,
    keywords: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Paging {
    page: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SearchRequest<'a> {
    map: MapArea,
    geography: Geography,
    listing: ListingFilter<'a>,
    paging: Paging,
    result_seed: u32,
    options: u8,
}

pub fn build_search_payload(
    search: &SearchProfile,
    keyword: &str,
    page: usize,
) -> Result<serde_json::Value, AdapterError> {
    let corner = |p: aptwatch_core::GeoPoint| LatLng {
        latitude: p.lat,
        longitude: p.lng,
    };
    let request = SearchRequest {
        map: MapArea {
            bounding_box: BoxCorners {
                lower_right: corner(search.bounding_box.lower_right),
                upper_left: corner(search.bounding_box.upper_left),
            },
        },
        geography: Geography {
            geography_type: GEOGRAPHY_TYPE_MAP_AREA,
            location: corner(search.center),
        },
        listing: ListingFilter {
            min_rent_amount: search.min_price,
            max_rent_amount: search.max_price,
            min_beds: search.min_beds,
            max_beds: search.max_beds(),
            keywords: keyword,
        },
        paging: Paging { page },
        result_seed: RESULT_SEED,
        options: 1,
    };
    Ok(serde_json::to_value(request)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SearchResponse {
    placard_state: Option<PlacardState>,
    #[serde(default)]
    meta_state: Option<MetaState>,
}

#[derive(Debug, Deserialize)]
struct PlacardState {
    #[serde(rename = "HTML")]
    html: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetaState {
    #[serde(default)]
    page_next_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub html: String,
    pub has_more: bool,
}

pub fn parse_search_response(body: &[u8]) -> Result<SearchPage, AdapterError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    let html = response
        .placard_state
        .and_then(|s| s.html)
        .ok_or_else(|| AdapterError::Message("search response has no PlacardState.HTML".into()))?;
    let has_more = response
        .meta_state
        .and_then(|m| m.page_next_url)
        .is_some_and(|url| !url.is_empty());
    Ok(SearchPage { html, has_more })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPlacards {
    pub listings: Vec<Listing>,
    pub malformed: Vec<ListingError>,
}

struct PlacardSelectors {
    list: Selector,
    title: Selector,
    address: Selector,
    availability: Selector,
    beds: Selector,
    price: Selector,
    image: Selector,
    phone: Selector,
    link: Selector,
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

impl PlacardSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            list: selector("ul")?,
            title: selector("div.property-title")?,
            address: selector("div.property-address")?,
            availability: selector("div.availability")?,
            beds: selector("div.bed-range")?,
            price: selector("div.price-range")?,
            image: selector("div[data-image]")?,
            phone: selector("a.phone-link")?,
            link: selector("a.property-link")?,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(el: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(el: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    el.select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Parses each direct `li` child of the first `ul` into a listing. Placards
/// missing an identity field are returned as errors instead of listings.
pub fn parse_placards(
    html: &str,
    keyword: &str,
    captured_at: f64,
) -> Result<ParsedPlacards, AdapterError> {
    let selectors = PlacardSelectors::new()?;
    let document = Html::parse_fragment(html);
    let mut parsed = ParsedPlacards::default();

    let Some(list) = document.select(&selectors.list).next() else {
        return Ok(parsed);
    };

    for placard in list
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
    {
        let raw = RawListing {
            address: first_attr(&placard, &selectors.title, "title"),
            zip: first_attr(&placard, &selectors.address, "title").unwrap_or_default(),
            keyword: keyword.to_string(),
            availability: first_text(&placard, &selectors.availability),
            beds: first_text(&placard, &selectors.beds).unwrap_or_default(),
            price: first_text(&placard, &selectors.price),
            image: first_attr(&placard, &selectors.image, "data-image").unwrap_or_default(),
            phone: first_attr(&placard, &selectors.phone, "href").unwrap_or_default(),
            link: first_attr(&placard, &selectors.link, "href").unwrap_or_default(),
            time: captured_at,
        };
        match Listing::try_from(raw) {
            Ok(listing) => parsed.listings.push(listing),
            Err(err) => parsed.malformed.push(err),
        }
    }
    Ok(parsed)
}

/// Live apartments.com search endpoint.
#[derive(Debug)]
pub struct ApartmentsComSource {
    http: HttpFetcher,
    endpoint: String,
    max_pages: usize,
}

impl ApartmentsComSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            endpoint: APARTMENTS_SEARCH_URL.to_string(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Browser-like headers the search endpoint expects.
    pub fn http_config(user_agent: &str, timeout: std::time::Duration) -> HttpClientConfig {
        HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.to_string()),
            default_headers: vec![
                (
                    "accept".to_string(),
                    "application/json, text/javascript, */*; q=0.01".to_string(),
                ),
                ("origin".to_string(), "https://www.apartments.com".to_string()),
            ],
            ..Default::default()
        }
    }
}

#[async_trait]
impl ListingSource for ApartmentsComSource {
    fn source_id(&self) -> &'static str {
        "apartments-com"
    }

    fn max_pages(&self) -> usize {
        self.max_pages
    }

    async fn fetch_page(
        &self,
        ctx: &ScanContext,
        search: &SearchProfile,
        keyword: &str,
        page: usize,
    ) -> Result<Vec<u8>, AdapterError> {
        let payload = build_search_payload(search, keyword, page)?;
        let response = self.http.post_json(ctx.run_id, &self.endpoint, &payload).await?;
        Ok(response.body)
    }
}

/// Replays recorded search responses (`page_1.json`, `page_2.json`, ...)
/// for every keyword; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    dir: PathBuf,
}

impl FixtureListingSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_page(
        &self,
        _ctx: &ScanContext,
        _search: &SearchProfile,
        _keyword: &str,
        page: usize,
    ) -> Result<Vec<u8>, AdapterError> {
        let path = self.dir.join(format!("page_{page}.json"));
        tokio::fs::read(&path)
            .await
            .map_err(|e| AdapterError::Message(format!("reading fixture {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptwatch_core::BoundingBox;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GoldenListing {
        address: String,
        zip: String,
        availability: String,
        beds: String,
        price: String,
        image: String,
        phone: String,
        link: String,
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_dir() -> PathBuf {
        workspace_root().join("fixtures").join("apartments-com")
    }

    fn search() -> SearchProfile {
        SearchProfile {
            name: "4bed".into(),
            keywords: vec!["patio".into(), "deck".into()],
            min_price: 4000,
            max_price: 6400,
            min_beds: 4,
            max_beds: None,
            bounding_box: BoundingBox::default(),
            center: aptwatch_core::GeoPoint {
                lat: 42.351,
                lng: -71.094,
            },
        }
    }

    fn to_golden(listings: &[Listing]) -> Vec<GoldenListing> {
        listings
            .iter()
            .map(|l| GoldenListing {
                address: l.address.clone(),
                zip: l.zip.clone(),
                availability: l.availability.clone(),
                beds: l.beds.clone(),
                price: l.price.clone(),
                image: l.image.clone(),
                phone: l.phone.clone(),
                link: l.link.clone(),
            })
            .collect()
    }

    #[test]
    fn search_payload_carries_filters_and_paging() {
        let payload = build_search_payload(&search(), "patio", 3).unwrap();
        assert_eq!(payload["Listing"]["MinRentAmount"], 4000);
        assert_eq!(payload["Listing"]["MaxRentAmount"], 6400);
        assert_eq!(payload["Listing"]["MinBeds"], 4);
        assert_eq!(payload["Listing"]["MaxBeds"], 6);
        assert_eq!(payload["Listing"]["Keywords"], "patio");
        assert_eq!(payload["Paging"]["Page"], 3);
        assert_eq!(payload["Geography"]["GeographyType"], 7);
        assert_eq!(payload["Map"]["BoundingBox"]["UpperLeft"]["Latitude"], 42.36808);
        assert_eq!(payload["ResultSeed"], 910660);
    }

    #[test]
    fn next_page_url_controls_paging() {
        let more = parse_search_response(
            br#"{"PlacardState":{"HTML":"<ul></ul>"},"MetaState":{"PageNextUrl":"https://x/2/"}}"#,
        )
        .unwrap();
        assert!(more.has_more);

        let last = parse_search_response(
            br#"{"PlacardState":{"HTML":"<ul></ul>"},"MetaState":{"PageNextUrl":""}}"#,
        )
        .unwrap();
        assert!(!last.has_more);

        let null = parse_search_response(
            br#"{"PlacardState":{"HTML":"<ul></ul>"},"MetaState":{"PageNextUrl":null}}"#,
        )
        .unwrap();
        assert!(!null.has_more);

        let no_meta = parse_search_response(br#"{"PlacardState":{"HTML":"<ul></ul>"}}"#).unwrap();
        assert!(!no_meta.has_more);
    }

    #[test]
    fn response_without_placards_is_an_error() {
        let err = parse_search_response(br#"{"error":1}"#).unwrap_err();
        assert!(err.to_string().contains("PlacardState"));
        assert!(matches!(
            parse_search_response(b"<html>").unwrap_err(),
            AdapterError::Decode(_)
        ));
    }

    #[test]
    fn golden_json_snapshot_test_apartments_com_page_1() {
        let body = std::fs::read(fixture_dir().join("page_1.json")).unwrap();
        let page = parse_search_response(&body).unwrap();
        let parsed = parse_placards(&page.html, "patio", 1_625_140_800.0).unwrap();

        let expected: Vec<GoldenListing> = serde_json::from_str(
            &std::fs::read_to_string(fixture_dir().join("page_1.snapshot.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(to_golden(&parsed.listings), expected);
        assert!(parsed.listings.iter().all(|l| l.keyword == "patio"));
        assert!(parsed.listings.iter().all(|l| l.time == 1_625_140_800.0));
        assert_eq!(
            parsed.malformed,
            vec![ListingError::MalformedListing { field: "address" }]
        );
    }

    #[test]
    fn placard_without_price_is_rejected() {
        let html = r#"<ul>
            <li><div class="property-title" title="1 Elm St"></div>
                <div class="availability">Now</div></li>
            <li><div class="property-title" title="2 Elm St"></div>
                <div class="price-range">$3,000</div>
                <div class="availability">Now</div></li>
        </ul>"#;
        let parsed = parse_placards(html, "yard", 1.0).unwrap();
        assert_eq!(parsed.listings.len(), 1);
        assert_eq!(parsed.listings[0].address, "2 Elm St");
        assert_eq!(parsed.listings[0].zip, "");
        assert_eq!(
            parsed.malformed,
            vec![ListingError::MalformedListing { field: "price" }]
        );
    }

    #[test]
    fn html_without_a_list_yields_nothing() {
        let parsed = parse_placards("<div>No results</div>", "pool", 1.0).unwrap();
        assert!(parsed.listings.is_empty());
        assert!(parsed.malformed.is_empty());
    }

    #[tokio::test]
    async fn fixture_source_pages_until_no_next_url() {
        let source = FixtureListingSource::new(fixture_dir());
        let scan = source
            .scan_keyword(&ScanContext::new(), &search(), "deck")
            .await
            .unwrap();
        assert_eq!(scan.pages, 2);
        assert_eq!(scan.listings.len(), 4);
        assert_eq!(scan.malformed, 1);
        assert!(scan.listings.iter().all(|l| l.keyword == "deck"));
    }

    #[tokio::test]
    async fn fixture_source_reports_missing_pages() {
        let source = FixtureListingSource::new(fixture_dir().join("does-not-exist"));
        let err = source
            .scan_keyword(&ScanContext::new(), &search(), "deck")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("page_1.json"));
    }
}
