//! Axum + Askama pages: run a search and browse the stored snapshot.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use aptwatch_core::{
    format_capture_time, neighborhood_label, sort_newest_first, IdentityKey, Listing,
    SearchProfile,
};
use aptwatch_sync::{maybe_build_scheduler, ScanConfig, ScanOutcome, ScanPipeline, SearchRegistry};
use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "aptwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScanPipeline>,
    pub searches: Vec<SearchProfile>,
}

impl AppState {
    pub fn new(pipeline: Arc<ScanPipeline>, searches: Vec<SearchProfile>) -> Self {
        Self { pipeline, searches }
    }
}

/// Display form of a listing.
#[derive(Debug, Clone)]
pub struct ListingRow {
    pub fingerprint: String,
    pub address: String,
    pub neighborhood: String,
    pub beds: String,
    pub price: String,
    pub availability: String,
    pub keyword: String,
    pub captured: String,
    pub image: String,
    pub phone: String,
    pub link: String,
    pub is_new: bool,
}

impl ListingRow {
    fn from_listing(listing: &Listing, is_new: bool) -> Self {
        Self {
            fingerprint: listing.identity().fingerprint(),
            address: listing.address.clone(),
            neighborhood: neighborhood_label(&listing.zip),
            beds: listing.beds.clone(),
            price: listing.price.clone(),
            availability: listing.availability.clone(),
            keyword: listing.keyword.clone(),
            captured: format_capture_time(listing),
            image: listing.image.clone(),
            phone: listing.phone.clone(),
            link: listing.link.clone(),
            is_new,
        }
    }
}

#[derive(Template)]
#[template(path = "listings.html")]
struct ListingsTemplate {
    heading: String,
    search_name: String,
    keywords: String,
    min_price: u32,
    max_price: u32,
    min_beds: u32,
    max_beds: u32,
    total_current: usize,
    new_count: usize,
    run_id: String,
    listings: Vec<ListingRow>,
}

impl ListingsTemplate {
    fn from_outcome(outcome: &ScanOutcome) -> Self {
        let search = &outcome.metadata.search;
        let new_keys: HashSet<IdentityKey> =
            outcome.newly_observed.iter().map(Listing::identity).collect();
        Self {
            heading: format!("Apartment Listings - {} beds", search.min_beds),
            search_name: search.name.clone(),
            keywords: search.keywords_joined(),
            min_price: search.min_price,
            max_price: search.max_price,
            min_beds: search.min_beds,
            max_beds: search.max_beds(),
            total_current: outcome.metadata.total_current_count,
            new_count: outcome.metadata.new_count,
            run_id: outcome.summary.run_id.to_string(),
            listings: outcome
                .current_view
                .iter()
                .map(|l| ListingRow::from_listing(l, new_keys.contains(&l.identity())))
                .collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "snapshot.html")]
struct SnapshotTemplate {
    location: String,
    listings: Vec<ListingRow>,
}

#[derive(Template)]
#[template(path = "listing_detail.html")]
struct ListingDetailTemplate {
    row: ListingRow,
    identity: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/searches/{name}", get(search_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/listings/{fingerprint}", get(listing_detail_handler))
        .with_state(Arc::new(state))
}

/// Serves the UI, plus the cron scheduler on the same pipeline when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ScanConfig::from_env();
    let registry = SearchRegistry::load(&config.searches_path)?;
    let pipeline = Arc::new(ScanPipeline::from_config(&config)?);

    let scheduler =
        maybe_build_scheduler(&config, pipeline.clone(), registry.searches.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.scan_cron, "scheduler started");
    }

    let port: u16 = std::env::var("APTWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(pipeline, registry.searches);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving web ui");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.searches.first() {
        Some(search) => run_and_render(&state, search).await,
        None => not_found("no searches configured"),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.searches.iter().find(|s| s.name == name) {
        Some(search) => run_and_render(&state, search).await,
        None => not_found(&format!("no search named {name}")),
    }
}

async fn run_and_render(state: &AppState, search: &SearchProfile) -> Response {
    match state.pipeline.run_once(search).await {
        Ok(outcome) => render_html(ListingsTemplate::from_outcome(&outcome)),
        Err(err) => server_error(err),
    }
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().load_latest().await {
        Ok(mut listings) => {
            sort_newest_first(&mut listings);
            render_html(SnapshotTemplate {
                location: state.pipeline.store().describe(),
                listings: listings
                    .iter()
                    .map(|l| ListingRow::from_listing(l, false))
                    .collect(),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(fingerprint): AxumPath<String>,
) -> Response {
    let listings = match state.pipeline.store().load_latest().await {
        Ok(listings) => listings,
        Err(err) => return server_error(err.into()),
    };
    match listings
        .iter()
        .find(|l| l.identity().fingerprint() == fingerprint)
    {
        Some(listing) => render_html(ListingDetailTemplate {
            row: ListingRow::from_listing(listing, false),
            identity: listing.identity().to_string(),
        }),
        None => not_found(&format!("no stored listing {fingerprint}")),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

// Plain text: messages can carry request path segments.
fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("Not found: {message}")).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err:#}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptwatch_adapters::FixtureListingSource;
    use aptwatch_core::BoundingBox;
    use aptwatch_storage::MemorySnapshotStore;
    use axum::body::Body;
    use axum::http::header;
    use http_body_util::BodyExt;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn search(name: &str) -> SearchProfile {
        SearchProfile {
            name: name.into(),
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

    fn fixture_app() -> Router {
        let source = FixtureListingSource::new(workspace_root().join("fixtures/apartments-com"));
        let pipeline = ScanPipeline::new(Box::new(source), Box::new(MemorySnapshotStore::new()));
        app(AppState::new(
            Arc::new(pipeline),
            vec![search("4bed"), search("3bed")],
        ))
    }

    async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_runs_the_default_search() {
        let app = fixture_app();
        let (status, text) = get_text(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Apartment Listings - 4 beds"));
        assert!(text.contains("16 Greenwich St, Boston, MA"));
        assert!(text.contains("02120 - Mission Hill"));
        assert!(text.contains("3 current listings, 3 new."));
    }

    #[tokio::test]
    async fn second_visit_reports_nothing_new() {
        let app = fixture_app();
        get_text(&app, "/searches/3bed").await;
        let (status, text) = get_text(&app, "/searches/3bed").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("3 current listings, 0 new."));
    }

    #[tokio::test]
    async fn unknown_search_is_not_found() {
        let (status, _) = get_text(&fixture_app(), "/searches/studio").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn not_found_pages_do_not_echo_markup() {
        let app = fixture_app();
        for uri in [
            "/searches/%3Cscript%3Ealert(1)%3C%2Fscript%3E",
            "/listings/%3Cimg%20src%3Dx%3E",
        ] {
            let resp = app
                .clone()
                .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
            assert!(content_type.starts_with("text/plain"), "{content_type}");
        }
    }

    #[tokio::test]
    async fn snapshot_and_detail_pages_read_the_store() {
        let app = fixture_app();
        let (_, empty) = get_text(&app, "/snapshot").await;
        assert!(empty.contains("No listings."));

        get_text(&app, "/").await;
        let (status, text) = get_text(&app, "/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("77 Westland Ave, Boston, MA"));

        let key = IdentityKey::from_fields(
            Some("77 Westland Ave, Boston, MA"),
            Some("$5,200"),
            Some("Available Now"),
        )
        .unwrap();
        let (status, detail) = get_text(&app, &format!("/listings/{}", key.fingerprint())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(detail.contains("$5,200"));

        let (status, _) = get_text(&app, "/listings/0000000000000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
