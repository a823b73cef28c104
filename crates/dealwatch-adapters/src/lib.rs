//! Source adapter contracts plus the RSS, static HTML and rendered-page adapters.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dealwatch_core::RawOffer;
use dealwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rss,
    Html,
    Rendered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed parse failed: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError>;

    fn parse(&self, page: &FetchedPage, ctx: &AdapterContext) -> Result<Vec<RawOffer>, AdapterError>;

    async fn collect(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawOffer>, AdapterError> {
        let page = self.fetch(http, ctx).await?;
        self.parse(&page, ctx)
    }
}

/// Lookback window for feed entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedWindow {
    pub hours: i64,
    pub grace_minutes: i64,
}

impl Default for FeedWindow {
    fn default() -> Self {
        Self {
            hours: 24,
            grace_minutes: 10,
        }
    }
}

impl FeedWindow {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.hours) - Duration::minutes(self.grace_minutes)
    }
}

pub struct RssAdapter {
    source_id: String,
    url: String,
    window: FeedWindow,
}

impl RssAdapter {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, window: FeedWindow) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            window,
        }
    }
}

#[async_trait]
impl SourceAdapter for RssAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        let resp = http.fetch_bytes(&self.source_id, &self.url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse(&self, page: &FetchedPage, _ctx: &AdapterContext) -> Result<Vec<RawOffer>, AdapterError> {
        let feed = feed_rs::parser::parse(page.body.as_slice())?;
        let cutoff = self.window.cutoff(page.fetched_at);
        let total = feed.entries.len();

        let offers: Vec<RawOffer> = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let link = entry
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref() != Some("enclosure"))
                    .map(|l| l.href.clone())?;
                let published_at = entry.published.or(entry.updated).unwrap_or(page.fetched_at);
                if published_at <= cutoff {
                    return None;
                }
                let image_url = feed_entry_image(&entry);
                Some(RawOffer {
                    source_id: self.source_id.clone(),
                    title: entry.title.map(|t| collapse_whitespace(&t.content)).unwrap_or_default(),
                    price_text: entry.summary.map(|t| t.content.trim().to_string()).unwrap_or_default(),
                    link,
                    image_url,
                    published_at,
                })
            })
            .collect();

        debug!(
            source_id = %self.source_id,
            total,
            fresh = offers.len(),
            cutoff = %cutoff,
            "parsed feed"
        );
        Ok(offers)
    }
}

fn feed_entry_image(entry: &feed_rs::model::Entry) -> Option<String> {
    let from_media = entry.media.iter().find_map(|media| {
        media
            .content
            .iter()
            .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
            .or_else(|| media.thumbnails.first().map(|t| t.image.uri.clone()))
    });
    from_media.or_else(|| {
        entry
            .links
            .iter()
            .find(|l| {
                l.rel.as_deref() == Some("enclosure")
                    && l.media_type.as_deref().is_some_and(|m| m.starts_with("image/"))
            })
            .map(|l| l.href.clone())
    })
}

/// CSS selectors describing one listing card and its fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub title_link: String,
    /// Attribute of the link holding the title; link text is used when absent.
    #[serde(default)]
    pub title_attr: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    /// Only price texts containing this marker count; also used to scan the card
    /// text when the price selector finds nothing.
    #[serde(default)]
    pub price_marker: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_image_attr")]
    pub image_attr: String,
    /// Extra fields appended to the name, comma-separated, in order.
    #[serde(default)]
    pub details: Vec<String>,
}

fn default_image_attr() -> String {
    "src".to_string()
}

impl ListingSelectors {
    pub fn otomoto() -> Self {
        Self {
            item: r#"div[data-testid="search-results"] article[data-media-size="small"][data-orientation="horizontal"]"#
                .to_string(),
            title_link: "p a[href]".to_string(),
            title_attr: None,
            price: Some("div h3".to_string()),
            price_marker: Some("PLN".to_string()),
            image: Some("img".to_string()),
            image_attr: default_image_attr(),
            details: vec![
                r#"dd[data-parameter="year"]"#.to_string(),
                r#"dd[data-parameter="mileage"]"#.to_string(),
            ],
        }
    }

    pub fn pepper() -> Self {
        Self {
            item: ".scrollBox-item.card-item.width--all-12".to_string(),
            title_link: "a[href]".to_string(),
            title_attr: Some("title".to_string()),
            price: None,
            price_marker: None,
            image: Some("img".to_string()),
            image_attr: default_image_attr(),
            details: Vec::new(),
        }
    }
}

struct CompiledSelectors {
    item: Selector,
    title_link: Selector,
    price: Option<Selector>,
    image: Option<Selector>,
    details: Vec<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl CompiledSelectors {
    fn new(spec: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: compile(&spec.item)?,
            title_link: compile(&spec.title_link)?,
            price: spec.price.as_deref().map(compile).transpose()?,
            image: spec.image.as_deref().map(compile).transpose()?,
            details: spec.details.iter().map(|s| compile(s)).collect::<Result<_, _>>()?,
        })
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn resolve_link(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Parses listing cards out of an HTML document. Cards without a title link are skipped.
pub fn parse_listing_html(
    source_id: &str,
    page: &FetchedPage,
    spec: &ListingSelectors,
) -> Result<Vec<RawOffer>, AdapterError> {
    let selectors = CompiledSelectors::new(spec)?;
    let html = String::from_utf8_lossy(&page.body);
    let document = Html::parse_document(&html);

    let mut offers = Vec::new();
    for (idx, card) in document.select(&selectors.item).enumerate() {
        let Some(anchor) = card.select(&selectors.title_link).next() else {
            debug!(source_id, card = idx, "card has no title link; skipped");
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };

        let mut title = match spec.title_attr.as_deref() {
            Some(attr) => anchor.value().attr(attr).map(collapse_whitespace).unwrap_or_default(),
            None => element_text(anchor),
        };
        let details: Vec<String> = selectors
            .details
            .iter()
            .filter_map(|sel| card.select(sel).next().map(element_text))
            .filter(|text| !text.is_empty())
            .collect();
        if !details.is_empty() {
            title = std::iter::once(title).chain(details).collect::<Vec<_>>().join(", ");
        }

        let image_url = selectors.image.as_ref().and_then(|sel| {
            card.select(sel)
                .next()
                .and_then(|img| img.value().attr(&spec.image_attr))
                .map(|src| resolve_link(&page.url, src.trim()))
        });

        offers.push(RawOffer {
            source_id: source_id.to_string(),
            title,
            price_text: card_price(card, &selectors, spec),
            link: resolve_link(&page.url, href.trim()),
            image_url,
            published_at: page.fetched_at,
        });
    }

    debug!(source_id, offers = offers.len(), "parsed listing page");
    Ok(offers)
}

fn card_price(card: ElementRef<'_>, selectors: &CompiledSelectors, spec: &ListingSelectors) -> String {
    let marker = spec.price_marker.as_deref();
    let accepts = |text: &str| marker.map_or(true, |m| text.contains(m));

    let selected = selectors.price.as_ref().and_then(|sel| {
        card.select(sel)
            .map(element_text)
            .find(|text| !text.is_empty() && accepts(text))
    });
    if let Some(price) = selected {
        return price;
    }
    marker
        .and_then(|m| card.text().find(|t| t.contains(m)))
        .map(collapse_whitespace)
        .unwrap_or_default()
}

pub struct HtmlListingAdapter {
    source_id: String,
    url: String,
    selectors: ListingSelectors,
}

impl HtmlListingAdapter {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, selectors: ListingSelectors) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            selectors,
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        let resp = http.fetch_bytes(&self.source_id, &self.url).await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse(&self, page: &FetchedPage, _ctx: &AdapterContext) -> Result<Vec<RawOffer>, AdapterError> {
        parse_listing_html(&self.source_id, page, &self.selectors)
    }
}

/// Browserless-compatible rendering endpoint (`POST {base}/content`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

impl RendererEndpoint {
    pub fn content_url(&self) -> String {
        let mut endpoint = format!("{}/content", self.base_url.trim_end_matches('/'));
        if let Some(token) = &self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }
}

pub struct RenderedPageAdapter {
    source_id: String,
    url: String,
    selectors: ListingSelectors,
    renderer: Option<RendererEndpoint>,
}

impl RenderedPageAdapter {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        selectors: ListingSelectors,
        renderer: Option<RendererEndpoint>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            selectors,
            renderer,
        }
    }
}

#[async_trait]
impl SourceAdapter for RenderedPageAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rendered
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<FetchedPage, AdapterError> {
        let renderer = self.renderer.as_ref().ok_or_else(|| {
            AdapterError::Message(format!("{}: no renderer endpoint configured", self.source_id))
        })?;
        let body = serde_json::json!({ "url": self.url });
        let html = http
            .post_json_text(&self.source_id, &renderer.content_url(), &body)
            .await?;
        Ok(FetchedPage {
            url: self.url.clone(),
            body: html.into_bytes(),
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse(&self, page: &FetchedPage, _ctx: &AdapterContext) -> Result<Vec<RawOffer>, AdapterError> {
        parse_listing_html(&self.source_id, page, &self.selectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dealwatch_storage::{HttpClientConfig, HttpFetcher};
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_page(rel: &str, url: &str) -> FetchedPage {
        let path = workspace_root().join("fixtures").join(rel);
        FetchedPage {
            url: url.to_string(),
            body: std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display())),
            fetched_at: ctx().fetched_at,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            fetched_at: Utc.with_ymd_and_hms(2024, 5, 12, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn rss_keeps_recent_linked_entries() {
        let adapter = RssAdapter::new("lzx", "https://lzx.example.test/rss", FeedWindow::default());
        let page = fixture_page("lzx/feed.xml", "https://lzx.example.test/rss");
        let offers = adapter.parse(&page, &ctx()).expect("parse feed");

        assert_eq!(offers.len(), 2);
        let first = &offers[0];
        assert_eq!(first.title, "Deal A!!");
        assert_eq!(first.price_text, "10 zł");
        assert_eq!(first.link, "https://lzx.example.test/r/1001");
        assert_eq!(first.image_url.as_deref(), Some("https://img.example.test/1001.jpg"));
        assert_eq!(
            first.published_at,
            Utc.with_ymd_and_hms(2024, 5, 12, 7, 30, 0).single().unwrap()
        );
        assert_eq!(offers[1].image_url.as_deref(), Some("https://img.example.test/nophoto.png"));
        assert!(offers.iter().all(|o| o.source_id == "lzx"));
    }

    #[test]
    fn narrow_window_drops_everything() {
        let adapter = RssAdapter::new(
            "lzx",
            "https://lzx.example.test/rss",
            FeedWindow {
                hours: 0,
                grace_minutes: 30,
            },
        );
        let page = fixture_page("lzx/feed.xml", "https://lzx.example.test/rss");
        assert!(adapter.parse(&page, &ctx()).expect("parse").is_empty());
    }

    #[test]
    fn malformed_feed_is_an_error() {
        let adapter = RssAdapter::new("lzx", "https://lzx.example.test/rss", FeedWindow::default());
        let page = FetchedPage {
            url: "https://lzx.example.test/rss".into(),
            body: b"<html>not a feed".to_vec(),
            fetched_at: ctx().fetched_at,
        };
        assert!(matches!(adapter.parse(&page, &ctx()), Err(AdapterError::Feed(_))));
    }

    #[test]
    fn otomoto_cards_carry_details_price_and_absolute_links() {
        let adapter = HtmlListingAdapter::new(
            "otomoto",
            "https://www.otomoto.example.test/osobowe/?search=1",
            ListingSelectors::otomoto(),
        );
        let page = fixture_page("otomoto/listing.html", "https://www.otomoto.example.test/osobowe/?search=1");
        let offers = adapter.parse(&page, &ctx()).expect("parse listing");

        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].title, "Volkswagen Golf 1.4 TSI, 2016, 123 000 km");
        assert_eq!(offers[0].price_text, "45 900 PLN");
        assert_eq!(
            offers[0].link,
            "https://www.otomoto.example.test/osobowe/oferta/volkswagen-golf-ID1.html"
        );
        assert_eq!(offers[0].image_url.as_deref(), Some("https://img.example.test/golf.jpg"));

        assert_eq!(offers[1].title, "Skoda Fabia, 2019");
        assert_eq!(offers[1].price_text, "38 500 PLN");
        assert_eq!(offers[1].image_url, None);
        assert_eq!(offers[1].published_at, ctx().fetched_at);
    }

    #[test]
    fn rendered_pepper_cards_use_title_attribute() {
        let adapter = RenderedPageAdapter::new(
            "pepper",
            "https://pepper.example.test/najgoretsze",
            ListingSelectors::pepper(),
            None,
        );
        let page = fixture_page("pepper/rendered.html", "https://pepper.example.test/najgoretsze");
        let offers = adapter.parse(&page, &ctx()).expect("parse rendered");

        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].title, "Słuchawki XYZ -40%");
        assert_eq!(offers[0].price_text, "");
        assert_eq!(offers[1].link, "https://pepper.example.test/promocje/kawa-2");
        assert_eq!(offers[1].image_url.as_deref(), Some("https://img.example.test/kawa.jpg"));
    }

    #[test]
    fn invalid_selector_is_reported() {
        let mut selectors = ListingSelectors::pepper();
        selectors.item = "div[[".into();
        let page = fixture_page("pepper/rendered.html", "https://pepper.example.test/");
        let err = parse_listing_html("pepper", &page, &selectors).unwrap_err();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }

    #[test]
    fn selectors_deserialize_with_defaults() {
        let spec: ListingSelectors =
            serde_json::from_str(r#"{"item": "li.offer", "title_link": "a"}"#).expect("json");
        assert_eq!(spec.image_attr, "src");
        assert!(spec.details.is_empty());
        assert_eq!(spec.price, None);
    }

    #[test]
    fn renderer_url_appends_token() {
        let endpoint = RendererEndpoint {
            base_url: "http://renderer:3000/".into(),
            token: Some("abc".into()),
        };
        assert_eq!(endpoint.content_url(), "http://renderer:3000/content?token=abc");
    }

    #[tokio::test]
    async fn rendered_adapter_without_renderer_fails_fast() {
        let adapter = RenderedPageAdapter::new("pepper", "https://pepper.example.test/", ListingSelectors::pepper(), None);
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = adapter.collect(&http, &ctx()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
        assert_eq!(adapter.kind(), SourceKind::Rendered);
    }
}
