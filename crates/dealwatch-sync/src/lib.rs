//! Sync pipeline orchestration: sources → seen-cache → enrichment → dedup → digest.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealwatch_adapters::{
    AdapterContext, FeedWindow, FetchedPage, HtmlListingAdapter, ListingSelectors, RenderedPageAdapter,
    RendererEndpoint, RssAdapter, SourceAdapter, SourceKind,
};
use dealwatch_core::{ExportConfig, Offer, RawOffer};
use dealwatch_dedup::{AverageHasher, DedupConfig, DedupEngine, DEFAULT_HASH_SIZE};
use dealwatch_notify::{render_digest, Digest, MailConfig, Mailer};
use dealwatch_storage::{HttpClientConfig, HttpFetcher, SeenCache, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-sync";

/// Image URLs that sources use in place of a real photo.
const PLACEHOLDER_IMAGE_SUFFIXES: &[&str] = &["nophoto.png"];

pub const MAX_CONSECUTIVE_FAILURES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorPreset {
    Otomoto,
    Pepper,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the URL, used when `url` is absent.
    #[serde(default)]
    pub url_env: Option<String>,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
    #[serde(default)]
    pub preset: Option<SelectorPreset>,
    #[serde(default)]
    pub window: Option<FeedWindow>,
    #[serde(default)]
    pub resolve_links: bool,
    #[serde(default)]
    pub fetch_images: bool,
    /// Parse this file instead of fetching (offline runs and tests).
    #[serde(default)]
    pub fixture: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn resolve_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| self.url_env.as_deref().and_then(|var| std::env::var(var).ok()))
            .filter(|u| !u.trim().is_empty())
    }

    fn listing_selectors(&self) -> Result<ListingSelectors> {
        if let Some(selectors) = &self.selectors {
            return Ok(selectors.clone());
        }
        match self.preset {
            Some(SelectorPreset::Otomoto) => Ok(ListingSelectors::otomoto()),
            Some(SelectorPreset::Pepper) => Ok(ListingSelectors::pepper()),
            None => anyhow::bail!("{}: html sources need `selectors` or `preset`", self.source_id),
        }
    }
}

pub fn parse_source_registry(yaml: &str) -> Result<SourceRegistry> {
    serde_yaml::from_str(yaml).context("parsing source registry")
}

/// Picks the requested sources in registry order. Unknown names are ignored; an empty
/// or fully invalid request falls back to every enabled source.
pub fn select_sources(registry: &SourceRegistry, requested: &[String]) -> Vec<SourceConfig> {
    let enabled = || -> Vec<SourceConfig> {
        registry.sources.iter().filter(|s| s.enabled).cloned().collect()
    };
    let wanted: HashSet<String> = requested
        .iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if wanted.is_empty() {
        return enabled();
    }

    let known: HashSet<String> = registry
        .sources
        .iter()
        .map(|s| s.source_id.to_ascii_lowercase())
        .collect();
    let mut unknown: Vec<&String> = wanted.difference(&known).collect();
    if !unknown.is_empty() {
        unknown.sort();
        warn!(?unknown, "ignoring unknown sources");
    }

    let selected: Vec<SourceConfig> = registry
        .sources
        .iter()
        .filter(|s| wanted.contains(&s.source_id.to_ascii_lowercase()))
        .cloned()
        .collect();
    if selected.is_empty() {
        warn!("no valid sources selected; using every enabled source");
        return enabled();
    }
    selected
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub cache_dir: PathBuf,
    pub output_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub renderer: Option<RendererEndpoint>,
    pub dedup: DedupConfig,
    pub hash_size: u32,
    pub export: ExportConfig,
    /// Send the digest by email after writing it.
    pub email: bool,
    pub mail: Option<MailConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("sources.yaml"),
            cache_dir: PathBuf::from("./cache"),
            output_path: PathBuf::from("./digest.html"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 5,
            workers: 8,
            renderer: None,
            dedup: DedupConfig::default(),
            hash_size: DEFAULT_HASH_SIZE,
            export: ExportConfig::default(),
            email: false,
            mail: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

/// Blank values count as unset, so an empty `.env` entry never adds `?token=`.
fn renderer_endpoint(url: Option<String>, token: Option<String>) -> Option<RendererEndpoint> {
    let base_url = url.filter(|u| !u.trim().is_empty())?;
    Some(RendererEndpoint {
        base_url,
        token: token.filter(|t| !t.trim().is_empty()),
    })
}

impl SyncConfig {
    /// Reads `.env` (if present) and `DEALWATCH_*` variables over the defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let export = match std::env::var("DEALWATCH_TZ") {
            Ok(name) if !name.trim().is_empty() => defaults.export.with_timezone_name(&name).unwrap_or_else(|| {
                warn!(name = %name, "unknown time zone; using the default");
                defaults.export
            }),
            _ => defaults.export,
        };

        Self {
            sources_file: std::env::var("DEALWATCH_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            cache_dir: std::env::var("DEALWATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            output_path: std::env::var("DEALWATCH_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            user_agent: std::env::var("DEALWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("DEALWATCH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            workers: env_parse("DEALWATCH_WORKERS").unwrap_or(defaults.workers),
            renderer: renderer_endpoint(
                std::env::var("DEALWATCH_RENDERER_URL").ok(),
                std::env::var("DEALWATCH_RENDERER_TOKEN").ok(),
            ),
            dedup: DedupConfig {
                require_same_price: env_flag("DEALWATCH_REQUIRE_SAME_PRICE")
                    .unwrap_or(defaults.dedup.require_same_price),
                similarity_threshold: env_parse("DEALWATCH_SIMILARITY_THRESHOLD")
                    .unwrap_or(defaults.dedup.similarity_threshold),
            },
            hash_size: env_parse("DEALWATCH_HASH_SIZE").unwrap_or(defaults.hash_size),
            export,
            email: env_flag("DEALWATCH_EMAIL").unwrap_or(defaults.email),
            mail: MailConfig::from_lookup(|key| std::env::var(key).ok()),
        }
    }
}

pub fn adapter_for_source(
    source: &SourceConfig,
    renderer: Option<&RendererEndpoint>,
) -> Result<Box<dyn SourceAdapter>> {
    let url = source
        .resolve_url()
        .or_else(|| source.fixture.as_ref().map(|p| format!("file://{}", p.display())))
        .with_context(|| format!("{}: no URL configured", source.source_id))?;

    let adapter: Box<dyn SourceAdapter> = match source.kind {
        SourceKind::Rss => Box::new(RssAdapter::new(
            source.source_id.clone(),
            url,
            source.window.unwrap_or_default(),
        )),
        SourceKind::Html => Box::new(HtmlListingAdapter::new(
            source.source_id.clone(),
            url,
            source.listing_selectors()?,
        )),
        SourceKind::Rendered => Box::new(RenderedPageAdapter::new(
            source.source_id.clone(),
            url,
            source.listing_selectors()?,
            renderer.cloned(),
        )),
    };
    Ok(adapter)
}

/// Keeps the first offer per link across all sources.
pub fn dedupe_by_link(offers: Vec<RawOffer>) -> Vec<RawOffer> {
    let mut seen = HashSet::new();
    offers
        .into_iter()
        .filter(|offer| offer.link.is_empty() || seen.insert(offer.link.clone()))
        .collect()
}

pub fn is_placeholder_image(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    PLACEHOLDER_IMAGE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Per-source enrichment switches taken from the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrichFlags {
    pub resolve_links: bool,
    pub fetch_images: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub failed_sources: Vec<String>,
    pub fetched_offers: usize,
    pub fresh_offers: usize,
    pub unique_offers: usize,
    pub duplicate_clusters: usize,
    pub output_path: PathBuf,
    pub emailed: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    engine: DedupEngine,
    hasher: AverageHasher,
    mailer: Option<Mailer>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            concurrency: config.workers,
            ..Default::default()
        })?;
        let mailer = match (&config.mail, config.email) {
            (Some(mail), true) => Some(Mailer::new(mail.clone())?),
            (None, true) => {
                warn!("email requested but DEALWATCH_SMTP_HOST / DEALWATCH_MAIL_TO are not set");
                None
            }
            (_, false) => None,
        };
        Ok(Self {
            mailer,
            engine: DedupEngine::new(config.dedup),
            hasher: AverageHasher::new(config.hash_size),
            http: Arc::new(http),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = &self.config.sources_file;
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        parse_source_registry(&text).with_context(|| format!("in {}", path.display()))
    }

    pub async fn run_once(&self, requested: &[String]) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_once_inner(run_id, requested)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run_once_inner(&self, run_id: Uuid, requested: &[String]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let registry = self.load_source_registry().await?;
        let sources = select_sources(&registry, requested);
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        // Caches live until the end of the run; dropping them on any early exit flushes.
        let mut caches: Vec<SeenCache> = Vec::with_capacity(sources.len());
        let mut flags: HashMap<String, EnrichFlags> = HashMap::new();
        let mut failed_sources = Vec::new();
        let mut fetched_offers = 0usize;
        let mut collected = Vec::new();

        for source in &sources {
            info!(source_id = %source.source_id, "scraping source");
            let offers = match self.collect_source(source, &ctx).await {
                Ok(offers) => offers,
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %format!("{err:#}"), "source failed; skipping");
                    failed_sources.push(source.source_id.clone());
                    continue;
                }
            };
            fetched_offers += offers.len();

            let mut cache = SeenCache::open(self.cache_path_for(&source.source_id));
            let fresh = cache.retain_unseen(offers);
            info!(source_id = %source.source_id, fresh = fresh.len(), "new offers");
            caches.push(cache);

            flags.insert(
                source.source_id.clone(),
                EnrichFlags {
                    resolve_links: source.resolve_links,
                    fetch_images: source.fetch_images,
                },
            );
            collected.extend(fresh);
        }

        let fresh = dedupe_by_link(collected);
        let fresh_offers = fresh.len();
        let enriched = self.enrich(fresh, &flags).await;
        let grouped = self.engine.split(enriched);

        let source_ids: Vec<String> = sources.iter().map(|s| s.source_id.clone()).collect();
        let digest = Digest::from_grouped(&grouped, &self.config.export, source_ids.clone(), Utc::now());
        let html = self.write_digest(&digest).await?;
        let emailed = self.send_email(html).await;

        for cache in &mut caches {
            cache
                .flush()
                .with_context(|| format!("saving cache {}", cache.path().display()))?;
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: source_ids,
            failed_sources,
            fetched_offers,
            fresh_offers,
            unique_offers: grouped.unique.len(),
            duplicate_clusters: grouped.duplicates.len(),
            output_path: self.config.output_path.clone(),
            emailed,
        };
        info!(
            fresh = summary.fresh_offers,
            unique = summary.unique_offers,
            clusters = summary.duplicate_clusters,
            "sync run complete"
        );
        Ok(summary)
    }

    async fn collect_source(&self, source: &SourceConfig, ctx: &AdapterContext) -> Result<Vec<RawOffer>> {
        let adapter = adapter_for_source(source, self.config.renderer.as_ref())?;
        let offers = match &source.fixture {
            Some(path) => {
                let body = fs::read(path)
                    .await
                    .with_context(|| format!("reading fixture {}", path.display()))?;
                let page = FetchedPage {
                    url: source
                        .resolve_url()
                        .unwrap_or_else(|| format!("file://{}", path.display())),
                    body,
                    fetched_at: ctx.fetched_at,
                };
                adapter.parse(&page, ctx)?
            }
            None => adapter.collect(&self.http, ctx).await?,
        };
        Ok(offers)
    }

    fn cache_path_for(&self, source_id: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{source_id}.seen.json.zst"))
    }

    /// Resolves redirects, downloads images and hashes them. Failures leave the
    /// original link or no hash; no offer is dropped.
    pub async fn enrich(&self, offers: Vec<RawOffer>, flags: &HashMap<String, EnrichFlags>) -> Vec<Offer> {
        let flags_for = |offer: &RawOffer| flags.get(&offer.source_id).copied().unwrap_or_default();

        let mut links: JoinSet<(usize, String)> = JoinSet::new();
        for (idx, offer) in offers.iter().enumerate() {
            if !flags_for(offer).resolve_links || offer.link.is_empty() {
                continue;
            }
            let http = Arc::clone(&self.http);
            let link = offer.link.clone();
            links.spawn(async move { (idx, http.resolve_redirect(&link).await) });
        }
        let mut resolved: Vec<Option<String>> = vec![None; offers.len()];
        while let Some(joined) = links.join_next().await {
            match joined {
                Ok((idx, link)) => resolved[idx] = Some(link),
                Err(err) => warn!(error = %err, "redirect task failed"),
            }
        }
        let offers: Vec<RawOffer> = offers
            .into_iter()
            .zip(resolved)
            .map(|(offer, link)| match link {
                Some(link) => offer.with_link(link),
                None => offer,
            })
            .collect();

        let mut images: JoinSet<(usize, Option<Vec<u8>>)> = JoinSet::new();
        for (idx, offer) in offers.iter().enumerate() {
            let Some(url) = offer.image_url.clone() else {
                continue;
            };
            if !flags_for(offer).fetch_images || is_placeholder_image(&url) {
                continue;
            }
            let http = Arc::clone(&self.http);
            let source_id = offer.source_id.clone();
            images.spawn(async move {
                match http.fetch_bytes(&source_id, &url).await {
                    Ok(resp) => (idx, Some(resp.body)),
                    Err(err) => {
                        debug!(url, error = %err, "image download failed");
                        (idx, None)
                    }
                }
            });
        }
        let mut bytes: Vec<Option<Vec<u8>>> = vec![None; offers.len()];
        while let Some(joined) = images.join_next().await {
            match joined {
                Ok((idx, body)) => bytes[idx] = body,
                Err(err) => warn!(error = %err, "image task failed"),
            }
        }

        offers
            .into_iter()
            .zip(bytes)
            .map(|(raw, image)| self.hasher.attach(Offer::from_raw(raw), image.as_deref()))
            .collect()
    }

    /// Delivery failures are logged; the digest file is already on disk.
    async fn send_email(&self, html: String) -> bool {
        let Some(mailer) = &self.mailer else {
            return false;
        };
        match mailer.send_digest(html).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to send digest email");
                false
            }
        }
    }

    async fn write_digest(&self, digest: &Digest) -> Result<String> {
        let html = render_digest(digest, &self.config.export)?;
        let path = &self.config.output_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, &html)
            .await
            .with_context(|| format!("writing digest {}", path.display()))?;
        info!(path = %path.display(), offers = digest.offer_count(), "wrote digest");
        Ok(html)
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule {0:?}: expected HH:MM in 24h time")]
    InvalidTime(String),
}

/// Six-field (seconds first) cron expression firing daily at `HH:MM`.
pub fn daily_cron(at: &str) -> Result<String, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(at.to_string());
    let (hours, minutes) = at.trim().split_once(':').ok_or_else(invalid)?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    Ok(format!("0 {minutes} {hours} * * *"))
}

fn report_outcome(outcome: Result<SyncRunSummary>) -> bool {
    match outcome {
        Ok(summary) => {
            info!(run_id = %summary.run_id, output = %summary.output_path.display(), "scheduled run finished");
            true
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "sync run failed");
            false
        }
    }
}

/// Runs the pipeline daily at `at` (local time) until Ctrl-C or too many
/// consecutive failures.
pub async fn run_scheduled(
    pipeline: Arc<SyncPipeline>,
    sources: Vec<String>,
    at: &str,
    run_immediately: bool,
) -> Result<()> {
    let cron = daily_cron(at)?;
    let mut failures = 0usize;

    if run_immediately && !report_outcome(pipeline.run_once(&sources).await) {
        failures += 1;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async_tz(cron.as_str(), chrono::Local, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let sources = sources.clone();
        let tx = tx.clone();
        Box::pin(async move {
            let ok = report_outcome(pipeline.run_once(&sources).await);
            let _ = tx.send(ok);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(at, cron = %cron, "scheduled daily run");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping scheduler");
                break;
            }
            outcome = rx.recv() => match outcome {
                Some(true) => failures = 0,
                Some(false) => {
                    failures += 1;
                    if failures > MAX_CONSECUTIVE_FAILURES {
                        error!(failures, "too many consecutive failures; exiting");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_sync_once_from_env(requested: &[String]) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once(requested).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn mk_raw(source_id: &str, title: &str, link: &str) -> RawOffer {
        RawOffer {
            source_id: source_id.to_string(),
            title: title.to_string(),
            price_text: "10 zł".into(),
            link: link.to_string(),
            image_url: None,
            published_at: Utc.with_ymd_and_hms(2024, 5, 12, 9, 0, 0).single().unwrap(),
        }
    }

    fn registry() -> SourceRegistry {
        parse_source_registry(
            r#"
sources:
  - source_id: pepper
    display_name: Pepper
    kind: rendered
    url: https://pepper.example.test/
    preset: pepper
  - source_id: lzx
    display_name: LZX
    kind: rss
    url_env: DEALWATCH_TEST_UNSET_LZX_URL
  - source_id: otomoto
    display_name: Otomoto
    enabled: false
    kind: html
    url: https://otomoto.example.test/
    preset: otomoto
"#,
        )
        .expect("registry")
    }

    fn ids(sources: &[SourceConfig]) -> Vec<&str> {
        sources.iter().map(|s| s.source_id.as_str()).collect()
    }

    #[test]
    fn empty_request_selects_enabled_sources() {
        let selected = select_sources(&registry(), &[]);
        assert_eq!(ids(&selected), vec!["pepper", "lzx"]);
    }

    #[test]
    fn explicit_request_keeps_registry_order_and_ignores_unknown() {
        let requested = vec!["OTOMOTO".to_string(), " pepper ".to_string(), "allegro".to_string()];
        let selected = select_sources(&registry(), &requested);
        assert_eq!(ids(&selected), vec!["pepper", "otomoto"]);
    }

    #[test]
    fn fully_invalid_request_falls_back_to_enabled() {
        let selected = select_sources(&registry(), &["nope".to_string()]);
        assert_eq!(ids(&selected), vec!["pepper", "lzx"]);
    }

    #[test]
    fn missing_url_is_an_adapter_error() {
        let reg = registry();
        let lzx = reg.sources.iter().find(|s| s.source_id == "lzx").unwrap();
        assert!(lzx.resolve_url().is_none());
        assert!(adapter_for_source(lzx, None).is_err());

        let pepper = &reg.sources[0];
        let adapter = adapter_for_source(pepper, None).expect("pepper adapter");
        assert_eq!(adapter.kind(), SourceKind::Rendered);
        assert_eq!(adapter.source_id(), "pepper");
    }

    #[test]
    fn html_source_without_selectors_is_rejected() {
        let reg = parse_source_registry(
            "sources:\n  - source_id: shop\n    display_name: Shop\n    kind: html\n    url: https://shop.example.test/\n",
        )
        .expect("registry");
        assert!(adapter_for_source(&reg.sources[0], None).is_err());
    }

    #[test]
    fn link_dedup_keeps_first_occurrence() {
        let offers = dedupe_by_link(vec![
            mk_raw("lzx", "A", "https://x/1"),
            mk_raw("pepper", "B", "https://x/1"),
            mk_raw("pepper", "C", "https://x/2"),
            mk_raw("pepper", "no link", ""),
            mk_raw("lzx", "no link either", ""),
        ]);
        let titles: Vec<&str> = offers.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C", "no link", "no link either"]);
    }

    #[test]
    fn placeholder_images_are_recognised() {
        assert!(is_placeholder_image("https://lzx.example.test/static/NoPhoto.png"));
        assert!(!is_placeholder_image("https://img.example.test/1001.jpg"));
    }

    #[test]
    fn daily_cron_validates_time() {
        assert_eq!(daily_cron("07:30").unwrap(), "0 30 7 * * *");
        assert_eq!(daily_cron("23:05").unwrap(), "0 5 23 * * *");
        for bad in ["24:00", "7:3", "07-30", "ab:cd", "", "12:60"] {
            assert!(daily_cron(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.workers, 8);
        assert!(config.dedup.require_same_price);
        assert_eq!(config.dedup.similarity_threshold, 0.10);
        assert_eq!(config.hash_size, 16);
    }

    #[test]
    fn blank_renderer_values_count_as_unset() {
        assert_eq!(renderer_endpoint(Some("  ".into()), Some("abc".into())), None);

        let endpoint = renderer_endpoint(Some("http://renderer:3000".into()), Some(String::new()))
            .expect("endpoint");
        assert_eq!(endpoint.token, None);
        assert_eq!(endpoint.content_url(), "http://renderer:3000/content");

        let endpoint = renderer_endpoint(Some("http://renderer:3000".into()), Some("abc".into()))
            .expect("endpoint");
        assert_eq!(endpoint.content_url(), "http://renderer:3000/content?token=abc");
    }

    #[tokio::test]
    async fn enrich_without_flags_only_builds_offers() {
        let pipeline = SyncPipeline::new(SyncConfig::default()).expect("pipeline");
        let mut raw = mk_raw("lzx", "Deal A!!", "https://x/1");
        raw.image_url = Some("https://img.example.test/1.jpg".into());
        let offers = pipeline.enrich(vec![raw], &HashMap::new()).await;
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].link(), "https://x/1");
        assert_eq!(offers[0].normalized_title(), "deala");
        assert!(offers[0].image_hash().is_none());
    }

    #[tokio::test]
    async fn fixture_run_writes_digest_and_filters_repeats() {
        let dir = tempdir().expect("tempdir");
        let fixtures = workspace_root().join("fixtures");
        let sources_file = dir.path().join("sources.yaml");
        std::fs::write(
            &sources_file,
            format!(
                r#"
sources:
  - source_id: lzx
    display_name: LZX
    kind: rss
    url: https://lzx.example.test/rss
    window:
      hours: 1000000
      grace_minutes: 0
    fixture: {lzx}
  - source_id: pepper
    display_name: Pepper
    kind: rendered
    url: https://pepper.example.test/najgoretsze
    preset: pepper
    fixture: {pepper}
  - source_id: otomoto
    display_name: Otomoto
    kind: html
    url: https://www.otomoto.example.test/osobowe/
    preset: otomoto
    fixture: {otomoto}
  - source_id: broken
    display_name: Broken
    kind: html
    url: https://broken.example.test/
    preset: otomoto
    fixture: {missing}
"#,
                lzx = fixtures.join("lzx/feed.xml").display(),
                pepper = fixtures.join("pepper/rendered.html").display(),
                otomoto = fixtures.join("otomoto/listing.html").display(),
                missing = dir.path().join("missing.html").display(),
            ),
        )
        .expect("write registry");

        let config = SyncConfig {
            sources_file,
            cache_dir: dir.path().join("cache"),
            output_path: dir.path().join("out").join("digest.html"),
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(config).expect("pipeline");

        let first = pipeline.run_once(&[]).await.expect("first run");
        assert_eq!(first.sources, vec!["lzx", "pepper", "otomoto", "broken"]);
        assert_eq!(first.failed_sources, vec!["broken"]);
        assert_eq!(first.fetched_offers, 7);
        assert_eq!(first.fresh_offers, 7);
        assert_eq!(first.unique_offers, 5);
        assert_eq!(first.duplicate_clusters, 1);

        let html = std::fs::read_to_string(&first.output_path).expect("digest");
        assert!(html.contains("Nowe oferty (5)"));
        assert!(html.contains("Powtarzające się oferty (1)"));
        assert!(html.contains("Deal A!!"));
        assert!(html.contains("deal a"));
        assert!(html.contains("Skoda Fabia, 2019"));
        assert!(html.contains("Kawa ziarnista 1kg"));
        assert!(dir.path().join("cache").join("pepper.seen.json.zst").exists());

        let second = pipeline.run_once(&["pepper".to_string()]).await.expect("second run");
        assert_eq!(second.fetched_offers, 2);
        assert_eq!(second.fresh_offers, 0);
        let html = std::fs::read_to_string(&second.output_path).expect("digest");
        assert!(html.contains("Brak nowych ofert."));
    }

    #[tokio::test]
    async fn failed_email_is_logged_and_run_still_succeeds() {
        let dir = tempdir().expect("tempdir");
        let sources_file = dir.path().join("sources.yaml");
        std::fs::write(
            &sources_file,
            format!(
                "sources:\n  - source_id: pepper\n    display_name: Pepper\n    kind: rendered\n    url: https://pepper.example.test/\n    preset: pepper\n    fixture: {}\n",
                workspace_root().join("fixtures/pepper/rendered.html").display()
            ),
        )
        .expect("write registry");

        let pipeline = SyncPipeline::new(SyncConfig {
            sources_file,
            cache_dir: dir.path().join("cache"),
            output_path: dir.path().join("digest.html"),
            email: true,
            mail: Some(MailConfig {
                host: "localhost".into(),
                port: 9,
                username: None,
                password: None,
                from: "bot@example.test".into(),
                to: vec!["me@example.test".into()],
                subject: "Oferty LZX i Pepper".into(),
            }),
            ..SyncConfig::default()
        })
        .expect("pipeline");

        let summary = pipeline.run_once(&[]).await.expect("run despite mail failure");
        assert!(!summary.emailed);
        assert_eq!(summary.unique_offers, 2);
        assert!(summary.output_path.exists());
    }

    #[tokio::test]
    async fn email_is_off_unless_requested() {
        let pipeline = SyncPipeline::new(SyncConfig::default()).expect("pipeline");
        assert!(pipeline.mailer.is_none());
        assert!(!pipeline.send_email("<p>x</p>".into()).await);
    }

    #[tokio::test]
    async fn missing_registry_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(SyncConfig {
            sources_file: dir.path().join("absent.yaml"),
            ..SyncConfig::default()
        })
        .expect("pipeline");
        let err = pipeline.run_once(&[]).await.unwrap_err();
        assert!(format!("{err:#}").contains("absent.yaml"));
    }
}
