//! Core offer model, title normalization and export records for dealwatch.

use chrono::{DateTime, Locale, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealwatch-core";

/// Ingestion handoff contract from source adapters into the sync pipeline.
///
/// Adapters default missing text fields to the empty string, so nothing downstream
/// has to reason about partially present records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOffer {
    pub source_id: String,
    pub title: String,
    pub price_text: String,
    pub link: String,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl RawOffer {
    /// Returns the same offer pointing at `link` (e.g. after redirect resolution).
    pub fn with_link(self, link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ..self
        }
    }
}

/// Lowercase, ASCII-alphanumeric-only canonical form of a title.
///
/// All-punctuation titles collapse to `""` and therefore compare equal to each other.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Fixed-width perceptual hash: `side * side` bits packed into 64-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageHash {
    side: u32,
    words: Vec<u64>,
}

impl ImageHash {
    /// Packs the first `side * side` bits of `bits`; missing bits are zero.
    pub fn from_bits<I>(side: u32, bits: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        let len = (side as usize) * (side as usize);
        let mut words = vec![0u64; len.div_ceil(64)];
        for (idx, bit) in bits.into_iter().take(len).enumerate() {
            if bit {
                words[idx / 64] |= 1u64 << (idx % 64);
            }
        }
        Self { side, words }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn bit_len(&self) -> usize {
        (self.side as usize) * (self.side as usize)
    }

    pub fn bit(&self, idx: usize) -> bool {
        idx < self.bit_len() && (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    /// Number of differing bits, or `None` when the grids have different sizes.
    pub fn hamming(&self, other: &ImageHash) -> Option<u32> {
        if self.side != other.side {
            return None;
        }
        Some(
            self.words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    /// Normalized Hamming distance in `[0, 1]`.
    pub fn distance(&self, other: &ImageHash) -> Option<f64> {
        let differing = self.hamming(other)?;
        let len = self.bit_len();
        if len == 0 {
            return Some(0.0);
        }
        Some(f64::from(differing) / len as f64)
    }

    pub fn to_hex(&self) -> String {
        self.words.iter().map(|w| format!("{w:016x}")).collect()
    }
}

/// Enriched offer used by the dedup engine. Immutable once built; every change
/// produces a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    source_id: String,
    title: String,
    normalized_title: String,
    price_text: String,
    link: String,
    image_url: Option<String>,
    image_hash: Option<ImageHash>,
    published_at: DateTime<Utc>,
}

impl Offer {
    pub fn from_raw(raw: RawOffer) -> Self {
        let normalized_title = normalize_title(&raw.title);
        Self {
            source_id: raw.source_id,
            title: raw.title,
            normalized_title,
            price_text: raw.price_text,
            link: raw.link,
            image_url: raw.image_url,
            image_hash: None,
            published_at: raw.published_at,
        }
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            normalized_title: normalize_title(&title),
            title,
            ..self
        }
    }

    /// Attaches a hash unless one is already present; the first computed hash wins.
    pub fn with_image_hash(self, hash: Option<ImageHash>) -> Self {
        if self.image_hash.is_some() {
            return self;
        }
        Self {
            image_hash: hash,
            ..self
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn normalized_title(&self) -> &str {
        &self.normalized_title
    }

    pub fn price_text(&self) -> &str {
        &self.price_text
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn image_hash(&self) -> Option<&ImageHash> {
        self.image_hash.as_ref()
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

/// Flat display record handed to the notification renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub image: Option<String>,
    pub link: String,
    pub price: String,
    pub date: String,
    pub name: String,
}

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Warsaw;

#[derive(Debug, Clone, Copy)]
pub struct ExportConfig {
    /// Zone the digest dates are shown in; DST transitions follow the tz database.
    pub timezone: Tz,
    pub locale: Locale,
    /// strftime pattern of the locale's medium date form.
    pub date_pattern: &'static str,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            locale: Locale::pl_PL,
            date_pattern: "%-d %b %Y",
        }
    }
}

impl ExportConfig {
    /// Switches to an IANA zone such as `"Europe/Warsaw"`; `None` for unknown names.
    pub fn with_timezone_name(self, name: &str) -> Option<Self> {
        let timezone: Tz = name.trim().parse().ok()?;
        Some(Self { timezone, ..self })
    }

    pub fn format_date(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone)
            .format_localized(self.date_pattern, self.locale)
            .to_string()
    }
}

pub fn to_record(offer: &Offer, config: &ExportConfig) -> OfferRecord {
    OfferRecord {
        image: offer.image_url().map(str::to_string),
        link: offer.link().to_string(),
        price: offer.price_text().to_string(),
        date: config.format_date(offer.published_at()),
        name: offer.title().to_string(),
    }
}
