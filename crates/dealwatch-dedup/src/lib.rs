//! Offer deduplication: perceptual image hashing plus greedy single-pass clustering.

use dealwatch_core::{to_record, ExportConfig, ImageHash, Offer, OfferRecord};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

pub const CRATE_NAME: &str = "dealwatch-dedup";

pub const DEFAULT_HASH_SIZE: u32 = 16;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.10;

/// Average-hash over an N×N grayscale grid.
#[derive(Debug, Clone, Copy)]
pub struct AverageHasher {
    side: u32,
}

impl Default for AverageHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_SIZE)
    }
}

impl AverageHasher {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(1) }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    /// Decodes `bytes` and hashes the image. Undecodable input yields `None`.
    pub fn hash_bytes(&self, bytes: &[u8]) -> Option<ImageHash> {
        match image::load_from_memory(bytes) {
            Ok(image) => self.hash_image(&image),
            Err(err) => {
                debug!(error = %err, byte_len = bytes.len(), "image decode failed; no hash");
                None
            }
        }
    }

    pub fn hash_image(&self, image: &DynamicImage) -> Option<ImageHash> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            debug!("empty image; no hash");
            return None;
        }
        let pixels = image
            .grayscale()
            .resize_exact(self.side, self.side, FilterType::Lanczos3)
            .to_luma8()
            .into_raw();
        let mean = pixels.iter().map(|&p| u64::from(p)).sum::<u64>() as f64 / pixels.len() as f64;
        Some(ImageHash::from_bits(
            self.side,
            pixels.iter().map(|&p| f64::from(p) > mean),
        ))
    }

    /// Hashes the offer's image unless it already carries a hash.
    pub fn attach(&self, offer: Offer, image_bytes: Option<&[u8]>) -> Offer {
        if offer.image_hash().is_some() {
            return offer;
        }
        let hash = image_bytes.and_then(|bytes| self.hash_bytes(bytes));
        offer.with_image_hash(hash)
    }
}

/// Hashes with the default 16×16 grid.
pub fn compute_image_hash(bytes: &[u8]) -> Option<ImageHash> {
    AverageHasher::default().hash_bytes(bytes)
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub require_same_price: bool,
    /// Largest normalized Hamming distance at which two images count as the same.
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            require_same_price: true,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Offers judged to be the same real-world deal. The seed is always first.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferGroup {
    members: Vec<Offer>,
}

impl OfferGroup {
    pub fn seed(&self) -> &Offer {
        &self.members[0]
    }

    pub fn members(&self) -> &[Offer] {
        &self.members
    }

    pub fn into_members(self) -> Vec<Offer> {
        self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_unique(&self) -> bool {
        self.members.len() == 1
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Title, then price, then image distance. An absent or incomparable hash on
    /// either side leaves the decision to title and price.
    pub fn is_duplicate(&self, seed: &Offer, candidate: &Offer) -> bool {
        if seed.normalized_title() != candidate.normalized_title() {
            return false;
        }
        if self.config.require_same_price && seed.price_text() != candidate.price_text() {
            return false;
        }
        match (seed.image_hash(), candidate.image_hash()) {
            (Some(a), Some(b)) => a
                .distance(b)
                .map_or(true, |distance| distance <= self.config.similarity_threshold),
            _ => true,
        }
    }

    /// Greedy single pass: the last remaining offer seeds a group and absorbs every
    /// remaining match. Finished groups are never revisited or merged.
    pub fn group(&self, offers: Vec<Offer>) -> Vec<OfferGroup> {
        let input_len = offers.len();
        let mut remaining = offers;
        let mut groups = Vec::new();

        while let Some(seed) = remaining.pop() {
            let (joined, survivors): (Vec<Offer>, Vec<Offer>) = remaining
                .into_iter()
                .partition(|candidate| self.is_duplicate(&seed, candidate));
            remaining = survivors;

            let mut members = Vec::with_capacity(joined.len() + 1);
            members.push(seed);
            members.extend(joined);
            groups.push(OfferGroup { members });
        }

        debug!(offers = input_len, groups = groups.len(), "grouped offers");
        groups
    }

    pub fn split(&self, offers: Vec<Offer>) -> GroupedOffers {
        GroupedOffers::from_groups(self.group(offers))
    }
}

/// Groups split into singletons and duplicate clusters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedOffers {
    pub unique: Vec<Offer>,
    pub duplicates: Vec<Vec<Offer>>,
}

impl GroupedOffers {
    pub fn from_groups(groups: Vec<OfferGroup>) -> Self {
        let mut out = Self::default();
        for group in groups {
            let mut members = group.into_members();
            if members.len() == 1 {
                out.unique.append(&mut members);
            } else {
                out.duplicates.push(members);
            }
        }
        out
    }

    pub fn total_offers(&self) -> usize {
        self.unique.len() + self.duplicates.iter().map(Vec::len).sum::<usize>()
    }

    pub fn unique_records(&self, config: &ExportConfig) -> Vec<OfferRecord> {
        self.unique.iter().map(|o| to_record(o, config)).collect()
    }

    pub fn duplicate_records(&self, config: &ExportConfig) -> Vec<Vec<OfferRecord>> {
        self.duplicates
            .iter()
            .map(|cluster| cluster.iter().map(|o| to_record(o, config)).collect())
            .collect()
    }
}
