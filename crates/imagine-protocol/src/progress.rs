//! Per-attempt image progress tracking.
//!
//! Each delivered image is classified into a quality stage by payload size
//! and URL shape. Deliveries for the same image id refine the entry in place
//! until a final-quality delivery arrives.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ProtocolConfig;

/// Quality tier of a delivered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    Preview,
    Medium,
    Final,
}

impl ImageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Medium => "medium",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for ImageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static IMAGE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/images/([a-f0-9-]+)\.(png|jpg)").unwrap());

/// Extract the image identifier from a delivery URL.
///
/// The id is the UUID-like segment directly before the `.png`/`.jpg` extension.
pub fn extract_image_id(url: &str) -> Option<String> {
    IMAGE_ID_REGEX
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Classify a delivery by its URL and encoded payload length.
pub fn classify_stage(url: &str, payload_len: usize, config: &ProtocolConfig) -> ImageStage {
    if url.ends_with(".jpg") && payload_len > config.final_min_bytes {
        ImageStage::Final
    } else if payload_len > config.medium_min_bytes {
        ImageStage::Medium
    } else {
        ImageStage::Preview
    }
}

/// One candidate image within an attempt.
#[derive(Debug, Clone)]
pub struct ImageProgress {
    pub image_id: String,
    pub stage: ImageStage,
    /// Base64 payload as delivered.
    pub blob: String,
    pub blob_size: usize,
    pub url: String,
    pub is_final: bool,
}

impl ImageProgress {
    /// Build an entry from a raw delivery, or `None` if the URL carries no image id.
    pub fn from_delivery(blob: String, url: String, config: &ProtocolConfig) -> Option<Self> {
        let image_id = extract_image_id(&url)?;
        let blob_size = blob.len();
        let stage = classify_stage(&url, blob_size, config);
        Some(Self {
            image_id,
            stage,
            blob,
            blob_size,
            url,
            is_final: stage == ImageStage::Final,
        })
    }
}

/// Aggregate state of one attempt.
#[derive(Debug, Clone)]
pub struct GenerationProgress {
    /// Requested image count.
    pub total: usize,
    images: HashMap<String, ImageProgress>,
}

impl GenerationProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            images: HashMap::new(),
        }
    }

    /// Apply a delivery. Returns `true` if the entry was stored.
    ///
    /// A non-final entry is replaced by any newer delivery for the same id;
    /// final entries are never replaced.
    pub fn apply(&mut self, entry: ImageProgress) -> bool {
        if let Some(existing) = self.images.get(&entry.image_id)
            && existing.is_final
        {
            return false;
        }
        self.images.insert(entry.image_id.clone(), entry);
        true
    }

    pub fn get(&self, image_id: &str) -> Option<&ImageProgress> {
        self.images.get(image_id)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageProgress> {
        self.images.values()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Number of final-stage entries.
    pub fn completed(&self) -> usize {
        self.images.values().filter(|img| img.is_final).count()
    }

    pub fn has_medium(&self) -> bool {
        self.images
            .values()
            .any(|img| img.stage == ImageStage::Medium)
    }

    pub fn has_final(&self) -> bool {
        self.images.values().any(|img| img.is_final)
    }

    /// Intermediate output was produced but no final image.
    pub fn is_blocked(&self) -> bool {
        self.has_medium() && !self.has_final()
    }

    /// Highest-quality entries, final first then larger payloads, at most `limit`.
    pub fn best_images(&self, limit: usize) -> Vec<&ImageProgress> {
        let mut images: Vec<&ImageProgress> = self.images.values().collect();
        images.sort_by(|a, b| {
            b.is_final
                .cmp(&a.is_final)
                .then_with(|| b.blob_size.cmp(&a.blob_size))
        });
        images.truncate(limit);
        images
    }
}
