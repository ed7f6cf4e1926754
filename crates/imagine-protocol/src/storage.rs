//! Persistence of generated images.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::progress::{ImageProgress, ImageStage};

/// A persisted image with a stable reference.
#[derive(Debug, Clone, Serialize)]
pub struct SavedImage {
    pub image_id: String,
    pub stage: ImageStage,
    pub file_name: String,
    pub path: PathBuf,
    /// Public URL the presentation layer can hand out.
    pub url: String,
    /// Base64 payload as delivered by the upstream.
    #[serde(skip_serializing)]
    pub b64: String,
    /// Decoded size in bytes.
    pub size_bytes: usize,
}

/// Destination for finished images.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn save(&self, image: &ImageProgress) -> Result<SavedImage>;
}

/// File name used for a stored image: finals are jpg, everything else png.
pub fn image_file_name(image: &ImageProgress) -> String {
    let ext = if image.is_final { "jpg" } else { "png" };
    format!("{}.{}", image.image_id, ext)
}

/// Writes images into a local directory.
#[derive(Debug, Clone)]
pub struct FsImageSink {
    images_dir: PathBuf,
    base_url: String,
}

impl FsImageSink {
    pub fn new(images_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            images_dir: images_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Public URL for a stored file.
    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/images/{}", self.base_url, file_name)
    }
}

#[async_trait]
impl ImageSink for FsImageSink {
    async fn save(&self, image: &ImageProgress) -> Result<SavedImage> {
        let data = STANDARD.decode(image.blob.as_bytes())?;

        tokio::fs::create_dir_all(&self.images_dir).await?;
        let file_name = image_file_name(image);
        let path = self.images_dir.join(&file_name);
        tokio::fs::write(&path, &data).await?;

        info!(
            file = %file_name,
            size_kb = format!("{:.1}", data.len() as f64 / 1024.0),
            stage = %image.stage,
            "Saved image"
        );

        Ok(SavedImage {
            image_id: image.image_id.clone(),
            stage: image.stage,
            url: self.url_for(&file_name),
            file_name,
            path,
            b64: image.blob.clone(),
            size_bytes: data.len(),
        })
    }
}

/// Keeps decoded images in memory.
#[derive(Debug, Default)]
pub struct MemoryImageSink {
    saved: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryImageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// File names and decoded bytes saved so far.
    pub fn saved(&self) -> Vec<(String, Vec<u8>)> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl ImageSink for MemoryImageSink {
    async fn save(&self, image: &ImageProgress) -> Result<SavedImage> {
        let data = STANDARD.decode(image.blob.as_bytes())?;
        let file_name = image_file_name(image);
        let size_bytes = data.len();
        self.saved.lock().push((file_name.clone(), data));

        Ok(SavedImage {
            image_id: image.image_id.clone(),
            stage: image.stage,
            url: format!("memory://images/{file_name}"),
            path: PathBuf::from(&file_name),
            file_name,
            b64: image.blob.clone(),
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;

    fn final_image() -> ImageProgress {
        let blob = STANDARD.encode(vec![7u8; 90_000]);
        ImageProgress::from_delivery(
            blob,
            "https://x/images/abcdef01-2345.jpg".to_string(),
            &ProtocolConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fs_sink_writes_decoded_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsImageSink::new(dir.path().join("images"), "http://127.0.0.1:9563/");

        let image = final_image();
        assert!(image.is_final);
        let saved = sink.save(&image).await.unwrap();

        assert_eq!(saved.file_name, "abcdef01-2345.jpg");
        assert_eq!(saved.url, "http://127.0.0.1:9563/images/abcdef01-2345.jpg");
        assert_eq!(saved.size_bytes, 90_000);
        let on_disk = std::fs::read(&saved.path).unwrap();
        assert_eq!(on_disk.len(), 90_000);
    }

    #[tokio::test]
    async fn test_invalid_base64_is_an_error() {
        let sink = MemoryImageSink::new();
        let mut image = final_image();
        image.blob = "***not base64***".to_string();
        assert!(sink.save(&image).await.is_err());
        assert!(sink.saved().is_empty());
    }
}
