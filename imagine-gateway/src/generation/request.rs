//! Generation request parameters.

use serde::{Deserialize, Serialize};

/// Aspect ratio used when the caller gives none.
pub const DEFAULT_ASPECT_RATIO: &str = "2:3";

/// Image count used when the caller gives none.
pub const DEFAULT_IMAGE_COUNT: usize = 4;

/// Defaults applied to new requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub aspect_ratio: String,
    pub image_count: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            image_count: DEFAULT_IMAGE_COUNT,
        }
    }
}

/// One orchestrated generation.
#[derive(Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_count: usize,
    /// Pin the request to this token; disables rotation retries.
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, defaults: &GenerationDefaults) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: defaults.aspect_ratio.clone(),
            image_count: defaults.image_count.max(1),
            credential: None,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = aspect_ratio.into();
        self
    }

    /// Use the aspect ratio matching an OpenAI-style `WxH` size.
    pub fn with_size(self, size: &str) -> Self {
        self.with_aspect_ratio(size_to_aspect_ratio(size))
    }

    pub fn with_image_count(mut self, image_count: usize) -> Self {
        self.image_count = image_count.max(1);
        self
    }

    pub fn with_credential(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(token.into());
        self
    }
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt", &self.prompt)
            .field("aspect_ratio", &self.aspect_ratio)
            .field("image_count", &self.image_count)
            .field(
                "credential",
                &self.credential.as_deref().map(imagine_protocol::mask_token),
            )
            .finish()
    }
}

/// Map an OpenAI-style size to an upstream aspect ratio.
pub fn size_to_aspect_ratio(size: &str) -> &'static str {
    match size.trim() {
        "1024x1024" | "512x512" | "256x256" => "1:1",
        "1024x1536" => "2:3",
        "1536x1024" => "3:2",
        _ => DEFAULT_ASPECT_RATIO,
    }
}
