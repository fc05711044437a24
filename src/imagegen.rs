//! Image generation provider client.
//!
//! The provider is an opaque HTTP boundary: POST a prompt plus options, get
//! back either inline base64 image data or a fetchable URL. Both result
//! shapes must be supported; which one arrives depends on the provider and
//! the image size.

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct ImageGenClient {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

/// One generation request, resolved from an AiJob's prompt and params.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f64>,
}

/// Decoded generation result.
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    /// Inline base64-encoded image data
    b64: Option<String>,
    /// Fetchable URL for the image bytes
    url: Option<String>,
    request_id: Option<String>,
}

impl ImageGenClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http: Client::new(),
        }
    }

    /// Run one generation and return the raw image bytes.
    pub async fn generate(&self, req: &GenerateRequest) -> Result<GeneratedImage, ImageGenError> {
        let url = format!("{}/generate", self.base_url);

        let mut request = self.http.post(&url).json(req);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let resp = request.send().await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(ImageGenError::Api(text));
        }

        let parsed: GenerateResponse = resp.json().await?;

        let bytes = if let Some(b64) = parsed.b64 {
            base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map_err(|e| ImageGenError::Decode(format!("invalid base64 payload: {}", e)))?
        } else if let Some(image_url) = parsed.url {
            self.fetch_url(&image_url).await?
        } else {
            return Err(ImageGenError::Api(
                "provider returned neither inline data nor a url".to_string(),
            ));
        };

        if bytes.is_empty() {
            return Err(ImageGenError::Decode("provider returned empty image".to_string()));
        }

        Ok(GeneratedImage {
            bytes,
            request_id: parsed.request_id,
        })
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, ImageGenError> {
        let resp = self.http.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(ImageGenError::Api(format!(
                "image fetch failed with status {}",
                resp.status()
            )));
        }

        Ok(resp.bytes().await?.to_vec())
    }
}

#[derive(Debug)]
pub enum ImageGenError {
    Http(reqwest::Error),
    Api(String),
    Decode(String),
}

impl From<reqwest::Error> for ImageGenError {
    fn from(e: reqwest::Error) -> Self {
        ImageGenError::Http(e)
    }
}

impl std::fmt::Display for ImageGenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageGenError::Http(e) => write!(f, "HTTP error: {}", e),
            ImageGenError::Api(s) => write!(f, "Provider API error: {}", s),
            ImageGenError::Decode(s) => write!(f, "Decode error: {}", s),
        }
    }
}

impl std::error::Error for ImageGenError {}
