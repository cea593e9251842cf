use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::truncate_text;
use crate::vision::response_json_or_error;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "dall-e-3";
const DEFAULT_SIZE: &str = "1024x1024";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Text-to-image API plus the download of its results. `generate` returns a
/// URL so that variants-mode results can be handed to clients without a
/// local copy; `fetch` resolves a URL to raster bytes for compositing.
pub trait ImageGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// OpenAI `images/generations` client, one image per call.
pub struct OpenAiImages {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl OpenAiImages {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_base = env::var("OPENAI_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let model = env::var("KEEPSAKE_IMAGE_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build image generation HTTP client")?;
        Ok(Self {
            api_base,
            api_key: api_key.into(),
            model,
            http,
        })
    }
}

impl ImageGenerator for OpenAiImages {
    fn generate(&self, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": DEFAULT_SIZE,
            "response_format": "url",
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("image generation request failed ({endpoint})"))?;
        let parsed = response_json_or_error("image generation", response)?;
        first_image_url(&parsed)
            .ok_or_else(|| anyhow::anyhow!("image generation response returned no URL"))
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading generated image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "generated image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading generated image bytes")?
            .to_vec())
    }
}

fn first_image_url(response: &Value) -> Option<String> {
    response
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_object)
        .and_then(|row| row.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Deterministic offline generator. Renders a solid-color PNG derived from
/// the prompt and hands it back as a data URL, so pipelines can run end to
/// end without a network.
#[derive(Default)]
pub struct DryrunGenerator {
    counter: AtomicU64,
}

impl DryrunGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageGenerator for DryrunGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        let seed = self.counter.fetch_add(1, Ordering::SeqCst);
        let (r, g, b) = color_from_prompt(prompt, seed);
        let mut canvas = RgbImage::new(256, 256);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(canvas)
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .context("failed encoding dryrun image")?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let Some(encoded) = url.strip_prefix("data:image/png;base64,") else {
            bail!("dryrun generator can only fetch its own data URLs");
        };
        BASE64
            .decode(encoded.as_bytes())
            .context("dryrun image base64 decode failed")
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hash = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    for byte in prompt.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(u64::from(byte));
    }
    ((hash >> 16) as u8, (hash >> 8) as u8, hash as u8)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn first_image_url_reads_data_array() {
        let response = json!({
            "created": 1,
            "data": [{ "url": " https://img.example/one.png " }],
        });
        assert_eq!(
            first_image_url(&response).as_deref(),
            Some("https://img.example/one.png")
        );
        assert!(first_image_url(&json!({ "data": [] })).is_none());
        assert!(first_image_url(&json!({ "data": [{ "url": "" }] })).is_none());
    }

    #[test]
    fn dryrun_round_trip_yields_a_decodable_png() -> anyhow::Result<()> {
        let generator = DryrunGenerator::new();
        let url = generator.generate("festive logo")?;
        assert!(url.starts_with("data:image/png;base64,"));

        let bytes = generator.fetch(&url)?;
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!(decoded.width(), 256);
        assert_eq!(decoded.height(), 256);
        Ok(())
    }

    #[test]
    fn dryrun_rejects_foreign_urls() {
        let generator = DryrunGenerator::new();
        assert!(generator.fetch("https://img.example/one.png").is_err());
    }

    #[test]
    fn repeated_calls_vary_the_color() -> anyhow::Result<()> {
        let generator = DryrunGenerator::new();
        let first = generator.generate("same prompt")?;
        let second = generator.generate("same prompt")?;
        assert_ne!(first, second);
        Ok(())
    }
}
