// Ships finished images off to the gallery server.
//
// The flow is: log in with a token (the server hands back a session cookie), then POST each
// image as a PNG. Nothing is returned to the caller; success and failure are only logged.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::{codecs::png::PngEncoder, ColorType, DynamicImage, ImageEncoder};
use log::{error, info};
use reqwest::multipart::{Form, Part};

use crate::config::UploadConfig;

/// An image as float samples in [0, 1], laid out [height][width][channels].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    height: u32,
    width: u32,
    channels: u8,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(height: u32, width: u32, channels: u8, data: Vec<f32>) -> Result<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            bail!("unsupported channel count {}", channels);
        }
        let expected = height as usize * width as usize * channels as usize;
        if data.len() != expected {
            bail!("tensor has {} samples, expected {}x{}x{} = {}", data.len(), height, width, channels, expected);
        }
        Ok(Self { height, width, channels, data })
    }

    /// Converts a decoded image, keeping alpha if it has one.
    pub fn from_image(image: &DynamicImage) -> Self {
        let (channels, data) = if image.color().has_alpha() {
            (4, image.to_rgba32f().into_raw())
        } else {
            (3, image.to_rgb32f().into_raw())
        };
        Self {
            height: image.height(),
            width: image.width(),
            channels,
            data,
        }
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        // NaN casts to 0.
        let pixels = self
            .data
            .iter()
            .map(|v| (255.0 * v).clamp(0.0, 255.0) as u8)
            .collect::<Vec<_>>();
        let color = match self.channels {
            1 => ColorType::L8,
            3 => ColorType::Rgb8,
            _ => ColorType::Rgba8,
        };
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(&pixels, self.width, self.height, color)
            .context("failed to encode PNG")?;
        Ok(png)
    }
}

/// Explicit token first, then $TOKEN. Blank counts as missing.
pub fn resolve_token(explicit: Option<&str>) -> Option<String> {
    resolve_token_from(explicit, std::env::var("TOKEN").ok())
}

fn resolve_token_from(explicit: Option<&str>, env: Option<String>) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .or_else(|| env.map(|t| t.trim().to_owned()).filter(|t| !t.is_empty()))
}

pub struct Uploader {
    client: reqwest::Client,
    base_url: String,
    login_timeout: Duration,
    upload_timeout: Duration,
}

impl Uploader {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            login_timeout: Duration::from_secs(config.login_timeout_secs),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        })
    }

    /// Uploads each image as `{prefix}_{index}.png`.
    pub async fn upload(&self, images: &[ImageTensor], filename_prefix: &str, token: Option<&str>) {
        let Some(token) = resolve_token(token) else {
            error!("Missing token. Pass one explicitly or set TOKEN.");
            return;
        };
        match self.login(&token).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("Login error: {:#}", e);
                return;
            }
        }

        for (index, image) in images.iter().enumerate() {
            let filename = format!("{}_{}.png", filename_prefix, index);
            match self.upload_one(&filename, image).await {
                Ok(()) => info!("Uploaded {}", filename),
                Err(e) => error!("Upload failed for {}: {:#}", filename, e),
            }
        }
    }

    async fn login(&self, token: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/login", self.base_url))
            .timeout(self.login_timeout)
            .form(&[("token", token)])
            .send()
            .await
            .context("failed to send login request")?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            error!("Login failed: {} {}", status.as_u16(), text);
            return Ok(false);
        }
        Ok(true)
    }

    async fn upload_one(&self, filename: &str, image: &ImageTensor) -> Result<()> {
        let png = image.to_png()?;
        let part = Part::bytes(png)
            .file_name(filename.to_owned())
            .mime_str("image/png")
            .context("bad mime type")?;
        let response = self
            .client
            .post(format!("{}/api/v1/upload", self.base_url))
            .timeout(self.upload_timeout)
            .multipart(Form::new().part("image", part))
            .send()
            .await
            .context("failed to send upload request")?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            bail!("upload failed: {} {}", status.as_u16(), text);
        }
        Ok(())
    }
}
