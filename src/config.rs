// This module handles the TOML config file.
// Every value has a default, so running without a config file reproduces the stock setup:
// a local ComfyUI on port 8188, the Chroma workflow, and the node ids baked into it.
//
// Unlike the workflow and prompts, the config is read once at startup.

use std::path::Path;

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "text, words, letters, font, watermark, signature, logo, UI, interface, button, subtitle, caption, speech bubble, comic text, manga text, handwritten, scribble, multiple subgraphs, collage, split image, diptych, triptych, panels, anime, cartoon, illustration, comic panels, photo frames, borders, grid, layout, multiple subjects, disconnected elements, disorganized, chaotic composition, floating objects, misplaced limbs, nonsensical object placement, broken anatomy, extra limbs, fused fingers, blurry, unfocused, out of focus, low resolution, bad quality, worst quality, jpeg artifacts, noise, dull colors, flat background, boring composition, nonsensical object placement";

lazy_static! {
    pub static ref DEFAULT_STYLES: Vec<&'static str> = vec![
        "facial lighting soft and even, professional portrait photography style, high definition, rich detail, natural skin texture.",
        "This is a high-definition, high-quality portrait photograph taken with a professional camera with well composed frame.",
        "4K resolution, rich in detail, hyper-realistic.",
        "masterpiece, best quality, photorealistic, 8K, realistic.",
    ];
    pub static ref DEFAULT_PARAMS: Vec<SweepParam> = vec![
        SweepParam { guidance_scale: 4.0, steps: 23 },
        SweepParam { guidance_scale: 4.5, steps: 26 },
    ];
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub files: FilesConfig,
    pub nodes: NodeIds,
    pub batch: BatchConfig,
    pub sweep: SweepConfig,
    pub upload: UploadConfig,
    pub gallery: GalleryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub submit_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8188".to_string(),
            submit_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesConfig {
    pub workflow: String,
    pub prompts: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            workflow: "chroma_workflow_api.json".to_string(),
            prompts: "prompts.json".to_string(),
        }
    }
}

/// Node ids inside the API-format workflow.
/// These only hold for the workflow they were exported from; re-exporting renumbers them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeIds {
    pub positive: String,
    pub negative: String,
    pub seed: String,
    pub save: String,
    pub batch: String,
    pub guidance: String,
    pub steps: String,
}

impl Default for NodeIds {
    fn default() -> Self {
        Self {
            positive: "748".to_string(),
            negative: "749".to_string(),
            seed: "718".to_string(),
            save: "740".to_string(),
            batch: "737".to_string(),
            guidance: "694".to_string(),
            steps: "751".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Images per queued prompt. Kept low for VRAM.
    pub batch_size: u32,
    pub negative_prompt: String,
    /// Pause after every item, whatever happened to it.
    pub item_pause_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            item_pause_secs: 360,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SweepParam {
    pub guidance_scale: f64,
    pub steps: u32,
}

impl SweepParam {
    /// Both knobs must be positive; NaN is rejected too.
    pub fn validate(&self) -> Result<()> {
        if self.guidance_scale.is_nan() || self.guidance_scale <= 0.0 {
            bail!("guidance scale must be positive, got {}", self.guidance_scale);
        }
        if self.steps == 0 {
            bail!("step count must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    pub runs: u32,
    pub cooldown_secs: u64,
    pub styles: Vec<String>,
    // Keep this last; TOML wants plain values ahead of arrays of tables.
    pub params: Vec<SweepParam>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            runs: 100,
            cooldown_secs: 120,
            styles: DEFAULT_STYLES.iter().map(|s| s.to_string()).collect(),
            params: DEFAULT_PARAMS.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub url: String,
    pub login_timeout_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:38889".to_string(),
            login_timeout_secs: 10,
            upload_timeout_secs: 30,
        }
    }
}

/// The receiving end of the upload client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GalleryConfig {
    pub listen: String,
    pub uploads_dir: String,
    pub per_page: usize,
    /// Login token. Falls back to $TOKEN; with neither, the gallery is open to anyone.
    pub token: Option<String>,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:38889".to_string(),
            uploads_dir: "./uploads".to_string(),
            per_page: 20,
            token: None,
        }
    }
}

impl Config {
    /// Loads the config file, or the defaults if no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Error reading {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("Error parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep.params.is_empty() {
            bail!("sweep.params must not be empty");
        }
        if self.sweep.styles.is_empty() {
            bail!("sweep.styles must not be empty");
        }
        for param in &self.sweep.params {
            param.validate()?;
        }
        if self.gallery.per_page == 0 {
            bail!("gallery.per_page must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn testconfig() -> Config {
    Config::parse(include_str!("../testdata/config.toml")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let config2 = Config::parse(&text).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_testconfig() {
        let config = testconfig();
        config.validate().unwrap();
        assert_eq!(config.server.url, "http://gpu-box:8188");
        assert_eq!(config.sweep.runs, 3);
        assert_eq!(config.sweep.params, vec![SweepParam { guidance_scale: 5.0, steps: 30 }]);
        assert_eq!(config.sweep.styles, vec!["film grain.".to_string()]);
        // Untouched sections fall back to the defaults.
        assert_eq!(config.nodes, NodeIds::default());
        assert_eq!(config.batch, BatchConfig::default());
        assert_eq!(config.upload.upload_timeout_secs, 30);
        assert_eq!(config.gallery, GalleryConfig::default());
    }

    #[test]
    fn test_rejects_empty_sweep() {
        let config = Config::parse("[sweep]\nstyles = []\n").unwrap();
        assert!(config.validate().is_err());
        let config = Config::parse("[sweep]\nparams = []\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_params() {
        let config = Config::parse("[[sweep.params]]\nguidance_scale = 0.0\nsteps = 20\n").unwrap();
        assert!(config.validate().is_err());
        let config = Config::parse("[[sweep.params]]\nguidance_scale = 4.0\nsteps = 0\n").unwrap();
        assert!(config.validate().is_err());
        let config = Config::parse("[[sweep.params]]\nguidance_scale = nan\nsteps = 20\n").unwrap();
        assert!(config.validate().is_err());
        let config = Config::parse("[gallery]\nper_page = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweep_param_validate() {
        assert!(SweepParam { guidance_scale: 4.5, steps: 26 }.validate().is_ok());
        assert!(SweepParam { guidance_scale: 0.0, steps: 26 }.validate().is_err());
        assert!(SweepParam { guidance_scale: -1.0, steps: 26 }.validate().is_err());
        assert!(SweepParam { guidance_scale: f64::NAN, steps: 26 }.validate().is_err());
        assert!(SweepParam { guidance_scale: 4.5, steps: 0 }.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[batch]\nitem_pause_secs = 5\n").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.batch.item_pause_secs, 5);
        assert_eq!(config.batch.batch_size, 3);

        assert!(Config::load(Some(Path::new("/nonexistent/config.toml"))).is_err());
    }
}
