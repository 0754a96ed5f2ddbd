use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use crate::{
    comfy::ComfyClient,
    config::{Config, SweepParam},
    pacing::SleepPacer,
    submitter::BatchSubmitter,
    upload::{resolve_token, ImageTensor, Uploader},
};

mod comfy;
mod config;
mod driver;
mod gallery;
mod pacing;
mod submitter;
#[cfg(test)]
mod testutil;
mod upload;
mod workflow;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    /// TOML config file. Built-in defaults are used if omitted.
    #[arg(long, short)]
    pub config_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep: repeatedly run batches with a random cfg/steps pair and style.
    Run {
        /// Overrides sweep.runs.
        #[arg(long)]
        runs: Option<u32>,
    },
    /// Submit every prompt once with fixed settings.
    Batch {
        #[arg(long)]
        cfg: f64,
        #[arg(long)]
        steps: u32,
        #[arg(long, default_value = "")]
        style: String,
    },
    /// Upload image files to the gallery server.
    Upload {
        #[arg(long, default_value = "img")]
        prefix: String,
        /// Falls back to $TOKEN.
        #[arg(long)]
        token: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the gallery server that uploads go to.
    Serve {
        /// Overrides gallery.listen.
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let config = Config::load(args.config_path.as_deref()).context("failed to initialize config")?;
    info!("Loaded config: {:?}", config);

    match args.command {
        Command::Run { runs } => {
            let runs = runs.unwrap_or(config.sweep.runs);
            let queue = ComfyClient::new(&config.server)?;
            let submitter = BatchSubmitter::new(config, queue, SleepPacer);
            submitter.run_sweep(runs).await?;
        }
        Command::Batch { cfg, steps, style } => {
            SweepParam { guidance_scale: cfg, steps }.validate()?;
            let queue = ComfyClient::new(&config.server)?;
            let submitter = BatchSubmitter::new(config, queue, SleepPacer);
            let mut rng = driver::wall_clock_rng();
            submitter.submit_batch(&mut rng, cfg, steps, &style).await?;
        }
        Command::Upload { prefix, token, files } => {
            let images = files
                .iter()
                .map(|path| {
                    let image = image::open(path).with_context(|| format!("failed to open {}", path.display()))?;
                    Ok(ImageTensor::from_image(&image))
                })
                .collect::<Result<Vec<_>>>()?;
            let uploader = Uploader::new(&config.upload)?;
            uploader.upload(&images, &prefix, token.as_deref()).await;
        }
        Command::Serve { listen } => {
            let mut gallery = config.gallery;
            if let Some(listen) = listen {
                gallery.listen = listen;
            }
            let token = resolve_token(gallery.token.as_deref());
            gallery::serve(&gallery, token).await?;
        }
    }
    Ok(())
}
