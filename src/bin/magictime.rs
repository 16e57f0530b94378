//! MagicTime controller CLI
//!
//! # Usage
//!
//! ```bash
//! magictime list
//! magictime rules --target vae > vae_rules.json
//! magictime audit RealisticVisionV60B1_v51VAE
//! magictime generate --prompt "Bean sprouts grow and mature from seeds." --seed -1
//! ```

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

use candle_magictime::{
    CheckpointFamily, CheckpointStore, Component, GenerationQueue, GenerationRequest, GifWriter,
    Job, JobOutput, MagicTimeConfig, ManifestArchitecture, ModelSession, NoAdapters,
    PreviewPipeline, RequestHandler, TextEncoderTemplate,
    convert::StyleTranslators,
    loader::list_tensor_names,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Hot-swap MagicTime style and motion checkpoints and render previews"
)]
struct Args {
    /// JSON config file; unset fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the directory relative paths are resolved against
    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List style and motion checkpoints
    List,

    /// Print a rewrite rule table as JSON
    Rules {
        #[arg(long, value_enum, default_value = "unet")]
        target: Target,
    },

    /// Check that every key of a style checkpoint is mapped or omitted on purpose
    Audit {
        /// Style checkpoint id or file name
        style: String,

        /// Print every unaccounted key
        #[arg(long)]
        verbose: bool,
    },

    /// Render a preview through the generation queue
    Generate {
        #[arg(short, long, default_value = "Bean sprouts grow and mature from seeds.")]
        prompt: String,

        #[arg(long, default_value = "")]
        negative_prompt: String,

        /// Style checkpoint; defaults to the first listed
        #[arg(long)]
        style: Option<String>,

        /// Motion checkpoint; defaults to the first listed
        #[arg(long)]
        motion: Option<String>,

        #[arg(long, default_value = "512")]
        width: usize,

        #[arg(long, default_value = "512")]
        height: usize,

        /// Zero or negative draws a random seed
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        seed: String,

        /// Use CPU instead of CUDA
        #[arg(long)]
        cpu: bool,

        /// Use float16 parameters
        #[arg(long)]
        f16: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Target {
    Unet,
    Vae,
    TextEncoder,
}

impl From<Target> for Component {
    fn from(target: Target) -> Self {
        match target {
            Target::Unet => Component::Unet,
            Target::Vae => Component::Vae,
            Target::TextEncoder => Component::TextEncoder,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_magictime=info".parse()?)
                .add_directive("magictime=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MagicTimeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MagicTimeConfig::default(),
    };
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }

    match args.command {
        Command::List => list(&config),
        Command::Rules { target } => rules(&config, target),
        Command::Audit { style, verbose } => audit(&config, &style, verbose),
        Command::Generate {
            prompt,
            negative_prompt,
            style,
            motion,
            width,
            height,
            seed,
            cpu,
            f16,
        } => {
            let device = select_device(cpu);
            let dtype = if f16 { DType::F16 } else { DType::F32 };
            let store = CheckpointStore::from_config(&config);
            let style = match style {
                Some(id) => id,
                None => store
                    .default_id(CheckpointFamily::Style)?
                    .context("No style checkpoints found")?,
            };
            let motion = match motion {
                Some(id) => id,
                None => store
                    .default_id(CheckpointFamily::Motion)?
                    .context("No motion checkpoints found")?,
            };
            let request = GenerationRequest {
                prompt,
                negative_prompt,
                width,
                height,
                seed,
                style_id: style,
                motion_id: motion,
            };
            generate(&config, request, &device, dtype)
        }
    }
}

fn select_device(cpu: bool) -> Device {
    if cpu {
        info!("Using CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => {
            info!("Using CUDA device 0");
            device
        }
        Err(e) => {
            warn!("CUDA not available: {}, falling back to CPU", e);
            Device::Cpu
        }
    }
}

fn list(config: &MagicTimeConfig) -> Result<()> {
    let store = CheckpointStore::from_config(config);
    for family in [CheckpointFamily::Style, CheckpointFamily::Motion] {
        println!("{family} ({})", store.dir(family).display());
        for desc in store.list(family)? {
            println!("  {}", desc.id);
        }
    }
    Ok(())
}

fn rules(config: &MagicTimeConfig, target: Target) -> Result<()> {
    let translators = StyleTranslators::from_config(config);
    let table = translators.get(target.into()).table();
    println!("{}", serde_json::to_string_pretty(table)?);
    Ok(())
}

fn audit(config: &MagicTimeConfig, style: &str, verbose: bool) -> Result<()> {
    let store = CheckpointStore::from_config(config);
    let desc = store.resolve(CheckpointFamily::Style, style)?;

    let template = TextEncoderTemplate::fetch(config, &Device::Cpu)
        .context("Failed to load text encoder template")?;
    let architecture = ManifestArchitecture::scan(config, &template)
        .context("Failed to scan base model")?;

    let keys = list_tensor_names(&desc.path)
        .with_context(|| format!("Failed to read {}", desc.path.display()))?;
    let report = StyleTranslators::from_config(config)
        .coverage(keys.iter().map(String::as_str), architecture.schemas());

    info!(
        mapped = report.mapped,
        omitted = report.omitted.len(),
        unaccounted = report.unaccounted.len(),
        "coverage of {}",
        desc.id
    );
    if verbose {
        for key in &report.unaccounted {
            println!("{key}");
        }
    }
    if !report.is_complete() {
        anyhow::bail!(
            "{} keys of {} are neither mapped nor on the omission list",
            report.unaccounted.len(),
            desc.id
        );
    }
    Ok(())
}

fn generate(
    config: &MagicTimeConfig,
    request: GenerationRequest,
    device: &Device,
    dtype: DType,
) -> Result<()> {
    let template = TextEncoderTemplate::fetch(config, device)
        .context("Failed to load text encoder template")?;
    let architecture = ManifestArchitecture::scan(config, &template)
        .context("Failed to scan base model")?;
    let session = ModelSession::load(
        config,
        Box::new(architecture),
        template,
        &NoAdapters,
        device,
        dtype,
    )
    .context("Failed to load model session")?;

    let handler = RequestHandler::from_config(
        PreviewPipeline::new(),
        GifWriter::new(config.inference.fps),
        config,
    );
    let queue = GenerationQueue::spawn(session, handler, config.queue_capacity)?;

    let output = queue.submit(Job::Generate(request))?.wait()?;
    queue.shutdown()?;

    if let JobOutput::Generated(result) = output {
        info!(
            "Saved {} (seed {})",
            result.video_path.display(),
            result.resolved_seed
        );
        println!("{}", serde_json::to_string_pretty(&result.config)?);
    }
    Ok(())
}
