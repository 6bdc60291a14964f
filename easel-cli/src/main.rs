use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::{Parser, Subcommand};
use easel_core::{
    telemetry, AdapterStore, ArchitectureFamily, Config, GenerationRequest, InMemoryAdapterStore,
    ModelManager, NewAdapter, SchedulerChoice,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation runtime")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// Hub cache directory for model weights
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog models and whether they are cached locally
    Models,
    /// Detect the architecture and precision of a .safetensors archive
    Detect { path: PathBuf },
    /// Show accelerator memory usage
    Gpu,
    /// Generate images
    Generate(GenerateArgs),
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Catalog key, or a path to a local .safetensors archive
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    prompt: String,

    #[arg(long)]
    negative: Option<String>,

    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    height: Option<usize>,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    guidance: Option<f64>,

    /// Number of images to generate
    #[arg(long, short = 'n')]
    num: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    scheduler: Option<SchedulerChoice>,

    /// LoRA archive as `path` or `path:weight`, may be repeated
    #[arg(long = "lora", value_parser = parse_lora)]
    loras: Vec<(PathBuf, f64)>,

    #[arg(long, default_value_t = 0)]
    clip_skip: usize,

    /// Reference image, switches to image-to-image
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    strength: Option<f64>,

    /// Output directory, defaults to EASEL_OUTPUTS_DIR
    #[arg(long)]
    out: Option<PathBuf>,
}

fn parse_lora(raw: &str) -> Result<(PathBuf, f64), String> {
    match raw.rsplit_once(':') {
        Some((path, weight)) if !path.is_empty() => weight
            .parse()
            .map(|weight| (PathBuf::from(path), weight))
            .map_err(|_| format!("invalid LoRA weight '{weight}'")),
        _ => Ok((PathBuf::from(raw), 1.0)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn generate(manager: &ModelManager, args: GenerateArgs) -> Result<()> {
    if let Some(model) = &args.model {
        let path = Path::new(model);
        let response = if path.is_file() {
            manager
                .load_custom_model(easel_core::CustomModelRequest {
                    path: path.to_path_buf(),
                    family: None,
                    precision: None,
                    name: None,
                })
                .await
        } else {
            manager.load_model(model).await
        };
        print_json(&response)?;
        response.into_result().map_err(|e| anyhow!(e))?;
    }

    let store = InMemoryAdapterStore::new();
    for (path, weight) in &args.loras {
        let adapter = store.add(NewAdapter {
            name: file_stem(path),
            path: path.clone(),
            family: ArchitectureFamily::Unknown,
            trigger_words: Vec::new(),
            weight: *weight,
        })?;
        store.set_active(adapter.id, true)?;
    }

    let reference_image = match &args.input {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Some(BASE64_STANDARD.encode(bytes))
        }
        None => None,
    };

    let request = GenerationRequest {
        prompt: args.prompt,
        negative_prompt: args.negative,
        width: args.width,
        height: args.height,
        steps: args.steps,
        guidance_scale: args.guidance,
        num_images: args.num,
        seed: args.seed,
        scheduler: args.scheduler,
        adapters: store.active(),
        clip_skip: args.clip_skip,
        reference_image,
        strength: args.strength,
    };

    let response = manager.generate(request).await;
    print_json(&response)?;
    let output = response.into_result().map_err(|e| anyhow!(e))?;

    let out_dir = args
        .out
        .unwrap_or_else(|| manager.config().outputs_dir.clone());
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    for (index, image) in output.images.iter().enumerate() {
        let path = out_dir.join(format!("{}-{stamp}-{index}.png", output.model));
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        info!("saved {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if args.cpu {
        config.force_cpu = true;
    }
    if let Some(dir) = args.models_dir {
        config.models_dir = Some(dir);
    }
    let manager = ModelManager::with_candle(config)?;

    match args.command {
        Command::Models => print_json(&manager.list_models())?,
        Command::Detect { path } => {
            if !path.exists() {
                bail!("{} does not exist", path.display());
            }
            print_json(&manager.detect_archive(&path))?
        }
        Command::Gpu => print_json(&manager.resource_info())?,
        Command::Generate(args) => generate(&manager, args).await?,
    }
    Ok(())
}
