use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gpu_runtime::{GpuDevice, SoftwareGpu};
use image::RgbaImage;
use psx_gpu::{GpuConfig, Session, read_trace};
use renderer::HostImage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Replay a PS1 GPU command trace")]
struct Arguments {
    /// JSONL trace to replay.
    trace: PathBuf,
    /// Internal resolution, overriding the config.
    #[arg(long)]
    scale: Option<u32>,
    /// TOML renderer config.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "software")]
    backend: Backend,
    /// Write the scaled VRAM as PNG after the replay.
    #[arg(long)]
    dump_vram: Option<PathBuf>,
    /// Write the last scanout as PNG after the replay.
    #[arg(long)]
    scanout: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Backend {
    Software,
    Wgpu,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let arguments = Arguments::parse();

    let mut config = match &arguments.config {
        Some(path) => {
            GpuConfig::load(path).with_context(|| format!("load config {}", path.display()))?
        }
        None => GpuConfig::default(),
    };
    if let Some(scale) = arguments.scale {
        config.internal_resolution = scale;
    }

    match arguments.backend {
        Backend::Software => run(SoftwareGpu::default(), config, &arguments),
        Backend::Wgpu => run_wgpu(config, &arguments),
    }
}

#[cfg(feature = "wgpu-backend")]
fn run_wgpu(config: GpuConfig, arguments: &Arguments) -> Result<()> {
    let device = gpu_runtime::WgpuDevice::request(wgpu::PowerPreference::HighPerformance)
        .context("request wgpu device")?;
    run(device, config, arguments)
}

#[cfg(not(feature = "wgpu-backend"))]
fn run_wgpu(_config: GpuConfig, _arguments: &Arguments) -> Result<()> {
    Err(anyhow::anyhow!(
        "built without the wgpu backend, use --backend software"
    ))
}

fn run<D: GpuDevice>(device: D, config: GpuConfig, arguments: &Arguments) -> Result<()> {
    let file = File::open(&arguments.trace)
        .with_context(|| format!("open trace {}", arguments.trace.display()))?;
    let commands = read_trace(&mut BufReader::new(file))
        .with_context(|| format!("read trace {}", arguments.trace.display()))?;

    let mut session = Session::new(device, config).context("create session")?;
    let summary = session
        .replay(&commands, arguments.frames)
        .context("replay trace")?;
    session.renderer_mut().flush().context("flush renderer")?;
    info!(
        "[replay] {} commands, {} frames at {}x",
        summary.commands,
        summary.frames,
        session.renderer().scaling()
    );

    if let Some(path) = &arguments.dump_vram {
        let vram = session
            .renderer_mut()
            .scanout_vram_to_buffer()
            .context("read scaled VRAM")?;
        write_png(&vram, path)?;
    }
    if let Some(path) = &arguments.scanout {
        let output = session.renderer_mut().scanout().context("scan out")?;
        write_png(&output, path)?;
    }
    if let Some(tracker) = session.tracker() {
        tracker.sync_io().context("finish texture dumps")?;
    }
    Ok(())
}

fn write_png(host: &HostImage, path: &Path) -> Result<()> {
    let image = RgbaImage::from_raw(host.width, host.height, host.to_rgba8_bytes())
        .ok_or_else(|| anyhow::anyhow!("{}x{} image has the wrong size", host.width, host.height))?;
    image
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;
    info!("[replay] wrote {}", path.display());
    Ok(())
}
