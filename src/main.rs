use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use procap::app::CaptureService;
use procap::config::{CaptureConfig, ConfigManager};
use procap::hook_capture::{HookCaptureSimulator, SimulatedSource};
use procap::playback_sink::PlaybackSink;

/// Demo harness for the procap capture core.
///
/// Hooking a real target process is platform-specific and out of scope;
/// this binary either drives a simulated audio source into the ring or
/// expects a separate hook to be writing into the same process.
#[derive(Parser, Debug)]
#[command(name = "procap", about = "Per-process audio capture and mixing core")]
struct Cli {
    /// Target process selector, "<exe_name>:<pid>". Overrides the saved config.
    #[arg(long)]
    target: Option<String>,

    /// Drive a simulated tone source instead of resolving a real target.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut manager = ConfigManager::new().unwrap_or_else(|e| {
        log::warn!("falling back to default configuration: {e}");
        ConfigManager::with_config(CaptureConfig::default())
    });

    if let Some(target) = cli.target {
        let mut config = manager.get_config().clone();
        config.target.selector = Some(target);
        manager.update_config(config)?;
    }

    let config = manager.get_config().clone();
    let mut service = CaptureService::new(config.clone());

    if !cli.simulate {
        match service.resolve_target() {
            Ok(target) => info!("resolved target process: {}", target.to_selector()),
            Err(e) => {
                log::warn!("{e}; pass --simulate to run against a synthetic source instead");
                return Err(e);
            }
        }
    }

    let sink = Arc::new(PlaybackSink::default_device(
        config.output.sample_rate,
        config.output.channels,
        config.output.output_frames,
    )?);
    service.start(sink)?;

    let sim_running = Arc::new(std::sync::atomic::AtomicBool::new(cli.simulate));
    let sim_handle = if cli.simulate {
        info!("driving a simulated 440 Hz source into the capture ring");
        let producer = service.ring_producer();
        let source = SimulatedSource::new(1, config.output.sample_rate, config.output.channels as u32, 440.0);
        let mut sim = HookCaptureSimulator::new(producer, vec![source], config.output.output_frames, Arc::new(procap::monitoring::CaptureMetrics::new()));
        let running = sim_running.clone();
        Some(std::thread::spawn(move || sim.run(&running)))
    } else {
        None
    };

    info!("capture service running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    sim_running.store(false, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = sim_handle {
        let _ = handle.join();
    }
    service.stop()?;
    info!("capture service stopped");
    Ok(())
}
