pub mod models {
    pub mod hdhomerun;
}

pub mod client;
pub mod config;
pub mod m3u;
pub mod output;
pub mod server;
pub mod xmltv;
pub mod services {
    pub mod guide;
    pub mod lineup;
    pub mod merge;
}

use crate::client::HdHomeRunClient;
use crate::config::{Cli, Command, Config};
use crate::server::ServedFiles;
use crate::services::guide::{self, WindowPlan};
use crate::services::lineup;
use crate::services::merge::GuideMerger;
use crate::xmltv::XmltvWriter;
use clap::Parser;
use log::{error, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Fetch the guide and write the XMLTV file, then the playlist derived from the same channels.
fn generate(cfg: &Config) -> Result<(), String> {
    generate_with_plan(cfg, WindowPlan::starting_now(cfg.days, cfg.hours))
}

fn generate_with_plan(cfg: &Config, plan: WindowPlan) -> Result<(), String> {
    // 1) Device identity and tuned channels
    let client = HdHomeRunClient::new(&cfg.host, &cfg.guide_url);
    let device = lineup::fetch_device_lineup(&client).map_err(|e| e.to_string())?;
    if device.channels.is_empty() {
        return Err("device lineup is empty; scan for channels on the tuner first".into());
    }

    // 2) Guide windows, merged as they arrive
    info!(
        "Fetching guide: days={}, hours={}, horizon={}",
        plan.days,
        plan.hours,
        plan.horizon().format("%Y-%m-%d %H:%M:%S")
    );
    let mut merger = GuideMerger::new(&device.channels);
    let summary = guide::fetch_guide(&client, &device.auth, plan, &mut merger).map_err(|e| e.to_string())?;
    let stats = merger.stats();
    info!(
        "Fetched {} window(s): {} programme(s) kept, {} duplicate(s), {} untuned segment(s)",
        summary.windows, stats.accepted, stats.duplicates, stats.untuned
    );
    if summary.end.is_partial() {
        warn!("Guide is partial ({:?}); writing what was collected", summary.end);
    }
    let merged = merger.finish();

    // 3) XMLTV
    let doc = XmltvWriter::new(chrono::Local)
        .render(&merged)
        .map_err(|e| format!("rendering XMLTV failed: {}", e))?;
    info!(
        "XMLTV has {} channel(s) and {} programme(s), {} skipped",
        doc.channels, doc.programmes, doc.skipped
    );
    output::write_output(&cfg.epg_file, &doc.xml)?;

    // 4) Playlist
    let playlist = m3u::render_playlist(&m3u::channels_from_guide(&merged), &cfg.server_url);
    output::write_output(&cfg.m3u_file, &playlist)
}

/// Rebuild the playlist from the XMLTV file already on disk.
fn playlist(cfg: &Config) -> Result<(), String> {
    let xml = std::fs::read_to_string(&cfg.epg_file)
        .map_err(|e| format!("reading {} failed: {}", cfg.epg_file.display(), e))?;
    let channels = m3u::channels_from_xmltv(&xml)?;
    if channels.is_empty() {
        return Err(format!("no channels found in {}", cfg.epg_file.display()));
    }
    info!("Read {} channel(s) from {}", channels.len(), cfg.epg_file.display());
    output::write_output(&cfg.m3u_file, &m3u::render_playlist(&channels, &cfg.server_url))
}

fn serve(cfg: &Config) -> Result<(), String> {
    let files = ServedFiles {
        epg: cfg.epg_file.clone(),
        m3u: cfg.m3u_file.clone(),
    };
    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("starting tokio runtime failed: {}", e))?;
    runtime.block_on(server::serve(cfg.listen_addr(), files))
}

/// Regenerate forever on a steady cadence. Failures are logged and retried on the next tick.
fn refresh_loop(cfg: Config, interval: Duration) {
    let mut tick_start = Instant::now();
    loop {
        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
        tick_start = Instant::now();

        info!("Scheduled guide refresh starting");
        match generate(&cfg) {
            Ok(()) => info!("Scheduled guide refresh complete"),
            Err(e) => error!("Scheduled guide refresh failed: {}", e),
        }
    }
}

pub fn run(cli: Cli) -> Result<(), String> {
    let cfg = cli.config;
    info!(
        "Config loaded (host={}, days={}, hours={}, epg={}, m3u={}, listen={})",
        cfg.host,
        cfg.days,
        cfg.hours,
        cfg.epg_file.display(),
        cfg.m3u_file.display(),
        cfg.listen_addr()
    );

    match cli.command.unwrap_or(Command::Generate) {
        Command::Generate => generate(&cfg),
        Command::Playlist => playlist(&cfg),
        Command::Serve => serve(&cfg),
        Command::Run => {
            generate(&cfg)?;
            if let Some(hours) = cfg.refresh_hours {
                info!("Regenerating the guide every {} hour(s)", hours);
                let interval = Duration::from_secs(u64::from(hours) * 3600);
                let refresh_cfg = cfg.clone();
                thread::Builder::new()
                    .name("guide-refresh".into())
                    .spawn(move || refresh_loop(refresh_cfg, interval))
                    .map_err(|e| format!("spawning refresh thread failed: {}", e))?;
            } else {
                info!("Periodic regeneration disabled; set EPG_REFRESH_HOURS to enable it");
            }
            serve(&cfg)
        }
    }
}

fn main() {
    let loaded_env = match config::load_env_file_from_args(std::env::args_os()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let cli = Cli::parse();

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or(cli.config.debug.filter());
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "hdhomerun-xmltv {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
