use std::sync::{Arc, Mutex};

use ffmpeg_ts::{StreamManager, TsStreamer};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod source;

pub(crate) type SharedManager = Arc<Mutex<StreamManager>>;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_ts", log::LevelFilter::Debug)
        .filter_module("ts_streamer", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

fn build_manager(config: &config::AppConfig) -> anyhow::Result<StreamManager> {
    let settings = &config.streamer;
    let mut manager = StreamManager::new();
    manager.add_streamer(Box::new(TsStreamer::new(settings.clone())));
    if !manager.initialize(settings.port, settings.width, settings.height, settings.fps) {
        anyhow::bail!("failed to initialize streamers");
    }
    if config.autostart && !manager.start() {
        anyhow::bail!("failed to start streaming on port {}", settings.port);
    }
    Ok(manager)
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    ffmpeg_ts::init().unwrap_or_else(|e| {
        eprintln!("Error initializing ffmpeg: {:#}", e);
        std::process::exit(1);
    });
    let config = config::config();

    let manager = build_manager(config).unwrap_or_else(|e| {
        eprintln!("Error starting streamer: {:#}", e);
        std::process::exit(1);
    });
    let manager: SharedManager = Arc::new(Mutex::new(manager));
    for url in manager.lock().unwrap_or_else(|p| p.into_inner()).stream_urls() {
        log::info!("stream available at {}", url);
    }

    let cancel = CancellationToken::new();

    let state = api::AppState::new(manager.clone());
    api::start_api_server(config.api_port, state, cancel.clone());

    let capture = source::spawn(manager.clone(), config, cancel.clone()).unwrap_or_else(|e| {
        eprintln!("Error starting capture: {:#}", e);
        std::process::exit(1);
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    let _ = tokio::task::spawn_blocking(move || {
        if capture.join().is_err() {
            log::error!("capture thread panicked");
        }
        manager.lock().unwrap_or_else(|p| p.into_inner()).cleanup();
    })
    .await;

    std::process::exit(0);
}
