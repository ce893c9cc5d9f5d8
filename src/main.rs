use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use cpcache::acceptor;
use cpcache::cli::Args;
use cpcache::config::Config;
use cpcache::content_length::ContentLengthCache;
use cpcache::mirror::MirrorSelector;
use cpcache::request::AppContext;
use cpcache::serializer;
use cpcache::store::Store;

use clap::Parser;

const POOL_MAX_IDLE_PER_HOST: usize = 16;

#[tokio::main]
async fn main() {
    install_panic_hook();
    cpcache::init();
    info!("logger initialized");

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_from_config_dir(),
    }
    .unwrap_or_else(|e| {
        error!("failed to load config: {}", e);
        std::process::exit(1);
    });

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_directory = cache_dir.into();
    }

    if let Err(e) = std::fs::create_dir_all(&config.cache_directory) {
        error!("failed to create cache directory: {}", e);
        std::process::exit(1);
    }

    let store = Store::open(&config.cache_directory).unwrap_or_else(|e| {
        error!("failed to open state store: {}", e);
        std::process::exit(1);
    });

    let content_length_cache = ContentLengthCache::open(&store).unwrap_or_else(|e| {
        error!("failed to open content-length cache: {}", e);
        std::process::exit(1);
    });

    let mirror_selector = Arc::new(MirrorSelector::new(&config, &store).unwrap_or_else(|e| {
        error!("failed to set up mirror selector: {}", e);
        std::process::exit(1);
    }));
    MirrorSelector::spawn_rescorer(mirror_selector.clone());

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(concat!("cpcache/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            error!("failed to build HTTP client: {}", e);
            std::process::exit(1);
        });

    let ctx = AppContext {
        config: Arc::new(config),
        content_length_cache,
        mirror_selector,
        serializer: serializer::spawn(),
        client,
    };

    info!("starting on port {}", ctx.config.port);
    if let Err(e) = acceptor::run(ctx).await {
        error!("acceptor exited: {}", e);
        std::process::exit(1);
    }
}

/// Installs a panic hook that logs the panic and exits the process, rather
/// than leaving the runtime to unwind into a half-dead connection pool.
/// Grounded on flexo's own `main()` panic-hook/`process::exit(1)` pattern.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(1);
    }));
}
