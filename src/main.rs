use s3_build_cache::{
    config::{Config, APP_NAME},
    http_proxy::HttpProxy,
    logging::LoggerManager,
    s3_client::HttpObjectStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}: {}", APP_NAME, e);
            std::process::exit(1);
        }
    };

    let logger = LoggerManager::new(config.logging.clone());
    if let Err(e) = logger.initialize() {
        eprintln!("{}: {}", APP_NAME, e);
        std::process::exit(1);
    }

    info!(
        "Starting {} v{} (built: {})",
        APP_NAME,
        env!("BUILD_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Store: bucket={}, endpoint={}",
        config.store.bucket, config.store.endpoint
    );
    if config.cache.enabled {
        info!(
            "Memory cache: enabled, max_entry={} bytes, max_total={} bytes",
            config.cache.max_entry_size_bytes, config.cache.max_total_size_bytes
        );
    } else {
        info!("Memory cache: disabled");
    }
    info!(
        "Uploads: async={}, staging_dir={}, max_pending={}MB",
        config.async_upload.enabled,
        config.async_upload.cache_dir.display(),
        config.async_upload.max_pending_upload_mb
    );

    let store = Arc::new(HttpObjectStore::new(&config.store));
    let proxy = HttpProxy::new(Arc::clone(&config), store);
    let shutdown = Arc::clone(proxy.shutdown_coordinator());

    let listener = match proxy.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            let message = format!("could not start server: {}", e);
            error!("{}", message);
            eprintln!("{}: {}", APP_NAME, message);
            std::process::exit(1);
        }
    };

    let url = format!("http://{}:{}/", config.server.host, config.server.port);
    info!("started server at {}", url);
    println!(
        "{}: started server at {}, logging to {}",
        APP_NAME,
        url,
        logger.log_file_path().display()
    );

    proxy.spawn_idle_watch();

    let signal_listener = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = signal_listener.listen_for_shutdown().await {
            error!("Signal handling unavailable: {}", e);
        }
    });

    // Returns once shutdown has been requested by signal, idle timeout or GET /shutdown
    proxy.serve(listener, shutdown.subscribe()).await;

    // Give the final response and log lines a moment to be written
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("{} terminated", APP_NAME);
    std::process::exit(0);
}
