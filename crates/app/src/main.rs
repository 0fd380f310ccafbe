use edgeflow::config::AppConfig;
use edgeflow::service::Service;
use std::env;
use std::process;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Install global log collector.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Setup environment variables
    let Ok(config_path) = env::var("CONFIG_PATH") else {
        error!("env variable CONFIG_PATH should be set");
        process::exit(1);
    };

    let config = AppConfig::load(&config_path).unwrap_or_else(|err| {
        error!("{}", err);
        process::exit(1);
    });

    // Run edgeflow service with a provided config.
    Service::build(config)
        .await
        .unwrap_or_else(|err| {
            error!("{}", err);
            process::exit(1);
        })
        .run()
        .await
        .unwrap_or_else(|err| {
            error!("{}", err);
            process::exit(1);
        });
}
