use llama_fleet::context::AppContext;
use llama_fleet::storage::settings::load_settings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("llama-fleet {} starting", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    let context = AppContext::new(settings);
    context.start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        }
        _ = context.shutdown_requested() => {}
    }

    context.shutdown().await;
    tracing::info!("Bye");
}
