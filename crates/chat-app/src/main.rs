use tracing_subscriber::EnvFilter;

use trellis::repl::{Repl, build_engine};
use trellis::settings::SettingsStore;

/// Terminal entry point.
///
/// 1. Logs go to stderr so replies on stdout stay readable (`RUST_LOG` overrides `info`)
/// 2. Settings come from the config file and `TRELLIS_*` variables
/// 3. The engine falls back to the mock backend when the configured one cannot start
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        path = ?settings_store.config_path(),
        adapter_id = %settings.adapter_id,
        "loaded settings"
    );

    let engine = build_engine(&settings).await;
    if let Err(error) = Repl::new(engine).run().await {
        tracing::error!(error = %error, "terminal session ended with an error");
        std::process::exit(1);
    }
}
