use lifecycle_provider::{init_logging, serve, LifecycleProvider};
use tracing::{error, info};

/// Provider configuration as JSON, applied before the server starts.
const CONFIG_ENV: &str = "LIFECYCLE_PROVIDER_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let provider = LifecycleProvider::new()?;

    if let Ok(raw) = std::env::var(CONFIG_ENV) {
        let config: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            error!(variable = CONFIG_ENV, error = %e, "Configuration is not valid JSON");
            e
        })?;
        match provider.preconfigure(&config) {
            Ok(warnings) => {
                info!(variable = CONFIG_ENV, warnings = warnings.len(), "Provider configured from environment");
            },
            Err(e) => {
                error!(variable = CONFIG_ENV, error = %e, "Refusing to start with invalid configuration");
                return Err(e.into());
            },
        }
    }

    serve(provider).await
}
