use slate_api::{config::ApiConfig, startup::Application};
use slate_config::load_config;
use slate_telemetry::init_tracing;
use tracing::info;

fn main() -> anyhow::Result<()> {
    // Initialize tracing from the binary name
    let _telemetry = init_tracing(env!("CARGO_BIN_NAME"))?;

    actix_web::rt::System::new().block_on(async_main())?;

    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let config = load_config::<ApiConfig>()?;
    log_store_config(&config);

    let application = Application::build(config).await?;
    info!(port = application.port(), "service listening");
    application.run_until_stopped().await?;

    Ok(())
}

fn log_store_config(config: &ApiConfig) {
    // The secret key never reaches the log; only its length is recorded so a
    // misconfigured empty value is still diagnosable.
    info!(
        region = config.aws.region,
        endpoint = config.aws.endpoint.as_deref().unwrap_or("default"),
        url_scheme = config.aws.url_scheme,
        access_key_id = config.aws.access_key_id,
        secret_key_len = config.aws.secret_access_key.expose().len(),
        "key-value store options",
    );
}
