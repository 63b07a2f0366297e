use anyhow::{Context, Result};
use gcp_migrate::{
    client::{CloudClient, auth::Credentials, rest::RestApi},
    config::PopulatorConfig,
    metrics::ProgressGauge,
    poll::PollPolicy,
    routes::routes::{ServerState, routes},
    services::transfer_service::populate,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        tracing::error!("populator failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cfg = PopulatorConfig::from_env_and_args()?;
    tracing::info!("Starting gcp-populator with config: {:?}", cfg);

    // --- Metrics endpoint ---
    let gauge = ProgressGauge::populator();
    let state = ServerState {
        gauge: gauge.clone(),
        volume_path: cfg.volume_path.clone(),
    };
    let listener = bind(&cfg.metrics_addr).await?;
    tracing::info!("Metrics listening on http://{}", listener.local_addr()?);
    let app = routes().with_state(state);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("metrics server stopped: {}", err);
        }
    });

    // --- Cloud client ---
    let credentials = Credentials::from_file(&cfg.auth_path)
        .await
        .with_context(|| format!("loading credentials from {}", cfg.auth_path.display()))?;
    let project = credentials.project_id().unwrap_or_default().to_string();
    let api = RestApi::new(credentials, PollPolicy::default())?;
    let client = CloudClient::new(Arc::new(api), project, Some(cfg.bucket.clone()));

    // --- Transfer ---
    let report = populate(
        &client,
        &cfg.bucket,
        &cfg.object,
        &cfg.volume_path,
        Arc::new(gauge),
        cfg.report_interval,
    )
    .await
    .with_context(|| {
        format!(
            "populating {}/{} for {}/{}",
            cfg.bucket, cfg.object, cfg.cr_namespace, cfg.cr_name
        )
    })?;

    tracing::info!(
        cr = %cfg.cr_name,
        namespace = %cfg.cr_namespace,
        bytes = report.bytes,
        "population complete"
    );
    Ok(())
}

/// Bind the metrics listener, falling back to loopback when a wildcard
/// address is not permitted.
async fn bind(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(addr.rsplit_once(':'), Some(("0.0.0.0" | "[::]", _))) =>
        {
            let port = addr.rsplit_once(':').map(|(_, port)| port).unwrap_or_default();
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            Ok(TcpListener::bind(&fallback_addr).await?)
        }
        Err(err) => Err(err).with_context(|| format!("binding metrics listener on {}", addr)),
    }
}
