mod cli;
mod pipeline;
mod settings;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::Args;
use pipeline::findface;
use pipeline::orchestrator::{start_camera, CameraHandle, Remote};
use settings::Settings;
use std::sync::Arc;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let mut settings = Settings::load(&args.config)?;
    let agent = findface::agent(settings.findface.timeout());

    match (args.findface_url.clone(), args.credentials()) {
        (Some(url), Some(credentials)) => {
            let (agent, prefix) = (agent.clone(), settings.findface.camera_prefix.clone());
            let discovered = tokio::task::spawn_blocking(move || {
                findface::discover_cameras(agent, &url, &credentials, &prefix)
            })
            .await?;
            match discovered {
                Ok(cameras) => {
                    tracing::info!("Discovered {} cameras on FindFace", cameras.len());
                    settings.merge_cameras(cameras);
                }
                Err(e) => tracing::error!("FindFace camera discovery failed: {:#}", e),
            }
        }
        (Some(_), None) => {
            tracing::info!("FindFace credentials not set, using configured cameras only")
        }
        (None, _) => tracing::warn!("FINDFACE_URL not set, tracks will only be saved locally"),
    }

    let remote_enabled = args.findface_url.is_some();
    settings.validate(remote_enabled)?;
    tracing::info!(
        "Loaded {} cameras, results go to {}",
        settings.cameras.len(),
        settings.results_dir().display()
    );

    let mut pipelines = Vec::with_capacity(settings.cameras.len());
    for camera in settings.cameras.iter().cloned() {
        let name = camera.to_string();
        let remote = args.findface_url.as_deref().map(|base_url| Remote {
            agent: &agent,
            base_url,
        });
        let pipeline = start_camera(camera, &settings, remote)
            .with_context(|| format!("Failed to start camera {}", name))?;
        pipelines.push(pipeline);
    }

    let handles: Arc<Vec<CameraHandle>> = Arc::new(pipelines.iter().map(|p| p.handle()).collect());
    let server = if args.no_status_server {
        None
    } else {
        let (host, port) = (args.host, args.port);
        Some(tokio::spawn(async move {
            if let Err(e) = run_server(host, port, handles).await {
                tracing::error!("Status API stopped: {:#}", e);
            }
        }))
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finalizing remaining tracks");

    for pipeline in &pipelines {
        pipeline.stop();
    }
    let finalized = tokio::task::spawn_blocking(move || {
        pipelines.into_iter().map(|p| p.join()).sum::<usize>()
    })
    .await?;
    tracing::info!("All cameras stopped, {} tracks finalized", finalized);

    if let Some(server) = server {
        server.abort();
    }

    Ok(())
}
