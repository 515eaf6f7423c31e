use anyhow::{Context, Result};
use facerelay_core::{ArcFaceEmbedder, NearestNeighborMatcher, ReferenceDatabase};
use facerelay_queue::SqliteQueue;
use facerelayd::config::RecognizeConfig;
use facerelayd::{spawn_embedder, RecognitionSettings, RecognitionStage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facerelay-recognized starting");
    let config = RecognizeConfig::from_env();

    // Reference database and model are loaded once and reused for every item.
    let reference_path = config
        .reference_db
        .clone()
        .context("FACERELAY_REFERENCE_DB must point at a reference database")?;
    let database = Arc::new(ReferenceDatabase::load(&reference_path)?);

    let model_path = config.shared.arcface_model_path();
    let embedder = ArcFaceEmbedder::load(&model_path)?;
    tracing::info!(path = %model_path, "ArcFace embedder loaded");
    let engine = spawn_embedder(embedder, config.shared.capability_timeout)?;

    let work = SqliteQueue::open(&config.shared.queue_db, &config.shared.work_queue).await?;
    let responses = work.sibling(&config.shared.response_queue);

    let stage = RecognitionStage::new(
        engine,
        database,
        Arc::new(NearestNeighborMatcher::new(config.metric, config.max_distance)),
        Arc::new(responses),
        RecognitionSettings {
            report_malformed: config.shared.report_malformed,
        },
    )?;

    tracing::info!(
        identities = stage.database().len(),
        metric = ?config.metric,
        max_distance = ?config.max_distance,
        batch_size = config.batch_size,
        "facerelay-recognized ready"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            polled = stage.poll_once(&work, config.batch_size, config.visibility_timeout) => {
                match polled {
                    Ok(report) if !report.is_empty() => continue,
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "work queue receive failed"),
                }
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }

    tracing::info!(stats = ?stage.stats(), "facerelay-recognized shutting down");
    Ok(())
}
