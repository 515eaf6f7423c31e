use anyhow::Result;
use facerelay_core::ScrfdDetector;
use facerelay_queue::SqliteQueue;
use facerelayd::config::{Bus, DetectConfig};
use facerelayd::dbus_interface::{DetectionService, BUS_NAME, OBJECT_PATH};
use facerelayd::{spawn_detector, DetectionSettings, DetectionStage, SeenSet};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facerelay-detectd starting");
    let config = DetectConfig::from_env();

    let model_path = config.shared.scrfd_model_path();
    let detector = ScrfdDetector::load(&model_path, config.detector_config())?;
    tracing::info!(path = %model_path, "SCRFD detector loaded");
    let engine = spawn_detector(detector, config.shared.capability_timeout)?;

    let work = SqliteQueue::open(&config.shared.queue_db, &config.shared.work_queue).await?;
    let responses = work.sibling(&config.shared.response_queue);
    tracing::info!(
        db = %config.shared.queue_db.display(),
        work = %config.shared.work_queue,
        responses = %config.shared.response_queue,
        "queues opened"
    );

    let stage = Arc::new(DetectionStage::new(
        engine,
        SeenSet::new(config.dedup_capacity, config.dedup_ttl),
        Arc::new(work),
        Arc::new(responses),
        DetectionSettings {
            report_malformed: config.shared.report_malformed,
        },
    ));

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, DetectionService::new(Arc::clone(&stage)))?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facerelay-detectd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!(stats = ?stage.stats(), "facerelay-detectd shutting down");

    Ok(())
}
