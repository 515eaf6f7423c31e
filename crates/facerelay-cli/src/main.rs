use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facerelay_core::ReferenceDatabase;
use facerelay_queue::{InboundEvent, Queue, ResultMessage, SqliteQueue};
use facerelayd::config::SharedConfig;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facerelay", about = "facerelay face detection and recognition pipeline CLI")]
struct Cli {
    /// Talk to the detection daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an image to the detection stage
    Submit {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Correlation id (default: random UUID)
        #[arg(long)]
        request_id: Option<String>,
        /// Filename carried through to the result (default: the image's file name)
        #[arg(long)]
        filename: Option<String>,
    },
    /// Drain results from the response queue and print them as JSON lines
    Results {
        /// Stop after printing this many results
        #[arg(long, default_value_t = 100)]
        max: usize,
    },
    /// Show detection daemon status
    Status,
    /// Inspect a reference database file
    Reference {
        /// Reference database JSON file
        path: PathBuf,
    },
}

#[zbus::proxy(
    interface = "org.facerelay.Detection1",
    default_service = "org.facerelay.Detection1",
    default_path = "/org/facerelay/Detection1"
)]
trait Detection {
    fn publish(&self, payload: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            image,
            request_id,
            filename,
        } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let filename = filename.unwrap_or_else(|| {
                image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let payload = InboundEvent::new(request_id.as_str(), &bytes, filename).to_body()?;

            let proxy = detection_proxy(cli.system).await?;
            let routed = proxy.publish(&payload).await?;
            println!("{request_id} {routed}");
        }
        Commands::Results { max } => {
            let shared = SharedConfig::from_env();
            let responses = SqliteQueue::open(&shared.queue_db, &shared.response_queue).await?;
            for message in drain_results(&responses, max).await? {
                println!("{}", message.to_body()?);
            }
        }
        Commands::Status => {
            let proxy = detection_proxy(cli.system).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Reference { path } => {
            let db = ReferenceDatabase::load(&path)?;
            println!("{}: {} identities, {}-d embeddings", path.display(), db.len(), db.dimension());
            for (i, (embedding, label)) in db.iter().enumerate() {
                let norm = embedding.values.iter().map(|v| v * v).sum::<f32>().sqrt();
                println!("  [{i}] {label} (norm {norm:.3})");
            }
        }
    }

    Ok(())
}

async fn detection_proxy(system: bool) -> Result<DetectionProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    Ok(DetectionProxy::new(&connection).await?)
}

/// Receive and acknowledge up to `max` results, keeping only the first
/// result seen for each request id. A stale receipt does not discard what
/// was already drained.
async fn drain_results(queue: &dyn Queue, max: usize) -> Result<Vec<ResultMessage>> {
    const BATCH: usize = 10;
    const HIDE: Duration = Duration::from_secs(30);

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    while out.len() < max {
        let batch = queue.receive(BATCH.min(max - out.len()), HIDE).await?;
        if batch.is_empty() {
            break;
        }
        for delivery in batch {
            match ResultMessage::parse(&delivery.body) {
                Ok(message) => {
                    if seen.insert(message.request_id.clone()) {
                        out.push(message);
                    } else {
                        tracing::debug!(request_id = %message.request_id, "duplicate result skipped");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "skipping unreadable result"),
            }
            if !queue.ack(&delivery.receipt).await? {
                tracing::warn!(
                    message_id = delivery.receipt.message_id,
                    "receipt went stale while draining; result may be delivered again"
                );
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use facerelay_queue::{Classification, Delivery, QueueError, Receipt, Sink};

    /// Queue whose receipts always go stale before they are acknowledged.
    struct StaleReceipts(SqliteQueue);

    #[async_trait]
    impl Sink for StaleReceipts {
        async fn send(&self, body: &str) -> Result<(), QueueError> {
            self.0.send(body).await
        }
    }

    #[async_trait]
    impl Queue for StaleReceipts {
        async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
            self.0.receive(max, visibility).await
        }

        async fn ack(&self, _receipt: &Receipt) -> Result<bool, QueueError> {
            Ok(false)
        }

        async fn depth(&self) -> Result<usize, QueueError> {
            self.0.depth().await
        }
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from(["facerelay", "submit", "face.jpg", "--request-id", "r1"]).unwrap();
        match cli.command {
            Commands::Submit {
                image,
                request_id,
                filename,
            } => {
                assert_eq!(image, PathBuf::from("face.jpg"));
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(filename, None);
            }
            _ => panic!("expected submit"),
        }
        assert!(!cli.system);
    }

    #[test]
    fn test_parse_global_system_flag() {
        let cli = Cli::try_parse_from(["facerelay", "status", "--system"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[tokio::test]
    async fn test_drain_dedupes_by_request_id() {
        let queue = SqliteQueue::open_in_memory("face-responses").await.unwrap();
        for (id, class) in [
            ("r1", Classification::NoFace),
            ("r2", Classification::Identified("alice".into())),
            ("r1", Classification::NoFace),
        ] {
            let body = ResultMessage::new(id, &class, "").to_body().unwrap();
            queue.send(&body).await.unwrap();
        }
        queue.send("not json").await.unwrap();

        let results = drain_results(&queue, 100).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|m| m.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(results[1].result, "alice");
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_respects_max() {
        let queue = SqliteQueue::open_in_memory("face-responses").await.unwrap();
        for i in 0..5 {
            let body = ResultMessage::new(format!("r{i}"), &Classification::Unknown, "").to_body().unwrap();
            queue.send(&body).await.unwrap();
        }
        let results = drain_results(&queue, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(queue.depth().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drain_keeps_results_when_receipts_go_stale() {
        let queue = StaleReceipts(SqliteQueue::open_in_memory("face-responses").await.unwrap());
        for id in ["r1", "r2", "r3"] {
            let body = ResultMessage::new(id, &Classification::Unknown, "").to_body().unwrap();
            queue.send(&body).await.unwrap();
        }

        let results = drain_results(&queue, 100).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|m| m.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(queue.depth().await.unwrap(), 3);
    }
}
