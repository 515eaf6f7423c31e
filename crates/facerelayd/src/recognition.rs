//! Recognition stage: embed each face crop, match it against the reference
//! database and publish the identity.

use crate::engine::EmbedderEngine;
use crate::error::StageError;
use crate::stats::{StageStats, StatsSnapshot};
use facerelay_core::{frame, Matcher, ReferenceDatabase};
use facerelay_queue::{Classification, Delivery, Queue, QueueError, Receipt, ResultMessage, Sink, WorkItem};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Recognized(String),
    Unknown,
    /// Unparseable work item; `Error` result published.
    Rejected,
    /// Unparseable work item without a request id; discarded.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    /// Publish an `Error` result for an unparseable work item instead of dropping it.
    pub report_malformed: bool,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self { report_malformed: true }
    }
}

/// Per-delivery result of one batch.
#[derive(Debug)]
pub struct ItemReport {
    pub receipt: Receipt,
    pub outcome: Result<ItemOutcome, StageError>,
}

/// Outcome of processing one batch of deliveries.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    /// Receipts of deliveries that reached a terminal result.
    pub fn completed(&self) -> impl Iterator<Item = &Receipt> {
        self.items.iter().filter(|i| i.outcome.is_ok()).map(|i| &i.receipt)
    }

    /// Deliveries left unacknowledged for redelivery.
    pub fn failed(&self) -> impl Iterator<Item = (&Receipt, &StageError)> {
        self.items
            .iter()
            .filter_map(|i| i.outcome.as_ref().err().map(|e| (&i.receipt, e)))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct RecognitionStage {
    embedder: EmbedderEngine,
    database: Arc<ReferenceDatabase>,
    matcher: Arc<dyn Matcher>,
    responses: Arc<dyn Sink>,
    settings: RecognitionSettings,
    stats: StageStats,
}

impl RecognitionStage {
    /// Fails when the embedder's output width cannot be compared with the database.
    pub fn new(
        embedder: EmbedderEngine,
        database: Arc<ReferenceDatabase>,
        matcher: Arc<dyn Matcher>,
        responses: Arc<dyn Sink>,
        settings: RecognitionSettings,
    ) -> Result<Self, StageError> {
        if let Some(dim) = embedder.dimension() {
            if dim != database.dimension() {
                return Err(StageError::DimensionMismatch {
                    embedder: dim,
                    database: database.dimension(),
                });
            }
        }
        Ok(Self {
            embedder,
            database,
            matcher,
            responses,
            settings,
            stats: StageStats::default(),
        })
    }

    /// Process a batch in order. A failing item never stops the rest.
    pub async fn process_batch(&self, deliveries: &[Delivery]) -> BatchReport {
        let mut report = BatchReport::default();
        for delivery in deliveries {
            if delivery.receive_count > 1 {
                tracing::debug!(
                    message_id = delivery.receipt.message_id,
                    receive_count = delivery.receive_count,
                    "redelivered work item"
                );
            }
            let outcome = self.process_item(&delivery.body).await;
            if let Err(err) = &outcome {
                StageStats::bump(&self.stats.retried);
                tracing::warn!(
                    message_id = delivery.receipt.message_id,
                    error = %err,
                    "work item left for redelivery"
                );
            }
            report.items.push(ItemReport {
                receipt: delivery.receipt.clone(),
                outcome,
            });
        }
        report
    }

    /// Process one work item body and publish its result.
    ///
    /// `Err` means the item did not reach the response channel and should
    /// be redelivered.
    pub async fn process_item(&self, body: &str) -> Result<ItemOutcome, StageError> {
        StageStats::bump(&self.stats.received);
        let item = match WorkItem::parse(body) {
            Ok(item) => item,
            Err(err) => return self.reject_unparseable(body, err.to_string()).await,
        };

        let started = Instant::now();
        let classification = self.classify(&item).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let message = ResultMessage::new(item.request_id.as_str(), &classification, item.filename.as_str());
        self.publish(&message.to_body()?).await?;

        let outcome = match classification {
            Classification::Identified(label) => {
                StageStats::bump(&self.stats.recognized);
                tracing::info!(request_id = %item.request_id, %label, elapsed_ms, "identity recognized");
                ItemOutcome::Recognized(label)
            }
            _ => {
                StageStats::bump(&self.stats.unknown);
                tracing::info!(request_id = %item.request_id, elapsed_ms, "identity unknown");
                ItemOutcome::Unknown
            }
        };
        Ok(outcome)
    }

    /// Identity for one work item. Only transient capability failures are errors.
    async fn classify(&self, item: &WorkItem) -> Result<Classification, StageError> {
        let request_id = item.request_id.as_str();
        let crop = match item
            .crop_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| frame::decode_image(&bytes).map_err(|e| e.to_string()))
        {
            Ok(crop) => crop,
            Err(reason) => {
                tracing::warn!(request_id, %reason, "face crop does not decode");
                return Ok(Classification::Unknown);
            }
        };

        let embedding = match self.embedder.embed(crop).await {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::debug!(request_id, "degenerate crop, no embedding");
                return Ok(Classification::Unknown);
            }
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => {
                tracing::error!(request_id, error = %err, "embedding failed");
                return Ok(Classification::Unknown);
            }
        };

        match self.matcher.best_match(&embedding, &self.database) {
            Ok(Some(best)) => {
                tracing::debug!(request_id, label = best.label, distance = best.distance, "nearest reference");
                Ok(Classification::Identified(best.label.to_string()))
            }
            Ok(None) => Ok(Classification::Unknown),
            Err(err) => {
                tracing::error!(request_id, error = %err, "matching failed");
                Ok(Classification::Unknown)
            }
        }
    }

    async fn reject_unparseable(&self, body: &str, reason: String) -> Result<ItemOutcome, StageError> {
        let salvaged = serde_json::from_str::<serde_json::Value>(body).ok().and_then(|v| {
            let id = v.get("request_id")?.as_str()?.to_owned();
            let filename = v.get("filename").and_then(|f| f.as_str()).unwrap_or_default().to_owned();
            Some((id, filename))
        });

        match salvaged {
            Some((request_id, filename)) if self.settings.report_malformed && !request_id.is_empty() => {
                let message = ResultMessage::new(request_id.as_str(), &Classification::Error, filename);
                self.publish(&message.to_body()?).await?;
                StageStats::bump(&self.stats.rejected);
                tracing::warn!(%request_id, %reason, "unparseable work item reported as error");
                Ok(ItemOutcome::Rejected)
            }
            _ => {
                StageStats::bump(&self.stats.dropped);
                tracing::warn!(%reason, "dropping unparseable work item");
                Ok(ItemOutcome::Dropped)
            }
        }
    }

    async fn publish(&self, body: &str) -> Result<(), StageError> {
        self.responses
            .send(body)
            .await
            .map_err(|source| StageError::Publish {
                channel: "response",
                source,
            })
    }

    /// Receive one batch, process it and acknowledge every completed item.
    pub async fn poll_once(
        &self,
        queue: &dyn Queue,
        batch_size: usize,
        visibility: Duration,
    ) -> Result<BatchReport, QueueError> {
        let deliveries = queue.receive(batch_size, visibility).await?;
        if deliveries.is_empty() {
            return Ok(BatchReport::default());
        }

        let report = self.process_batch(&deliveries).await;
        for receipt in report.completed() {
            match queue.ack(receipt).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    message_id = receipt.message_id,
                    "receipt expired before ack; item will be redelivered"
                ),
                Err(err) => tracing::error!(message_id = receipt.message_id, error = %err, "ack failed"),
            }
        }
        tracing::debug!(
            batch = report.len(),
            failed = report.failed().count(),
            "batch processed"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn database(&self) -> &ReferenceDatabase {
        &self.database
    }
}
