//! Detection stage: dedup gate, face detection and routing.
//!
//! A face crop goes to the work queue for recognition; no face ends the
//! request with a `No-Face` result on the response channel.

use crate::dedup::SeenSet;
use crate::engine::DetectorEngine;
use crate::error::StageError;
use crate::stats::{StageStats, StatsSnapshot};
use facerelay_core::frame;
use facerelay_queue::{Classification, InboundEvent, ResultMessage, Sink, WorkItem};
use std::sync::Arc;
use std::time::Instant;

/// Where a single inbound event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// `No-Face` result published.
    NoFace,
    /// Work item published for recognition.
    Forwarded,
    /// Already claimed by an earlier delivery; nothing published.
    Duplicate,
    /// Malformed or unprocessable; `Error` result published.
    Rejected,
    /// Malformed or unprocessable; discarded without a result.
    Dropped,
}

impl Routed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Routed::NoFace => "no-face",
            Routed::Forwarded => "forwarded",
            Routed::Duplicate => "duplicate",
            Routed::Rejected => "rejected",
            Routed::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Publish an `Error` result for malformed input instead of dropping it.
    pub report_malformed: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self { report_malformed: true }
    }
}

pub struct DetectionStage {
    detector: DetectorEngine,
    seen: SeenSet,
    work: Arc<dyn Sink>,
    responses: Arc<dyn Sink>,
    settings: DetectionSettings,
    stats: StageStats,
}

impl DetectionStage {
    pub fn new(
        detector: DetectorEngine,
        seen: SeenSet,
        work: Arc<dyn Sink>,
        responses: Arc<dyn Sink>,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            detector,
            seen,
            work,
            responses,
            settings,
            stats: StageStats::default(),
        }
    }

    /// Process one raw inbound payload.
    ///
    /// `Err` is returned only for retryable failures (capability timeout or
    /// transient error, publish failure) and for failures to encode an
    /// outgoing message. After a retryable failure the request id is
    /// released, so a redelivery of the same event is processed again.
    pub async fn handle(&self, payload: &[u8]) -> Result<Routed, StageError> {
        StageStats::bump(&self.stats.received);
        match InboundEvent::parse(payload) {
            Ok(event) => {
                let request_id = event.request_id.clone();
                self.gated(&request_id, self.route(&event)).await
            }
            Err(err) => match err.request_id().map(str::to_owned) {
                Some(request_id) => {
                    let reason = err.to_string();
                    self.gated(&request_id, self.reject(&request_id, err.filename(), reason))
                        .await
                }
                None => {
                    tracing::warn!(error = %err, "dropping inbound event without a usable request_id");
                    StageStats::bump(&self.stats.dropped);
                    Ok(Routed::Dropped)
                }
            },
        }
    }

    /// Run `work` under a claim on `request_id`, releasing it when `work`
    /// fails in a way that should be retried and settling it otherwise.
    async fn gated(
        &self,
        request_id: &str,
        work: impl std::future::Future<Output = Result<Routed, StageError>>,
    ) -> Result<Routed, StageError> {
        if !self.seen.claim(request_id) {
            tracing::debug!(request_id, "duplicate delivery discarded");
            StageStats::bump(&self.stats.duplicates);
            return Ok(Routed::Duplicate);
        }

        let result = work.await;
        match &result {
            Err(err) if err.is_retryable() => {
                self.seen.release(request_id);
                StageStats::bump(&self.stats.retried);
                tracing::warn!(request_id, error = %err, "detection failed; left for redelivery");
            }
            Err(err) => {
                self.seen.settle(request_id);
                tracing::error!(request_id, error = %err, "detection failed");
            }
            Ok(_) => self.seen.settle(request_id),
        }
        result
    }

    async fn route(&self, event: &InboundEvent) -> Result<Routed, StageError> {
        let request_id = event.request_id.as_str();
        let image = match event
            .image_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| frame::decode_image(&bytes).map_err(|e| e.to_string()))
        {
            Ok(image) => image,
            Err(reason) => return self.reject(request_id, &event.filename, reason).await,
        };

        let started = Instant::now();
        let crop = match self.detector.call(image).await {
            Ok(crop) => crop,
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => return self.reject(request_id, &event.filename, err.to_string()).await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let Some(crop) = crop else {
            let body = ResultMessage::new(request_id, &Classification::NoFace, event.filename.as_str()).to_body()?;
            self.publish(self.responses.as_ref(), "response", &body).await?;
            StageStats::bump(&self.stats.no_face);
            tracing::info!(request_id, elapsed_ms, "no face detected");
            return Ok(Routed::NoFace);
        };

        let jpeg = match frame::encode_jpeg(&crop.image) {
            Ok(jpeg) => jpeg,
            Err(err) => return self.reject(request_id, &event.filename, err.to_string()).await,
        };
        let body = WorkItem::new(request_id, &jpeg, event.filename.as_str()).to_body()?;
        self.publish(self.work.as_ref(), "work", &body).await?;
        StageStats::bump(&self.stats.forwarded);
        tracing::info!(
            request_id,
            confidence = crop.confidence,
            crop_bytes = jpeg.len(),
            elapsed_ms,
            "face forwarded for recognition"
        );
        Ok(Routed::Forwarded)
    }

    /// Apply the malformed-input policy to a request that cannot be processed.
    async fn reject(&self, request_id: &str, filename: &str, reason: String) -> Result<Routed, StageError> {
        if !self.settings.report_malformed {
            tracing::warn!(request_id, %reason, "dropping unprocessable request");
            StageStats::bump(&self.stats.dropped);
            return Ok(Routed::Dropped);
        }
        let body = ResultMessage::new(request_id, &Classification::Error, filename).to_body()?;
        self.publish(self.responses.as_ref(), "response", &body).await?;
        StageStats::bump(&self.stats.rejected);
        tracing::warn!(request_id, %reason, "unprocessable request reported as error");
        Ok(Routed::Rejected)
    }

    async fn publish(&self, sink: &dyn Sink, channel: &'static str, body: &str) -> Result<(), StageError> {
        sink.send(body)
            .await
            .map_err(|source| StageError::Publish { channel, source })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }
}
