use crate::detection::DetectionStage;
use std::sync::Arc;
use zbus::interface;

/// Well-known bus name claimed by the detection daemon.
pub const BUS_NAME: &str = "org.facerelay.Detection1";
/// Object path the detection service is served at.
pub const OBJECT_PATH: &str = "/org/facerelay/Detection1";

/// D-Bus inbound channel of the detection stage.
///
/// Bus name: org.facerelay.Detection1
/// Object path: /org/facerelay/Detection1
pub struct DetectionService {
    stage: Arc<DetectionStage>,
}

impl DetectionService {
    pub fn new(stage: Arc<DetectionStage>) -> Self {
        Self { stage }
    }
}

#[interface(name = "org.facerelay.Detection1")]
impl DetectionService {
    /// Deliver one inbound event (`{request_id, encoded, filename?}` JSON).
    ///
    /// Returns the routing decision. A D-Bus error means the event was not
    /// consumed and the publisher should deliver it again.
    async fn publish(&self, payload: &str) -> zbus::fdo::Result<String> {
        match self.stage.handle(payload.as_bytes()).await {
            Ok(routed) => Ok(routed.as_str().into()),
            Err(err) if err.is_retryable() => Err(zbus::fdo::Error::LimitsExceeded(format!(
                "not consumed, retry later: {err}"
            ))),
            Err(err) => Err(zbus::fdo::Error::Failed(err.to_string())),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let seen = self.stage.seen();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "dedup": {
                "tracked": seen.len(),
                "capacity": seen.capacity(),
            },
            "stats": self.stage.stats(),
        })
        .to_string())
    }
}
