use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use hitl_protocol::{HITL_REQUEST_TOPIC, HitlRequest, HitlResponse, ReviewOutcome, UNSPECIFIED_NODE};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::logger::ReviewMetrics;
use crate::pending::{PendingInfo, PendingTable, Resolution};
use crate::transport::Transport;

/// Used until startup configuration says otherwise.
pub const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(1800);

/// A pause point the pipeline wants a human to look at.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub name: String,
    pub context_message: String,
    pub data_for_review: Option<Value>,
    pub node_id: Option<String>,
    pub attempt: u32,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, context_message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context_message: context_message.into(),
            data_for_review: None,
            node_id: None,
            attempt: 1,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data_for_review = Some(data);
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Result of handing an inbound decision to the broker. None of these are
/// errors: late and unknown decisions are expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Resolved,
    MissingRequestId,
    Unknown,
    Abandoned,
    Malformed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Resolved => "resolved",
            DeliveryStatus::MissingRequestId => "missing_request_id",
            DeliveryStatus::Unknown => "unknown",
            DeliveryStatus::Abandoned => "abandoned",
            DeliveryStatus::Malformed => "malformed",
        }
    }
}

impl From<Resolution> for DeliveryStatus {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved => DeliveryStatus::Resolved,
            Resolution::Unknown => DeliveryStatus::Unknown,
            Resolution::Abandoned => DeliveryStatus::Abandoned,
        }
    }
}

/// Correlates review requests pushed to humans with the decisions they send
/// back.
///
/// One broker is built at startup and shared as `Arc<ReviewBroker>`: the
/// pipeline calls [`ReviewBroker::review`], the transport layer calls
/// [`ReviewBroker::deliver_raw`] for every inbound decision.
#[derive(Debug)]
pub struct ReviewBroker {
    transport: RwLock<Option<Transport>>,
    pending: PendingTable,
    timeout_ns: AtomicU64,
    metrics: ReviewMetrics,
}

impl ReviewBroker {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport: RwLock::new(None),
            pending: PendingTable::new(),
            timeout_ns: AtomicU64::new(duration_to_nanos(timeout)),
            metrics: ReviewMetrics::new(),
        })
    }

    /// Register (or replace) the push channel. Reviews already in flight keep
    /// the handle they started with.
    pub async fn set_transport(&self, transport: Transport) {
        info!("HITL transport '{}' registered", transport.name());
        *self.transport.write().await = Some(transport);
    }

    pub async fn clear_transport(&self) {
        if let Some(old) = self.transport.write().await.take() {
            info!("HITL transport '{}' unregistered", old.name());
        }
    }

    pub async fn has_transport(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Change the deadline for reviews created from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ns.store(duration_to_nanos(timeout), Ordering::SeqCst);
        info!("HITL timeout set to {} seconds", timeout.as_secs_f64());
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns.load(Ordering::SeqCst))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains(request_id)
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.pending.snapshot()
    }

    /// Push `checkpoint` to the reviewers and wait for a decision.
    ///
    /// Always returns a terminal outcome; failures come back as
    /// [`ReviewOutcome::Error`], a missing transport as
    /// [`ReviewOutcome::TransportUnavailable`], and an elapsed deadline as
    /// [`ReviewOutcome::Timeout`].
    pub async fn review(&self, checkpoint: Checkpoint) -> ReviewOutcome {
        let node_id = checkpoint
            .node_id
            .clone()
            .unwrap_or_else(|| UNSPECIFIED_NODE.to_string());
        info!(
            checkpoint = %checkpoint.name,
            node_id = %node_id,
            attempt = checkpoint.attempt,
            "HITL: broadcasting checkpoint"
        );

        let Some(transport) = self.transport.read().await.clone() else {
            warn!(checkpoint = %checkpoint.name, "HITL: no transport registered, auto-approving");
            return ReviewOutcome::TransportUnavailable {
                message: format!(
                    "Auto-approved checkpoint '{}' (no transport registered)",
                    checkpoint.name
                ),
            };
        };

        let request = HitlRequest {
            checkpoint_name: checkpoint.name,
            context_message: checkpoint.context_message,
            data_for_review: checkpoint.data_for_review,
            node_id,
            current_attempt: checkpoint.attempt.max(1),
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        };
        let timeout = self.timeout();
        let started = Instant::now();

        // registered before the broadcast so a fast reply always finds its slot
        let (guard, slot) = self
            .pending
            .register(&request.request_id, &request.checkpoint_name);
        self.metrics.review_started();

        let outcome = match self.broadcast(&transport, &request).await {
            Err(message) => {
                error!(request_id = %request.request_id, "HITL: {}", message);
                ReviewOutcome::Error { message }
            }
            Ok(()) => {
                debug!(
                    request_id = %request.request_id,
                    "HITL: waiting for reviewer (timeout {}s)",
                    timeout.as_secs_f64()
                );
                match tokio::time::timeout(timeout, slot).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => {
                        error!(request_id = %request.request_id, "HITL: completion slot dropped");
                        ReviewOutcome::Error {
                            message: "Error during HITL request: completion slot dropped"
                                .to_string(),
                        }
                    }
                    Err(_) => {
                        warn!(
                            request_id = %request.request_id,
                            "HITL: request timed out after {} seconds",
                            timeout.as_secs_f64()
                        );
                        ReviewOutcome::Timeout {
                            message: format!(
                                "HITL request timed out after {} seconds",
                                timeout.as_secs_f64()
                            ),
                        }
                    }
                }
            }
        };
        drop(guard);

        let waited = started.elapsed();
        self.metrics.review_finished(&outcome, waited);
        tracing::event!(
            target: "review",
            tracing::Level::INFO,
            request_id = %request.request_id,
            checkpoint = %request.checkpoint_name,
            outcome = outcome.as_ref(),
            latency_ms = waited.as_secs_f64() * 1_000.0,
            "review finished"
        );
        outcome
    }

    async fn broadcast(&self, transport: &Transport, request: &HitlRequest) -> Result<(), String> {
        let payload = serde_json::to_value(request)
            .map_err(|err| format!("Error during HITL request: {}", err))?;
        match AssertUnwindSafe(transport.broadcast(HITL_REQUEST_TOPIC, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("Error during HITL request: {}", err)),
            Err(_) => Err(format!(
                "Error during HITL request: transport '{}' panicked",
                transport.name()
            )),
        }
    }

    /// Resolve the pending review `response` answers. Unknown, late or
    /// repeated decisions are logged and otherwise ignored.
    pub fn deliver_response(&self, response: HitlResponse) -> DeliveryStatus {
        let status = match response.request_id.as_deref().filter(|id| !id.is_empty()) {
            None => {
                error!("HITL response missing request_id");
                DeliveryStatus::MissingRequestId
            }
            Some(request_id) => {
                let HitlResponse {
                    action,
                    modification_instructions,
                    checkpoint_name,
                    ..
                } = &response;
                let resolution = self.pending.resolve(request_id, |stored_name| {
                    let name = checkpoint_name.as_deref().unwrap_or(stored_name);
                    ReviewOutcome::from_decision(
                        action.as_deref(),
                        modification_instructions.clone(),
                        name,
                    )
                });
                match resolution {
                    Resolution::Resolved => info!(
                        request_id,
                        action = action.as_deref().unwrap_or("<missing>"),
                        "HITL response processed"
                    ),
                    Resolution::Unknown => {
                        warn!(request_id, "No pending HITL request found for this id")
                    }
                    Resolution::Abandoned => warn!(
                        request_id,
                        "HITL response arrived after the caller stopped waiting"
                    ),
                }
                resolution.into()
            }
        };
        self.metrics.delivery(status.as_str());
        status
    }

    /// Same as [`ReviewBroker::deliver_response`] for a payload straight off
    /// the wire. Only a payload that is not a JSON object is `Malformed`;
    /// mistyped fields inside an object are read leniently.
    pub fn deliver_raw(&self, payload: Value) -> DeliveryStatus {
        if !payload.is_object() {
            warn!("HITL response is not a JSON object: {}", payload);
            self.metrics.delivery(DeliveryStatus::Malformed.as_str());
            return DeliveryStatus::Malformed;
        }
        match serde_json::from_value::<HitlResponse>(payload) {
            Ok(response) => self.deliver_response(response),
            Err(err) => {
                warn!("Could not parse HITL response: {}", err);
                self.metrics.delivery(DeliveryStatus::Malformed.as_str());
                DeliveryStatus::Malformed
            }
        }
    }
}

impl Default for ReviewBroker {
    fn default() -> Self {
        Self {
            transport: RwLock::new(None),
            pending: PendingTable::new(),
            timeout_ns: AtomicU64::new(duration_to_nanos(DEFAULT_REVIEW_TIMEOUT)),
            metrics: ReviewMetrics::new(),
        }
    }
}

fn duration_to_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
