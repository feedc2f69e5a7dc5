//! Scripted adapter for tests and dry runs.
//!
//! Replays queued responses per zone, then falls back to a default response.
//! Tracks calls and peak concurrency so callers can assert scheduling limits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use zoneflow_shared::{ContentType, Result, ToolOutput, Zone, ZoneId, ZoneflowError};

use super::ToolAdapter;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    Output(ToolOutput),
    Error(String),
    /// Never answers; ends only on cancellation or timeout.
    Hang,
    /// Answers after the delay and ignores cancellation.
    Stubborn(Duration, ToolOutput),
}

impl ScriptedResponse {
    pub fn output(content: impl Into<String>, raw_confidence: Option<f64>) -> Self {
        Self::Output(ToolOutput::new(content, raw_confidence))
    }

    /// Output that claims a different content type than the zone's.
    pub fn detected(
        content: impl Into<String>,
        raw_confidence: Option<f64>,
        detected: ContentType,
    ) -> Self {
        let mut out = ToolOutput::new(content, raw_confidence);
        out.detected_content_type = Some(detected);
        Self::Output(out)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

pub struct ScriptedAdapter {
    name: String,
    scripts: Mutex<HashMap<ZoneId, VecDeque<ScriptedResponse>>>,
    default: ScriptedResponse,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<ZoneId>>,
    in_flight: AtomicU32,
    peak: AtomicU32,
}

/// Decrements the in-flight counter even when the call future is dropped.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            default: ScriptedResponse::error("no scripted response"),
            delay: Duration::ZERO,
            gate: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    /// Queue a response for a zone (builder form).
    pub fn respond(self, zone_id: impl Into<ZoneId>, response: ScriptedResponse) -> Self {
        self.push(zone_id, response);
        self
    }

    /// Queue a response for a zone at any time.
    pub fn push(&self, zone_id: impl Into<ZoneId>, response: ScriptedResponse) {
        self.scripts
            .lock()
            .entry(zone_id.into())
            .or_default()
            .push_back(response);
    }

    /// Response used once a zone's queue is empty.
    pub fn with_default(mut self, response: ScriptedResponse) -> Self {
        self.default = response;
        self
    }

    /// Simulated work time per call (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each call consumes one permit before answering.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Zones this adapter was called for, in call order.
    pub fn calls(&self) -> Vec<ZoneId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> ZoneflowError {
        ZoneflowError::ToolExecution {
            tool: self.name.clone(),
            message: "cancelled".into(),
        }
    }

    fn next_response(&self, zone_id: &ZoneId) -> ScriptedResponse {
        self.scripts
            .lock()
            .get_mut(zone_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ToolAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        zone: &Zone,
        _timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ToolOutput> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.calls.lock().push(zone.id.clone());
        let response = self.next_response(&zone.id);

        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                permit = gate.acquire() => {
                    if let Ok(p) = permit {
                        p.forget();
                    }
                }
            }
        }

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        match response {
            ScriptedResponse::Output(out) => Ok(out),
            ScriptedResponse::Error(message) => Err(ZoneflowError::ToolExecution {
                tool: self.name.clone(),
                message,
            }),
            ScriptedResponse::Hang => {
                cancel.cancelled().await;
                Err(self.cancelled())
            }
            ScriptedResponse::Stubborn(delay, out) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use zoneflow_shared::BoundingBox;

    use super::*;

    fn zone(id: &str) -> Zone {
        Zone {
            id: id.into(),
            page_number: 1,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                page_width: 1.0,
                page_height: 1.0,
            },
            content_type: ContentType::Text,
            user_priority: None,
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn replays_then_defaults() {
        let adapter = ScriptedAdapter::new("t")
            .respond("a", ScriptedResponse::output("first", Some(0.5)))
            .respond("a", ScriptedResponse::error("boom"))
            .with_default(ScriptedResponse::output("default", None));
        let z = zone("a");
        let t = Duration::from_secs(1);

        let first = adapter.execute(&z, t, CancellationToken::new()).await;
        assert_eq!(first.expect("first").content, "first");
        let second = adapter.execute(&z, t, CancellationToken::new()).await;
        assert!(second.unwrap_err().to_string().contains("boom"));
        let third = adapter.execute(&z, t, CancellationToken::new()).await;
        assert_eq!(third.expect("third").content, "default");
        assert_eq!(adapter.call_count(), 3);
        assert_eq!(adapter.in_flight(), 0);
    }

    #[tokio::test]
    async fn hang_ends_on_cancel() {
        let adapter = ScriptedAdapter::new("t").with_default(ScriptedResponse::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = adapter
            .execute(&zone("a"), Duration::from_secs(1), cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn gate_holds_calls_and_tracks_peak() {
        let gate = Arc::new(Semaphore::new(0));
        let adapter = Arc::new(
            ScriptedAdapter::new("t")
                .with_gate(Arc::clone(&gate))
                .with_default(ScriptedResponse::output("ok", Some(1.0))),
        );
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let adapter = Arc::clone(&adapter);
                tokio::spawn(async move {
                    adapter
                        .execute(&zone(id), Duration::from_secs(1), CancellationToken::new())
                        .await
                })
            })
            .collect();

        while adapter.in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(2);
        for h in handles {
            assert!(h.await.expect("join").is_ok());
        }
        assert_eq!(adapter.peak_concurrency(), 2);
    }
}
