//! Client-side event delivery: sinks push events toward a daemon, sources
//! hand them to whatever polls. `HttpSink` is the production path for
//! emitting events at a running daemon's ingest endpoint; the memory pair
//! exists for tests and local wiring.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::wire::{IngestResponse, WireEvent};

#[async_trait]
pub trait EventSink: Send {
    /// Queue one event for delivery. Implementations may buffer.
    async fn send(
        &mut self,
        name: &str,
        data: serde_json::Value,
        source: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Deliver anything buffered.
    async fn flush(&mut self) -> anyhow::Result<()>;

    /// Flush and release resources. Call before dropping the sink.
    async fn close(&mut self) -> anyhow::Result<()> {
        self.flush().await
    }
}

#[async_trait]
pub trait EventSource: Send {
    /// Drain whatever events are currently available.
    async fn next_batch(&mut self) -> anyhow::Result<Vec<WireEvent>>;
}

fn make_event(name: &str, data: serde_json::Value, source: Option<&str>) -> WireEvent {
    WireEvent {
        name: name.to_string(),
        source: source.map(str::to_string),
        data,
        timestamp: Some(Utc::now()),
    }
}

/// Batching sink over the daemon's `/v1/events/ingest` endpoint. A batch
/// is posted when it reaches `batch_size` or when `batch_timeout` has
/// passed since the last flush.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
    batch_timeout: Duration,
    batch: Vec<WireEvent>,
    last_flush: Instant,
}

impl HttpSink {
    pub fn new(daemon_url: &str, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/v1/events/ingest", daemon_url.trim_end_matches('/')),
            batch_size,
            batch_timeout,
            batch: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Unbatched sink: every send posts immediately.
    pub fn unbuffered(daemon_url: &str) -> Self {
        Self::new(daemon_url, 1, Duration::ZERO)
    }

    fn should_flush(&self) -> bool {
        self.batch.len() >= self.batch_size || self.last_flush.elapsed() >= self.batch_timeout
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn send(
        &mut self,
        name: &str,
        data: serde_json::Value,
        source: Option<&str>,
    ) -> anyhow::Result<()> {
        self.batch.push(make_event(name, data, source));
        if self.should_flush() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "events": self.batch }))
            .send()
            .await?
            .error_for_status()?;
        let body: IngestResponse = response.json().await?;
        debug!(received = body.received, "Flushed event batch");
        self.batch.clear();
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemorySink {
    pub events: Vec<WireEvent>,
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(
        &mut self,
        name: &str,
        data: serde_json::Value,
        source: Option<&str>,
    ) -> anyhow::Result<()> {
        self.events.push(make_event(name, data, source));
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drains a `MemorySink`'s queue.
pub struct MemorySource {
    pub sink: MemorySink,
}

impl MemorySource {
    pub fn new(sink: MemorySink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_batch(&mut self) -> anyhow::Result<Vec<WireEvent>> {
        Ok(std::mem::take(&mut self.sink.events))
    }
}
