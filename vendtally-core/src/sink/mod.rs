//! Aggregate sinks
//!
//! A sink delivers one serialized aggregate to wherever the operator collects
//! them. The counter only decides *when* to send and what to do with the
//! result; connection handling, timeouts and retries belong to the sink.
//!
//! ## Usage
//!
//! Enable the HTTP sink in `~/.config/vendtally/config.toml`:
//!
//! ```toml
//! [counter]
//! machine_id = 12345
//! enable_external_api = true
//! api_endpoint = "https://collector.example.com/consumption"
//! api_key = "vt_live_xxxxxxxxxxxx"
//! max_retry_attempts = 3
//!
//! [sink]
//! timeout_secs = 30
//! ```

mod http;

pub use http::{HttpSink, SinkStats};

use crate::error::Result;

/// One delivery attempt handed to a sink
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    /// Destination URL
    pub endpoint: &'a str,
    /// Bearer credential, if configured
    pub api_key: Option<&'a str>,
    /// Serialized aggregate (JSON)
    pub payload: &'a [u8],
    /// Retry budget for transient failures within this attempt
    pub max_retries: u32,
}

/// Delivers aggregates to an external collector
///
/// Any error is treated by the counter as retryable at the next trigger.
pub trait NetworkSink {
    fn send(&mut self, request: &SyncRequest<'_>) -> Result<()>;
}

impl<T: NetworkSink + ?Sized> NetworkSink for Box<T> {
    fn send(&mut self, request: &SyncRequest<'_>) -> Result<()> {
        (**self).send(request)
    }
}

/// Sink that accepts everything and sends nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NetworkSink for NullSink {
    fn send(&mut self, request: &SyncRequest<'_>) -> Result<()> {
        tracing::debug!(
            endpoint = %request.endpoint,
            bytes = request.payload.len(),
            "Discarding aggregate (null sink)"
        );
        Ok(())
    }
}
