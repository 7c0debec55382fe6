/*!
 * Call Tracing
 * Structured tracing for RPC calls using the tracing crate
 *
 * Features:
 * - Trace ID per call for correlating client and agent logs
 * - JSON-formatted logs for structured parsing
 * - Slow-call warnings with the call's result attached
 */

use crate::core::errors::RpcErrno;
use crate::core::limits::SLOW_CALL_WARN_MS;
use crate::core::types::JobId;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Environment variable switching log output to JSON
pub const TRACE_JSON_ENV: &str = "RPC_AGENT_TRACE_JSON";

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - RPC_AGENT_TRACE_JSON: Enable JSON output (default: false)
///
/// Calling this twice is harmless; the second subscriber is discarded.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(TRACE_JSON_ENV)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .compact(),
            )
            .try_init()
    };

    if installed.is_ok() {
        info!(json = use_json, "structured tracing initialized");
    }
}

/// Generate a unique trace ID for request correlation
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one dispatched RPC
///
/// Records duration and result when dropped; calls slower than
/// `SLOW_CALL_WARN_MS` are reported at warn level.
pub struct RpcSpan {
    span: tracing::Span,
    start: Instant,
    rpc: &'static str,
    trace_id: String,
    result: RpcErrno,
}

impl RpcSpan {
    pub fn new(rpc: &'static str, jobid: JobId, use_libc: bool) -> Self {
        let trace_id = generate_trace_id();

        let span = span!(
            Level::DEBUG,
            "rpc",
            trace_id = %trace_id,
            rpc,
            jobid,
            use_libc,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
        );
        span.in_scope(|| debug!(rpc, "call started"));

        Self {
            span,
            start: Instant::now(),
            rpc,
            trace_id,
            result: RpcErrno::Ok,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Record the wire result of the call
    pub fn record_result(&mut self, errno: RpcErrno) {
        self.result = errno;
        self.span.record("result", errno.as_str());
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Enter the span context
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for RpcSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();

        if duration.as_millis() > SLOW_CALL_WARN_MS {
            warn!(
                trace_id = %self.trace_id,
                rpc = self.rpc,
                duration_ms = duration.as_millis() as u64,
                result = %self.result,
                slow = true,
                "slow call detected"
            );
        } else {
            debug!(
                trace_id = %self.trace_id,
                rpc = self.rpc,
                duration_us = duration.as_micros() as u64,
                result = %self.result,
                "call completed"
            );
        }
    }
}

/// Convenience constructor mirroring `tracing::span!`
pub fn span_rpc(rpc: &'static str, jobid: JobId, use_libc: bool) -> RpcSpan {
    RpcSpan::new(rpc, jobid, use_libc)
}
