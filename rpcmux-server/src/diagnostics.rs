//! Built-in operations for probing a server: one per call shape.
//!
//! | op                   | shape            |
//! |----------------------|------------------|
//! | `rpcmux.echo`        | unary            |
//! | `rpcmux.ticks`       | server streaming |
//! | `rpcmux.count`       | client streaming |
//! | `rpcmux.echo_stream` | duplex           |
//! | `rpcmux.ops`         | unary            |

use crate::handler::{CallContext, CallError, ServerCall, ServerStreamWriter, ServiceRegistry};
use bytes::Bytes;
use rpcmux_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ECHO: &str = "rpcmux.echo";
pub const TICKS: &str = "rpcmux.ticks";
pub const COUNT: &str = "rpcmux.count";
pub const ECHO_STREAM: &str = "rpcmux.echo_stream";
pub const OPS: &str = "rpcmux.ops";

/// Upper bound on ticks per call.
const MAX_TICKS: u32 = 10_000;

/// Request for `rpcmux.ticks`. An empty request uses the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicksRequest {
    pub count: u32,
    pub interval_ms: u64,
}

impl Default for TicksRequest {
    fn default() -> Self {
        Self {
            count: 5,
            interval_ms: 100,
        }
    }
}

/// Response of `rpcmux.count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub messages: u64,
    pub bytes: u64,
}

/// Registers the diagnostic operations. `rpcmux.ops` lists what was
/// registered before it, so call this after the application's own handlers.
pub fn register_diagnostics(registry: &mut ServiceRegistry) {
    registry
        .unary(ECHO, |request: Bytes, _ctx| async move { Ok(request) })
        .server_streaming(TICKS, ticks)
        .register(COUNT, count)
        .register(ECHO_STREAM, echo_stream);

    let mut ops: Vec<String> = registry.ops().into_iter().map(String::from).collect();
    ops.push(OPS.to_string());
    ops.sort_unstable();
    registry.unary(OPS, move |_request, _ctx| {
        let body = serde_json::to_vec(&ops)
            .map(Bytes::from)
            .map_err(|e| CallError::with_code(ErrorCode::InternalError, e.to_string()));
        async move { body }
    });
}

async fn ticks(
    request: Bytes,
    mut writer: ServerStreamWriter,
    ctx: CallContext,
) -> Result<(), CallError> {
    let request: TicksRequest = if request.is_empty() {
        TicksRequest::default()
    } else {
        serde_json::from_slice(&request)
            .map_err(|e| CallError::new(format!("invalid ticks request: {}", e)))?
    };
    if request.count > MAX_TICKS {
        return Err(CallError::new(format!(
            "count {} exceeds {}",
            request.count, MAX_TICKS
        )));
    }

    let mut interval = tokio::time::interval(Duration::from_millis(request.interval_ms.max(1)));
    for tick in 0..request.count {
        tokio::select! {
            _ = interval.tick() => {}
            _ = ctx.cancelled() => {
                tracing::debug!(stream_id = ctx.stream_id(), sent = tick, "Ticks cancelled");
                return Ok(());
            }
        }
        writer.send(format!("tick {}", tick)).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn count(mut call: ServerCall) -> Result<(), CallError> {
    let mut response = CountResponse {
        messages: 0,
        bytes: 0,
    };
    while let Some(message) = call.input.recv().await? {
        response.messages += 1;
        response.bytes += message.len() as u64;
    }
    let body = serde_json::to_vec(&response)
        .map_err(|e| CallError::with_code(ErrorCode::InternalError, e.to_string()))?;
    call.output.send_final(body).await?;
    Ok(())
}

async fn echo_stream(mut call: ServerCall) -> Result<(), CallError> {
    while let Some(message) = call.input.recv().await? {
        call.output.send(message).await?;
        call.output.flush().await?;
    }
    call.output.finish().await?;
    Ok(())
}
