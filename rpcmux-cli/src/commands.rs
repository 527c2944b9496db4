//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use rpcmux_client::Client;
use rpcmux_protocol::OpenRequest;

/// Operation listing registered by the server's diagnostics.
const OPS_OP: &str = "rpcmux.ops";

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping { count } => {
            let mut lines = Vec::new();
            for seq in 0..count.max(1) {
                let rtt = client.ping().await?;
                lines.push(format!(
                    "{} seq={} time={:.3} ms",
                    "PONG".green(),
                    seq,
                    rtt.as_secs_f64() * 1000.0
                ));
            }
            Ok(lines.join("\n"))
        }

        Commands::Ops => {
            let body = client.unary(OPS_OP, Bytes::new()).await?;
            let ops: Vec<String> = serde_json::from_slice(&body)?;
            if ops.is_empty() {
                return Ok("No operations registered".yellow().to_string());
            }
            Ok(ops
                .iter()
                .map(|op| format!("  {}", op.cyan()))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        Commands::Call { op, data, metadata } => {
            let open = open_request(&op, &metadata)?;
            let response = client.unary_with(open, parse_payload_arg(&data)?).await?;
            Ok(format_payload(&response))
        }

        Commands::Send {
            op,
            messages,
            metadata,
        } => {
            let open = open_request(&op, &metadata)?;
            let mut stream = client.connection().open(open).await?;
            for message in &messages {
                stream.send(parse_payload_arg(message)?).await?;
            }
            stream.finish().await?;
            match stream.recv().await? {
                Some(response) => Ok(format_payload(&response)),
                None => Ok(format!("{} ({} sent, no response)", "Done".green(), messages.len())),
            }
        }

        Commands::Stream {
            op,
            data,
            metadata,
            take,
        } => {
            let open = open_request(&op, &metadata)?;
            let mut responses = client
                .server_streaming_with(open, parse_payload_arg(&data)?)
                .await?;
            let mut received = 0usize;
            loop {
                if take.is_some_and(|limit| received >= limit) {
                    responses.cancel();
                    return Ok(format!("{} after {} responses", "Cancelled".yellow(), received));
                }
                tokio::select! {
                    next = responses.next() => match next? {
                        Some(message) => {
                            println!("{}", format_payload(&message));
                            received += 1;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        responses.cancel();
                        eprintln!("\n{}", "Stream cancelled".dimmed());
                        return Ok(String::new());
                    }
                }
            }
            Ok(format!("{} ({} responses)", "End of stream".dimmed(), received))
        }
    }
}

fn open_request(op: &str, metadata: &[String]) -> Result<OpenRequest, Box<dyn std::error::Error>> {
    let mut open = OpenRequest::new(op);
    for (key, value) in parse_metadata(metadata)? {
        open = open.with_metadata(key, value);
    }
    Ok(open)
}

/// Parses `KEY=VALUE` pairs.
fn parse_metadata(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(format!("invalid metadata '{}', expected KEY=VALUE", pair)),
        })
        .collect()
}

/// Parses a payload argument (either inline text or @file).
fn parse_payload_arg(arg: &str) -> Result<Bytes, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        Ok(Bytes::from(std::fs::read(path)?))
    } else {
        Ok(Bytes::copy_from_slice(arg.as_bytes()))
    }
}

/// Formats a payload for display: JSON pretty-printed, other text as is,
/// binary as a size.
fn format_payload(payload: &[u8]) -> String {
    if payload.is_empty() {
        return "(empty)".dimmed().to_string();
    }
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        if value.is_object() || value.is_array() {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return pretty;
            }
        }
    }
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes of binary data>", payload.len()).dimmed().to_string(),
    }
}
