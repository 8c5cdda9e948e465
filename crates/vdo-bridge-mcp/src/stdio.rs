//! Stdio JSON-RPC transport
//!
//! Accepts newline-delimited JSON and `Content-Length`-framed messages on
//! the same connection, autodetected per message. Output echoes the peer's
//! framing: line-delimited by default, framed after the first framed
//! inbound message. Dispatch is serialized by the read loop itself.

use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::jsonrpc::{JsonRpcResponse, INVALID_REQUEST, PARSE_ERROR};
use crate::service::McpService;

/// Serve JSON-RPC over the process stdio until EOF or an `exit`
/// notification.
pub async fn run_stdio(service: Arc<McpService>) -> std::io::Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    run_loop(service, reader, writer).await
}

/// Transport loop over arbitrary streams; split out so tests can drive it
/// with in-memory pipes.
pub async fn run_loop<R, W>(
    service: Arc<McpService>,
    mut reader: BufReader<R>,
    mut writer: W,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framed_output = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
            // Framed mode; echo it on output from here on.
            framed_output = true;
            let length: usize = match rest.trim().parse() {
                Ok(length) => length,
                Err(_) => {
                    write_response(
                        &mut writer,
                        &JsonRpcResponse::failure(
                            Value::Null,
                            INVALID_REQUEST,
                            "malformed Content-Length header",
                        ),
                        framed_output,
                    )
                    .await?;
                    continue;
                }
            };
            // Skip remaining headers up to the blank line.
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await? == 0 {
                    return Ok(());
                }
                if header.trim().is_empty() {
                    break;
                }
            }
            if length > service.max_message_bytes {
                // Drain the oversized body to keep the stream aligned.
                let mut sink = tokio::io::sink();
                tokio::io::copy(&mut (&mut reader).take(length as u64), &mut sink).await?;
                write_response(
                    &mut writer,
                    &JsonRpcResponse::failure(
                        Value::Null,
                        INVALID_REQUEST,
                        format!("message exceeds {} bytes", service.max_message_bytes),
                    ),
                    framed_output,
                )
                .await?;
                continue;
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            String::from_utf8_lossy(&body).into_owned()
        } else {
            if trimmed.len() > service.max_message_bytes {
                write_response(
                    &mut writer,
                    &JsonRpcResponse::failure(
                        Value::Null,
                        INVALID_REQUEST,
                        format!("message exceeds {} bytes", service.max_message_bytes),
                    ),
                    framed_output,
                )
                .await?;
                continue;
            }
            trimmed.to_string()
        };

        let value: Value = match serde_json::from_str(&message) {
            Ok(value) => value,
            Err(err) => {
                write_response(
                    &mut writer,
                    &JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("parse error: {err}")),
                    framed_output,
                )
                .await?;
                continue;
            }
        };

        if let Some(response) = service.handle_value(value).await {
            write_value(&mut writer, &response, framed_output).await?;
        }
        if service.exit_requested() {
            break;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
    framed: bool,
) -> std::io::Result<()> {
    let value = serde_json::to_value(response).expect("response serializes");
    write_value(writer, &value, framed).await
}

async fn write_value<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &Value,
    framed: bool,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).expect("response serializes");
    if framed {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(&body).await?;
    } else {
        writer.write_all(&body).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
