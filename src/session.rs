//! Long-running line protocol.
//!
//! Each input line is either a JSON control command (it starts with `{`)
//! or a URL to fetch through the interceptor. Every line gets exactly one
//! JSON line back.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::control::{ControlChannel, ControlCommand, ControlHandle};
use crate::interceptor::Interceptor;

/// Serve lines from `input` until EOF. Eviction runs in the background for
/// as long as the session does.
pub async fn run<R, W>(interceptor: Interceptor, input: R, mut output: W) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let scheduler = interceptor.start();
  let control = ControlChannel::new(interceptor.clone()).spawn();
  info!("Session started");

  let result = serve(&interceptor, &control, input, &mut output).await;

  scheduler.shutdown().await;
  info!("Session ended");
  result
}

async fn serve<R, W>(
  interceptor: &Interceptor,
  control: &ControlHandle,
  input: R,
  output: &mut W,
) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut lines = input.lines();

  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read input: {}", e))?
  {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let reply = if line.starts_with('{') {
      command_line(control, line).await
    } else {
      fetch_line(interceptor, line).await
    };

    let mut text = reply.to_string();
    text.push('\n');
    output
      .write_all(text.as_bytes())
      .await
      .map_err(|e| eyre!("Failed to write reply: {}", e))?;
    output
      .flush()
      .await
      .map_err(|e| eyre!("Failed to write reply: {}", e))?;
  }

  Ok(())
}

async fn command_line(control: &ControlHandle, line: &str) -> Value {
  let result = match ControlCommand::parse(line) {
    Ok(command) => control.send(command).await,
    Err(e) => Err(e),
  };

  match result {
    Ok(reply) => serde_json::to_value(&reply).unwrap_or_else(|e| json!({ "error": e.to_string() })),
    Err(e) => json!({ "error": e.to_string() }),
  }
}

async fn fetch_line(interceptor: &Interceptor, url: &str) -> Value {
  match interceptor.get(url).await {
    Ok(served) => json!({
      "url": url,
      "status": served.response.status,
      "bytes": served.response.body.len(),
      "source": served.source,
    }),
    Err(e) => json!({ "url": url, "error": e.to_string() }),
  }
}
