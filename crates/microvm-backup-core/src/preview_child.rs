//! The spawned preview child (C7): the short-lived process `sk` launches
//! once per highlighted row. It reads the preview socket's name from the
//! environment, asks the cache for that archive's metadata, and prints
//! whatever comes back to stdout for `sk` to render in its preview pane.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

use crate::error::CliError;
use crate::picker::PREVIEW_SOCKET_ENV;
use crate::preview::rpc_connect;

/// Default reply-wait budget requested of the cache for a single preview
/// render. Generous relative to typical archive-tool latency so a cold
/// cache entry usually finishes within one pane refresh.
const DEFAULT_WAIT_MS: u64 = 10_000;

/// Renders the preview pane body for `archive`: an immediate loading line,
/// then (after the cache replies or the wait budget expires) a cleared
/// screen followed by the final text.
pub fn render_preview(archive: &str) -> Result<(), CliError> {
    println!("Loading archive info for {archive}...");
    std::io::stdout().flush().ok();

    let socket_name = std::env::var(PREVIEW_SOCKET_ENV)
        .map_err(|_| CliError::Configuration(format!("{PREVIEW_SOCKET_ENV} is not set")))?;

    let text = fetch_preview_text(&socket_name, archive, DEFAULT_WAIT_MS)?;

    print!("\x1b[2J\x1b[H");
    println!("{text}");
    Ok(())
}

/// Connects to the cache's socket, sends a `get_preview` request, and
/// returns the response's `text` field. The read timeout is the requested
/// wait budget plus a fixed grace period, so a slow reply still arrives
/// before the socket read gives up.
fn fetch_preview_text(socket_name: &str, archive: &str, wait_ms: u64) -> Result<String, CliError> {
    let mut stream = rpc_connect(socket_name)
        .map_err(|e| CliError::Configuration(format!("cannot connect to preview cache: {e}")))?;

    let read_timeout = Duration::from_secs(wait_ms / 1000 + 2);
    stream.set_read_timeout(Some(read_timeout)).ok();

    let request = serde_json::json!({"op": "get_preview", "archive": archive, "wait_ms": wait_ms});
    let mut body = serde_json::to_vec(&request)
        .map_err(|e| CliError::Configuration(format!("failed to encode preview request: {e}")))?;
    body.push(b'\n');
    stream
        .write_all(&body)
        .map_err(|e| CliError::Configuration(format!("failed to send preview request: {e}")))?;

    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    read_line_or_eof(&mut reader, &mut line)
        .map_err(|e| CliError::Configuration(format!("failed to read preview response: {e}")))?;

    let value: serde_json::Value = serde_json::from_str(line.trim_end())
        .map_err(|e| CliError::Configuration(format!("malformed preview response: {e}")))?;
    Ok(value
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string())
}

fn read_line_or_eof<R: Read>(reader: &mut BufReader<R>, line: &mut String) -> std::io::Result<()> {
    reader.read_line(line)?;
    Ok(())
}
