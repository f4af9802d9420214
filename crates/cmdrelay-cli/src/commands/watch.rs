//! `cmdrelay watch <area>`: print a relay stream as it arrives.

use std::io::Write;

use anyhow::{Context, Result, bail};
use cmdrelay_core::Area;
use futures::StreamExt;
use reqwest::header::{ACCEPT, COOKIE};
use tracing::{debug, info};

use super::RelayTarget;

/// Streams `area` from the relay into `out`, flushing after every chunk.
///
/// Returns the number of bytes written once the relay ends the stream.
pub async fn run(target: &RelayTarget, area: &str, out: &mut impl Write) -> Result<u64> {
    let area = Area::parse(area).with_context(|| format!("invalid area {area:?}"))?;

    let mut request = target
        .http
        .get(target.url(&format!("/sse/commands/{area}")))
        .header(ACCEPT, "text/event-stream");
    if let Some(cookie) = target.cookie() {
        request = request.header(COOKIE, cookie);
    }

    let response = request.send().await.context("failed to reach relay")?;
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body["error"].as_str().map(str::to_owned))
            .unwrap_or_default();
        bail!("relay returned {status}: {message}");
    }
    info!(area = %area, "stream open");

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("stream interrupted")?;
        out.write_all(&chunk)?;
        out.flush()?;
        written += chunk.len() as u64;
    }
    debug!(area = %area, bytes = written, "stream ended");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_relay;

    #[tokio::test]
    async fn prints_stream_bytes() {
        let addr = test_relay::spawn().await;
        let mut out = Vec::new();
        let written = run(&test_relay::target(addr, Some("good")), "grill", &mut out)
            .await
            .unwrap();
        let expected = test_relay::STREAM.concat();
        assert_eq!(String::from_utf8(out).unwrap(), expected);
        assert_eq!(written, expected.len() as u64);
    }

    #[tokio::test]
    async fn relay_error_is_reported() {
        let addr = test_relay::spawn().await;
        let mut out = Vec::new();
        let error = run(&test_relay::target(addr, None), "grill", &mut out)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("401"));
        assert!(error.to_string().contains("Unauthorized"));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn invalid_area_is_rejected_locally() {
        let target = test_relay::target("127.0.0.1:9".parse().unwrap(), Some("good"));
        let error = run(&target, "gr ill", &mut Vec::new()).await.unwrap_err();
        assert!(error.to_string().contains("invalid area"));
    }
}
