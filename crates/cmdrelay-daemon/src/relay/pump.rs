//! Upstream-to-downstream pump.
//!
//! One pump task runs per streaming connection. It owns the upstream body
//! and the sending half of the single-slot channel that feeds the response
//! body, and it is the only place either is dropped.
//!
//! # Invariants
//!
//! - Chunks are forwarded in upstream order, one send per chunk
//! - Every await is raced against downstream closure and shutdown
//! - The upstream body is dropped as soon as the loop exits

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};

use super::{CloseReason, RelayConnection};
use crate::metrics::RelayMetrics;
use crate::state::ShutdownSignal;
use crate::upstream::{UpstreamBody, UpstreamError};

/// Item type of the downstream channel.
pub type DownstreamItem = Result<Bytes, io::Error>;

/// Everything one pump task owns.
pub struct Pump {
    /// The connection being served.
    pub connection: RelayConnection,
    /// Upstream response body.
    pub upstream: UpstreamBody,
    /// Sending half of the channel feeding the response body.
    pub downstream: mpsc::Sender<DownstreamItem>,
    /// Process shutdown.
    pub shutdown: ShutdownSignal,
    /// Tear down after this long without a chunk.
    pub idle_timeout: Option<Duration>,
    /// Metrics sink.
    pub metrics: RelayMetrics,
}

impl Pump {
    /// Copies chunks until one side closes, then tears both down.
    pub async fn run(self) -> CloseReason {
        let Self {
            mut connection,
            mut upstream,
            downstream,
            mut shutdown,
            idle_timeout,
            metrics,
        } = self;
        let area = connection.area().as_str().to_owned();
        let _active = metrics.stream_opened(&area);
        let mut chunks: u64 = 0;

        let reason = loop {
            let next = tokio::select! {
                biased;
                () = downstream.closed() => break CloseReason::DownstreamClosed,
                () = shutdown.wait() => break CloseReason::Shutdown,
                next = next_chunk(&mut upstream, idle_timeout) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    let len = chunk.len();
                    tokio::select! {
                        biased;
                        () = shutdown.wait() => break CloseReason::Shutdown,
                        sent = downstream.send(Ok(chunk)) => {
                            if sent.is_err() {
                                break CloseReason::DownstreamClosed;
                            }
                        },
                    }
                    chunks += 1;
                    metrics.bytes_forwarded(&area, len);
                },
                Ok(None) => break CloseReason::UpstreamEnded,
                Ok(Some(Err(
                    UpstreamError::Transport(message) | UpstreamError::InvalidUrl(message),
                ))) => {
                    abort(&downstream, &mut shutdown, "upstream stream failed").await;
                    break CloseReason::UpstreamFailed(message);
                },
                Err(_elapsed) => {
                    abort(&downstream, &mut shutdown, "upstream idle timeout").await;
                    break CloseReason::IdleTimeout;
                },
            }
        };

        drop(upstream);
        drop(downstream);
        connection.close(&reason);

        match &reason {
            CloseReason::UpstreamFailed(message) => {
                warn!(chunks, error = %message, "relay closed: upstream failed");
            },
            CloseReason::IdleTimeout => {
                warn!(chunks, "relay closed: upstream idle");
            },
            other => {
                info!(chunks, reason = other.outcome(), "relay closed");
            },
        }
        metrics.connection_finished(&area, reason.outcome());
        reason
    }
}

async fn next_chunk(
    upstream: &mut UpstreamBody,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Bytes, UpstreamError>>, Elapsed> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, upstream.next()).await,
        None => Ok(upstream.next().await),
    }
}

/// Terminates the response body with an error so the client observes an
/// aborted stream rather than a clean end.
async fn abort(
    downstream: &mpsc::Sender<DownstreamItem>,
    shutdown: &mut ShutdownSignal,
    message: &'static str,
) {
    tokio::select! {
        biased;
        () = shutdown.wait() => {},
        sent = downstream.send(Err(io::Error::other(message))) => {
            if sent.is_err() {
                debug!("downstream already closed; abort marker dropped");
            }
        },
    }
}
