use bytes::BytesMut;
use flux_traits::{ConditionModel, Direction};
use mod_metrics::MetricsCollector;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Upper bound of a single read/write cycle.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Why a pipe stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    EndOfStream,
    ReadError(io::ErrorKind),
    WriteError(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeSummary {
    pub direction: Direction,
    pub bytes: u64,
    pub chunks: u64,
    pub dropped: u64,
    pub end: PipeEnd,
}

/// One-way copy loop from a source to a sink.
///
/// Per chunk: read, ask the model whether to drop (a dropped chunk has
/// already been consumed from the source and is discarded), sleep the latency
/// delay, sleep the bandwidth delay, write. Chunks leave in the order they
/// were read. Any read or write failure, or end-of-stream, stops the loop.
pub struct DirectionalPipe {
    direction: Direction,
    session_id: Arc<str>,
    conditions: Arc<dyn ConditionModel>,
    metrics: Arc<MetricsCollector>,
}

impl DirectionalPipe {
    pub fn new(
        direction: Direction,
        session_id: Arc<str>,
        conditions: Arc<dyn ConditionModel>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            direction,
            session_id,
            conditions,
            metrics,
        }
    }

    pub async fn run<R, W>(&self, src: &mut R, dst: &mut W) -> PipeSummary
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = PipeSummary {
            direction: self.direction,
            bytes: 0,
            chunks: 0,
            dropped: 0,
            end: PipeEnd::EndOfStream,
        };
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        loop {
            buf.clear();
            let n = match src.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    summary.end = PipeEnd::ReadError(e.kind());
                    debug!("[{}] {} read failed: {}", self.session_id, self.direction, e);
                    break;
                }
            };
            let ingress = Instant::now();

            if self.conditions.should_drop() {
                summary.dropped += 1;
                self.metrics.record_packet_loss(&self.session_id);
                trace!("[{}] {} dropped {} bytes", self.session_id, self.direction, n);
                continue;
            }

            pause(self.conditions.latency_delay()).await;
            pause(self.conditions.bandwidth_delay(n)).await;

            if let Err(e) = dst.write_all(&buf).await {
                summary.end = PipeEnd::WriteError(e.kind());
                debug!("[{}] {} write failed: {}", self.session_id, self.direction, e);
                break;
            }

            summary.bytes += n as u64;
            summary.chunks += 1;
            self.metrics.record_bytes(n);
            self.metrics
                .record_session_bytes(&self.session_id, self.direction, n);
            self.metrics.record_latency(ingress.elapsed());
        }

        summary
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
