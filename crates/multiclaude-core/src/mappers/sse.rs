//! Generic SSE probe: drive a decoding state machine over an upstream
//! response until the first client-visible event exists, then hand the
//! remainder to a background pump.
//!
//! Probing keeps empty-response detection inside the request future: when a
//! stream ends without producing anything, nothing has been sent to the
//! client and the dispatch can retry or fall back freely.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use multiclaude_types::ProxyError;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::mappers::claude::streaming::{parse_data_line, SSE_BUFFER_CAPACITY};

/// A state machine translating decoded `data:` payloads into Anthropic
/// events.
pub trait SseMachine: Send + 'static {
    fn process_payload(&mut self, payload: &Value) -> Vec<Bytes>;
    fn finish(&mut self) -> Vec<Bytes>;
}

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Result of probing an upstream stream.
pub enum ProbeOutcome<M: SseMachine> {
    /// At least one event was produced; forward the rest in the background.
    Content(ProbedStream<M>),
    /// The stream ended without a single event.
    Empty,
}

/// A stream that has produced its first events but is not yet drained.
pub struct ProbedStream<M: SseMachine> {
    machine: M,
    byte_stream: ByteStream,
    leftover: Vec<u8>,
    pending: Vec<Bytes>,
    finished: bool,
}

/// Read `response` until the machine yields its first events or the stream
/// ends. Transport errors before the first event surface as `Stream` errors
/// so the dispatch can retry with another account.
pub async fn probe_sse<M: SseMachine>(
    response: reqwest::Response,
    mut machine: M,
) -> Result<ProbeOutcome<M>, ProxyError> {
    let mut byte_stream: ByteStream = response.bytes_stream().boxed();
    let mut leftover: Vec<u8> = Vec::with_capacity(SSE_BUFFER_CAPACITY);
    let mut pending: Vec<Bytes> = Vec::new();

    loop {
        match byte_stream.next().await {
            Some(Ok(chunk)) => {
                leftover.extend_from_slice(&chunk);
                drain_lines(&mut leftover, &mut machine, &mut pending);
                if !pending.is_empty() {
                    return Ok(ProbeOutcome::Content(ProbedStream {
                        machine,
                        byte_stream,
                        leftover,
                        pending,
                        finished: false,
                    }));
                }
            }
            Some(Err(e)) => return Err(ProxyError::Stream { message: e.to_string() }),
            None => {
                flush_tail(&mut leftover, &mut machine, &mut pending);
                if pending.is_empty() {
                    return Ok(ProbeOutcome::Empty);
                }
                pending.extend(machine.finish());
                return Ok(ProbeOutcome::Content(ProbedStream {
                    machine,
                    byte_stream,
                    leftover: Vec::new(),
                    pending,
                    finished: true,
                }));
            }
        }
    }
}

impl<M: SseMachine> ProbedStream<M> {
    /// Spawn the background pump and return the event receiver. The pump
    /// stops as soon as the receiver is dropped; the upstream reader is
    /// dropped with it on every exit path.
    pub fn into_receiver(self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            let ProbedStream { mut machine, mut byte_stream, mut leftover, pending, finished } =
                self;

            for event in pending {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if finished {
                return;
            }

            let mut events: Vec<Bytes> = Vec::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("Upstream stream error mid-flight: {}", e);
                        break;
                    }
                };
                leftover.extend_from_slice(&chunk);
                drain_lines(&mut leftover, &mut machine, &mut events);
                for event in events.drain(..) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            flush_tail(&mut leftover, &mut machine, &mut events);
            events.extend(machine.finish());
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

fn drain_lines<M: SseMachine>(buf: &mut Vec<u8>, machine: &mut M, out: &mut Vec<Bytes>) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(payload) = parse_data_line(line.trim_end()) {
            out.extend(machine.process_payload(&payload));
        }
    }
}

fn flush_tail<M: SseMachine>(buf: &mut Vec<u8>, machine: &mut M, out: &mut Vec<Bytes>) {
    if buf.is_empty() {
        return;
    }
    let tail = String::from_utf8_lossy(buf);
    if let Some(payload) = parse_data_line(tail.trim_end()) {
        out.extend(machine.process_payload(&payload));
    }
    buf.clear();
}

/// Deliver a fixed set of events as a receiver (canned fallbacks).
pub fn canned_events(events: Vec<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(events.len().max(1));
    tokio::spawn(async move {
        for event in events {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
    rx
}
