use bytes::Bytes;
use tokio::sync::mpsc;

use kproxy_protocol::decoder::PayloadDecoder;
use kproxy_protocol::sse::{SseFraming, data_frame};

use crate::engine::usage::{GeminiStreamState, OpenAiStreamState, ReportedUsage};
use crate::upstream::{ChunkReceiver, StreamFault};

/// Streaming proxy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitingUpstream,
    HeadersReceived,
    Streaming,
    Closed,
    Aborted,
    PartialAborted,
}

/// What a finished relay learned; the engine settles the metric from this.
#[derive(Debug)]
pub struct RelayReport {
    pub phase: StreamPhase,
    pub usage: ReportedUsage,
    pub output_text: String,
    pub finish_reason: Option<String>,
    pub fault: Option<StreamFault>,
    pub bytes_forwarded: bool,
}

enum Parser {
    OpenAi {
        framer: SseFraming,
        state: OpenAiStreamState,
    },
    Gemini {
        decoder: PayloadDecoder,
        state: GeminiStreamState,
    },
}

/// Pump upstream chunks to the downstream writer.
///
/// OpenAI-family bytes are forwarded untouched and parsed opportunistically
/// on the side; Gemini payloads are normalized to `data: <json>` SSE frames
/// before forwarding. A failed downstream send means the client went away:
/// the upstream receiver is dropped, which the reader task observes within
/// one chunk.
pub async fn relay_stream(
    mut upstream: ChunkReceiver,
    downstream: mpsc::Sender<Bytes>,
    gemini: bool,
) -> RelayReport {
    let mut parser = if gemini {
        Parser::Gemini {
            decoder: PayloadDecoder::new(),
            state: GeminiStreamState::new(),
        }
    } else {
        Parser::OpenAi {
            framer: SseFraming::new(),
            state: OpenAiStreamState::new(),
        }
    };

    let mut phase = StreamPhase::HeadersReceived;
    let mut fault = None;
    let mut bytes_forwarded = false;

    loop {
        let Some(item) = upstream.recv().await else {
            // Clean upstream EOF.
            if let Parser::Gemini { decoder, state } = &mut parser {
                let mut tail = Vec::new();
                for payload in decoder.finish() {
                    state.push_payload(&payload);
                    tail.extend_from_slice(&data_frame(payload.as_bytes()));
                }
                if !tail.is_empty() && downstream.send(Bytes::from(tail)).await.is_ok() {
                    bytes_forwarded = true;
                }
            }
            phase = StreamPhase::Closed;
            break;
        };

        let chunk = match item {
            Ok(chunk) => chunk,
            Err(observed) => {
                fault = Some(observed);
                phase = StreamPhase::PartialAborted;
                break;
            }
        };
        phase = StreamPhase::Streaming;

        let outgoing = match &mut parser {
            Parser::OpenAi { framer, state } => {
                for frame in framer.feed(&chunk) {
                    state.push_payload(&frame.data);
                }
                Some(chunk)
            }
            Parser::Gemini { decoder, state } => {
                let payloads = decoder.push(&chunk);
                if payloads.is_empty() {
                    None
                } else {
                    let mut buf = Vec::new();
                    for payload in payloads {
                        state.push_payload(&payload);
                        buf.extend_from_slice(&data_frame(payload.as_bytes()));
                    }
                    Some(Bytes::from(buf))
                }
            }
        };

        if let Some(outgoing) = outgoing {
            if downstream.send(outgoing).await.is_err() {
                phase = StreamPhase::Aborted;
                break;
            }
            bytes_forwarded = true;
        }
    }

    let (usage, output_text, finish_reason) = match parser {
        Parser::OpenAi { state, .. } => (
            state.usage(),
            state.output_text().to_string(),
            state.finish_reason().map(str::to_string),
        ),
        Parser::Gemini { state, .. } => (
            state.usage(),
            state.output_text().to_string(),
            state.finish_reason().map(str::to_string),
        ),
    };

    RelayReport {
        phase,
        usage,
        output_text,
        finish_reason,
        fault,
        bytes_forwarded,
    }
}
