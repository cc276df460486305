//! Incoming demultiplexer: the single reader task.
//!
//! Frames are consumed in stream order and routed by message number into
//! per-number assembly records. Completed requests are dispatched to handler
//! workers off the read path, so a slow handler never stalls demultiplexing
//! of other messages. Completed replies are matched against the connection's
//! pending-response table.
//!
//! Wire-level malformation (bad frame headers, bad property blocks, gzip
//! failures) ends the loop with an error and takes the connection down; the
//! semantic violation of a reply referencing an unknown number is logged and
//! ignored, leaving the connection usable.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

use crate::compress::decompress_body;
use crate::connection::Shared;
use crate::dispatcher::Outcome;
use crate::error::{FramewireError, Result};
use crate::message::{error_codes, IncomingRequest, IncomingResponse, ReplyContext, ResponseError};
use crate::properties::Properties;
use crate::protocol::{Frame, FrameBuffer, FrameKind};
use crate::writer::WriterHandle;

/// A pending-response table entry: the completion signal registered at send
/// time, plus the reply's assembly state once its frames start arriving.
pub(crate) struct PendingResponse {
    assembly: Option<ResponseAssembly>,
    tx: oneshot::Sender<Result<IncomingResponse>>,
}

impl PendingResponse {
    pub(crate) fn new(tx: oneshot::Sender<Result<IncomingResponse>>) -> Self {
        Self { assembly: None, tx }
    }

    /// Resolve the pending response as failed: the connection went away.
    pub(crate) fn fail_disconnected(self) {
        let _ = self.tx.send(Err(FramewireError::Disconnected));
    }
}

struct ResponseAssembly {
    kind: FrameKind,
    compressed: bool,
    properties: Properties,
    body: BytesMut,
}

/// Assembly record for an incoming request.
struct RequestAssembly {
    compressed: bool,
    urgent: bool,
    no_reply: bool,
    properties: Properties,
    body: BytesMut,
}

/// Main read loop: reads stream chunks, extracts frames, routes each one.
///
/// Returns `Ok(())` on clean EOF and an error on stream failure or a
/// connection-fatal protocol violation.
pub(crate) async fn reader_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    writer: WriterHandle,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(shared.config.max_frame_payload);
    let mut inbound: HashMap<u32, RequestAssembly> = HashMap::new();
    // Incoming request numbers arrive strictly in sequence.
    let mut next_incoming: u32 = 1;
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(FramewireError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            route_frame(frame, &mut inbound, &mut next_incoming, &shared, &writer).await?;
        }
    }
}

async fn route_frame(
    frame: Frame,
    inbound: &mut HashMap<u32, RequestAssembly>,
    next_incoming: &mut u32,
    shared: &Arc<Shared>,
    writer: &WriterHandle,
) -> Result<()> {
    let number = frame.number();
    tracing::trace!(
        number,
        kind = ?frame.kind(),
        more = frame.more_coming(),
        len = frame.payload.len(),
        "incoming frame"
    );

    match frame.kind() {
        FrameKind::Msg => route_msg_frame(frame, inbound, next_incoming, shared, writer).await,
        FrameKind::Reply | FrameKind::Error => {
            let finished = {
                let mut pending = shared.pending.lock().unwrap();
                let Some(entry) = pending.get_mut(&number) else {
                    drop(pending);
                    tracing::warn!(
                        number,
                        "BadData: reply frame references an unknown message number, ignoring"
                    );
                    return Ok(());
                };

                match &mut entry.assembly {
                    None => {
                        let (properties, consumed) = decode_frame_properties(&frame, shared)?;
                        let mut body = BytesMut::new();
                        body.extend_from_slice(&frame.payload[consumed..]);
                        entry.assembly = Some(ResponseAssembly {
                            kind: frame.kind(),
                            compressed: frame.header.is_compressed(),
                            properties,
                            body,
                        });
                    }
                    Some(assembly) => {
                        if frame.has_properties() {
                            return Err(FramewireError::BadFrame(
                                "hasProperties on a continuation frame".to_string(),
                            ));
                        }
                        // An error frame may finalize what began as a reply.
                        assembly.kind = frame.kind();
                        assembly.body.extend_from_slice(&frame.payload);
                    }
                }

                if frame.more_coming() {
                    None
                } else {
                    pending.remove(&number)
                }
            };

            if let Some(entry) = finished {
                complete_response(number, entry, shared)?;
            }
            Ok(())
        }
    }
}

async fn route_msg_frame(
    frame: Frame,
    inbound: &mut HashMap<u32, RequestAssembly>,
    next_incoming: &mut u32,
    shared: &Arc<Shared>,
    writer: &WriterHandle,
) -> Result<()> {
    let number = frame.number();

    if let Some(assembly) = inbound.get_mut(&number) {
        if frame.has_properties() {
            return Err(FramewireError::BadFrame(
                "hasProperties on a continuation frame".to_string(),
            ));
        }
        assembly.body.extend_from_slice(&frame.payload);

        if !frame.more_coming() {
            let assembly = inbound.remove(&number).expect("assembly exists");
            complete_request(number, assembly, shared, writer)?;
        }
        return Ok(());
    }

    if number != *next_incoming {
        tracing::warn!(
            number,
            expected = *next_incoming,
            "ignoring frame for an unexpected message number"
        );
        return Ok(());
    }

    // Shed new multi-frame messages once too many are mid-assembly.
    if frame.more_coming() && inbound.len() >= shared.config.max_inflight_incoming {
        *next_incoming += 1;
        tracing::warn!(number, "incoming message capacity reached, shedding request");
        if !frame.header.is_no_reply() {
            let ctx = reply_context(&frame, shared, writer);
            if let Err(e) = ctx
                .respond_error(error_codes::BUSY, "too many concurrent incoming messages")
                .await
            {
                tracing::debug!(number, "could not send busy response: {}", e);
            }
        }
        return Ok(());
    }

    *next_incoming += 1;

    let (properties, consumed) = decode_frame_properties(&frame, shared)?;
    shared
        .listeners
        .notify_properties_available(number, &properties);

    let mut assembly = RequestAssembly {
        compressed: frame.header.is_compressed(),
        urgent: frame.header.is_urgent(),
        no_reply: frame.header.is_no_reply(),
        properties,
        body: BytesMut::new(),
    };
    assembly.body.extend_from_slice(&frame.payload[consumed..]);

    if frame.more_coming() {
        inbound.insert(number, assembly);
    } else {
        complete_request(number, assembly, shared, writer)?;
    }
    Ok(())
}

/// Decode the property block from a message's first frame. Frames without
/// `hasProperties` carry an empty set.
fn decode_frame_properties(frame: &Frame, shared: &Shared) -> Result<(Properties, usize)> {
    if frame.has_properties() {
        Properties::decode(&frame.payload, shared.config.max_properties_size)
    } else {
        Ok((Properties::new(), 0))
    }
}

fn reply_context(frame: &Frame, shared: &Shared, writer: &WriterHandle) -> ReplyContext {
    ReplyContext::new(
        frame.number(),
        frame.header.is_urgent(),
        frame.header.is_no_reply(),
        writer.clone(),
        shared.config.max_frame_payload,
        shared.config.max_properties_size,
    )
}

/// Finish a fully reassembled request: decompress, notify listeners, and
/// hand it to a dispatch worker. Only the handler runs off the read path;
/// a body that fails to decode is wire corruption and connection-fatal.
fn complete_request(
    number: u32,
    assembly: RequestAssembly,
    shared: &Arc<Shared>,
    writer: &WriterHandle,
) -> Result<()> {
    let body = if assembly.compressed {
        Bytes::from(decompress_body(
            &assembly.body,
            shared.config.max_message_size,
        )?)
    } else {
        assembly.body.freeze()
    };

    let request = IncomingRequest {
        number,
        properties: assembly.properties,
        body,
        compressed: assembly.compressed,
        urgent: assembly.urgent,
        no_reply: assembly.no_reply,
    };
    shared.listeners.notify_request_received(&request);

    let ctx = ReplyContext::new(
        number,
        assembly.urgent,
        assembly.no_reply,
        writer.clone(),
        shared.config.max_frame_payload,
        shared.config.max_properties_size,
    );
    spawn_dispatch(shared.clone(), request, ctx);
    Ok(())
}

/// Run the dispatch chain for a finished request on a worker task, so a
/// slow handler cannot stall demultiplexing of other messages.
fn spawn_dispatch(shared: Arc<Shared>, request: IncomingRequest, ctx: ReplyContext) {
    tokio::spawn(async move {
        let Ok(_permit) = shared.handler_semaphore.clone().acquire_owned().await else {
            return;
        };

        let number = request.number();
        let handler = shared
            .dispatcher
            .resolve(request.properties())
            .or_else(|| shared.default_handler.read().unwrap().clone());

        let outcome = match handler {
            Some(handler) => handler(request, ctx.clone()).await,
            None => Ok(Outcome::Unhandled),
        };

        match outcome {
            Ok(Outcome::Deferred) => {}
            Ok(_) => {
                if let Err(e) = ctx.respond_default().await {
                    tracing::debug!(number, "could not send default response: {}", e);
                }
            }
            Err(e) => {
                tracing::error!(number, "handler failed: {}", e);
                let _ = ctx
                    .respond_error(error_codes::HANDLER_FAILED, e.to_string())
                    .await;
            }
        }
    });
}

/// Finish a fully reassembled response: decompress and fulfill the pending
/// entry removed from the table.
fn complete_response(number: u32, entry: PendingResponse, shared: &Arc<Shared>) -> Result<()> {
    let PendingResponse { assembly, tx } = entry;
    let assembly = assembly.expect("completed response has an assembly");

    let body = if assembly.compressed {
        Bytes::from(decompress_body(
            &assembly.body,
            shared.config.max_message_size,
        )?)
    } else {
        assembly.body.freeze()
    };

    let error = match assembly.kind {
        FrameKind::Error => Some(ResponseError::from_wire(&assembly.properties, &body)),
        _ => None,
    };

    let response = IncomingResponse {
        number,
        properties: assembly.properties,
        body,
        error,
    };
    shared.listeners.notify_response_received(&response);

    if tx.send(Ok(response)).is_err() {
        tracing::debug!(number, "response arrived but nobody is waiting");
    }
    Ok(())
}
