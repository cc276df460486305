//! Dedicated writer task: the outgoing multiplexer.
//!
//! The writer owns the single physical write path. Messages are enqueued via
//! an mpsc channel and interleaved frame by frame, so several large messages
//! make progress concurrently without head-of-line blocking.
//!
//! # Architecture
//!
//! ```text
//! send()    ─┐
//! respond() ─┼─► mpsc::Sender<OutgoingMessage> ─► Writer Task ─► Stream
//! respond() ─┘                                    (urgent/normal lanes)
//! ```
//!
//! # Scheduling
//!
//! Two lanes, urgent and normal. Each turn advances one message by exactly
//! one frame and requeues it at the tail of its lane unless finished. With
//! both lanes occupied, the urgent lane is serviced `urgent_weight` turns for
//! every normal turn, so urgent traffic dominates the stream but the normal
//! lane always makes progress. First frames leave in enqueue order within a
//! lane. When the stream's write side is not ready, `write_all` suspends the
//! whole loop: nothing is dropped or reordered.
//!
//! Compression, if enabled on a message, is applied once to the whole body
//! at enqueue time, before chunking.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::compress::compress_body;
use crate::error::{FramewireError, Result};
use crate::properties::Properties;
use crate::protocol::{flags, FrameKind, Header};

/// Default weight of the urgent lane: urgent turns per normal turn.
pub const DEFAULT_URGENT_WEIGHT: u32 = 3;

/// Default capacity of the enqueue channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub(crate) struct WriterConfig {
    /// Maximum payload bytes per frame.
    pub max_frame_payload: usize,
    /// Urgent-lane turns per normal-lane turn.
    pub urgent_weight: u32,
    /// Enqueue channel capacity.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: crate::protocol::DEFAULT_MAX_FRAME_PAYLOAD,
            urgent_weight: DEFAULT_URGENT_WEIGHT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A message prepared for transmission: encoded property block, (possibly
/// compressed) body, and a cursor over how much has been framed so far.
pub(crate) struct OutgoingMessage {
    number: u32,
    kind: FrameKind,
    compressed: bool,
    urgent: bool,
    no_reply: bool,
    props_block: Vec<u8>,
    body: Bytes,
    offset: usize,
    first_sent: bool,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl OutgoingMessage {
    /// Encode a message for transmission.
    ///
    /// Compresses the body (whole-body, before chunking) when requested and
    /// encodes the property block. Fails with
    /// [`FramewireError::BadData`] if the property block cannot fit in the
    /// first frame or exceeds the configured maximum.
    pub(crate) fn encode(
        number: u32,
        kind: FrameKind,
        properties: &Properties,
        body: Vec<u8>,
        compressed: bool,
        urgent: bool,
        no_reply: bool,
        max_frame_payload: usize,
        max_properties_size: usize,
    ) -> Result<Self> {
        let props_block = if properties.is_empty() {
            Vec::new()
        } else {
            properties.encode()
        };
        if props_block.len() > max_properties_size {
            return Err(FramewireError::BadData(format!(
                "property block of {} bytes exceeds maximum {}",
                props_block.len(),
                max_properties_size
            )));
        }
        if props_block.len() > max_frame_payload {
            return Err(FramewireError::BadData(format!(
                "property block of {} bytes does not fit in one frame of {}",
                props_block.len(),
                max_frame_payload
            )));
        }

        let body = if compressed {
            Bytes::from(compress_body(&body)?)
        } else {
            Bytes::from(body)
        };

        Ok(Self {
            number,
            kind,
            compressed,
            urgent,
            no_reply,
            props_block,
            body,
            offset: 0,
            first_sent: false,
            done: None,
        })
    }

    /// Attach a completion signal, fired with `Ok` once the final frame is
    /// written or `Err(Disconnected)` if the connection closes first.
    pub(crate) fn set_done(&mut self, tx: oneshot::Sender<Result<()>>) {
        self.done = Some(tx);
    }

    /// The message number.
    pub(crate) fn number(&self) -> u32 {
        self.number
    }

    /// Whether this message rides the urgent lane.
    pub(crate) fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Whether every byte has been framed.
    fn is_finished(&self) -> bool {
        self.first_sent && self.offset >= self.body.len()
    }

    /// Emit the next frame's bytes and advance the cursor.
    ///
    /// The property block rides the first frame; the remaining budget is
    /// filled with body bytes. `moreComing` is set on every frame but the
    /// last.
    fn next_frame(&mut self, max_frame_payload: usize) -> Vec<u8> {
        let props: &[u8] = if self.first_sent {
            &[]
        } else {
            &self.props_block
        };
        let budget = max_frame_payload - props.len();
        let chunk_len = (self.body.len() - self.offset).min(budget);
        let more = self.offset + chunk_len < self.body.len();

        let mut frame_flags = self.kind as u8;
        if self.compressed {
            frame_flags |= flags::COMPRESSED;
        }
        if self.urgent {
            frame_flags |= flags::URGENT;
        }
        if self.no_reply {
            frame_flags |= flags::NO_REPLY;
        }
        if more {
            frame_flags |= flags::MORE_COMING;
        }
        if !props.is_empty() {
            frame_flags |= flags::HAS_PROPERTIES;
        }

        let payload_len = props.len() + chunk_len;
        let header = Header::new(self.number, frame_flags, payload_len as u16);

        let mut bytes = Vec::with_capacity(crate::protocol::HEADER_SIZE + payload_len);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(props);
        bytes.extend_from_slice(&self.body[self.offset..self.offset + chunk_len]);

        self.offset += chunk_len;
        self.first_sent = true;
        bytes
    }

    /// Fire the completion signal, if any.
    fn complete(mut self, result: Result<()>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }
}

/// The two scheduling lanes with their weighted round-robin state.
pub(crate) struct Lanes {
    urgent: VecDeque<OutgoingMessage>,
    normal: VecDeque<OutgoingMessage>,
    urgent_run: u32,
    urgent_weight: u32,
}

impl Lanes {
    pub(crate) fn new(urgent_weight: u32) -> Self {
        Self {
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            urgent_run: 0,
            urgent_weight: urgent_weight.max(1),
        }
    }

    pub(crate) fn push(&mut self, msg: OutgoingMessage) {
        if msg.is_urgent() {
            self.urgent.push_back(msg);
        } else {
            self.normal.push_back(msg);
        }
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.urgent.is_empty() || !self.normal.is_empty()
    }

    /// Pick the next message to advance.
    ///
    /// The urgent lane wins `urgent_weight` consecutive turns while both
    /// lanes are occupied; then the normal lane gets one.
    pub(crate) fn next(&mut self) -> Option<OutgoingMessage> {
        let take_urgent = match (self.urgent.is_empty(), self.normal.is_empty()) {
            (true, true) => return None,
            (false, true) => true,
            (true, false) => false,
            (false, false) => self.urgent_run < self.urgent_weight,
        };
        if take_urgent {
            self.urgent_run = self.urgent_run.saturating_add(1);
            self.urgent.pop_front()
        } else {
            self.urgent_run = 0;
            self.normal.pop_front()
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = OutgoingMessage> + '_ {
        self.urgent.drain(..).chain(self.normal.drain(..))
    }
}

/// Handle for enqueueing messages onto the writer task.
///
/// Cheaply cloneable; shared by the connection and every reply context.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<OutgoingMessage>,
}

impl WriterHandle {
    /// Enqueue a message for transmission.
    ///
    /// Waits only for channel capacity; the actual write happens on the
    /// writer task. Fails with [`FramewireError::Disconnected`] once the
    /// writer has shut down.
    pub(crate) async fn enqueue(&self, msg: OutgoingMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| FramewireError::Disconnected)
    }
}

/// Spawn the writer task and return a handle for enqueueing messages.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, config));
    (WriterHandle { tx }, task)
}

/// Main writer loop: pulls messages off the channel into the lanes and
/// advances one message per turn until the channel closes or the stream
/// fails. On exit every unfinished message is failed with `Disconnected`.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutgoingMessage>,
    mut writer: W,
    config: WriterConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut lanes = Lanes::new(config.urgent_weight);
    let mut flushed = true;
    let mut channel_open = true;

    let result = loop {
        // Pick up everything already enqueued without blocking, so newly
        // arrived urgent messages take effect on the very next turn.
        while channel_open {
            match rx.try_recv() {
                Ok(msg) => lanes.push(msg),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => channel_open = false,
            }
        }

        if !lanes.has_work() {
            if !flushed {
                if let Err(e) = writer.flush().await {
                    break Err(e);
                }
                flushed = true;
            }
            if !channel_open {
                break Ok(());
            }
            match rx.recv().await {
                Some(msg) => lanes.push(msg),
                None => channel_open = false,
            }
            continue;
        }

        let mut msg = lanes.next().expect("lanes have work");
        let frame = msg.next_frame(config.max_frame_payload);
        if let Err(e) = writer.write_all(&frame).await {
            msg.complete(Err(FramewireError::Disconnected));
            break Err(e);
        }
        flushed = false;

        if msg.is_finished() {
            tracing::debug!(number = msg.number(), "message fully transmitted");
            msg.complete(Ok(()));
        } else {
            lanes.push(msg);
        }
    };

    for msg in lanes.drain() {
        msg.complete(Err(FramewireError::Disconnected));
    }
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        msg.complete(Err(FramewireError::Disconnected));
    }

    if let Err(e) = &result {
        tracing::warn!("writer loop ended with error: {}", e);
    }
    result.map_err(FramewireError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn msg(number: u32, urgent: bool, body: &[u8]) -> OutgoingMessage {
        OutgoingMessage::encode(
            number,
            FrameKind::Msg,
            &Properties::new(),
            body.to_vec(),
            false,
            urgent,
            false,
            16,
            16,
        )
        .unwrap()
    }

    #[test]
    fn test_chunking_sets_more_coming() {
        let mut m = msg(1, false, &[0xAB; 40]);
        let max = 16;

        let mut frames = Vec::new();
        while !m.is_finished() {
            frames.push(m.next_frame(max));
        }
        assert_eq!(frames.len(), 3); // 16 + 16 + 8

        for (i, bytes) in frames.iter().enumerate() {
            let header = Header::decode(bytes).unwrap();
            assert_eq!(header.number, 1);
            assert_eq!(header.more_coming(), i < frames.len() - 1);
        }
    }

    #[test]
    fn test_properties_only_on_first_frame() {
        let mut props = Properties::new();
        props.set("Profile", "x");
        let mut m = OutgoingMessage::encode(
            2,
            FrameKind::Msg,
            &props,
            vec![1; 100],
            false,
            false,
            false,
            64,
            64,
        )
        .unwrap();

        let first = m.next_frame(64);
        let header = Header::decode(&first).unwrap();
        assert!(header.has_properties());

        while !m.is_finished() {
            let frame = m.next_frame(64);
            let header = Header::decode(&frame).unwrap();
            assert!(!header.has_properties());
        }
    }

    #[test]
    fn test_empty_message_is_one_frame() {
        let mut m = msg(3, false, b"");
        assert!(!m.is_finished());

        let frame = m.next_frame(16);
        let header = Header::decode(&frame).unwrap();
        assert!(!header.more_coming());
        assert_eq!(header.payload_len, 0);
        assert!(m.is_finished());
    }

    #[test]
    fn test_oversized_properties_rejected() {
        let mut props = Properties::new();
        props.set("key", "v".repeat(100));

        let result = OutgoingMessage::encode(
            1,
            FrameKind::Msg,
            &props,
            Vec::new(),
            false,
            false,
            false,
            64,
            4096,
        );
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_lanes_weighted_round_robin() {
        let mut lanes = Lanes::new(3);
        // Bodies long enough that nothing finishes during this test.
        for n in 1..=2 {
            lanes.push(msg(n, true, &[0; 1000]));
        }
        for n in 10..=11 {
            lanes.push(msg(n, false, &[0; 1000]));
        }

        let mut order = Vec::new();
        for _ in 0..12 {
            let mut m = lanes.next().unwrap();
            let _ = m.next_frame(16);
            order.push((m.number(), m.is_urgent()));
            lanes.push(m);
        }

        // Urgent gets 3 turns per normal turn: U U U N repeating.
        let urgency: Vec<bool> = order.iter().map(|(_, u)| *u).collect();
        assert_eq!(
            urgency,
            vec![
                true, true, true, false, true, true, true, false, true, true, true, false
            ]
        );

        // Within each lane, round-robin in enqueue order.
        let urgent_numbers: Vec<u32> = order
            .iter()
            .filter(|(_, u)| *u)
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(urgent_numbers[..4], [1, 2, 1, 2]);

        let normal_numbers: Vec<u32> = order
            .iter()
            .filter(|(_, u)| !*u)
            .map(|(n, _)| *n)
            .collect();
        assert_eq!(normal_numbers[..2], [10, 11]);
    }

    #[test]
    fn test_lanes_single_lane_round_robin() {
        let mut lanes = Lanes::new(3);
        for n in 1..=3 {
            lanes.push(msg(n, false, &[0; 1000]));
        }

        let mut order = Vec::new();
        for _ in 0..6 {
            let mut m = lanes.next().unwrap();
            let _ = m.next_frame(16);
            order.push(m.number());
            lanes.push(m);
        }
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_lanes_empty() {
        let mut lanes = Lanes::new(3);
        assert!(!lanes.has_work());
        assert!(lanes.next().is_none());
    }

    #[tokio::test]
    async fn test_writer_task_interleaves_messages() {
        let (client, mut server) = duplex(64 * 1024);
        let config = WriterConfig {
            max_frame_payload: 16,
            urgent_weight: 3,
            channel_capacity: 8,
        };
        let (handle, task) = spawn_writer_task(client, config);

        let (done_tx, done_rx) = oneshot::channel();
        let mut m1 = msg(1, false, &[1; 100]);
        m1.set_done(done_tx);
        handle.enqueue(m1).await.unwrap();
        handle.enqueue(msg(2, false, &[2; 100])).await.unwrap();

        // Wait for the first message to be fully written.
        done_rx.await.unwrap().unwrap();

        let mut buf = vec![0u8; 16 * 1024];
        let mut collected = Vec::new();
        let mut frame_buffer = FrameBuffer::with_max_payload(16);
        // Both messages total 14 frames; read until all are in.
        while collected.len() < 14 {
            let n = server.read(&mut buf).await.unwrap();
            collected.extend(frame_buffer.push(&buf[..n]).unwrap());
        }

        // Frames of the two messages alternate: 1, 2, 1, 2, ...
        let numbers: Vec<u32> = collected.iter().map(|f| f.number()).collect();
        assert_eq!(numbers[..4], [1, 2, 1, 2]);

        // Per-message frame order is preserved and reassembles byte-identical.
        let m1_bytes: Vec<u8> = collected
            .iter()
            .filter(|f| f.number() == 1)
            .flat_map(|f| f.payload.to_vec())
            .collect();
        assert_eq!(m1_bytes, vec![1; 100]);

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_queued_messages_fail_on_stream_close() {
        let (client, server) = duplex(64);
        let config = WriterConfig {
            max_frame_payload: 16,
            urgent_weight: 3,
            channel_capacity: 8,
        };
        let (handle, task) = spawn_writer_task(client, config);

        // Closing the read side makes writes fail once the tiny buffer fills.
        drop(server);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (done_tx, done_rx) = oneshot::channel();
        let mut m = msg(1, false, &[0; 10_000]);
        m.set_done(done_tx);
        handle.enqueue(m).await.unwrap();

        let result = done_rx.await.unwrap();
        assert!(matches!(result, Err(FramewireError::Disconnected)));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);
        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
