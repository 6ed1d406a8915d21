// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::TransferError;
use crate::rate_limit::RateLimiter;

use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;

use tracing::{event, Level};

pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const PEER_ID_LEN: usize = 20;

const LENGTH_PREFIX: usize = 4;
/// Framing around a PIECE payload: length, id, index, begin.
pub const PIECE_FRAME_OVERHEAD: u32 = 13;

pub struct MessageSummary<'a>(pub &'a Message);
impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Bitfield(bitfield) => {
                write!(f, "BITFIELD(len: {})", bitfield.len())
            }
            Message::Piece(index, begin, data) => {
                write!(
                    f,
                    "PIECE(index: {}, begin: {}, len: {})",
                    index,
                    begin,
                    data.len()
                )
            }
            Message::Extended(id, payload) => {
                write!(f, "EXTENDED(id: {}, len: {})", id, payload.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Every post-handshake wire message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
    Extended(u8, Vec<u8>),
}

#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

fn violation(msg: impl Into<String>) -> TransferError {
    TransferError::ProtocolViolation(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub content_id: Vec<u8>,
    pub peer_id: Vec<u8>,
}

impl Handshake {
    pub fn new(content_id: Vec<u8>, peer_id: Vec<u8>) -> Self {
        Self {
            reserved: [0u8; 8],
            content_id,
            peer_id,
        }
    }

    /// pstrlen + pstr + reserved + content id + peer id.
    pub fn wire_len(content_id_len: usize) -> usize {
        1 + PROTOCOL_STRING.len() + 8 + content_id_len + PEER_ID_LEN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut handshake = Vec::with_capacity(Self::wire_len(self.content_id.len()));
        handshake.push(PROTOCOL_STRING.len() as u8);
        handshake.extend_from_slice(PROTOCOL_STRING);
        handshake.extend_from_slice(&self.reserved);
        handshake.extend_from_slice(&self.content_id);
        handshake.extend_from_slice(&self.peer_id);
        handshake
    }

    /// Parses a remote handshake and checks it against our content id.
    pub fn parse(buffer: &[u8], expected_content_id: &[u8]) -> Result<Self, TransferError> {
        let id_len = expected_content_id.len();
        if buffer.len() != Self::wire_len(id_len) {
            return Err(TransferError::HandshakeRejected(format!(
                "handshake is {} bytes, expected {}",
                buffer.len(),
                Self::wire_len(id_len)
            )));
        }
        if buffer[0] as usize != PROTOCOL_STRING.len() || &buffer[1..20] != PROTOCOL_STRING {
            return Err(TransferError::HandshakeRejected(
                "unsupported protocol identifier".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buffer[20..28]);
        let content_id = buffer[28..28 + id_len].to_vec();
        if content_id != expected_content_id {
            return Err(TransferError::HandshakeRejected(format!(
                "content id mismatch (peer sent {})",
                hex::encode(&content_id)
            )));
        }
        let peer_id = buffer[28 + id_len..].to_vec();

        Ok(Self {
            reserved,
            content_id,
            peer_id,
        })
    }
}

pub fn generate_message(message: &Message) -> Result<Vec<u8>, TransferError> {
    fn frame(id: u8, payload_len: usize) -> Result<Vec<u8>, TransferError> {
        let message_len: u32 = (1 + payload_len)
            .try_into()
            .map_err(|_| violation("payload too large"))?;
        let mut bytes = Vec::with_capacity(LENGTH_PREFIX + 1 + payload_len);
        bytes.extend(message_len.to_be_bytes());
        bytes.push(id);
        Ok(bytes)
    }

    let bytes = match message {
        Message::KeepAlive => vec![0, 0, 0, 0],
        Message::Choke => frame(0, 0)?,
        Message::Unchoke => frame(1, 0)?,
        Message::Interested => frame(2, 0)?,
        Message::NotInterested => frame(3, 0)?,
        Message::Have(index) => {
            let mut bytes = frame(4, 4)?;
            bytes.extend(index.to_be_bytes());
            bytes
        }
        Message::Bitfield(bitfield) => {
            let mut bytes = frame(5, bitfield.len())?;
            bytes.extend_from_slice(bitfield);
            bytes
        }
        Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
            let id = if matches!(message, Message::Request(..)) {
                6
            } else {
                8
            };
            let mut bytes = frame(id, 12)?;
            bytes.extend(index.to_be_bytes());
            bytes.extend(begin.to_be_bytes());
            bytes.extend(length.to_be_bytes());
            bytes
        }
        Message::Piece(index, begin, block) => {
            let mut bytes = frame(7, 8 + block.len())?;
            bytes.extend(index.to_be_bytes());
            bytes.extend(begin.to_be_bytes());
            bytes.extend_from_slice(block);
            bytes
        }
        Message::Port(port) => {
            let mut bytes = frame(9, 2)?;
            bytes.extend(port.to_be_bytes());
            bytes
        }
        Message::Extended(extended_id, payload) => {
            let mut bytes = frame(20, 1 + payload.len())?;
            bytes.push(*extended_id);
            bytes.extend_from_slice(payload);
            bytes
        }
    };
    Ok(bytes)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_payload(id: u8, payload: &[u8]) -> Result<Message, TransferError> {
    let expect_len = |expected: usize, name: &str| {
        if payload.len() == expected {
            Ok(())
        } else {
            Err(violation(format!(
                "{} payload is {} bytes, expected {}",
                name,
                payload.len(),
                expected
            )))
        }
    };

    match id {
        0 => expect_len(0, "choke").map(|_| Message::Choke),
        1 => expect_len(0, "unchoke").map(|_| Message::Unchoke),
        2 => expect_len(0, "interested").map(|_| Message::Interested),
        3 => expect_len(0, "not interested").map(|_| Message::NotInterested),
        4 => {
            expect_len(4, "have")?;
            Ok(Message::Have(be_u32(payload)))
        }
        5 => Ok(Message::Bitfield(payload.to_vec())),
        6 | 8 => {
            expect_len(12, if id == 6 { "request" } else { "cancel" })?;
            let (index, begin, length) = (
                be_u32(&payload[0..4]),
                be_u32(&payload[4..8]),
                be_u32(&payload[8..12]),
            );
            if id == 6 {
                Ok(Message::Request(index, begin, length))
            } else {
                Ok(Message::Cancel(index, begin, length))
            }
        }
        7 => {
            if payload.len() < 8 {
                return Err(violation("piece payload shorter than its header"));
            }
            Ok(Message::Piece(
                be_u32(&payload[0..4]),
                be_u32(&payload[4..8]),
                payload[8..].to_vec(),
            ))
        }
        9 => {
            expect_len(2, "port")?;
            Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
        }
        20 => {
            if payload.is_empty() {
                return Err(violation("extended message without an id"));
            }
            Ok(Message::Extended(payload[0], payload[1..].to_vec()))
        }
        other => Err(violation(format!("unknown message id {}", other))),
    }
}

/// Accumulates raw socket reads and yields a message only once its declared
/// length is fully buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_message_length: u32,
}

impl FrameDecoder {
    pub fn new(max_message_length: u32) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_length,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, TransferError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let message_len = be_u32(&self.buffer[..LENGTH_PREFIX]);
        if message_len > self.max_message_length {
            return Err(violation(format!(
                "declared message length {} exceeds limit {}",
                message_len, self.max_message_length
            )));
        }

        let frame_len = LENGTH_PREFIX + message_len as usize;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let message = if message_len == 0 {
            Message::KeepAlive
        } else {
            parse_payload(self.buffer[LENGTH_PREFIX], &self.buffer[LENGTH_PREFIX + 1..frame_len])?
        };
        self.buffer.drain(..frame_len);
        Ok(Some(message))
    }
}

/// Expands a wire bitfield (MSB first) into one flag per piece. Trailing
/// spare bits must be zero.
pub fn bitfield_to_pieces(bitfield: &[u8], piece_count: u32) -> Result<Vec<bool>, TransferError> {
    let expected_len = (piece_count as usize).div_ceil(8);
    if bitfield.len() != expected_len {
        return Err(violation(format!(
            "bitfield is {} bytes, expected {}",
            bitfield.len(),
            expected_len
        )));
    }

    let mut pieces = Vec::with_capacity(piece_count as usize);
    for index in 0..expected_len * 8 {
        let set = bitfield[index / 8] & (0x80 >> (index % 8)) != 0;
        if index < piece_count as usize {
            pieces.push(set);
        } else if set {
            return Err(violation("bitfield has spare bits set"));
        }
    }
    Ok(pieces)
}

/// Raises the configured frame limit until a full block and a full bitfield
/// for this content both fit.
pub fn frame_limit_for(configured: u32, block_size: u32, piece_count: u32) -> u32 {
    let piece_frame = block_size.saturating_add(PIECE_FRAME_OVERHEAD);
    let bitfield_frame = piece_count.div_ceil(8).saturating_add(1);
    configured.max(piece_frame).max(bitfield_frame)
}

pub fn pieces_to_bitfield(pieces: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; pieces.len().div_ceil(8)];
    for (index, have) in pieces.iter().enumerate() {
        if *have {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
    }
    bitfield
}

/// Drains the session's outgoing queue onto the socket. Block payloads are
/// paced through the shared upload limiter.
pub async fn writer_task<W>(
    mut stream_write_half: W,
    mut write_rx: Receiver<Message>,
    error_tx: oneshot::Sender<TransferError>,
    upload_limiter: Arc<RateLimiter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            Some(message) = write_rx.recv() => {
                if let Message::Piece(_, _, data) = &message {
                    upload_limiter.acquire(data.len()).await;
                }

                let message_bytes = match generate_message(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        event!(Level::ERROR, error = %e, "Failed to encode outgoing message");
                        let _ = error_tx.send(e);
                        break;
                    }
                };

                tokio::select! {
                    write_result = stream_write_half.write_all(&message_bytes) => {
                        if let Err(e) = write_result {
                            let _ = error_tx.send(e.into());
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        event!(Level::TRACE, "Writer task shutting down during write.");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                event!(Level::TRACE, "Writer task shutting down while idle.");
                break;
            }

            else => {
                event!(Level::TRACE, "Writer task shutting down, channel closed.");
                break;
            }
        }
    }
    let _ = stream_write_half.shutdown().await;
}
