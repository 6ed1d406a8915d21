// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::protocol::{
    bitfield_to_pieces, writer_task, BlockInfo, FrameDecoder, Handshake, Message, MessageSummary,
    PIECE_FRAME_OVERHEAD,
};

use crate::command::{PeerCommand, ReturnReason, TransferCommand};
use crate::config::Settings;
use crate::errors::TransferError;
use crate::rate_limit::RateLimiter;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Duration, Instant, MissedTickBehavior};

use strum_macros::Display;
use tracing::{event, instrument, Level};

const READ_BUFFER_SIZE: usize = 32 * 1024;
const WRITER_QUEUE: usize = 100;

struct DisconnectGuard {
    peer: SocketAddr,
    manager_tx: Sender<TransferCommand>,
    error: Option<TransferError>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let command = TransferCommand::SessionClosed {
            peer: self.peer,
            error: self.error.take(),
        };
        if let Err(TrySendError::Full(command)) = self.manager_tx.try_send(command) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let manager_tx = self.manager_tx.clone();
                runtime.spawn(async move {
                    let _ = manager_tx.send(command).await;
                });
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Outgoing,
    Incoming,
}

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Choked,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub handshake: Duration,
    pub request: Duration,
    pub idle: Duration,
    pub keep_alive: Duration,
}

impl SessionTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            handshake: settings.handshake_timeout(),
            request: settings.request_timeout(),
            idle: settings.idle_timeout(),
            keep_alive: settings.keep_alive_interval(),
        }
    }
}

pub struct PeerSessionParameters {
    pub peer: SocketAddr,
    pub content_id: Vec<u8>,
    pub client_id: Vec<u8>,
    pub piece_count: u32,
    pub connection_type: ConnectionType,
    pub commands_rx: Receiver<PeerCommand>,
    pub manager_tx: Sender<TransferCommand>,
    pub download_limiter: Arc<RateLimiter>,
    pub upload_limiter: Arc<RateLimiter>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub timeouts: SessionTimeouts,
    pub pipeline_depth: usize,
    pub max_message_length: u32,
}

pub struct PeerSession {
    peer: SocketAddr,
    content_id: Vec<u8>,
    client_id: Vec<u8>,
    piece_count: u32,
    connection_type: ConnectionType,
    state: SessionState,

    commands_rx: Receiver<PeerCommand>,
    manager_tx: Sender<TransferCommand>,

    writer_tx: Sender<Message>,
    writer_rx: Option<Receiver<Message>>,

    in_flight: BTreeMap<BlockInfo, Instant>,
    pipeline_depth: usize,
    max_message_length: u32,
    seen_first_message: bool,

    download_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    timeouts: SessionTimeouts,

    shutdown_tx: broadcast::Sender<()>,
}

impl PeerSession {
    pub fn new(params: PeerSessionParameters) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel::<Message>(WRITER_QUEUE);

        Self {
            peer: params.peer,
            content_id: params.content_id,
            client_id: params.client_id,
            piece_count: params.piece_count,
            connection_type: params.connection_type,
            state: SessionState::Connecting,
            commands_rx: params.commands_rx,
            manager_tx: params.manager_tx,
            writer_tx,
            writer_rx: Some(writer_rx),
            in_flight: BTreeMap::new(),
            pipeline_depth: params.pipeline_depth.max(1),
            max_message_length: params.max_message_length,
            seen_first_message: false,
            download_limiter: params.download_limiter,
            upload_limiter: params.upload_limiter,
            timeouts: params.timeouts,
            shutdown_tx: params.shutdown_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            event!(Level::DEBUG, peer = %self.peer, from = %self.state, to = %next, "Session state change");
            self.state = next;
        }
    }

    /// Drives the connection until it closes. The manager always receives
    /// exactly one `SessionClosed` for this peer, even if the task is aborted.
    #[instrument(skip(self, stream), fields(peer = %self.peer))]
    pub async fn run<S>(mut self, stream: S) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut guard = DisconnectGuard {
            peer: self.peer,
            manager_tx: self.manager_tx.clone(),
            error: None,
        };

        let result = self.drive(stream).await;
        self.set_state(SessionState::Closed);

        if let Err(e) = &result {
            event!(Level::DEBUG, error = %e, "Session closed with error");
            guard.error = Some(e.clone());
        }
        result
    }

    async fn drive<S>(&mut self, stream: S) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut stream_read_half, mut stream_write_half) = split(stream);

        self.set_state(SessionState::Handshaking);
        let remote = timeout(
            self.timeouts.handshake,
            self.exchange_handshakes(&mut stream_read_half, &mut stream_write_half),
        )
        .await
        .map_err(|_| TransferError::HandshakeRejected("handshake timed out".to_string()))??;

        let writer_rx = self
            .writer_rx
            .take()
            .ok_or_else(|| TransferError::Io("session writer already started".to_string()))?;
        let (error_tx, mut error_rx) = oneshot::channel();
        let writer_handle = tokio::spawn(writer_task(
            stream_write_half,
            writer_rx,
            error_tx,
            self.upload_limiter.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let _writer_abort_guard = AbortOnDrop(writer_handle);

        // Every peer starts out choking us.
        self.set_state(SessionState::Choked);
        self.notify(TransferCommand::SessionReady {
            peer: self.peer,
            peer_id: remote.peer_id,
        })
        .await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut decoder = FrameDecoder::new(self.max_message_length);
        let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

        let keep_alive_period = self.timeouts.keep_alive;
        let mut keep_alive_timer = interval_at(Instant::now() + keep_alive_period, keep_alive_period);
        keep_alive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let check_period = (self.timeouts.request / 4).max(Duration::from_millis(10));
        let mut request_check = interval(check_period);
        request_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let inactivity_timeout = tokio::time::sleep(self.timeouts.idle);
        tokio::pin!(inactivity_timeout);

        let result = 'session: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    event!(Level::DEBUG, "Session received shutdown signal.");
                    break 'session Ok(());
                }

                _ = &mut inactivity_timeout => {
                    event!(Level::DEBUG, "Peer timed out due to inactivity. Disconnecting.");
                    break 'session Err(TransferError::ConnectTimeout(self.peer));
                }

                _ = keep_alive_timer.tick() => {
                    if let Err(e) = self.send(Message::KeepAlive).await {
                        break 'session Err(e);
                    }
                    event!(Level::TRACE, "Sent periodic Keep-Alive.");
                }

                _ = request_check.tick() => {
                    if let Err(e) = self.expire_requests().await {
                        break 'session Err(e);
                    }
                }

                read_result = stream_read_half.read(&mut read_buffer) => {
                    let bytes_read = match read_result {
                        Ok(0) => {
                            event!(Level::DEBUG, "Peer closed the connection.");
                            break 'session Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => break 'session Err(e.into()),
                    };
                    inactivity_timeout.as_mut().reset(Instant::now() + self.timeouts.idle);
                    decoder.extend(&read_buffer[..bytes_read]);

                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => {
                                if let Err(e) = self.handle_message(message).await {
                                    break 'session Err(e);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => break 'session Err(e),
                        }
                    }
                }

                Some(command) = self.commands_rx.recv() => {
                    match self.handle_command(command).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => break 'session Ok(()),
                        Err(e) => break 'session Err(e),
                    }
                }

                writer_error = &mut error_rx => {
                    match writer_error {
                        Ok(err) => break 'session Err(err),
                        // Writer stopped without an error: shutdown.
                        Err(_) => break 'session Ok(()),
                    }
                }
            }
        };

        self.set_state(SessionState::Closing);
        result
    }

    async fn exchange_handshakes<R, W>(
        &self,
        read_half: &mut R,
        write_half: &mut W,
    ) -> Result<Handshake, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ours = Handshake::new(self.content_id.clone(), self.client_id.clone()).encode();
        let mut buffer = vec![0u8; Handshake::wire_len(self.content_id.len())];

        let closed = |e: std::io::Error| {
            TransferError::HandshakeRejected(format!("connection failed during handshake: {}", e))
        };

        // Incoming peers must prove they want our content before we answer.
        if self.connection_type == ConnectionType::Outgoing {
            write_half.write_all(&ours).await.map_err(closed)?;
            read_half.read_exact(&mut buffer).await.map_err(closed)?;
            Handshake::parse(&buffer, &self.content_id)
        } else {
            read_half.read_exact(&mut buffer).await.map_err(closed)?;
            let remote = Handshake::parse(&buffer, &self.content_id)?;
            write_half.write_all(&ours).await.map_err(closed)?;
            Ok(remote)
        }
    }

    async fn send(&self, message: Message) -> Result<(), TransferError> {
        self.writer_tx
            .send(message)
            .await
            .map_err(|_| TransferError::Io("peer writer is closed".to_string()))
    }

    async fn notify(&self, command: TransferCommand) -> Result<(), TransferError> {
        self.manager_tx
            .send(command)
            .await
            .map_err(|_| TransferError::TransferCancelled)
    }

    async fn expire_requests(&mut self) -> Result<(), TransferError> {
        let request_timeout = self.timeouts.request;
        let now = Instant::now();
        let expired: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= request_timeout)
            .map(|(block, _)| *block)
            .collect();
        if expired.is_empty() {
            return Ok(());
        }

        for block in &expired {
            self.in_flight.remove(block);
        }
        event!(Level::DEBUG, count = expired.len(), "Requests timed out");
        self.notify(TransferCommand::RequestsReturned {
            peer: self.peer,
            blocks: expired,
            reason: ReturnReason::TimedOut,
        })
        .await
    }

    fn check_piece_index(&self, piece_index: u32) -> Result<(), TransferError> {
        if piece_index < self.piece_count {
            Ok(())
        } else {
            Err(TransferError::ProtocolViolation(format!(
                "piece index {} out of range ({} pieces)",
                piece_index, self.piece_count
            )))
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), TransferError> {
        match &message {
            Message::KeepAlive => event!(Level::TRACE, "Peer sent keep-alive"),
            other => event!(Level::TRACE, message_summary = ?MessageSummary(other)),
        }

        let first_message = !self.seen_first_message && message != Message::KeepAlive;
        if first_message {
            self.seen_first_message = true;
        }

        match message {
            Message::KeepAlive | Message::Port(_) | Message::Extended(..) => Ok(()),
            Message::Choke => {
                self.set_state(SessionState::Choked);
                if !self.in_flight.is_empty() {
                    let blocks: Vec<BlockInfo> = std::mem::take(&mut self.in_flight)
                        .into_keys()
                        .collect();
                    self.notify(TransferCommand::RequestsReturned {
                        peer: self.peer,
                        blocks,
                        reason: ReturnReason::Choked,
                    })
                    .await?;
                }
                self.notify(TransferCommand::Choked(self.peer)).await
            }
            Message::Unchoke => {
                self.set_state(SessionState::Ready);
                self.notify(TransferCommand::Unchoked(self.peer)).await
            }
            Message::Interested => {
                self.notify(TransferCommand::PeerInterested(self.peer, true))
                    .await
            }
            Message::NotInterested => {
                self.notify(TransferCommand::PeerInterested(self.peer, false))
                    .await
            }
            Message::Have(piece_index) => {
                self.check_piece_index(piece_index)?;
                self.notify(TransferCommand::Have(self.peer, piece_index))
                    .await
            }
            Message::Bitfield(bitfield) => {
                if !first_message {
                    return Err(TransferError::ProtocolViolation(
                        "bitfield sent after other messages".to_string(),
                    ));
                }
                let pieces = bitfield_to_pieces(&bitfield, self.piece_count)?;
                self.notify(TransferCommand::PeerBitfield(self.peer, pieces))
                    .await
            }
            Message::Request(piece_index, offset, length) => {
                self.check_piece_index(piece_index)?;
                if length == 0 || length > self.max_message_length.saturating_sub(PIECE_FRAME_OVERHEAD) {
                    return Err(TransferError::ProtocolViolation(format!(
                        "request length {} is not allowed",
                        length
                    )));
                }
                self.notify(TransferCommand::UploadRequested(
                    self.peer,
                    BlockInfo::new(piece_index, offset, length),
                ))
                .await
            }
            Message::Cancel(piece_index, offset, length) => {
                self.notify(TransferCommand::UploadCancelled(
                    self.peer,
                    BlockInfo::new(piece_index, offset, length),
                ))
                .await
            }
            Message::Piece(piece_index, offset, data) => {
                self.check_piece_index(piece_index)?;
                let block = BlockInfo::new(piece_index, offset, data.len() as u32);
                if self.in_flight.remove(&block).is_none() {
                    // Late reply to a timed out or cancelled request.
                    event!(Level::DEBUG, ?block, "Dropping unsolicited block");
                    return Ok(());
                }

                self.download_limiter.acquire(data.len()).await;
                self.notify(TransferCommand::Block {
                    peer: self.peer,
                    piece_index,
                    offset,
                    data,
                })
                .await
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: PeerCommand,
    ) -> Result<ControlFlow<()>, TransferError> {
        event!(Level::TRACE, ?command);
        match command {
            PeerCommand::Request(blocks) => {
                let mut rejected = Vec::new();
                for block in blocks {
                    let accepted = self.state == SessionState::Ready
                        && self.in_flight.len() < self.pipeline_depth
                        && !self.in_flight.contains_key(&block);
                    if !accepted {
                        rejected.push(block);
                        continue;
                    }
                    self.in_flight.insert(block, Instant::now());
                    self.send(Message::Request(block.piece_index, block.offset, block.length))
                        .await?;
                }
                if !rejected.is_empty() {
                    self.notify(TransferCommand::RequestsReturned {
                        peer: self.peer,
                        blocks: rejected,
                        reason: ReturnReason::Rejected,
                    })
                    .await?;
                }
            }
            PeerCommand::Cancel(block) => {
                if self.in_flight.remove(&block).is_some() {
                    self.send(Message::Cancel(block.piece_index, block.offset, block.length))
                        .await?;
                }
            }
            PeerCommand::Bitfield(bitfield) => self.send(Message::Bitfield(bitfield)).await?,
            PeerCommand::Have(piece_index) => self.send(Message::Have(piece_index)).await?,
            PeerCommand::Upload(block, data) => {
                let bytes = data.len() as u64;
                self.send(Message::Piece(block.piece_index, block.offset, data))
                    .await?;
                self.notify(TransferCommand::BlockSent {
                    peer: self.peer,
                    bytes,
                })
                .await?;
            }
            PeerCommand::Unchoke => self.send(Message::Unchoke).await?,
            PeerCommand::Interested => self.send(Message::Interested).await?,
            PeerCommand::NotInterested => self.send(Message::NotInterested).await?,
            PeerCommand::Disconnect => {
                event!(Level::DEBUG, "Manager requested disconnect");
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::protocol::generate_message;
    use tokio::io::{duplex, DuplexStream};

    const CONTENT_ID: [u8; 20] = [7u8; 20];
    const REMOTE_ID: &[u8; 20] = b"-MK0001-remotepeer01";
    const WAIT: Duration = Duration::from_secs(2);

    struct MockPeer {
        network: DuplexStream,
        decoder: FrameDecoder,
        commands_tx: Sender<PeerCommand>,
        events_rx: Receiver<TransferCommand>,
        shutdown_tx: broadcast::Sender<()>,
        session: JoinHandle<Result<(), TransferError>>,
    }

    fn test_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_secs(2),
            request: Duration::from_secs(30),
            idle: Duration::from_secs(120),
            keep_alive: Duration::from_secs(60),
        }
    }

    fn spawn_session(timeouts: SessionTimeouts, pipeline_depth: usize) -> MockPeer {
        let (client_socket, network) = duplex(256 * 1024);
        let (manager_tx, events_rx) = mpsc::channel(100);
        let (commands_tx, commands_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = broadcast::channel(1);

        let params = PeerSessionParameters {
            peer: "127.0.0.1:6881".parse().unwrap(),
            content_id: CONTENT_ID.to_vec(),
            client_id: b"-SG0100-TESTTESTTEST".to_vec(),
            piece_count: 4,
            connection_type: ConnectionType::Outgoing,
            commands_rx,
            manager_tx,
            download_limiter: Arc::new(RateLimiter::unlimited()),
            upload_limiter: Arc::new(RateLimiter::unlimited()),
            shutdown_tx: shutdown_tx.clone(),
            timeouts,
            pipeline_depth,
            max_message_length: 1 << 17,
        };

        let session = tokio::spawn(PeerSession::new(params).run(client_socket));
        MockPeer {
            network,
            decoder: FrameDecoder::new(1 << 20),
            commands_tx,
            events_rx,
            shutdown_tx,
            session,
        }
    }

    impl MockPeer {
        async fn answer_handshake(&mut self, content_id: &[u8]) {
            let mut theirs = vec![0u8; Handshake::wire_len(CONTENT_ID.len())];
            timeout(WAIT, self.network.read_exact(&mut theirs))
                .await
                .unwrap()
                .unwrap();
            let parsed = Handshake::parse(&theirs, &CONTENT_ID).unwrap();
            assert_eq!(parsed.peer_id, b"-SG0100-TESTTESTTEST".to_vec());

            let ours = Handshake::new(content_id.to_vec(), REMOTE_ID.to_vec()).encode();
            self.network.write_all(&ours).await.unwrap();
        }

        async fn connect(&mut self) {
            self.answer_handshake(&CONTENT_ID).await;
            match self.next_event().await {
                TransferCommand::SessionReady { peer_id, .. } => {
                    assert_eq!(peer_id, REMOTE_ID.to_vec())
                }
                other => panic!("expected SessionReady, got {:?}", other),
            }
        }

        async fn unchoke(&mut self) {
            self.send(Message::Unchoke).await;
            assert!(matches!(
                self.next_event().await,
                TransferCommand::Unchoked(_)
            ));
        }

        async fn send(&mut self, message: Message) {
            let bytes = generate_message(&message).unwrap();
            self.network.write_all(&bytes).await.unwrap();
        }

        async fn next_message(&mut self) -> Message {
            let mut buffer = vec![0u8; 4096];
            loop {
                if let Some(message) = self.decoder.next_message().unwrap() {
                    return message;
                }
                let n = timeout(WAIT, self.network.read(&mut buffer))
                    .await
                    .expect("session went quiet")
                    .unwrap();
                assert!(n > 0, "session closed the connection");
                self.decoder.extend(&buffer[..n]);
            }
        }

        async fn next_event(&mut self) -> TransferCommand {
            timeout(WAIT, self.events_rx.recv())
                .await
                .expect("no event from session")
                .expect("event channel closed")
        }

        async fn finish(self) -> Result<(), TransferError> {
            timeout(WAIT, self.session).await.unwrap().unwrap()
        }
    }

    fn block(piece_index: u32, offset: u32) -> BlockInfo {
        BlockInfo::new(piece_index, offset, 16_384)
    }

    #[tokio::test]
    async fn test_pipeline_depth_is_respected() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;
        peer.unchoke().await;

        let blocks: Vec<BlockInfo> = (0..5).map(|i| block(0, i * 16_384)).collect();
        peer.commands_tx
            .send(PeerCommand::Request(blocks.clone()))
            .await
            .unwrap();
        for expected in &blocks {
            assert_eq!(
                peer.next_message().await,
                Message::Request(expected.piece_index, expected.offset, expected.length)
            );
        }

        // A sixth request is handed straight back.
        peer.commands_tx
            .send(PeerCommand::Request(vec![block(1, 0)]))
            .await
            .unwrap();
        match peer.next_event().await {
            TransferCommand::RequestsReturned { blocks, reason, .. } => {
                assert_eq!(reason, ReturnReason::Rejected);
                assert_eq!(blocks, vec![block(1, 0)]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Answering one frees a slot.
        peer.send(Message::Piece(0, 0, vec![0xAA; 16_384])).await;
        match peer.next_event().await {
            TransferCommand::Block {
                piece_index,
                offset,
                data,
                ..
            } => {
                assert_eq!((piece_index, offset), (0, 0));
                assert_eq!(data.len(), 16_384);
            }
            other => panic!("unexpected event {:?}", other),
        }
        peer.commands_tx
            .send(PeerCommand::Request(vec![block(1, 0)]))
            .await
            .unwrap();
        assert_eq!(peer.next_message().await, Message::Request(1, 0, 16_384));
    }

    #[tokio::test]
    async fn test_requests_while_choked_are_returned() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.commands_tx
            .send(PeerCommand::Request(vec![block(2, 0)]))
            .await
            .unwrap();
        match peer.next_event().await {
            TransferCommand::RequestsReturned { blocks, reason, .. } => {
                assert_eq!(reason, ReturnReason::Rejected);
                assert_eq!(blocks, vec![block(2, 0)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_choke_returns_in_flight_blocks() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;
        peer.unchoke().await;

        let blocks = vec![block(0, 0), block(0, 16_384), block(3, 0)];
        peer.commands_tx
            .send(PeerCommand::Request(blocks.clone()))
            .await
            .unwrap();
        for _ in 0..3 {
            assert!(matches!(peer.next_message().await, Message::Request(..)));
        }

        peer.send(Message::Choke).await;
        match peer.next_event().await {
            TransferCommand::RequestsReturned {
                blocks: returned,
                reason,
                ..
            } => {
                assert_eq!(reason, ReturnReason::Choked);
                let mut expected = blocks.clone();
                expected.sort();
                assert_eq!(returned, expected);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(peer.next_event().await, TransferCommand::Choked(_)));
    }

    #[tokio::test]
    async fn test_timed_out_request_is_returned_once() {
        let timeouts = SessionTimeouts {
            request: Duration::from_millis(150),
            ..test_timeouts()
        };
        let mut peer = spawn_session(timeouts, 5);
        peer.connect().await;
        peer.unchoke().await;

        peer.commands_tx
            .send(PeerCommand::Request(vec![block(1, 0)]))
            .await
            .unwrap();
        assert_eq!(peer.next_message().await, Message::Request(1, 0, 16_384));

        match peer.next_event().await {
            TransferCommand::RequestsReturned { blocks, reason, .. } => {
                assert_eq!(reason, ReturnReason::TimedOut);
                assert_eq!(blocks, vec![block(1, 0)]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // The late reply is dropped and nothing else times out.
        tokio::time::sleep(Duration::from_millis(400)).await;
        peer.send(Message::Piece(1, 0, vec![1; 16_384])).await;
        peer.send(Message::Have(2)).await;
        match peer.next_event().await {
            TransferCommand::Have(_, 2) => {}
            other => panic!("expected only the HAVE marker, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_content_id_mismatch_is_rejected() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.answer_handshake(&[9u8; 20]).await;

        match peer.next_event().await {
            TransferCommand::SessionClosed { error, .. } => {
                assert!(matches!(error, Some(TransferError::HandshakeRejected(_))))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            peer.finish().await,
            Err(TransferError::HandshakeRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_a_protocol_violation() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.network
            .write_all(&(1u32 << 24).to_be_bytes())
            .await
            .unwrap();
        match peer.next_event().await {
            TransferCommand::SessionClosed { error, .. } => {
                assert!(matches!(error, Some(TransferError::ProtocolViolation(_))))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_have_is_a_protocol_violation() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.send(Message::Have(99)).await;
        assert!(matches!(
            peer.finish().await,
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_bitfield_is_forwarded() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.send(Message::Bitfield(vec![0b1010_0000])).await;
        match peer.next_event().await {
            TransferCommand::PeerBitfield(_, pieces) => {
                assert_eq!(pieces, vec![true, false, true, false])
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_request_is_served() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.send(Message::Interested).await;
        assert!(matches!(
            peer.next_event().await,
            TransferCommand::PeerInterested(_, true)
        ));

        peer.send(Message::Request(0, 0, 16_384)).await;
        let requested = match peer.next_event().await {
            TransferCommand::UploadRequested(_, block) => block,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(requested, block(0, 0));

        peer.commands_tx.send(PeerCommand::Unchoke).await.unwrap();
        peer.commands_tx
            .send(PeerCommand::Upload(requested, vec![5; 16_384]))
            .await
            .unwrap();
        assert_eq!(peer.next_message().await, Message::Unchoke);
        assert_eq!(
            peer.next_message().await,
            Message::Piece(0, 0, vec![5; 16_384])
        );
        assert!(matches!(
            peer.next_event().await,
            TransferCommand::BlockSent { bytes: 16_384, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_cleanly() {
        let mut peer = spawn_session(test_timeouts(), 5);
        peer.connect().await;

        peer.shutdown_tx.send(()).unwrap();
        match peer.next_event().await {
            TransferCommand::SessionClosed { error, .. } => assert!(error.is_none()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(peer.finish().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_fails_the_handshake() {
        let mut peer = spawn_session(
            SessionTimeouts {
                handshake: Duration::from_millis(500),
                ..test_timeouts()
            },
            5,
        );
        match peer.next_event().await {
            TransferCommand::SessionClosed { error, .. } => {
                assert!(matches!(error, Some(TransferError::HandshakeRejected(_))))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            peer.finish().await,
            Err(TransferError::HandshakeRejected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_is_sent_on_a_quiet_link() {
        let mut peer = spawn_session(
            SessionTimeouts {
                keep_alive: Duration::from_secs(1),
                ..test_timeouts()
            },
            5,
        );
        peer.connect().await;
        assert_eq!(peer.next_message().await, Message::KeepAlive);
        assert_eq!(peer.next_message().await, Message::KeepAlive);
        assert!(peer.events_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_is_closed_once_traffic_stops() {
        let mut peer = spawn_session(
            SessionTimeouts {
                idle: Duration::from_secs(1),
                ..test_timeouts()
            },
            5,
        );
        peer.connect().await;

        // Remote keep-alives hold the session open past the idle limit.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            peer.send(Message::KeepAlive).await;
        }
        assert!(peer.events_rx.try_recv().is_err());

        match peer.next_event().await {
            TransferCommand::SessionClosed { error, .. } => {
                assert!(matches!(error, Some(TransferError::ConnectTimeout(_))))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            peer.finish().await,
            Err(TransferError::ConnectTimeout(_))
        ));
    }
}
