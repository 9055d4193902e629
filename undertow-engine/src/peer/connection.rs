use std::{
    collections::{HashMap, HashSet},
    io,
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace};

use undertow_common::{InfoHash, PeerId};
use undertow_wire::{BlockInfo, Handshake, Message, PeerCodec};

use crate::{
    config::EngineConfig,
    error::PeerError,
    peer::{PeerCommand, PeerEvent, Pid, metrics::PeerMetrics},
};

/// Cadence of the housekeeping sweep (inactivity, keep-alives, request
/// deadlines).
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on a single requested block. Requests past this are a
/// protocol violation, mirroring the codec's frame cap.
const MAX_REQUEST_LEN: u32 = 1 << 17;

/// Per-connection timing knobs, copied out of the engine config so the
/// connection task does not drag the whole config along.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub request_strike_limit: u32,
    pub keepalive_interval: Duration,
    pub inactivity_timeout: Duration,
}

impl From<&EngineConfig> for ConnectionLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
            request_strike_limit: config.request_strike_limit,
            keepalive_interval: config.keepalive_interval,
            inactivity_timeout: config.inactivity_timeout,
        }
    }
}

/// Typestate connection: a raw stream handshakes into a ready peer,
/// which then runs the message loop until the link dies. The states
/// only ever move forward; closing is the task returning.
pub struct Peer<S> {
    state: S,
}

pub struct Handshaking<T> {
    stream: T,
    inbound: bool,
}

pub struct Ready<T> {
    framed: Framed<T, PeerCodec>,
    remote_id: PeerId,
}

impl<T> Peer<Handshaking<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: T, inbound: bool) -> Self {
        Self {
            state: Handshaking { stream, inbound },
        }
    }

    /// Swap 68-byte handshakes. The dialing side speaks first; an
    /// accepted peer is validated before we reveal anything. Both
    /// directions reject a malformed header or a foreign info-hash.
    pub async fn handshake(
        mut self,
        info_hash: InfoHash,
        local_id: PeerId,
    ) -> Result<Peer<Ready<T>>, PeerError> {
        let ours = Handshake::new(local_id, info_hash).to_bytes();
        let mut buf = [0u8; Handshake::HANDSHAKE_LEN];

        let stream = &mut self.state.stream;
        let remote_id = if self.state.inbound {
            stream.read_exact(&mut buf).await?;
            let theirs = validate_handshake(&buf, info_hash)?;
            stream.write_all(&ours).await?;
            theirs
        } else {
            stream.write_all(&ours).await?;
            stream.read_exact(&mut buf).await?;
            validate_handshake(&buf, info_hash)?
        };
        stream.flush().await?;

        Ok(Peer {
            state: Ready {
                framed: Framed::new(self.state.stream, PeerCodec::default()),
                remote_id,
            },
        })
    }
}

impl<T> Peer<Ready<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn remote_id(&self) -> PeerId {
        self.state.remote_id
    }

    /// The steady-state message loop: the framed socket, the command
    /// channel, and the housekeeping sweep, until one of them ends the
    /// connection.
    pub async fn run(
        self,
        pid: Pid,
        limits: &ConnectionLimits,
        metrics: &PeerMetrics,
        events: &mpsc::Sender<PeerEvent>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<(), PeerError> {
        let mut framed = self.state.framed;

        // our requests awaiting a piece, with the instant each was sent
        let mut pending: HashMap<BlockInfo, Instant> = HashMap::new();
        // blocks the remote asked for and has not cancelled
        let mut wanted_by_remote: HashSet<BlockInfo> = HashSet::new();
        let mut strikes = 0u32;
        let mut last_rx = Instant::now();
        let mut last_tx = Instant::now();

        let mut sweep = time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = framed.next() => {
                    let msg = match frame {
                        None => return Err(PeerError::Disconnected),
                        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                            return Err(PeerError::ProtocolViolation(e.to_string()));
                        }
                        Some(Err(e)) => return Err(PeerError::Transport(e)),
                        Some(Ok(msg)) => msg,
                    };
                    last_rx = Instant::now();
                    trace!(%pid, ?msg, "rx");

                    let event = match msg {
                        Message::KeepAlive => continue,
                        Message::Choke => {
                            // the remote will not answer anything outstanding
                            pending.clear();
                            PeerEvent::ChokeChanged { pid, choked: true }
                        }
                        Message::Unchoke => PeerEvent::ChokeChanged { pid, choked: false },
                        Message::Interested => {
                            PeerEvent::InterestChanged { pid, interested: true }
                        }
                        Message::NotInterested => {
                            PeerEvent::InterestChanged { pid, interested: false }
                        }
                        Message::Have { piece_index } => {
                            PeerEvent::HaveReceived { pid, piece: piece_index }
                        }
                        Message::Bitfield(raw) => PeerEvent::BitfieldReceived { pid, raw },
                        Message::Request(info) => {
                            if info.length == 0 || info.length > MAX_REQUEST_LEN {
                                return Err(PeerError::ProtocolViolation(format!(
                                    "request for {} bytes",
                                    info.length
                                )));
                            }
                            wanted_by_remote.insert(info);
                            PeerEvent::BlockRequested { pid, info }
                        }
                        Message::Piece(block) => {
                            metrics.add_downloaded(block.data.len() as u64);
                            // strikes only count consecutive unanswered requests
                            if pending.remove(&block.info()).is_some() {
                                strikes = 0;
                            }
                            PeerEvent::BlockReceived { pid, block }
                        }
                        Message::Cancel(info) => {
                            wanted_by_remote.remove(&info);
                            continue;
                        }
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    match cmd {
                        PeerCommand::Send(msg) => {
                            // choking withdraws every reply still owed to
                            // the remote
                            if matches!(msg, Message::Choke) {
                                wanted_by_remote.clear();
                            }
                            framed.send(msg).await?;
                            last_tx = Instant::now();
                        }
                        PeerCommand::Request(blocks) => {
                            for info in blocks {
                                pending.insert(info, Instant::now());
                                framed.send(Message::Request(info)).await?;
                            }
                            last_tx = Instant::now();
                        }
                        PeerCommand::Cancel(info) => {
                            if pending.remove(&info).is_some() {
                                framed.send(Message::Cancel(info)).await?;
                                last_tx = Instant::now();
                            }
                        }
                        PeerCommand::Serve(block) => {
                            // the remote may have cancelled while the data
                            // was being fetched
                            if wanted_by_remote.remove(&block.info()) {
                                metrics.add_uploaded(block.data.len() as u64);
                                framed.send(Message::Piece(block)).await?;
                                last_tx = Instant::now();
                            }
                        }
                        PeerCommand::Shutdown => {
                            let _ = framed.close().await;
                            return Ok(());
                        }
                    }
                }

                _ = sweep.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_rx) >= limits.inactivity_timeout {
                        return Err(PeerError::Timeout);
                    }
                    let expired: Vec<BlockInfo> = pending
                        .iter()
                        .filter(|(_, sent)| {
                            now.duration_since(**sent) >= limits.request_timeout
                        })
                        .map(|(info, _)| *info)
                        .collect();
                    for info in expired {
                        pending.remove(&info);
                        strikes += 1;
                        if events
                            .send(PeerEvent::RequestTimedOut { pid, info })
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    if strikes >= limits.request_strike_limit {
                        return Err(PeerError::Timeout);
                    }
                    if now.duration_since(last_tx) >= limits.keepalive_interval {
                        framed.send(Message::KeepAlive).await?;
                        last_tx = now;
                    }
                }
            }
        }
    }
}

/// Drive one peer connection through its whole life: handshake, then
/// the message loop. Always emits a final `Closed` event, carrying the
/// error that ended the connection if there was one.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(%pid, inbound))]
pub async fn drive<S>(
    pid: Pid,
    stream: S,
    inbound: bool,
    info_hash: InfoHash,
    local_id: PeerId,
    limits: ConnectionLimits,
    metrics: Arc<PeerMetrics>,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let result = async {
        let peer = time::timeout(
            limits.handshake_timeout,
            Peer::new(stream, inbound).handshake(info_hash, local_id),
        )
        .await
        .map_err(|_| PeerError::HandshakeFailed("timed out".into()))??;

        let remote_id = peer.remote_id();
        if events
            .send(PeerEvent::Connected { pid, remote_id })
            .await
            .is_err()
        {
            return Ok(());
        }
        debug!(%remote_id, "handshake complete");

        peer.run(pid, &limits, &metrics, &events, commands).await
    }
    .await;

    let _ = events
        .send(PeerEvent::Closed {
            pid,
            error: result.err(),
        })
        .await;
}

fn validate_handshake(buf: &[u8], info_hash: InfoHash) -> Result<PeerId, PeerError> {
    let theirs = Handshake::from_bytes(buf)
        .ok_or_else(|| PeerError::HandshakeFailed("malformed handshake".into()))?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::HandshakeFailed(format!(
            "info-hash mismatch: {}",
            theirs.info_hash
        )));
    }
    Ok(theirs.peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use undertow_wire::Block;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            handshake_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            request_strike_limit: 3,
            keepalive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120),
        }
    }

    struct Harness {
        remote: DuplexStream,
        events: mpsc::Receiver<PeerEvent>,
        commands: mpsc::UnboundedSender<PeerCommand>,
        metrics: Arc<PeerMetrics>,
    }

    fn spawn_connection(inbound: bool, limits: ConnectionLimits) -> Harness {
        let (local, remote) = tokio::io::duplex(256 * 1024);
        let (events_tx, events_rx) = mpsc::channel(32);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PeerMetrics::default());
        tokio::spawn(drive(
            Pid(1),
            local,
            inbound,
            InfoHash::new(INFO_HASH),
            PeerId::new([1u8; 20]),
            limits,
            metrics.clone(),
            events_tx,
            cmd_rx,
        ));
        Harness {
            remote,
            events: events_rx,
            commands: cmd_tx,
            metrics,
        }
    }

    /// Complete the handshake from the remote side of an outbound
    /// connection and swallow the `Connected` event.
    async fn complete_handshake(h: &mut Harness) {
        let mut buf = [0u8; Handshake::HANDSHAKE_LEN];
        h.remote.read_exact(&mut buf).await.unwrap();
        let ours = Handshake::from_bytes(&buf).unwrap();
        assert_eq!(ours.info_hash, InfoHash::new(INFO_HASH));

        let reply = Handshake::new(PeerId::new([2u8; 20]), InfoHash::new(INFO_HASH));
        h.remote.write_all(&reply.to_bytes()).await.unwrap();

        match h.events.recv().await.unwrap() {
            PeerEvent::Connected { pid, remote_id } => {
                assert_eq!(pid, Pid(1));
                assert_eq!(remote_id, PeerId::new([2u8; 20]));
            }
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_handshake_then_message_flow() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        // raw have frame: <len=0005><id=4><index=3>
        h.remote
            .write_all(&[0, 0, 0, 5, 4, 0, 0, 0, 3])
            .await
            .unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::HaveReceived { piece, .. } => assert_eq!(piece, 3),
            other => panic!("expected HaveReceived, got {other:?}"),
        }

        // a request command reaches the wire bit-exactly
        let info = BlockInfo {
            index: 2,
            begin: 16384,
            length: 16384,
        };
        h.commands.send(PeerCommand::Request(vec![info])).unwrap();
        let mut frame = [0u8; 17];
        h.remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(
            frame,
            [0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );

        // the matching piece resolves the request and counts bytes
        let data = vec![9u8; 16384];
        let mut piece = Vec::from([0u8, 0, 0x40, 9, 7, 0, 0, 0, 2, 0, 0, 0x40, 0]);
        piece.extend_from_slice(&data);
        h.remote.write_all(&piece).await.unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::BlockReceived { block, .. } => {
                assert_eq!(block.info(), info);
            }
            other => panic!("expected BlockReceived, got {other:?}"),
        }
        assert_eq!(h.metrics.downloaded(), 16384);

        // remote hangup surfaces as Disconnected
        drop(h.remote);
        match h.events.recv().await.unwrap() {
            PeerEvent::Closed {
                error: Some(PeerError::Disconnected),
                ..
            } => {}
            other => panic!("expected Closed(Disconnected), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_handshake_is_answered() {
        let mut h = spawn_connection(true, limits());

        let theirs = Handshake::new(PeerId::new([3u8; 20]), InfoHash::new(INFO_HASH));
        h.remote.write_all(&theirs.to_bytes()).await.unwrap();

        let mut buf = [0u8; Handshake::HANDSHAKE_LEN];
        h.remote.read_exact(&mut buf).await.unwrap();
        let ours = Handshake::from_bytes(&buf).unwrap();
        assert_eq!(ours.peer_id, PeerId::new([1u8; 20]));

        match h.events.recv().await.unwrap() {
            PeerEvent::Connected { remote_id, .. } => {
                assert_eq!(remote_id, PeerId::new([3u8; 20]));
            }
            other => panic!("expected Connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn info_hash_mismatch_closes_without_other_events() {
        let mut h = spawn_connection(false, limits());

        let mut buf = [0u8; Handshake::HANDSHAKE_LEN];
        h.remote.read_exact(&mut buf).await.unwrap();
        let reply = Handshake::new(PeerId::new([2u8; 20]), InfoHash::new([8u8; 20]));
        h.remote.write_all(&reply.to_bytes()).await.unwrap();

        match h.events.recv().await.unwrap() {
            PeerEvent::Closed {
                error: Some(PeerError::HandshakeFailed(_)),
                ..
            } => {}
            other => panic!("expected Closed(HandshakeFailed), got {other:?}"),
        }
        assert!(h.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_message_id_is_a_protocol_violation() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        h.remote.write_all(&[0, 0, 0, 1, 42]).await.unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::Closed {
                error: Some(PeerError::ProtocolViolation(_)),
                ..
            } => {}
            other => panic!("expected Closed(ProtocolViolation), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn serves_only_blocks_the_remote_requested() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        // remote asks for (0, 0, 11)
        h.remote
            .write_all(&[0, 0, 0, 13, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 11])
            .await
            .unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::BlockRequested { info, .. } => assert_eq!(info.length, 11),
            other => panic!("expected BlockRequested, got {other:?}"),
        }

        // an unsolicited serve is dropped; the requested one goes out
        h.commands
            .send(PeerCommand::Serve(Block {
                index: 5,
                begin: 0,
                data: Bytes::from_static(b"unrequested"),
            }))
            .unwrap();
        h.commands
            .send(PeerCommand::Serve(Block {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"hello world"),
            }))
            .unwrap();

        let mut frame = [0u8; 4 + 9 + 11];
        h.remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..5], &[0, 0, 0, 20, 7]);
        assert_eq!(&frame[13..], b"hello world");
        assert_eq!(h.metrics.uploaded(), 11);
    }

    #[tokio::test]
    async fn choke_discards_pending_upload_replies() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        // remote asks for (0, 0, 5)
        h.remote
            .write_all(&[0, 0, 0, 13, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5])
            .await
            .unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::BlockRequested { info, .. } => assert_eq!(info.length, 5),
            other => panic!("expected BlockRequested, got {other:?}"),
        }

        // we choke before the data was fetched; the serve that follows
        // must not reach the wire
        h.commands
            .send(PeerCommand::Send(Message::Choke))
            .unwrap();
        h.commands
            .send(PeerCommand::Serve(Block {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"stale"),
            }))
            .unwrap();
        h.commands
            .send(PeerCommand::Send(Message::Unchoke))
            .unwrap();

        // choke then unchoke back to back, no piece frame in between
        let mut frames = [0u8; 10];
        h.remote.read_exact(&mut frames).await.unwrap();
        assert_eq!(frames, [0, 0, 0, 1, 0, 0, 0, 0, 1, 1]);
        assert_eq!(h.metrics.uploaded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_requests_strike_out_the_peer() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        let blocks: Vec<BlockInfo> = (0..3)
            .map(|i| BlockInfo {
                index: i,
                begin: 0,
                length: 16384,
            })
            .collect();
        h.commands
            .send(PeerCommand::Request(blocks.clone()))
            .unwrap();

        let mut timed_out = Vec::new();
        loop {
            match h.events.recv().await.unwrap() {
                PeerEvent::RequestTimedOut { info, .. } => timed_out.push(info),
                PeerEvent::Closed {
                    error: Some(PeerError::Timeout),
                    ..
                } => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(timed_out.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_blocks_clear_timeout_strikes() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        // two requests expire unanswered: two strikes
        h.commands
            .send(PeerCommand::Request(
                (0..2)
                    .map(|i| BlockInfo {
                        index: i,
                        begin: 0,
                        length: 16384,
                    })
                    .collect(),
            ))
            .unwrap();
        for _ in 0..2 {
            match h.events.recv().await.unwrap() {
                PeerEvent::RequestTimedOut { .. } => {}
                other => panic!("expected RequestTimedOut, got {other:?}"),
            }
        }

        // a request that gets answered resets the count
        let info = BlockInfo {
            index: 2,
            begin: 0,
            length: 16384,
        };
        h.commands.send(PeerCommand::Request(vec![info])).unwrap();
        let mut frame = [0u8; 17];
        h.remote.read_exact(&mut frame).await.unwrap();
        let mut piece = Vec::from([0u8, 0, 0x40, 9, 7, 0, 0, 0, 2, 0, 0, 0, 0]);
        piece.extend_from_slice(&[3u8; 16384]);
        h.remote.write_all(&piece).await.unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::BlockReceived { .. } => {}
            other => panic!("expected BlockReceived, got {other:?}"),
        }

        // two more expiries would have been the third and fourth strike
        h.commands
            .send(PeerCommand::Request(
                (3..5)
                    .map(|i| BlockInfo {
                        index: i,
                        begin: 0,
                        length: 16384,
                    })
                    .collect(),
            ))
            .unwrap();
        for _ in 0..2 {
            match h.events.recv().await.unwrap() {
                PeerEvent::RequestTimedOut { .. } => {}
                other => panic!("expected RequestTimedOut, got {other:?}"),
            }
        }

        // still connected: a have from the remote flows through
        h.remote
            .write_all(&[0, 0, 0, 5, 4, 0, 0, 0, 1])
            .await
            .unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::HaveReceived { piece, .. } => assert_eq!(piece, 1),
            other => panic!("expected HaveReceived, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn choke_drops_pending_request_timers() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        h.commands
            .send(PeerCommand::Request(vec![BlockInfo {
                index: 0,
                begin: 0,
                length: 16384,
            }]))
            .unwrap();
        // wait for the request to hit the wire, then choke instead of
        // answering
        let mut frame = [0u8; 17];
        h.remote.read_exact(&mut frame).await.unwrap();
        h.remote.write_all(&[0, 0, 0, 1, 0]).await.unwrap();
        match h.events.recv().await.unwrap() {
            PeerEvent::ChokeChanged { choked: true, .. } => {}
            other => panic!("expected ChokeChanged, got {other:?}"),
        }

        // well past the request timeout: no RequestTimedOut may surface
        time::sleep(Duration::from_secs(90)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_link_gets_keepalives_then_times_out() {
        let mut h = spawn_connection(false, limits());
        complete_handshake(&mut h).await;

        // first keep-alive after 60 idle seconds
        let mut frame = [0u8; 4];
        h.remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0, 0, 0, 0]);

        // nothing ever arrives; the inactivity deadline closes the link
        match h.events.recv().await.unwrap() {
            PeerEvent::Closed {
                error: Some(PeerError::Timeout),
                ..
            } => {}
            other => panic!("expected Closed(Timeout), got {other:?}"),
        }
    }
}
