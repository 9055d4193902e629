use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use once_cell::sync::Lazy;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use undertow_common::{PeerId, TorrentInfo};
use undertow_wire::{Block, BlockInfo, Message};

use crate::{
    availability::AvailabilityTracker,
    bitfield::Bitfield,
    choker::Choker,
    config::EngineConfig,
    error::{PeerError, StoreError, TorrentError},
    peer::{
        ConnectionLimits, PeerCommand, PeerEvent, PeerMetrics, Pid, RateEstimator, connection,
        format_rate,
    },
    retry::RetryQueue,
    scheduler::PieceScheduler,
    storage::PieceStorage,
    store::{BlockWrite, PieceStore, Verdict},
    transport::Transport,
};

/// One peer id per process, the way real clients do it.
static LOCAL_PEER_ID: Lazy<PeerId> = Lazy::new(PeerId::generate);

const EVENT_CHANNEL_DEPTH: usize = 256;
const RATE_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Leeching,
    Seeding,
}

/// Snapshot of a torrent's progress, published through a watch channel
/// so observers never block the engine.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub state: TorrentState,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes not yet verified, the "left" figure an announce reports.
    pub left: u64,
    /// Smoothed bytes per second.
    pub download_rate: u64,
    pub upload_rate: u64,
    pub connected_peers: usize,
    pub endgame: bool,
}

#[derive(Debug)]
enum SwarmCommand {
    AddCandidate(SocketAddr),
    Shutdown,
}

/// Owning handle for one running swarm. Dropping it stops the torrent.
pub struct SwarmHandle {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    stats_rx: watch::Receiver<TransferStats>,
    join: JoinHandle<Result<(), TorrentError>>,
}

impl SwarmHandle {
    pub fn stats(&self) -> watch::Receiver<TransferStats> {
        self.stats_rx.clone()
    }

    /// Feed an extra peer address, on top of the discovery stream.
    pub async fn add_candidate(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(SwarmCommand::AddCandidate(addr)).await;
    }

    /// Resolves once every piece is verified and persisted.
    pub async fn wait_until_seeding(&mut self) -> Result<(), TorrentError> {
        self.stats_rx
            .wait_for(|s| s.state == TorrentState::Seeding)
            .await
            .map_err(|_| TorrentError::Internal("engine stopped before completing".into()))?;
        Ok(())
    }

    /// Orderly shutdown: all peer connections are closed, then the
    /// engine task's final result is returned.
    pub async fn shutdown(self) -> Result<(), TorrentError> {
        let _ = self.cmd_tx.send(SwarmCommand::Shutdown).await;
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TorrentError::Internal(e.to_string())),
        }
    }
}

struct PeerState {
    addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
    metrics: Arc<PeerMetrics>,
    /// False until the handshake completes.
    connected: bool,
    /// Whether the remote is choking us.
    remote_choking: bool,
    /// Whether we declared interest in the remote's pieces.
    am_interested: bool,
    /// Contribution counter snapshot at the last choke round.
    last_contribution: u64,
    rate: RateEstimator,
}

impl PeerState {
    fn new(addr: SocketAddr, cmd_tx: mpsc::UnboundedSender<PeerCommand>, metrics: Arc<PeerMetrics>) -> Self {
        Self {
            addr,
            cmd_tx,
            metrics,
            connected: false,
            remote_choking: true,
            am_interested: false,
            last_contribution: 0,
            rate: RateEstimator::new(RATE_ALPHA),
        }
    }

    fn send(&self, cmd: PeerCommand) {
        // a closed channel just means the task already exited
        let _ = self.cmd_tx.send(cmd);
    }
}

/// The swarm controller: a single task owning every piece of mutable
/// per-torrent state (store, scheduler, availability, choker), fed by
/// peer events, discovery, accepted connections and timers. Peer tasks
/// only push events and execute commands, so all scheduling decisions
/// are serialized here.
pub struct Swarm<T: Transport, S> {
    torrent: Arc<TorrentInfo>,
    config: EngineConfig,
    transport: Arc<T>,
    storage: Arc<S>,

    store: PieceStore,
    scheduler: PieceScheduler,
    availability: AvailabilityTracker,
    choker: Choker,
    own_pieces: Bitfield,
    state: TorrentState,

    peers: HashMap<Pid, PeerState>,
    next_pid: usize,
    /// Which peers supplied blocks for each in-flight piece, for blame
    /// when the piece fails its hash check.
    contributors: HashMap<u32, HashSet<Pid>>,
    hash_strikes: HashMap<IpAddr, u32>,
    banned: HashSet<IpAddr>,
    retry: RetryQueue,

    events_tx: mpsc::Sender<PeerEvent>,
    stats_tx: watch::Sender<TransferStats>,
    lifetime_down: u64,
    lifetime_up: u64,
    down_rate: RateEstimator,
    up_rate: RateEstimator,
}

impl<T: Transport, S: PieceStorage> Swarm<T, S> {
    /// Start a torrent. `discovery` streams candidate addresses from
    /// whatever discovery mechanism the caller runs; `incoming` carries
    /// already-accepted connections from a listener.
    pub fn spawn(
        torrent: Arc<TorrentInfo>,
        config: EngineConfig,
        transport: T,
        storage: Arc<S>,
        discovery: mpsc::Receiver<SocketAddr>,
        incoming: mpsc::Receiver<(T::Stream, SocketAddr)>,
    ) -> SwarmHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (stats_tx, stats_rx) = watch::channel(TransferStats {
            total_pieces: torrent.num_pieces(),
            left: torrent.total_length(),
            ..TransferStats::default()
        });

        let num_pieces = torrent.num_pieces();
        let swarm = Swarm {
            store: PieceStore::new(torrent.clone()),
            scheduler: PieceScheduler::new(
                torrent.clone(),
                config.pipeline_depth,
                config.endgame_floor,
            ),
            availability: AvailabilityTracker::new(num_pieces),
            choker: Choker::new(config.upload_slots, config.optimistic_rounds),
            own_pieces: Bitfield::new(num_pieces),
            state: TorrentState::Leeching,
            torrent,
            config,
            transport: Arc::new(transport),
            storage,
            peers: HashMap::new(),
            next_pid: 0,
            contributors: HashMap::new(),
            hash_strikes: HashMap::new(),
            banned: HashSet::new(),
            retry: RetryQueue::default(),
            events_tx,
            stats_tx,
            lifetime_down: 0,
            lifetime_up: 0,
            down_rate: RateEstimator::new(RATE_ALPHA),
            up_rate: RateEstimator::new(RATE_ALPHA),
        };

        let join = tokio::spawn(swarm.run(cmd_rx, events_rx, discovery, incoming));
        SwarmHandle {
            cmd_tx,
            stats_rx,
            join,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SwarmCommand>,
        mut events_rx: mpsc::Receiver<PeerEvent>,
        mut discovery: mpsc::Receiver<SocketAddr>,
        mut incoming: mpsc::Receiver<(T::Stream, SocketAddr)>,
    ) -> Result<(), TorrentError> {
        info!(
            info_hash = %self.torrent.info_hash(),
            pieces = self.torrent.num_pieces(),
            total = self.torrent.total_length(),
            "swarm started"
        );

        let mut choke_tick = time::interval(self.config.choke_interval);
        let mut tick = time::interval(self.config.tick_interval);
        choke_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut discovery_done = false;
        let mut incoming_done = false;

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(SwarmCommand::AddCandidate(addr)) => self.try_connect(addr),
                    Some(SwarmCommand::Shutdown) | None => break,
                },

                Some(event) = events_rx.recv() => self.handle_event(event)?,

                maybe_addr = discovery.recv(), if !discovery_done && self.wants_candidates() => {
                    match maybe_addr {
                        Some(addr) => self.try_connect(addr),
                        None => discovery_done = true,
                    }
                }

                maybe_conn = incoming.recv(), if !incoming_done => {
                    match maybe_conn {
                        Some((stream, addr)) => self.accept_incoming(stream, addr),
                        None => incoming_done = true,
                    }
                }

                _ = choke_tick.tick() => self.run_choke_round(),

                _ = tick.tick() => self.on_tick(),
            }
        }

        for state in self.peers.values() {
            state.send(PeerCommand::Shutdown);
        }
        info!("swarm stopped");
        Ok(())
    }

    fn wants_candidates(&self) -> bool {
        self.connected_count() < self.config.target_peers
            && self.peers.len() < self.config.max_peers
    }

    fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.connected).count()
    }

    fn alloc_pid(&mut self) -> Pid {
        self.next_pid += 1;
        Pid(self.next_pid)
    }

    fn try_connect(&mut self, addr: SocketAddr) {
        if self.banned.contains(&addr.ip())
            || self.peers.len() >= self.config.max_peers
            || self.peers.values().any(|p| p.addr == addr)
        {
            return;
        }

        let pid = self.alloc_pid();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PeerMetrics::default());
        self.peers
            .insert(pid, PeerState::new(addr, cmd_tx, metrics.clone()));

        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let limits = ConnectionLimits::from(&self.config);
        let info_hash = self.torrent.info_hash();
        debug!(%pid, %addr, "dialing peer");

        tokio::spawn(async move {
            match time::timeout(limits.handshake_timeout, transport.connect(addr)).await {
                Ok(Ok(stream)) => {
                    connection::drive(
                        pid,
                        stream,
                        false,
                        info_hash,
                        *LOCAL_PEER_ID,
                        limits,
                        metrics,
                        events,
                        cmd_rx,
                    )
                    .await;
                }
                Ok(Err(e)) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            pid,
                            error: Some(PeerError::Transport(e)),
                        })
                        .await;
                }
                Err(_) => {
                    let _ = events
                        .send(PeerEvent::Closed {
                            pid,
                            error: Some(PeerError::Timeout),
                        })
                        .await;
                }
            }
        });
    }

    fn accept_incoming(&mut self, stream: T::Stream, addr: SocketAddr) {
        if self.banned.contains(&addr.ip())
            || self.peers.len() >= self.config.max_peers
            || self.peers.values().any(|p| p.addr == addr)
        {
            debug!(%addr, "rejecting incoming connection");
            return;
        }

        let pid = self.alloc_pid();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PeerMetrics::default());
        self.peers
            .insert(pid, PeerState::new(addr, cmd_tx, metrics.clone()));

        let events = self.events_tx.clone();
        let limits = ConnectionLimits::from(&self.config);
        let info_hash = self.torrent.info_hash();
        debug!(%pid, %addr, "accepted incoming peer");

        tokio::spawn(connection::drive(
            pid,
            stream,
            true,
            info_hash,
            *LOCAL_PEER_ID,
            limits,
            metrics,
            events,
            cmd_rx,
        ));
    }

    fn handle_event(&mut self, event: PeerEvent) -> Result<(), TorrentError> {
        match event {
            PeerEvent::Connected { pid, remote_id } => {
                let Some(state) = self.peers.get_mut(&pid) else {
                    return Ok(());
                };
                state.connected = true;
                info!(%pid, %remote_id, addr = %state.addr, "peer connected");
                self.retry.forget(&state.addr);
                if !self.own_pieces.is_empty() {
                    state.send(PeerCommand::Send(Message::Bitfield(
                        self.own_pieces.as_bytes(),
                    )));
                }
                self.scheduler.update_endgame(self.connected_count());
            }

            PeerEvent::BitfieldReceived { pid, raw } => {
                match Bitfield::from_payload(&raw, self.torrent.num_pieces()) {
                    Ok(bitfield) => {
                        self.availability.on_peer_bitfield(pid, bitfield);
                        self.update_interest(pid);
                        self.maybe_request(pid);
                    }
                    Err(e) => {
                        warn!(%pid, %e, "invalid bitfield");
                        self.disconnect(pid);
                    }
                }
            }

            PeerEvent::HaveReceived { pid, piece } => {
                if piece as usize >= self.torrent.num_pieces() {
                    warn!(%pid, piece, "have for unknown piece");
                    self.disconnect(pid);
                } else {
                    self.availability.on_peer_have(pid, piece as usize);
                    self.update_interest(pid);
                    self.maybe_request(pid);
                }
            }

            PeerEvent::InterestChanged { pid, interested } => {
                self.choker.set_interest(pid, interested);
            }

            PeerEvent::ChokeChanged { pid, choked } => {
                if let Some(state) = self.peers.get_mut(&pid) {
                    state.remote_choking = choked;
                }
                if choked {
                    // everything in flight to this peer is dead
                    let released = self.scheduler.peer_gone(pid);
                    if !released.is_empty() {
                        trace!(%pid, count = released.len(), "requests dropped by remote choke");
                        self.request_from_ready_peers();
                    }
                } else {
                    self.maybe_request(pid);
                }
            }

            PeerEvent::BlockReceived { pid, block } => self.on_block(pid, block)?,

            PeerEvent::BlockRequested { pid, info } => self.on_remote_request(pid, info)?,

            PeerEvent::RequestTimedOut { pid, info } => {
                debug!(%pid, ?info, "request timed out");
                self.scheduler.release(pid, info);
                self.scheduler.update_endgame(self.connected_count());
                self.request_from_ready_peers();
            }

            PeerEvent::Closed { pid, error } => self.on_closed(pid, error),
        }
        Ok(())
    }

    fn on_block(&mut self, pid: Pid, block: Block) -> Result<(), TorrentError> {
        let info = block.info();
        for (other, duplicate) in self.scheduler.block_received(pid, info) {
            if let Some(state) = self.peers.get(&other) {
                state.send(PeerCommand::Cancel(duplicate));
            }
        }

        match self.store.put_block(info.index, info.begin, &block.data) {
            Ok(BlockWrite::Duplicate) => {}
            Ok(BlockWrite::Accepted) => {
                self.contributors.entry(info.index).or_default().insert(pid);
            }
            Ok(BlockWrite::Completed) => {
                self.contributors.entry(info.index).or_default().insert(pid);
                self.finish_piece(info.index)?;
            }
            // a late endgame duplicate for a piece that already verified
            Err(StoreError::AlreadyVerified(_)) => {}
            Err(e) => {
                warn!(%pid, %e, "unusable block");
                self.disconnect(pid);
            }
        }

        self.scheduler.update_endgame(self.connected_count());
        self.maybe_request(pid);
        Ok(())
    }

    fn finish_piece(&mut self, index: u32) -> Result<(), TorrentError> {
        match self.store.verify(index) {
            Ok(Verdict::Verified(data)) => {
                self.storage.write_piece(index, &data)?;
                let _ = self.own_pieces.set(index as usize);
                self.scheduler.piece_verified(index);
                self.contributors.remove(&index);
                info!(
                    piece = index,
                    verified = self.store.verified_count(),
                    total = self.torrent.num_pieces(),
                    "piece verified"
                );
                self.broadcast(Message::Have { piece_index: index });
                self.refresh_all_interest();
                if self.store.all_verified() {
                    self.enter_seeding();
                }
            }
            Ok(Verdict::HashMismatch) => {
                self.scheduler.piece_invalid(index);
                let blamed = self.contributors.remove(&index).unwrap_or_default();
                warn!(
                    piece = index,
                    contributors = blamed.len(),
                    "piece failed hash check"
                );
                for pid in blamed {
                    self.strike(pid);
                }
            }
            Err(e) => debug!(piece = index, %e, "verification skipped"),
        }
        Ok(())
    }

    fn on_remote_request(&mut self, pid: Pid, info: BlockInfo) -> Result<(), TorrentError> {
        if !self.choker.is_unchoked(pid) {
            trace!(%pid, ?info, "request while choked, ignoring");
            return Ok(());
        }

        let index = info.index as usize;
        let in_range = index < self.torrent.num_pieces()
            && info
                .begin
                .checked_add(info.length)
                .is_some_and(|end| end <= self.torrent.piece_len(index));
        if !in_range || !self.own_pieces.has(index) {
            warn!(%pid, ?info, "request for a block we never advertised");
            self.disconnect(pid);
            return Ok(());
        }

        // we verified and persisted this piece, so a read failure here
        // is a genuine storage fault
        let data = self.storage.read_block(info.index, info.begin, info.length)?;
        if let Some(state) = self.peers.get(&pid) {
            state.send(PeerCommand::Serve(Block {
                index: info.index,
                begin: info.begin,
                data,
            }));
        }
        Ok(())
    }

    fn on_closed(&mut self, pid: Pid, error: Option<PeerError>) {
        let Some(state) = self.peers.remove(&pid) else {
            return;
        };
        match &error {
            Some(e) => debug!(%pid, addr = %state.addr, %e, "peer closed"),
            None => debug!(%pid, addr = %state.addr, "peer closed"),
        }

        if !state.connected {
            self.retry.record_failure(state.addr);
        }
        self.lifetime_down += state.metrics.downloaded();
        self.lifetime_up += state.metrics.uploaded();

        self.availability.on_peer_gone(pid);
        self.choker.peer_gone(pid);
        let released = self.scheduler.peer_gone(pid);

        // departed peers escape hash blame; a partial piece fed only by
        // this peer is dropped so its blocks can be fetched afresh
        let mut orphaned = Vec::new();
        self.contributors.retain(|&index, peers| {
            peers.remove(&pid);
            if peers.is_empty() {
                orphaned.push(index);
                false
            } else {
                true
            }
        });
        let mut reclaimed = false;
        for index in orphaned {
            if !self.scheduler.piece_in_flight(index) {
                debug!(piece = index, "reclaiming partial piece");
                self.store.drop_piece(index);
                self.scheduler.piece_invalid(index);
                reclaimed = true;
            }
        }

        self.scheduler.update_endgame(self.connected_count());
        if !released.is_empty() || reclaimed {
            self.request_from_ready_peers();
        }
    }

    /// Ask the scheduler for more work for one peer, if it is in a state
    /// where requests can flow.
    fn maybe_request(&mut self, pid: Pid) {
        if self.state == TorrentState::Seeding {
            return;
        }
        let Some(state) = self.peers.get(&pid) else {
            return;
        };
        if !state.connected || state.remote_choking || !state.am_interested {
            return;
        }
        let Some(bitfield) = self.availability.peer_bitfield(pid) else {
            return;
        };
        let requests = self
            .scheduler
            .next_requests(pid, bitfield, &self.availability);
        if !requests.is_empty() {
            trace!(%pid, count = requests.len(), "dispatching requests");
            state.send(PeerCommand::Request(requests));
        }
    }

    fn request_from_ready_peers(&mut self) {
        let pids: Vec<Pid> = self.peers.keys().copied().collect();
        for pid in pids {
            self.maybe_request(pid);
        }
    }

    /// Reconcile our declared interest with what the peer advertises.
    fn update_interest(&mut self, pid: Pid) {
        let want = match self.availability.peer_bitfield(pid) {
            Some(bitfield) => bitfield.iter_set().any(|i| !self.own_pieces.has(i)),
            None => false,
        };
        let Some(state) = self.peers.get_mut(&pid) else {
            return;
        };
        if want != state.am_interested {
            state.am_interested = want;
            state.send(PeerCommand::Send(if want {
                Message::Interested
            } else {
                Message::NotInterested
            }));
        }
    }

    fn refresh_all_interest(&mut self) {
        let pids: Vec<Pid> = self.peers.keys().copied().collect();
        for pid in pids {
            self.update_interest(pid);
        }
    }

    fn broadcast(&self, msg: Message) {
        for state in self.peers.values() {
            if state.connected {
                state.send(PeerCommand::Send(msg.clone()));
            }
        }
    }

    fn strike(&mut self, pid: Pid) {
        let Some(state) = self.peers.get(&pid) else {
            return;
        };
        let ip = state.addr.ip();
        let strikes = self.hash_strikes.entry(ip).or_insert(0);
        *strikes += 1;
        if *strikes >= self.config.ban_threshold {
            warn!(%pid, %ip, "banning peer after repeated hash failures");
            self.banned.insert(ip);
            self.disconnect(pid);
        }
    }

    fn disconnect(&mut self, pid: Pid) {
        if let Some(state) = self.peers.get(&pid) {
            state.send(PeerCommand::Shutdown);
        }
    }

    fn run_choke_round(&mut self) {
        let mut rates = HashMap::new();
        for (pid, state) in self.peers.iter_mut() {
            if !state.connected {
                continue;
            }
            // while leeching, reward peers by what they give us; while
            // seeding, by what they take
            let total = match self.state {
                TorrentState::Leeching => state.metrics.downloaded(),
                TorrentState::Seeding => state.metrics.uploaded(),
            };
            let delta = total.saturating_sub(state.last_contribution);
            state.last_contribution = total;
            rates.insert(*pid, state.rate.update(delta));
        }

        let update = self.choker.run_round(&rates);
        for pid in update.to_unchoke {
            if let Some(state) = self.peers.get(&pid) {
                state.send(PeerCommand::Send(Message::Unchoke));
            }
        }
        for pid in update.to_choke {
            if let Some(state) = self.peers.get(&pid) {
                state.send(PeerCommand::Send(Message::Choke));
            }
        }
    }

    fn enter_seeding(&mut self) {
        self.state = TorrentState::Seeding;
        info!("download complete, seeding");
        for state in self.peers.values_mut() {
            state.last_contribution = state.metrics.uploaded();
            if state.am_interested {
                state.am_interested = false;
                state.send(PeerCommand::Send(Message::NotInterested));
            }
        }
        self.publish_stats();
    }

    fn on_tick(&mut self) {
        for addr in self.retry.take_ready(Instant::now()) {
            if self.wants_candidates() {
                self.try_connect(addr);
            }
        }
        // catch blocks that reopened without a triggering peer event
        self.request_from_ready_peers();
        self.publish_stats();
    }

    fn publish_stats(&mut self) {
        let downloaded =
            self.lifetime_down + self.peers.values().map(|p| p.metrics.downloaded()).sum::<u64>();
        let uploaded =
            self.lifetime_up + self.peers.values().map(|p| p.metrics.uploaded()).sum::<u64>();

        let previous = self.stats_tx.borrow().clone();
        let interval = self.config.tick_interval.as_secs_f64().max(0.001);
        let down_delta = (downloaded.saturating_sub(previous.downloaded) as f64 / interval) as u64;
        let up_delta = (uploaded.saturating_sub(previous.uploaded) as f64 / interval) as u64;

        let stats = TransferStats {
            state: self.state,
            verified_pieces: self.store.verified_count(),
            total_pieces: self.torrent.num_pieces(),
            downloaded,
            uploaded,
            left: self.store.bytes_left(),
            download_rate: self.down_rate.update(down_delta),
            upload_rate: self.up_rate.update(up_delta),
            connected_peers: self.connected_count(),
            endgame: self.scheduler.endgame(),
        };
        trace!(
            verified = stats.verified_pieces,
            total = stats.total_pieces,
            peers = stats.connected_peers,
            down = %format_rate(stats.download_rate),
            up = %format_rate(stats.upload_rate),
            "progress"
        );
        self.stats_tx.send_replace(stats);
    }
}
