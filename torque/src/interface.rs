use crate::address::Address;
use crate::bitstream::{self, BitStream};
use crate::connection::{
    AsymmetricKey, Certificate, ConnectionParameters, ConnectionState, Nonce,
};
use crate::ghost::{GhostConnection, GhostNotice};
use crate::object::{DirtyList, NetObjectHandle};
use crate::puzzle::ClientPuzzleManager;
use crate::registry::ClassRegistry;
use crate::socket::Socket;
use crate::support::constants::*;
use crate::support::{NetworkError, NetworkResult, TerminationReason};
use quark::crypto;
use quark::logging::{self, Logger};
use quark::time;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// Control packet types, encoded as the first byte of each non-connected packet.
/// Packets whose first byte has the high bit set are connected data packets and are
/// dispatched by source address instead.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    ConnectChallengeRequest = 0,
    ConnectChallengeResponse = 1,
    ConnectRequest = 2,
    ConnectReject = 3,
    ConnectAccept = 4,
    Disconnect = 5,
    Punch = 6,
    ArrangedConnectRequest = 7,
}

/// The first packet-type value available to application info packets.
pub const FIRST_VALID_INFO_PACKET_ID: u8 = 8;

const CHALLENGE_RETRY_COUNT: u32 = 4;
const CHALLENGE_RETRY_TIME: u64 = 2500;
const CONNECT_RETRY_COUNT: u32 = 4;
const CONNECT_RETRY_TIME: u64 = 2500;
const PUNCH_RETRY_COUNT: u32 = 6;
const PUNCH_RETRY_TIME: u64 = 2500;
/// Candidate address list cap for arranged connections.
const MAX_POSSIBLE_ADDRESSES: usize = 5;
const INITIAL_HASH_TABLE_SIZE: usize = 129;

/// Identifies a connection within its interface. Stable for the connection's life.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub usize);

/// Connection lifecycle notifications, drained by the application each tick.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed; the connection is live on both sides.
    ConnectionEstablished(ConnectionId),
    /// The host's challenge response arrived, with its opaque response data.
    ChallengeResponse(ConnectionId, Vec<u8>),
    /// A connection attempt failed before establishing.
    ConnectTerminated(ConnectionId, TerminationReason, String),
    /// An established connection went away.
    ConnectionTerminated(ConnectionId, TerminationReason, String),
    /// The remote host started ghosting to us.
    GhostingStarted(ConnectionId),
    /// The remote host stopped ghosting and our local ghosts were deleted.
    GhostingStopped(ConnectionId),
}

/// Application hooks invoked synchronously during packet processing: opaque
/// handshake payloads and custom info packets. All methods have accept-everything
/// defaults.
pub trait InterfaceDelegate {
    /// Appends application data to an outgoing connect request.
    fn write_connect_request(&mut self, _stream: &mut BitStream) {}

    /// Validates the application data of an incoming connect request; an `Err` reason
    /// rejects the connection.
    fn read_connect_request(
        &mut self,
        _address: &Address,
        _stream: &mut BitStream,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Appends application data to an outgoing connect accept.
    fn write_connect_accept(&mut self, _stream: &mut BitStream) {}

    /// Reads the application data of an incoming connect accept.
    fn read_connect_accept(&mut self, _stream: &mut BitStream) -> Result<(), String> {
        Ok(())
    }

    /// Handles application packets with type bytes at or above
    /// `FIRST_VALID_INFO_PACKET_ID`.
    fn handle_info_packet(&mut self, _address: &Address, _packet_type: u8, _stream: &mut BitStream) {
    }
}

struct DefaultDelegate;

impl InterfaceDelegate for DefaultDelegate {}

/// A packet held back to simulate latency; released when its due time arrives.
struct DelayedPacket {
    send_time: u64,
    address: Address,
    data: Vec<u8>,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.send_time == other.send_time
    }
}
impl Eq for DelayedPacket {}
impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the BinaryHeap pops the earliest due time first
        other.send_time.cmp(&self.send_time)
    }
}

/// Manages all valid and pending notify-protocol connections for one bound UDP
/// endpoint. Drive it from a single loop: `process_socket` drains incoming
/// datagrams, `process_connections` advances timers, retries, puzzle work and
/// per-connection packet sends.
///
/// The handshake is four-phase and keeps the host stateless until a valid puzzle
/// solution arrives: challenge request, challenge response (identity token, puzzle,
/// optional key or certificate), connect request (solution, key half, class counts),
/// connect accept.
pub struct NetInterface {
    socket: Socket,
    registry: Rc<ClassRegistry>,
    group: u32,

    connections: Vec<Option<GhostConnection>>,
    free_slots: Vec<usize>,
    active: Vec<usize>,
    pending: Vec<usize>,
    address_table: Vec<Option<usize>>,

    private_key: Option<AsymmetricKey>,
    certificate: Option<Certificate>,
    puzzle_manager: ClientPuzzleManager,
    random_hash_data: [u8; 12],

    allow_connections: bool,
    requires_key_exchange: bool,
    challenge_response_data: Vec<u8>,
    connection_type_identifier: u32,

    delayed: BinaryHeap<DelayedPacket>,
    simulated_latency: u64,
    simulated_packet_loss: f32,

    dirty: DirtyList,
    events_out: Vec<ConnectionEvent>,
    delegate: Box<dyn InterfaceDelegate>,

    process_start_time: u64,
    last_timeout_check: u64,

    log: Logger,
}

impl NetInterface {
    /// Binds the interface to a local address. The registry must be frozen before
    /// any interface exists; `group` selects which class group this interface's
    /// connections transmit.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        bind_address: &Address,
        registry: Rc<ClassRegistry>,
        group: u32,
        log: L,
    ) -> NetworkResult<NetInterface> {
        let log = logging::child_logger(log);
        let socket = Socket::bind(bind_address)?;
        let mut random_hash_data = [0u8; 12];
        crypto::random_bytes(&mut random_hash_data);
        let now = time::clock_millis();

        logging::info!(log, "interface bound"; "address" => %socket.bound_address());

        Ok(NetInterface {
            socket,
            registry,
            group,
            connections: Vec::new(),
            free_slots: Vec::new(),
            active: Vec::new(),
            pending: Vec::new(),
            address_table: vec![None; INITIAL_HASH_TABLE_SIZE],
            private_key: None,
            certificate: None,
            puzzle_manager: ClientPuzzleManager::new(),
            random_hash_data,
            allow_connections: true,
            requires_key_exchange: false,
            challenge_response_data: Vec::new(),
            connection_type_identifier: 0x5452_5143, // "TRQC"
            delayed: BinaryHeap::new(),
            simulated_latency: 0,
            simulated_packet_loss: 0.0,
            dirty: DirtyList::new(),
            events_out: Vec::new(),
            delegate: Box::new(DefaultDelegate),
            process_start_time: now,
            last_timeout_check: 0,
            log,
        })
    }

    // -- configuration -------------------------------------------------------

    /// Sets the private key used for key exchange with connecting clients.
    pub fn set_private_key(&mut self, key: AsymmetricKey) {
        self.private_key = Some(key);
    }

    /// Sets the signed certificate sent to clients that request authentication.
    pub fn set_certificate(&mut self, certificate: Certificate) {
        self.certificate = Some(certificate);
    }

    /// When set, unencrypted connections are refused in both directions.
    pub fn set_requires_key_exchange(&mut self, requires: bool) {
        self.requires_key_exchange = requires;
    }

    pub fn set_allows_connections(&mut self, allow: bool) {
        self.allow_connections = allow;
    }

    pub fn allows_connections(&self) -> bool {
        self.allow_connections
    }

    /// Opaque data appended to every challenge response; surfaced to initiators via
    /// `ConnectionEvent::ChallengeResponse`. Capped at 255 bytes.
    pub fn set_challenge_response_data(&mut self, mut data: Vec<u8>) {
        data.truncate(255);
        self.challenge_response_data = data;
    }

    pub fn set_delegate(&mut self, delegate: Box<dyn InterfaceDelegate>) {
        self.delegate = delegate;
    }

    /// Latency and loss simulation applied to every outgoing packet.
    pub fn set_simulated_net_params(&mut self, latency_millis: u64, packet_loss: f32) {
        self.simulated_latency = latency_millis;
        self.simulated_packet_loss = packet_loss;
    }

    pub fn bound_address(&self) -> &Address {
        self.socket.bound_address()
    }

    /// Addresses this interface can be reached at, for self-identification.
    pub fn interface_addresses(&self) -> Vec<Address> {
        self.socket.interface_addresses()
    }

    pub fn registry(&self) -> &Rc<ClassRegistry> {
        &self.registry
    }

    /// The single timestamp all work within the current tick observes.
    pub fn process_start_time(&self) -> u64 {
        self.process_start_time
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&GhostConnection> {
        self.connections.get(id.0)?.as_ref()
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut GhostConnection> {
        self.connections.get_mut(id.0)?.as_mut()
    }

    /// Drains the lifecycle events accumulated since the last call.
    pub fn poll_events(&mut self) -> std::vec::Drain<ConnectionEvent> {
        self.events_out.drain(..)
    }

    /// Notifies the engine that one or more of an object's states changed; the mask
    /// is folded into every scoping connection at the next `process_connections`.
    pub fn set_mask_bits(&mut self, object: &NetObjectHandle, mask: u32) {
        self.dirty.mark(object, mask);
    }

    // -- connection initiation ----------------------------------------------

    /// Begins the connection handshake with a remote host.
    pub fn connect(&mut self, address: &Address) -> ConnectionId {
        let mut conn = GhostConnection::new(self.registry.clone(), self.group, true, &self.log);
        conn.net_mut().set_address(*address);
        conn.net_mut().params_mut().request_key_exchange = self.requires_key_exchange;
        let slot = self.start_pending(conn);
        self.connections[slot]
            .as_mut()
            .expect("fresh slot")
            .net_mut()
            .set_state(ConnectionState::AwaitingChallengeResponse);
        self.send_connect_challenge_request(slot);
        ConnectionId(slot)
    }

    /// Begins an arranged connection: both peers learned each other's candidate
    /// addresses and a shared secret from an introducer, and now punch each other's
    /// NATs simultaneously. Exactly one side must pass `is_initiator = true`, and
    /// the nonce pair must be mirrored on the two sides.
    pub fn connect_arranged(
        &mut self,
        possible_addresses: Vec<Address>,
        nonce: Nonce,
        server_nonce: Nonce,
        arranged_secret: [u8; crypto::KEY_SIZE],
        is_initiator: bool,
    ) -> ConnectionId {
        let mut conn =
            GhostConnection::new(self.registry.clone(), self.group, is_initiator, &self.log);
        if let Some(first) = possible_addresses.first() {
            conn.net_mut().set_address(*first);
        }
        {
            let params = conn.net_mut().params_mut();
            params.nonce = nonce;
            params.server_nonce = server_nonce;
            params.arranged_secret = arranged_secret;
            params.is_arranged = true;
            params.possible_addresses = possible_addresses;
            params.request_key_exchange = self.requires_key_exchange;
        }
        let slot = self.start_pending(conn);
        self.connections[slot]
            .as_mut()
            .expect("fresh slot")
            .net_mut()
            .set_state(ConnectionState::SendingPunchPackets);
        self.send_punch_packets(slot);
        ConnectionId(slot)
    }

    /// Application-initiated disconnect: a best-effort disconnect packet is sent and
    /// the connection is torn down locally without further callbacks.
    pub fn disconnect(&mut self, id: ConnectionId, reason: &str) {
        if self.connections.get(id.0).map_or(true, Option::is_none) {
            return;
        }
        self.terminate(id.0, TerminationReason::SelfDisconnect, reason);
    }

    fn start_pending(&mut self, conn: GhostConnection) -> usize {
        let address = *conn.net().address();
        self.find_and_remove_pending(&address);
        if let Some(existing) = self.find_connection(&address) {
            self.terminate(existing, TerminationReason::SelfDisconnect, "Reconnecting");
        }
        let slot = self.alloc_slot(conn);
        self.pending.push(slot);
        slot
    }

    // -- tick loop -----------------------------------------------------------

    /// Drains all pending datagrams from the socket, dispatching each to the
    /// handshake engine, the owning connection, or the info-packet delegate.
    pub fn process_socket(&mut self) {
        self.process_start_time = time::clock_millis();
        let mut buf = [0u8; MAX_PACKET_DATA_SIZE + 64];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok(Some((address, size))) => {
                    let data = buf[..size].to_vec();
                    self.process_packet(&address, &data);
                }
                Ok(None) => break,
                Err(err) => {
                    logging::warn!(self.log, "socket receive error"; "error" => ?err);
                    break;
                }
            }
        }
    }

    /// Advances the puzzle manager, releases due delayed packets, collapses dirty
    /// masks, runs per-connection sends, and sweeps for retries and timeouts.
    pub fn process_connections(&mut self) {
        self.process_start_time = time::clock_millis();
        let now = self.process_start_time;
        self.puzzle_manager.tick(now);

        while let Some(front) = self.delayed.peek() {
            if front.send_time > now {
                break;
            }
            let packet = self.delayed.pop().expect("peeked above");
            if let Err(err) = self.socket.send_to(&packet.address, &packet.data) {
                logging::warn!(self.log, "delayed send failed"; "error" => ?err);
            }
        }

        if !self.dirty.is_empty() {
            let dirty = self.dirty.take();
            for &slot in &self.active.clone() {
                if let Some(conn) = self.connections[slot].as_mut() {
                    for &(key, mask) in &dirty {
                        conn.mark_dirty(key, mask);
                    }
                }
            }
        }

        // packet sends on every established connection
        let mut outgoing: Vec<(Address, Vec<u8>)> = Vec::new();
        for &slot in &self.active {
            if let Some(conn) = self.connections[slot].as_mut() {
                let force = conn.net().needs_keepalive(now);
                if let Some(stream) = conn.check_packet_send(force, now) {
                    outgoing.push((*conn.net().address(), stream.bytes().to_vec()));
                }
            }
        }
        for (address, data) in outgoing {
            self.send_bytes(&address, &data);
        }

        if now > self.last_timeout_check + TIMEOUT_CHECK_INTERVAL {
            self.last_timeout_check = now;
            self.check_pending_retries(now);
            self.check_active_timeouts(now);
        }

        // advance at most one puzzle solution per tick
        for &slot in &self.pending.clone() {
            let computing = self.connections[slot]
                .as_ref()
                .map_or(false, |conn| conn.state() == ConnectionState::ComputingPuzzleSolution);
            if computing {
                self.continue_puzzle_solution(slot);
                break;
            }
        }
    }

    fn check_pending_retries(&mut self, now: u64) {
        for slot in self.pending.clone() {
            let (state, last_send, send_count, is_arranged) = {
                let conn = match self.connections[slot].as_ref() {
                    Some(conn) => conn,
                    None => continue,
                };
                (
                    conn.state(),
                    conn.net().connect_last_send_time,
                    conn.net().connect_send_count,
                    conn.net().params().is_arranged,
                )
            };
            match state {
                ConnectionState::AwaitingChallengeResponse
                    if now > last_send + CHALLENGE_RETRY_TIME =>
                {
                    if send_count > CHALLENGE_RETRY_COUNT {
                        self.terminate_pending_timeout(slot);
                    } else {
                        self.send_connect_challenge_request(slot);
                    }
                }
                ConnectionState::AwaitingConnectResponse
                    if now > last_send + CONNECT_RETRY_TIME =>
                {
                    if send_count > CONNECT_RETRY_COUNT {
                        self.terminate_pending_timeout(slot);
                    } else if is_arranged {
                        self.send_arranged_connect_request(slot);
                    } else {
                        self.send_connect_request(slot);
                    }
                }
                ConnectionState::SendingPunchPackets if now > last_send + PUNCH_RETRY_TIME => {
                    if send_count > PUNCH_RETRY_COUNT {
                        self.terminate_pending_timeout(slot);
                    } else {
                        self.send_punch_packets(slot);
                    }
                }
                ConnectionState::ComputingPuzzleSolution
                    if now > last_send + CONNECT_REQUEST_TIMEOUT =>
                {
                    self.terminate_pending_timeout(slot);
                }
                _ => {}
            }
        }
    }

    fn terminate_pending_timeout(&mut self, slot: usize) {
        if let Some(conn) = self.connections[slot].as_mut() {
            conn.net_mut().set_state(ConnectionState::TimedOut);
        }
        self.events_out.push(ConnectionEvent::ConnectTerminated(
            ConnectionId(slot),
            TerminationReason::TimedOut,
            "Timeout".to_owned(),
        ));
        self.remove_pending(slot);
        self.free_slot(slot);
    }

    fn check_active_timeouts(&mut self, now: u64) {
        for slot in self.active.clone() {
            let timed_out = self.connections[slot]
                .as_ref()
                .map_or(false, |conn| conn.net().check_timeout(now));
            if timed_out {
                if let Some(conn) = self.connections[slot].as_mut() {
                    conn.net_mut().set_state(ConnectionState::TimedOut);
                }
                self.events_out.push(ConnectionEvent::ConnectionTerminated(
                    ConnectionId(slot),
                    TerminationReason::TimedOut,
                    "Timeout".to_owned(),
                ));
                self.remove_connection_from_table(slot);
                self.active.retain(|&s| s != slot);
                self.free_slot(slot);
            }
        }
    }

    fn continue_puzzle_solution(&mut self, slot: usize) {
        let solved = {
            let conn = match self.connections[slot].as_mut() {
                Some(conn) => conn,
                None => return,
            };
            let (nonce, server_nonce, difficulty, identity) = {
                let params = conn.net().params();
                (
                    params.nonce,
                    params.server_nonce,
                    params.puzzle_difficulty,
                    params.client_identity,
                )
            };
            let mut solution = conn.net().params().puzzle_solution;
            let solved = ClientPuzzleManager::solve_puzzle(
                &mut solution,
                &nonce,
                &server_nonce,
                difficulty,
                identity,
            );
            conn.net_mut().params_mut().puzzle_solution = solution;
            solved
        };
        if solved {
            logging::debug!(self.log, "puzzle solved"; "slot" => slot);
            if let Some(conn) = self.connections[slot].as_mut() {
                conn.net_mut().set_state(ConnectionState::AwaitingConnectResponse);
                conn.net_mut().connect_send_count = 0;
            }
            self.send_connect_request(slot);
        }
    }

    // -- packet dispatch -----------------------------------------------------

    /// Classifies and routes one received datagram.
    fn process_packet(&mut self, address: &Address, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data[0] & 0x80 != 0 {
            // connected data packet for whichever connection holds this address
            if let Some(slot) = self.find_connection(address) {
                let now = self.process_start_time;
                let result = self.connections[slot]
                    .as_mut()
                    .expect("active slot")
                    .read_raw_packet(data, now);
                self.collect_notices(slot);
                if let Err(NetworkError::Fatal(_)) = result {
                    let reason = self.connections[slot]
                        .as_mut()
                        .and_then(|conn| conn.last_error.take())
                        .unwrap_or_else(|| "Invalid packet".to_owned());
                    self.terminate(slot, TerminationReason::Error, &reason);
                }
            }
            return;
        }

        let mut stream = BitStream::from_bytes(data);
        let packet_type = stream.read_int(8) as u8;
        if packet_type >= FIRST_VALID_INFO_PACKET_ID {
            self.delegate
                .handle_info_packet(address, packet_type, &mut stream);
            return;
        }
        match packet_type {
            x if x == PacketType::ConnectChallengeRequest as u8 => {
                self.handle_connect_challenge_request(address, &mut stream)
            }
            x if x == PacketType::ConnectChallengeResponse as u8 => {
                self.handle_connect_challenge_response(address, &mut stream)
            }
            x if x == PacketType::ConnectRequest as u8 => {
                self.handle_connect_request(address, &mut stream)
            }
            x if x == PacketType::ConnectReject as u8 => {
                self.handle_connect_reject(address, &mut stream)
            }
            x if x == PacketType::ConnectAccept as u8 => {
                self.handle_connect_accept(address, &mut stream)
            }
            x if x == PacketType::Disconnect as u8 => self.handle_disconnect(address, &mut stream),
            x if x == PacketType::Punch as u8 => self.handle_punch(address, &mut stream),
            x if x == PacketType::ArrangedConnectRequest as u8 => {
                self.handle_arranged_connect_request(address, &mut stream)
            }
            _ => {}
        }
    }

    fn collect_notices(&mut self, slot: usize) {
        let notices: Vec<GhostNotice> = match self.connections[slot].as_mut() {
            Some(conn) => conn.notices.drain(..).collect(),
            None => return,
        };
        for notice in notices {
            self.events_out.push(match notice {
                GhostNotice::GhostingStarted => {
                    ConnectionEvent::GhostingStarted(ConnectionId(slot))
                }
                GhostNotice::GhostingStopped => {
                    ConnectionEvent::GhostingStopped(ConnectionId(slot))
                }
            });
        }
    }

    /// Computes the identity token for a connecting client from its address and
    /// nonce; recomputed on each handshake packet so the host stores nothing.
    fn compute_client_identity_token(&self, address: &Address, nonce: &Nonce) -> u32 {
        let hash = crypto::Sha256::new()
            .update(&address.to_bytes())
            .update(&nonce.0)
            .update(&self.random_hash_data)
            .finish();
        u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
    }

    // -- handshake: challenge ------------------------------------------------

    fn send_connect_challenge_request(&mut self, slot: usize) {
        let now = self.process_start_time;
        let (address, mut out) = {
            let conn = match self.connections[slot].as_mut() {
                Some(conn) => conn,
                None => return,
            };
            let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
            out.write_int(PacketType::ConnectChallengeRequest as u32, 8);
            let params = conn.net().params();
            params.nonce.write(&mut out);
            out.write_flag(params.request_key_exchange);
            out.write_flag(params.request_certificate);
            conn.net_mut().connect_send_count += 1;
            conn.net_mut().connect_last_send_time = now;
            (*conn.net().address(), out)
        };
        logging::debug!(self.log, "sending connect challenge request"; "address" => %address);
        let bytes = out.bytes().to_vec();
        self.send_bytes(&address, &bytes);
    }

    fn handle_connect_challenge_request(&mut self, address: &Address, stream: &mut BitStream) {
        logging::debug!(self.log, "received connect challenge request"; "address" => %address);
        if !self.allow_connections {
            return;
        }
        let client_nonce = Nonce::read(stream);
        let wants_key_exchange = stream.read_flag();
        let wants_certificate = stream.read_flag();
        if stream.was_error() {
            return;
        }
        self.send_connect_challenge_response(
            address,
            &client_nonce,
            wants_key_exchange,
            wants_certificate,
        );
    }

    fn send_connect_challenge_response(
        &mut self,
        address: &Address,
        client_nonce: &Nonce,
        wants_key_exchange: bool,
        wants_certificate: bool,
    ) {
        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::ConnectChallengeResponse as u32, 8);
        client_nonce.write(&mut out);

        let identity_token = self.compute_client_identity_token(address, client_nonce);
        out.write_int(identity_token, 32);

        self.puzzle_manager.current_nonce().write(&mut out);
        out.write_int(self.puzzle_manager.current_difficulty(), 32);

        let offer_key =
            self.private_key.is_some() && (self.requires_key_exchange || wants_key_exchange);
        if out.write_flag(offer_key) {
            if out.write_flag(wants_certificate && self.certificate.is_some()) {
                self.certificate
                    .as_ref()
                    .expect("flag checked")
                    .write(&mut out);
            } else {
                out.write_bytes(self.private_key.as_ref().expect("flag checked").public_key());
            }
        }

        if out.write_flag(!self.challenge_response_data.is_empty()) {
            out.write_ranged_u32(self.challenge_response_data.len() as u32, 1, 255);
            out.write_bytes(&self.challenge_response_data);
        }

        logging::debug!(self.log, "sending challenge response";
                        "address" => %address,
                        "identity" => identity_token);
        let bytes = out.bytes().to_vec();
        self.send_bytes(address, &bytes);
    }

    fn handle_connect_challenge_response(&mut self, address: &Address, stream: &mut BitStream) {
        let slot = match self.find_pending(address) {
            Some(slot) => slot,
            None => return,
        };
        let mut response_data = Vec::new();
        {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            if conn.state() != ConnectionState::AwaitingChallengeResponse {
                return;
            }
            let the_nonce = Nonce::read(stream);
            if the_nonce != conn.net().params().nonce {
                return;
            }

            let client_identity = stream.read_int(32);
            let server_nonce = Nonce::read(stream);
            let puzzle_difficulty = stream.read_int(32);
            if puzzle_difficulty > MAX_PUZZLE_DIFFICULTY || stream.was_error() {
                return;
            }

            let mut public_key = None;
            let mut certificate = None;
            if stream.read_flag() {
                if stream.read_flag() {
                    let cert = Certificate::read(stream);
                    if stream.was_error() || !cert.is_valid() {
                        return;
                    }
                    public_key = Some(cert.public_key);
                    certificate = Some(cert);
                } else {
                    let mut key = [0u8; crypto::EXCHANGE_KEY_SIZE];
                    stream.read_bytes(&mut key);
                    if stream.was_error() {
                        return;
                    }
                    public_key = Some(key);
                }
            }

            if stream.read_flag() {
                let len = stream.read_ranged_u32(1, 255) as usize;
                response_data = vec![0u8; len];
                stream.read_bytes(&mut response_data);
            }
            if stream.was_error() {
                return;
            }

            let params = conn.net_mut().params_mut();
            params.client_identity = client_identity;
            params.server_nonce = server_nonce;
            params.puzzle_difficulty = puzzle_difficulty;
            params.certificate = certificate;
            if let Some(peer_key) = public_key {
                params.public_key = Some(peer_key);
                params.using_crypto = true;
            }
            params.puzzle_solution = 0;
        }

        // derive the shared secret outside the params borrow
        if self.connections[slot]
            .as_ref()
            .expect("pending slot")
            .net()
            .params()
            .using_crypto
        {
            let private = self
                .private_key
                .clone()
                .unwrap_or_else(AsymmetricKey::generate);
            let conn = self.connections[slot].as_mut().expect("pending slot");
            let peer_key = conn.net().params().public_key.expect("crypto flagged");
            let shared = match private.shared_secret(&peer_key) {
                Some(shared) => shared,
                None => return,
            };
            let params = conn.net_mut().params_mut();
            params.private_key = Some(private);
            params.shared_secret = Some(shared);
            crypto::random_bytes(&mut params.symmetric_key);
        }

        logging::debug!(self.log, "received challenge response"; "address" => %address);
        self.events_out.push(ConnectionEvent::ChallengeResponse(
            ConnectionId(slot),
            response_data,
        ));

        let now = self.process_start_time;
        {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            conn.net_mut().set_state(ConnectionState::ComputingPuzzleSolution);
            conn.net_mut().connect_send_count = 0;
            conn.net_mut().connect_last_send_time = now;
        }
        self.continue_puzzle_solution(slot);
    }

    // -- handshake: connect request/accept -----------------------------------

    fn send_connect_request(&mut self, slot: usize) {
        logging::debug!(self.log, "sending connect request"; "slot" => slot);
        let now = self.process_start_time;
        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::ConnectRequest as u32, 8);

        let (address, handshake_key, encrypt_pos) = {
            let conn = match self.connections[slot].as_mut() {
                Some(conn) => conn,
                None => return,
            };
            let address = *conn.net().address();
            let mut encrypt_pos = 0usize;
            {
                let params = conn.net().params();
                params.nonce.write(&mut out);
                params.server_nonce.write(&mut out);
                out.write_int(params.client_identity, 32);
                out.write_int(params.puzzle_difficulty, 32);
                out.write_int(params.puzzle_solution, 32);
            }
            if out.write_flag(conn.net().params().using_crypto) {
                let params = conn.net().params();
                out.write_bytes(
                    params
                        .private_key
                        .as_ref()
                        .expect("crypto params set")
                        .public_key(),
                );
                out.align_byte();
                encrypt_pos = out.byte_position();
                out.write_bytes(&params.symmetric_key);
            }
            out.write_flag(conn.net().params().debug_object_sizes);
            out.write_int(conn.net().initial_send_sequence(), 32);
            out.write_int(self.connection_type_identifier, 32);
            conn.write_connect_request(&mut out);
            conn.net_mut().connect_send_count += 1;
            conn.net_mut().connect_last_send_time = now;
            let key = conn.net().params().handshake_key();
            (address, key, encrypt_pos)
        };

        self.delegate.write_connect_request(&mut out);

        if encrypt_pos > 0 {
            let key = handshake_key.expect("crypto requires shared secret");
            bitstream::hash_and_encrypt(
                &mut out,
                encrypt_pos,
                PacketType::ConnectRequest as u64,
                &key,
            );
        }
        let bytes = out.bytes().to_vec();
        self.send_bytes(&address, &bytes);
    }

    fn handle_connect_request(&mut self, address: &Address, stream: &mut BitStream) {
        if !self.allow_connections {
            return;
        }
        let mut params = ConnectionParameters::new(false);
        params.nonce = Nonce::read(stream);
        params.server_nonce = Nonce::read(stream);
        params.client_identity = stream.read_int(32);

        if params.client_identity != self.compute_client_identity_token(address, &params.nonce) {
            return;
        }
        params.puzzle_difficulty = stream.read_int(32);
        params.puzzle_solution = stream.read_int(32);
        if stream.was_error() {
            return;
        }

        // a connection that already completed this handshake lost our accept packet;
        // just resend it
        let existing = self.find_connection(address);
        if let Some(existing_slot) = existing {
            let conn = self.connections[existing_slot].as_ref().expect("active");
            let cp = conn.net().params();
            if cp.nonce == params.nonce && cp.server_nonce == params.server_nonce {
                self.send_connect_accept(existing_slot);
                return;
            }
        }

        if let Err(error) = self.puzzle_manager.check_solution(
            params.puzzle_solution,
            &params.nonce,
            &params.server_nonce,
            params.puzzle_difficulty,
            params.client_identity,
        ) {
            logging::debug!(self.log, "puzzle solution refused"; "error" => ?error);
            self.send_connect_reject(&params.nonce, &params.server_nonce, address, "Puzzle");
            return;
        }

        if stream.read_flag() {
            let private = match self.private_key.clone() {
                Some(private) => private,
                None => return,
            };
            let mut peer_key = [0u8; crypto::EXCHANGE_KEY_SIZE];
            stream.read_bytes(&mut peer_key);
            if stream.was_error() {
                return;
            }
            stream.align_byte();
            let decrypt_pos = stream.byte_position();
            let shared = match private.shared_secret(&peer_key) {
                Some(shared) => shared,
                None => return,
            };
            if !bitstream::decrypt_and_check_hash(
                stream,
                decrypt_pos,
                PacketType::ConnectRequest as u64,
                &shared,
            ) {
                return;
            }
            stream.read_bytes(&mut params.symmetric_key);
            crypto::random_bytes(&mut params.init_vector);
            params.public_key = Some(peer_key);
            params.private_key = Some(private);
            params.shared_secret = Some(shared);
            params.using_crypto = true;
        } else if self.requires_key_exchange {
            return;
        }

        params.debug_object_sizes = stream.read_flag();
        let connect_sequence = stream.read_int(32);
        let type_identifier = stream.read_int(32);
        if stream.was_error() || type_identifier != self.connection_type_identifier {
            return;
        }
        logging::debug!(self.log, "received connect request";
                        "address" => %address,
                        "identity" => params.client_identity);

        if let Some(existing_slot) = existing {
            self.terminate(existing_slot, TerminationReason::SelfDisconnect, "NewConnection");
        }

        let mut conn = GhostConnection::new(self.registry.clone(), self.group, false, &self.log);
        conn.net_mut().set_address(*address);
        let using_crypto = params.using_crypto;
        let session_key = params.session_key();
        let reject_nonce = params.nonce;
        let reject_server_nonce = params.server_nonce;
        *conn.net_mut().params_mut() = params;
        conn.net_mut().set_initial_recv_sequence(connect_sequence);
        if using_crypto {
            conn.net_mut().set_symmetric_cipher(session_key);
        }

        if let Err(reason) = conn.read_connect_request(stream) {
            self.send_connect_reject(&reject_nonce, &reject_server_nonce, address, &reason);
            return;
        }
        if let Err(reason) = self.delegate.read_connect_request(address, stream) {
            self.send_connect_reject(&reject_nonce, &reject_server_nonce, address, &reason);
            return;
        }
        if stream.was_error() {
            return;
        }

        let now = self.process_start_time;
        let slot = self.alloc_slot(conn);
        self.add_connection(slot);
        self.connections[slot]
            .as_mut()
            .expect("fresh slot")
            .net_mut()
            .set_established(now);
        self.events_out
            .push(ConnectionEvent::ConnectionEstablished(ConnectionId(slot)));
        self.send_connect_accept(slot);
    }

    fn send_connect_accept(&mut self, slot: usize) {
        logging::debug!(self.log, "sending connect accept"; "slot" => slot);
        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::ConnectAccept as u32, 8);

        let (address, crypto_parts) = {
            let conn = match self.connections[slot].as_mut() {
                Some(conn) => conn,
                None => return,
            };
            let address = *conn.net().address();
            {
                let params = conn.net().params();
                params.nonce.write(&mut out);
                params.server_nonce.write(&mut out);
            }
            out.align_byte();
            let encrypt_pos = out.byte_position();
            out.write_int(conn.net().initial_send_sequence(), 32);
            conn.write_connect_accept(&mut out);
            let params = conn.net().params();
            let crypto_parts = if params.using_crypto {
                Some((
                    encrypt_pos,
                    params.init_vector,
                    params.handshake_key().expect("crypto requires secret"),
                ))
            } else {
                None
            };
            (address, crypto_parts)
        };

        self.delegate.write_connect_accept(&mut out);

        if let Some((encrypt_pos, init_vector, key)) = crypto_parts {
            out.write_bytes(&init_vector);
            bitstream::hash_and_encrypt(
                &mut out,
                encrypt_pos,
                PacketType::ConnectAccept as u64,
                &key,
            );
        }
        let bytes = out.bytes().to_vec();
        self.send_bytes(&address, &bytes);
    }

    fn handle_connect_accept(&mut self, address: &Address, stream: &mut BitStream) {
        let the_nonce = Nonce::read(stream);
        let server_nonce = Nonce::read(stream);
        if stream.was_error() {
            return;
        }

        let slot = match self.find_pending(address) {
            Some(slot) => slot,
            None => return,
        };
        {
            let conn = self.connections[slot].as_ref().expect("pending slot");
            if conn.state() != ConnectionState::AwaitingConnectResponse {
                return;
            }
            let params = conn.net().params();
            if params.nonce != the_nonce || params.server_nonce != server_nonce {
                return;
            }
        }

        stream.align_byte();
        let decrypt_pos = stream.byte_position();
        let result = {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            if conn.net().params().using_crypto {
                let key = conn.net().params().handshake_key().expect("crypto set");
                if !bitstream::decrypt_and_check_hash(
                    stream,
                    decrypt_pos,
                    PacketType::ConnectAccept as u64,
                    &key,
                ) {
                    return;
                }
            }
            let recv_sequence = stream.read_int(32);
            conn.net_mut().set_initial_recv_sequence(recv_sequence);
            conn.read_connect_accept(stream)
        };
        if let Err(reason) = result {
            self.events_out.push(ConnectionEvent::ConnectTerminated(
                ConnectionId(slot),
                TerminationReason::Error,
                reason,
            ));
            self.remove_pending(slot);
            self.free_slot(slot);
            return;
        }
        if let Err(reason) = self.delegate.read_connect_accept(stream) {
            self.events_out.push(ConnectionEvent::ConnectTerminated(
                ConnectionId(slot),
                TerminationReason::Error,
                reason,
            ));
            self.remove_pending(slot);
            self.free_slot(slot);
            return;
        }
        if stream.was_error() {
            return;
        }

        {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            if conn.net().params().using_crypto {
                let mut init_vector = [0u8; crypto::KEY_SIZE];
                stream.read_bytes(&mut init_vector);
                if stream.was_error() {
                    return;
                }
                conn.net_mut().params_mut().init_vector = init_vector;
                let session_key = conn.net().params().session_key();
                conn.net_mut().set_symmetric_cipher(session_key);
            }
        }

        let now = self.process_start_time;
        self.remove_pending(slot);
        self.add_connection(slot);
        self.connections[slot]
            .as_mut()
            .expect("slot")
            .net_mut()
            .set_established(now);
        logging::debug!(self.log, "received connect accept - connection established";
                        "address" => %address);
        self.events_out
            .push(ConnectionEvent::ConnectionEstablished(ConnectionId(slot)));
    }

    // -- handshake: rejection and disconnect ---------------------------------

    fn send_connect_reject(
        &mut self,
        client_nonce: &Nonce,
        server_nonce: &Nonce,
        address: &Address,
        reason: &str,
    ) {
        if reason.is_empty() {
            // an empty reason rejects silently
            return;
        }
        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::ConnectReject as u32, 8);
        client_nonce.write(&mut out);
        server_nonce.write(&mut out);
        out.write_string(reason);
        let bytes = out.bytes().to_vec();
        self.send_bytes(address, &bytes);
    }

    fn handle_connect_reject(&mut self, address: &Address, stream: &mut BitStream) {
        let the_nonce = Nonce::read(stream);
        let server_nonce = Nonce::read(stream);

        let slot = match self.find_pending(address) {
            Some(slot) => slot,
            None => return,
        };
        {
            let conn = self.connections[slot].as_ref().expect("pending slot");
            let state = conn.state();
            if state != ConnectionState::AwaitingChallengeResponse
                && state != ConnectionState::AwaitingConnectResponse
            {
                return;
            }
            let params = conn.net().params();
            if params.nonce != the_nonce || params.server_nonce != server_nonce {
                return;
            }
        }

        let reason = stream.read_string();
        if stream.was_error() {
            return;
        }
        logging::debug!(self.log, "received connect reject"; "reason" => &reason);

        // a stale puzzle solution earns one retry with a fresh nonce
        let retry = {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            let params = conn.net_mut().params_mut();
            if reason == "Puzzle" && !params.puzzle_retried {
                params.puzzle_retried = true;
                params.nonce = Nonce::random();
                true
            } else {
                false
            }
        };
        if retry {
            let conn = self.connections[slot].as_mut().expect("pending slot");
            conn.net_mut().set_state(ConnectionState::AwaitingChallengeResponse);
            conn.net_mut().connect_send_count = 0;
            self.send_connect_challenge_request(slot);
            return;
        }

        if let Some(conn) = self.connections[slot].as_mut() {
            conn.net_mut().set_state(ConnectionState::Rejected);
        }
        self.events_out.push(ConnectionEvent::ConnectTerminated(
            ConnectionId(slot),
            TerminationReason::RemoteHostRejected,
            reason,
        ));
        self.remove_pending(slot);
        self.free_slot(slot);
    }

    fn handle_disconnect(&mut self, address: &Address, stream: &mut BitStream) {
        let slot = match self.find_connection(address) {
            Some(slot) => slot,
            None => return,
        };
        let the_nonce = Nonce::read(stream);
        let server_nonce = Nonce::read(stream);
        {
            let conn = self.connections[slot].as_ref().expect("active slot");
            let params = conn.net().params();
            if params.nonce != the_nonce || params.server_nonce != server_nonce {
                return;
            }
        }
        stream.align_byte();
        let decrypt_pos = stream.byte_position();
        {
            let conn = self.connections[slot].as_ref().expect("active slot");
            if conn.net().params().using_crypto {
                let key = conn.net().params().handshake_key().expect("crypto set");
                if !bitstream::decrypt_and_check_hash(
                    stream,
                    decrypt_pos,
                    PacketType::Disconnect as u64,
                    &key,
                ) {
                    return;
                }
            }
        }
        let reason = stream.read_string();

        if let Some(conn) = self.connections[slot].as_mut() {
            conn.net_mut().set_state(ConnectionState::Disconnected);
        }
        self.events_out.push(ConnectionEvent::ConnectionTerminated(
            ConnectionId(slot),
            TerminationReason::RemoteDisconnect,
            reason,
        ));
        self.remove_connection_from_table(slot);
        self.active.retain(|&s| s != slot);
        self.free_slot(slot);
    }

    /// Tears a connection down. Active connections get a best-effort disconnect
    /// packet; `emit` is false only for self-disconnects, which fire no callbacks.
    fn terminate(&mut self, slot: usize, reason: TerminationReason, reason_string: &str) {
        let state = match self.connections[slot].as_ref() {
            Some(conn) => conn.state(),
            None => return,
        };
        match state {
            ConnectionState::AwaitingChallengeResponse
            | ConnectionState::ComputingPuzzleSolution
            | ConnectionState::AwaitingConnectResponse
            | ConnectionState::SendingPunchPackets => {
                if reason != TerminationReason::SelfDisconnect {
                    self.events_out.push(ConnectionEvent::ConnectTerminated(
                        ConnectionId(slot),
                        reason,
                        reason_string.to_owned(),
                    ));
                }
                self.remove_pending(slot);
                self.free_slot(slot);
            }
            ConnectionState::Connected => {
                self.send_disconnect_packet(slot, reason_string);
                if let Some(conn) = self.connections[slot].as_mut() {
                    conn.net_mut().set_state(ConnectionState::Disconnected);
                }
                if reason != TerminationReason::SelfDisconnect {
                    self.events_out.push(ConnectionEvent::ConnectionTerminated(
                        ConnectionId(slot),
                        reason,
                        reason_string.to_owned(),
                    ));
                }
                self.remove_connection_from_table(slot);
                self.active.retain(|&s| s != slot);
                self.free_slot(slot);
            }
            _ => {
                self.remove_pending(slot);
                self.active.retain(|&s| s != slot);
                self.free_slot(slot);
            }
        }
    }

    fn send_disconnect_packet(&mut self, slot: usize, reason: &str) {
        let (address, crypto_parts, mut out) = {
            let conn = match self.connections[slot].as_ref() {
                Some(conn) => conn,
                None => return,
            };
            let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
            out.write_int(PacketType::Disconnect as u32, 8);
            let params = conn.net().params();
            params.nonce.write(&mut out);
            params.server_nonce.write(&mut out);
            out.align_byte();
            let encrypt_pos = out.byte_position();
            out.write_string(reason);
            let crypto_parts = if params.using_crypto {
                params.handshake_key().map(|key| (encrypt_pos, key))
            } else {
                None
            };
            (*conn.net().address(), crypto_parts, out)
        };
        if let Some((encrypt_pos, key)) = crypto_parts {
            bitstream::hash_and_encrypt(
                &mut out,
                encrypt_pos,
                PacketType::Disconnect as u64,
                &key,
            );
        }
        let bytes = out.bytes().to_vec();
        self.send_bytes(&address, &bytes);
    }

    // -- arranged connections ------------------------------------------------

    fn send_punch_packets(&mut self, slot: usize) {
        let now = self.process_start_time;
        let (is_initiator, nonce, server_nonce, request_key_exchange, request_certificate) = {
            let conn = match self.connections[slot].as_ref() {
                Some(conn) => conn,
                None => return,
            };
            let params = conn.net().params();
            (
                params.is_initiator,
                params.nonce,
                params.server_nonce,
                params.request_key_exchange,
                params.request_certificate,
            )
        };

        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::Punch as u32, 8);
        if is_initiator {
            nonce.write(&mut out);
        } else {
            server_nonce.write(&mut out);
        }
        out.align_byte();
        let encrypt_pos = out.byte_position();
        if is_initiator {
            server_nonce.write(&mut out);
        } else {
            // the non-initiator side offers its credential for key exchange
            nonce.write(&mut out);
            let offer_key = self.private_key.is_some()
                && (self.requires_key_exchange || request_key_exchange);
            if out.write_flag(offer_key) {
                if out.write_flag(request_certificate && self.certificate.is_some()) {
                    self.certificate
                        .as_ref()
                        .expect("flag checked")
                        .write(&mut out);
                } else {
                    out.write_bytes(
                        self.private_key.as_ref().expect("flag checked").public_key(),
                    );
                }
            }
        }

        let (addresses, arranged_key) = {
            let conn = self.connections[slot].as_mut().expect("slot checked");
            conn.net_mut().connect_send_count += 1;
            conn.net_mut().connect_last_send_time = now;
            let params = conn.net().params();
            (params.possible_addresses.clone(), params.arranged_key())
        };
        bitstream::hash_and_encrypt(&mut out, encrypt_pos, PacketType::Punch as u64, &arranged_key);

        let bytes = out.bytes().to_vec();
        for address in &addresses {
            logging::debug!(self.log, "sending punch packet"; "address" => %address);
            self.send_bytes(address, &bytes);
        }
    }

    fn handle_punch(&mut self, address: &Address, stream: &mut BitStream) {
        let first_nonce = Nonce::read(stream);
        if stream.was_error() {
            return;
        }
        logging::debug!(self.log, "received punch packet"; "address" => %address);

        // find a punching connection whose nonce pairing matches
        let mut matched = None;
        for &slot in &self.pending {
            let conn = match self.connections[slot].as_ref() {
                Some(conn) => conn,
                None => continue,
            };
            if conn.state() != ConnectionState::SendingPunchPackets {
                continue;
            }
            let params = conn.net().params();
            let expected = if params.is_initiator {
                params.server_nonce
            } else {
                params.nonce
            };
            if first_nonce != expected {
                continue;
            }

            let exact = params
                .possible_addresses
                .iter()
                .any(|candidate| candidate == address);
            if exact {
                if params.is_initiator {
                    matched = Some(slot);
                    break;
                }
                continue;
            }
            // a NAT rewrote the port; accept the observed address if the host matches
            let partial = params
                .possible_addresses
                .iter()
                .any(|candidate| candidate.same_host(address));
            if !partial {
                continue;
            }
            let conn = self.connections[slot].as_mut().expect("slot");
            let params = conn.net_mut().params_mut();
            if params.possible_addresses.len() < MAX_POSSIBLE_ADDRESSES {
                params.possible_addresses.push(*address);
            }
            if params.is_initiator {
                matched = Some(slot);
                break;
            }
        }
        let slot = match matched {
            Some(slot) => slot,
            None => return,
        };

        stream.align_byte();
        let decrypt_pos = stream.byte_position();
        {
            let conn = self.connections[slot].as_ref().expect("slot");
            let arranged_key = conn.net().params().arranged_key();
            if !bitstream::decrypt_and_check_hash(
                stream,
                decrypt_pos,
                PacketType::Punch as u64,
                &arranged_key,
            ) {
                return;
            }
        }

        let next_nonce = Nonce::read(stream);
        {
            let conn = self.connections[slot].as_ref().expect("slot");
            if next_nonce != conn.net().params().nonce {
                return;
            }
        }

        // the host's punch may carry its credential for key exchange
        if stream.read_flag() {
            let mut public_key = None;
            if stream.read_flag() {
                let cert = Certificate::read(stream);
                if stream.was_error() || !cert.is_valid() {
                    return;
                }
                public_key = Some(cert.public_key);
                let conn = self.connections[slot].as_mut().expect("slot");
                conn.net_mut().params_mut().certificate = Some(cert);
            } else {
                let mut key = [0u8; crypto::EXCHANGE_KEY_SIZE];
                stream.read_bytes(&mut key);
                if stream.was_error() {
                    return;
                }
                public_key = Some(key);
            }
            let private = self
                .private_key
                .clone()
                .unwrap_or_else(AsymmetricKey::generate);
            let peer_key = public_key.expect("set above");
            let shared = match private.shared_secret(&peer_key) {
                Some(shared) => shared,
                None => return,
            };
            let conn = self.connections[slot].as_mut().expect("slot");
            let params = conn.net_mut().params_mut();
            params.public_key = Some(peer_key);
            params.private_key = Some(private);
            params.shared_secret = Some(shared);
            crypto::random_bytes(&mut params.symmetric_key);
            params.using_crypto = true;
        }
        if stream.was_error() {
            return;
        }

        logging::debug!(self.log, "punch matched nonces - connecting"; "address" => %address);
        let now = self.process_start_time;
        {
            let conn = self.connections[slot].as_mut().expect("slot");
            conn.net_mut().set_address(*address);
            conn.net_mut().set_state(ConnectionState::AwaitingConnectResponse);
            conn.net_mut().connect_send_count = 0;
            conn.net_mut().connect_last_send_time = now;
        }
        self.send_arranged_connect_request(slot);
    }

    fn send_arranged_connect_request(&mut self, slot: usize) {
        logging::debug!(self.log, "sending arranged connect request"; "slot" => slot);
        let now = self.process_start_time;
        let mut out = BitStream::packet(MAX_PACKET_DATA_SIZE);
        out.write_int(PacketType::ArrangedConnectRequest as u32, 8);

        let (address, inner_key, inner_pos, arranged_key, encrypt_pos) = {
            let conn = match self.connections[slot].as_mut() {
                Some(conn) => conn,
                None => return,
            };
            let address = *conn.net().address();
            conn.net().params().nonce.write(&mut out);
            out.align_byte();
            let encrypt_pos = out.byte_position();
            conn.net().params().server_nonce.write(&mut out);

            let mut inner_pos = 0usize;
            if out.write_flag(conn.net().params().using_crypto) {
                let params = conn.net().params();
                out.write_bytes(
                    params
                        .private_key
                        .as_ref()
                        .expect("crypto params set")
                        .public_key(),
                );
                out.align_byte();
                inner_pos = out.byte_position();
                out.write_bytes(&params.symmetric_key);
            }
            out.write_flag(conn.net().params().debug_object_sizes);
            out.write_int(conn.net().initial_send_sequence(), 32);
            conn.write_connect_request(&mut out);

            conn.net_mut().connect_send_count += 1;
            conn.net_mut().connect_last_send_time = now;
            (
                address,
                conn.net().params().handshake_key(),
                inner_pos,
                conn.net().params().arranged_key(),
                encrypt_pos,
            )
        };

        self.delegate.write_connect_request(&mut out);

        if inner_pos > 0 {
            let key = inner_key.expect("crypto requires shared secret");
            bitstream::hash_and_encrypt(
                &mut out,
                inner_pos,
                PacketType::ArrangedConnectRequest as u64,
                &key,
            );
        }
        bitstream::hash_and_encrypt(
            &mut out,
            encrypt_pos,
            PacketType::ArrangedConnectRequest as u64,
            &arranged_key,
        );
        let bytes = out.bytes().to_vec();
        self.send_bytes(&address, &bytes);
    }

    fn handle_arranged_connect_request(&mut self, address: &Address, stream: &mut BitStream) {
        let the_nonce = Nonce::read(stream);
        if stream.was_error() {
            return;
        }

        // a live connection with the same nonce lost our accept; resend it
        let existing = self.find_connection(address);
        if let Some(existing_slot) = existing {
            let conn = self.connections[existing_slot].as_ref().expect("active");
            if conn.net().params().nonce == the_nonce {
                self.send_connect_accept(existing_slot);
                return;
            }
        }

        let mut matched = None;
        for &slot in &self.pending {
            let conn = match self.connections[slot].as_ref() {
                Some(conn) => conn,
                None => continue,
            };
            if conn.state() != ConnectionState::SendingPunchPackets
                || conn.net().params().is_initiator
            {
                continue;
            }
            let params = conn.net().params();
            if the_nonce != params.nonce {
                continue;
            }
            if params
                .possible_addresses
                .iter()
                .any(|candidate| candidate.same_host(address))
            {
                matched = Some(slot);
                break;
            }
        }
        let slot = match matched {
            Some(slot) => slot,
            None => return,
        };

        stream.align_byte();
        let outer_pos = stream.byte_position();
        {
            let conn = self.connections[slot].as_ref().expect("slot");
            let arranged_key = conn.net().params().arranged_key();
            if !bitstream::decrypt_and_check_hash(
                stream,
                outer_pos,
                PacketType::ArrangedConnectRequest as u64,
                &arranged_key,
            ) {
                return;
            }
        }

        let server_nonce = Nonce::read(stream);
        {
            let conn = self.connections[slot].as_ref().expect("slot");
            if server_nonce != conn.net().params().server_nonce {
                return;
            }
        }

        if stream.read_flag() {
            let private = match self.private_key.clone() {
                Some(private) => private,
                None => return,
            };
            let mut peer_key = [0u8; crypto::EXCHANGE_KEY_SIZE];
            stream.read_bytes(&mut peer_key);
            if stream.was_error() {
                return;
            }
            stream.align_byte();
            let inner_pos = stream.byte_position();
            let shared = match private.shared_secret(&peer_key) {
                Some(shared) => shared,
                None => return,
            };
            if !bitstream::decrypt_and_check_hash(
                stream,
                inner_pos,
                PacketType::ArrangedConnectRequest as u64,
                &shared,
            ) {
                return;
            }
            let conn = self.connections[slot].as_mut().expect("slot");
            let params = conn.net_mut().params_mut();
            stream.read_bytes(&mut params.symmetric_key);
            crypto::random_bytes(&mut params.init_vector);
            params.public_key = Some(peer_key);
            params.private_key = Some(private);
            params.shared_secret = Some(shared);
            params.using_crypto = true;
        }

        let debug_object_sizes = stream.read_flag();
        let connect_sequence = stream.read_int(32);
        if stream.was_error() {
            return;
        }
        logging::debug!(self.log, "received arranged connect request"; "address" => %address);

        if let Some(existing_slot) = existing {
            self.terminate(existing_slot, TerminationReason::SelfDisconnect, "");
        }

        let (reject_nonce, reject_server_nonce, result) = {
            let conn = self.connections[slot].as_mut().expect("slot");
            conn.net_mut().set_address(*address);
            conn.net_mut().params_mut().debug_object_sizes = debug_object_sizes;
            conn.net_mut().set_initial_recv_sequence(connect_sequence);
            if conn.net().params().using_crypto {
                let session_key = conn.net().params().session_key();
                conn.net_mut().set_symmetric_cipher(session_key);
            }
            let params = conn.net().params();
            let nonces = (params.nonce, params.server_nonce);
            let result = conn.read_connect_request(stream);
            (nonces.0, nonces.1, result)
        };
        if let Err(reason) = result {
            self.send_connect_reject(&reject_nonce, &reject_server_nonce, address, &reason);
            self.remove_pending(slot);
            self.free_slot(slot);
            return;
        }
        if let Err(reason) = self.delegate.read_connect_request(address, stream) {
            self.send_connect_reject(&reject_nonce, &reject_server_nonce, address, &reason);
            self.remove_pending(slot);
            self.free_slot(slot);
            return;
        }

        let now = self.process_start_time;
        self.remove_pending(slot);
        self.add_connection(slot);
        self.connections[slot]
            .as_mut()
            .expect("slot")
            .net_mut()
            .set_established(now);
        self.events_out
            .push(ConnectionEvent::ConnectionEstablished(ConnectionId(slot)));
        self.send_connect_accept(slot);
    }

    // -- transmission --------------------------------------------------------

    /// Sends a raw stream to an address over this interface's socket, honoring the
    /// latency and loss simulation. Used for application info packets as well.
    pub fn send_to(&mut self, address: &Address, stream: &BitStream) {
        let bytes = stream.bytes().to_vec();
        self.send_bytes(address, &bytes);
    }

    fn send_bytes(&mut self, address: &Address, data: &[u8]) {
        if self.simulated_packet_loss > 0.0 {
            let roll = crypto::random_u32() as f32 / u32::MAX as f32;
            if roll < self.simulated_packet_loss {
                logging::trace!(self.log, "simulated packet loss"; "address" => %address);
                return;
            }
        }
        if self.simulated_latency > 0 {
            self.delayed.push(DelayedPacket {
                send_time: self.process_start_time + self.simulated_latency,
                address: *address,
                data: data.to_vec(),
            });
            return;
        }
        if let Err(err) = self.socket.send_to(address, data) {
            // transport errors are logged; the connection keeps running
            logging::warn!(self.log, "socket send failed";
                           "address" => %address,
                           "error" => ?err);
        }
    }

    // -- connection bookkeeping ----------------------------------------------

    fn alloc_slot(&mut self, conn: GhostConnection) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.connections[slot] = Some(conn);
                slot
            }
            None => {
                self.connections.push(Some(conn));
                self.connections.len() - 1
            }
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.connections[slot] = None;
        self.free_slots.push(slot);
    }

    fn conn_address(&self, slot: usize) -> Address {
        *self.connections[slot]
            .as_ref()
            .expect("slot holds connection")
            .net()
            .address()
    }

    fn find_pending(&self, address: &Address) -> Option<usize> {
        self.pending
            .iter()
            .copied()
            .find(|&slot| self.conn_address(slot) == *address)
    }

    fn remove_pending(&mut self, slot: usize) {
        self.pending.retain(|&s| s != slot);
    }

    fn find_and_remove_pending(&mut self, address: &Address) {
        if let Some(slot) = self.find_pending(address) {
            self.remove_pending(slot);
            self.free_slot(slot);
        }
    }

    /// Moves a connection into the active list and the address hash table, growing
    /// the table once its load factor passes one half.
    fn add_connection(&mut self, slot: usize) {
        self.active.push(slot);
        if self.active.len() > self.address_table.len() / 2 {
            let new_size = self.active.len() * 4 - 1;
            self.address_table = vec![None; new_size];
            for s in self.active.clone() {
                let address = self.conn_address(s);
                self.hash_insert(s, &address);
            }
        } else {
            let address = self.conn_address(slot);
            self.hash_insert(slot, &address);
        }
    }

    fn hash_insert(&mut self, slot: usize, address: &Address) {
        let table_len = self.address_table.len();
        let mut index = address.table_hash() as usize % table_len;
        while self.address_table[index].is_some() {
            index += 1;
            if index >= table_len {
                index = 0;
            }
        }
        self.address_table[index] = Some(slot);
    }

    /// Looks up the connection bound to an address: open addressing with linear
    /// probing, stopping at the first empty slot.
    fn find_connection(&self, address: &Address) -> Option<usize> {
        let table_len = self.address_table.len();
        let mut index = address.table_hash() as usize % table_len;
        while let Some(slot) = self.address_table[index] {
            if self.conn_address(slot) == *address {
                return Some(slot);
            }
            index += 1;
            if index >= table_len {
                index = 0;
            }
        }
        None
    }

    /// Removes a connection from the hash table, rehashing the probe run after it
    /// so later lookups still terminate correctly at empty slots.
    fn remove_connection_from_table(&mut self, slot: usize) {
        let table_len = self.address_table.len();
        let address = self.conn_address(slot);
        let mut index = address.table_hash() as usize % table_len;
        let start = index;
        while self.address_table[index] != Some(slot) {
            index += 1;
            if index >= table_len {
                index = 0;
            }
            if index == start {
                return;
            }
        }
        self.address_table[index] = None;

        loop {
            index += 1;
            if index >= table_len {
                index = 0;
            }
            let other = match self.address_table[index] {
                Some(other) => other,
                None => break,
            };
            self.address_table[index] = None;
            let other_address = self.conn_address(other);
            self.hash_insert(other, &other_address);
        }
    }
}

impl Drop for NetInterface {
    /// Gracefully closes every active connection with a best-effort disconnect.
    fn drop(&mut self) {
        for slot in self.active.clone() {
            self.send_disconnect_packet(slot, "Shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitStream;
    use crate::event::{NetEvent};
    use crate::ghost::{GhostConnection, ScopeQuery};
    use crate::object::{NetObject, NetObjectHandle};
    use crate::registry::{ClassRegistryBuilder, CLASS_GROUP_GAME, CLASS_GROUP_GAME_MASK};
    use crate::stringtable::{StringTableRead, StringTableWrite};
    use std::cell::RefCell;
    use std::thread;
    use std::time::Duration;

    thread_local! {
        static PROCESSED: RefCell<Vec<String>> = RefCell::new(Vec::new());
        static INFO_PACKETS: RefCell<Vec<(u8, u32)>> = RefCell::new(Vec::new());
        static GHOST_VALUES: RefCell<Vec<u32>> = RefCell::new(Vec::new());
    }

    struct PingEvent {
        message: String,
    }

    impl NetEvent for PingEvent {
        fn class_name(&self) -> &'static str {
            "PingEvent"
        }
        fn pack(&self, stream: &mut BitStream, _strings: &mut StringTableWrite) {
            stream.write_string(&self.message);
        }
        fn unpack(&mut self, stream: &mut BitStream, _strings: &mut StringTableRead) {
            self.message = stream.read_string();
        }
        fn process(&mut self, _conn: &mut GhostConnection) {
            PROCESSED.with(|log| log.borrow_mut().push(self.message.clone()));
        }
    }

    fn ping_ctor() -> Box<dyn NetEvent> {
        Box::new(PingEvent {
            message: String::new(),
        })
    }

    struct CounterObject {
        value: u32,
    }

    impl NetObject for CounterObject {
        fn class_name(&self) -> &'static str {
            "CounterObject"
        }
        fn pack_update(&mut self, mask: u32, stream: &mut BitStream) -> u32 {
            if stream.write_flag(mask & 1 != 0) {
                stream.write_int(self.value, 32);
            }
            0
        }
        fn unpack_update(&mut self, stream: &mut BitStream, _initial_update: bool) {
            if stream.read_flag() {
                self.value = stream.read_int(32);
                GHOST_VALUES.with(|log| log.borrow_mut().push(self.value));
            }
        }
    }

    fn counter_ctor() -> NetObjectHandle {
        Rc::new(RefCell::new(CounterObject { value: 0 }))
    }

    struct EveryoneScope {
        visible: RefCell<Vec<NetObjectHandle>>,
    }

    impl NetObject for EveryoneScope {
        fn class_name(&self) -> &'static str {
            "EveryoneScope"
        }
        fn pack_update(&mut self, _mask: u32, _stream: &mut BitStream) -> u32 {
            0
        }
        fn unpack_update(&mut self, _stream: &mut BitStream, _initial_update: bool) {}
        fn perform_scope_query(&self, query: &mut ScopeQuery) {
            for object in self.visible.borrow().iter() {
                query.object_in_scope(object);
            }
        }
    }

    fn build_registry() -> Rc<ClassRegistry> {
        let mut builder = ClassRegistryBuilder::new();
        builder
            .register_event("PingEvent", CLASS_GROUP_GAME_MASK, 0, ping_ctor)
            .register_object("CounterObject", CLASS_GROUP_GAME_MASK, 0, counter_ctor);
        builder.freeze()
    }

    fn make_interface(registry: &Rc<ClassRegistry>) -> NetInterface {
        NetInterface::new(
            &Address::localhost(0),
            registry.clone(),
            CLASS_GROUP_GAME,
            None,
        )
        .expect("loopback bind")
    }

    fn reset_logs() {
        PROCESSED.with(|log| log.borrow_mut().clear());
        INFO_PACKETS.with(|log| log.borrow_mut().clear());
        GHOST_VALUES.with(|log| log.borrow_mut().clear());
    }

    /// Ticks both interfaces until the handshake completes on both sides.
    fn establish(client: &mut NetInterface, server: &mut NetInterface) -> (ConnectionId, ConnectionId) {
        let server_address = *server.bound_address();
        let client_id = client.connect(&server_address);

        let mut client_established = None;
        let mut server_established = None;
        for _ in 0..4000 {
            client.process_socket();
            client.process_connections();
            server.process_socket();
            server.process_connections();

            for event in client.poll_events() {
                if let ConnectionEvent::ConnectionEstablished(id) = event {
                    client_established = Some(id);
                }
            }
            for event in server.poll_events() {
                if let ConnectionEvent::ConnectionEstablished(id) = event {
                    server_established = Some(id);
                }
            }
            if client_established.is_some() && server_established.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let client_id_established = client_established.expect("client never established");
        assert_eq!(client_id_established, client_id);
        (client_id, server_established.expect("server never established"))
    }

    #[test]
    fn test_handshake_no_crypto() {
        reset_logs();
        let registry = build_registry();
        let mut server = make_interface(&registry);
        let mut client = make_interface(&registry);

        let (client_id, server_id) = establish(&mut client, &mut server);
        assert_eq!(
            client.connection(client_id).unwrap().state(),
            ConnectionState::Connected
        );
        assert_eq!(
            server.connection(server_id).unwrap().state(),
            ConnectionState::Connected
        );
        assert!(!client.connection(client_id).unwrap().net().params().using_crypto);
    }

    #[test]
    fn test_handshake_with_key_exchange_and_event() {
        reset_logs();
        let registry = build_registry();
        let mut server = make_interface(&registry);
        server.set_private_key(AsymmetricKey::generate());
        server.set_requires_key_exchange(true);
        let mut client = make_interface(&registry);
        client.set_requires_key_exchange(true);

        let (client_id, _server_id) = establish(&mut client, &mut server);
        assert!(client.connection(client_id).unwrap().net().params().using_crypto);

        client
            .connection_mut(client_id)
            .unwrap()
            .post_event(Rc::new(PingEvent {
                message: "over encrypted link".to_owned(),
            }));

        for _ in 0..500 {
            client.process_socket();
            client.process_connections();
            server.process_socket();
            server.process_connections();
            if !PROCESSED.with(|log| log.borrow().is_empty()) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(
            PROCESSED.with(|log| log.borrow().clone()),
            vec!["over encrypted link"]
        );
    }

    #[test]
    fn test_puzzle_reject_earns_one_retry_with_fresh_nonce() {
        reset_logs();
        let registry = build_registry();
        let mut client = make_interface(&registry);
        // a bound-but-silent peer, so nothing answers the challenge
        let sink = crate::socket::Socket::bind(&Address::localhost(0)).unwrap();
        let target = *sink.bound_address();

        let id = client.connect(&target);
        let (first_nonce, server_nonce) = {
            let params = client.connection(id).unwrap().net().params();
            (params.nonce, params.server_nonce)
        };

        let mut reject = BitStream::packet(64);
        reject.write_int(PacketType::ConnectReject as u32, 8);
        first_nonce.write(&mut reject);
        server_nonce.write(&mut reject);
        reject.write_string("Puzzle");
        client.process_packet(&target, reject.bytes());

        // first "Puzzle" reject restarts the challenge with a regenerated nonce
        let second_nonce = {
            let conn = client.connection(id).expect("still pending");
            assert_eq!(conn.state(), ConnectionState::AwaitingChallengeResponse);
            assert!(conn.net().params().puzzle_retried);
            assert_ne!(conn.net().params().nonce, first_nonce);
            conn.net().params().nonce
        };

        // a second one terminates the attempt
        let mut reject = BitStream::packet(64);
        reject.write_int(PacketType::ConnectReject as u32, 8);
        second_nonce.write(&mut reject);
        server_nonce.write(&mut reject);
        reject.write_string("Puzzle");
        client.process_packet(&target, reject.bytes());

        assert!(client.connection(id).is_none());
        let events: Vec<ConnectionEvent> = client.poll_events().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::ConnectTerminated(
                event_id,
                TerminationReason::RemoteHostRejected,
                reason
            ) if *event_id == id && reason == "Puzzle"
        )));
    }

    #[test]
    fn test_closed_interface_ignores_challenges() {
        reset_logs();
        let registry = build_registry();
        let mut server = make_interface(&registry);
        server.set_allows_connections(false);
        let mut client = make_interface(&registry);

        let server_address = *server.bound_address();
        let id = client.connect(&server_address);
        for _ in 0..50 {
            client.process_socket();
            client.process_connections();
            server.process_socket();
            server.process_connections();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(server.poll_events().next().is_none());
        assert_eq!(
            client.connection(id).unwrap().state(),
            ConnectionState::AwaitingChallengeResponse
        );
    }

    struct RecordingDelegate;

    impl InterfaceDelegate for RecordingDelegate {
        fn handle_info_packet(
            &mut self,
            _address: &Address,
            packet_type: u8,
            stream: &mut BitStream,
        ) {
            let value = stream.read_int(32);
            INFO_PACKETS.with(|log| log.borrow_mut().push((packet_type, value)));
        }
    }

    #[test]
    fn test_info_packets_route_to_delegate() {
        reset_logs();
        let registry = build_registry();
        let mut interface = make_interface(&registry);
        interface.set_delegate(Box::new(RecordingDelegate));

        let mut out = BitStream::packet(64);
        out.write_int(u32::from(FIRST_VALID_INFO_PACKET_ID) + 3, 8);
        out.write_int(0xCAFE, 32);
        let source = Address::localhost(12345);
        interface.process_packet(&source, out.bytes());

        assert_eq!(
            INFO_PACKETS.with(|log| log.borrow().clone()),
            vec![(FIRST_VALID_INFO_PACKET_ID + 3, 0xCAFE)]
        );
    }

    #[test]
    fn test_disconnect_notifies_peer_only() {
        reset_logs();
        let registry = build_registry();
        let mut server = make_interface(&registry);
        let mut client = make_interface(&registry);
        let (client_id, server_id) = establish(&mut client, &mut server);

        client.disconnect(client_id, "Quit");
        assert!(client.connection(client_id).is_none());
        // self-disconnect produces no local callback
        assert!(client.poll_events().next().is_none());

        let mut remote_notice = None;
        for _ in 0..200 {
            server.process_socket();
            server.process_connections();
            for event in server.poll_events() {
                if let ConnectionEvent::ConnectionTerminated(id, reason, message) = event {
                    remote_notice = Some((id, reason, message));
                }
            }
            if remote_notice.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let (id, reason, message) = remote_notice.expect("peer never noticed");
        assert_eq!(id, server_id);
        assert_eq!(reason, TerminationReason::RemoteDisconnect);
        assert_eq!(message, "Quit");
        assert!(server.connection(server_id).is_none());
    }

    #[test]
    fn test_full_stack_ghosting() {
        reset_logs();
        let registry = build_registry();
        let mut server = make_interface(&registry);
        let mut client = make_interface(&registry);
        let (client_id, server_id) = establish(&mut client, &mut server);

        client
            .connection_mut(client_id)
            .unwrap()
            .set_ghost_to(true);

        let scope = Rc::new(RefCell::new(EveryoneScope {
            visible: RefCell::new(Vec::new()),
        }));
        let counter = Rc::new(RefCell::new(CounterObject { value: 7 }));
        let object: NetObjectHandle = counter.clone();
        scope.borrow().visible.borrow_mut().push(object.clone());
        {
            let conn = server.connection_mut(server_id).unwrap();
            conn.set_ghost_from(true);
            conn.set_scope_object(scope.clone());
            conn.activate_ghosting();
        }

        // drive until the initial state replicates
        for _ in 0..1000 {
            client.process_socket();
            client.process_connections();
            server.process_socket();
            server.process_connections();
            if GHOST_VALUES.with(|log| log.borrow().contains(&7)) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(GHOST_VALUES.with(|log| log.borrow().contains(&7)));

        // a state change marked dirty reaches the replica
        counter.borrow_mut().value = 99;
        server.set_mask_bits(&object, 1);
        for _ in 0..1000 {
            client.process_socket();
            client.process_connections();
            server.process_socket();
            server.process_connections();
            if GHOST_VALUES.with(|log| log.borrow().contains(&99)) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(GHOST_VALUES.with(|log| log.borrow().contains(&99)));
    }
}
