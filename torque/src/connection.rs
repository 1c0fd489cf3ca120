use crate::address::Address;
use crate::bitstream::{self, BitStream};
use crate::event::EventNote;
use crate::ghost::GhostRef;
use crate::stringtable::StringPacketEntry;
use crate::support::constants::*;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use quark::crypto;
use quark::logging::{self, Logger};
use std::collections::VecDeque;

/// Bits of the send sequence carried in the clear at the head of every data packet.
const SEQUENCE_BITS: u32 = 15;
const SEQUENCE_MASK: u32 = (1 << SEQUENCE_BITS) - 1;
/// Largest forward jump accepted when reconstructing a full sequence number from its
/// transmitted low bits. Anything further is a stale or forged packet.
const MAX_SEQUENCE_ADVANCE: u32 = 1 << 12;
/// Plaintext prefix of a data packet: marker flag + low sequence bits.
const DATA_HEADER_BYTES: usize = 2;
/// An idle connection forces a header-only packet at this interval so the peer's
/// timeout clock and ack state stay warm.
pub const KEEPALIVE_INTERVAL: u64 = 3000;
/// Default idle threshold before an established connection is considered dead.
pub const DEFAULT_IDLE_TIMEOUT: u64 = 30_000;

/// An 8-byte uniformly random value used as a liveness proof in the handshake.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Nonce(pub [u8; 8]);

impl Nonce {
    pub const SIZE: usize = 8;

    #[inline]
    pub fn random() -> Nonce {
        let mut data = [0u8; 8];
        crypto::random_bytes(&mut data);
        Nonce(data)
    }

    #[inline]
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_bytes(&self.0);
    }

    #[inline]
    pub fn read(stream: &mut BitStream) -> Nonce {
        let mut data = [0u8; 8];
        stream.read_bytes(&mut data);
        Nonce(data)
    }
}

/// An X25519 key pair used for the handshake key exchange.
#[derive(Clone)]
pub struct AsymmetricKey {
    secret: [u8; crypto::EXCHANGE_KEY_SIZE],
    public: [u8; crypto::EXCHANGE_KEY_SIZE],
}

impl AsymmetricKey {
    pub fn generate() -> AsymmetricKey {
        let (secret, public) = crypto::exchange_keypair();
        AsymmetricKey { secret, public }
    }

    #[inline]
    pub fn public_key(&self) -> &[u8; crypto::EXCHANGE_KEY_SIZE] {
        &self.public
    }

    /// Derives the shared secret with the holder of `peer_public`'s secret key.
    #[inline]
    pub fn shared_secret(
        &self,
        peer_public: &[u8; crypto::EXCHANGE_KEY_SIZE],
    ) -> Option<[u8; crypto::KEY_SIZE]> {
        crypto::exchange_shared_secret(&self.secret, peer_public)
    }
}

/// A public key signed by some authority, authenticating the host to initiators that
/// trust the signatory.
#[derive(Clone)]
pub struct Certificate {
    pub public_key: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub payload: Vec<u8>,
    pub signature: [u8; crypto::SIGNATURE_SIZE],
    pub signatory: [u8; crypto::SIGN_KEY_SIZE],
}

impl Certificate {
    const MAX_PAYLOAD: u32 = 512;

    /// Signs `public_key` and an application payload with the signatory's secret key.
    pub fn issue(
        public_key: [u8; crypto::EXCHANGE_KEY_SIZE],
        payload: Vec<u8>,
        signatory_secret: &[u8; crypto::SIGN_SECRET_KEY_SIZE],
        signatory: [u8; crypto::SIGN_KEY_SIZE],
    ) -> Certificate {
        let mut message = public_key.to_vec();
        message.extend_from_slice(&payload);
        let signature = crypto::sign_detached(&message, signatory_secret);
        Certificate {
            public_key,
            payload,
            signature,
            signatory,
        }
    }

    pub fn is_valid(&self) -> bool {
        let mut message = self.public_key.to_vec();
        message.extend_from_slice(&self.payload);
        crypto::sign_verify(&self.signature, &message, &self.signatory)
    }

    pub fn write(&self, stream: &mut BitStream) {
        stream.write_bytes(&self.public_key);
        stream.write_ranged_u32(self.payload.len() as u32, 0, Self::MAX_PAYLOAD);
        stream.write_bytes(&self.payload);
        stream.write_bytes(&self.signature);
        stream.write_bytes(&self.signatory);
    }

    pub fn read(stream: &mut BitStream) -> Certificate {
        let mut public_key = [0u8; crypto::EXCHANGE_KEY_SIZE];
        stream.read_bytes(&mut public_key);
        let len = stream.read_ranged_u32(0, Self::MAX_PAYLOAD) as usize;
        let mut payload = vec![0u8; len];
        stream.read_bytes(&mut payload);
        let mut signature = [0u8; crypto::SIGNATURE_SIZE];
        stream.read_bytes(&mut signature);
        let mut signatory = [0u8; crypto::SIGN_KEY_SIZE];
        stream.read_bytes(&mut signatory);
        Certificate {
            public_key,
            payload,
            signature,
            signatory,
        }
    }
}

/// Per-connection state negotiated during the handshake.
pub struct ConnectionParameters {
    pub nonce: Nonce,
    pub server_nonce: Nonce,
    pub client_identity: u32,
    pub puzzle_difficulty: u32,
    pub puzzle_solution: u32,
    pub puzzle_retried: bool,
    pub request_key_exchange: bool,
    pub request_certificate: bool,
    pub using_crypto: bool,
    pub public_key: Option<[u8; crypto::EXCHANGE_KEY_SIZE]>,
    pub private_key: Option<AsymmetricKey>,
    pub certificate: Option<Certificate>,
    pub shared_secret: Option<[u8; crypto::KEY_SIZE]>,
    pub symmetric_key: [u8; crypto::KEY_SIZE],
    pub init_vector: [u8; crypto::KEY_SIZE],
    pub debug_object_sizes: bool,
    pub is_initiator: bool,
    pub is_arranged: bool,
    pub arranged_secret: [u8; crypto::KEY_SIZE],
    pub possible_addresses: Vec<Address>,
}

impl ConnectionParameters {
    pub fn new(is_initiator: bool) -> ConnectionParameters {
        ConnectionParameters {
            nonce: Nonce::random(),
            server_nonce: Nonce::default(),
            client_identity: 0,
            puzzle_difficulty: 0,
            puzzle_solution: 0,
            puzzle_retried: false,
            request_key_exchange: false,
            request_certificate: false,
            using_crypto: false,
            public_key: None,
            private_key: None,
            certificate: None,
            shared_secret: None,
            symmetric_key: [0u8; crypto::KEY_SIZE],
            init_vector: [0u8; crypto::KEY_SIZE],
            debug_object_sizes: false,
            is_initiator,
            is_arranged: false,
            arranged_secret: [0u8; crypto::KEY_SIZE],
            possible_addresses: Vec::new(),
        }
    }

    /// The data-packet session key: the handshake shared secret folded with the
    /// initiator's symmetric key half and the host's init vector.
    pub fn session_key(&self) -> [u8; crypto::KEY_SIZE] {
        let shared = self.shared_secret.unwrap_or([0u8; crypto::KEY_SIZE]);
        crypto::Sha256::new()
            .update(&shared)
            .update(&self.symmetric_key)
            .update(&self.init_vector)
            .finish()
    }

    /// The cipher key protecting handshake payloads before the session is established.
    pub fn handshake_key(&self) -> Option<[u8; crypto::KEY_SIZE]> {
        self.shared_secret
    }

    /// The cipher key protecting punch and arranged-connect packets.
    pub fn arranged_key(&self) -> [u8; crypto::KEY_SIZE] {
        crypto::sha256(&self.arranged_secret)
    }
}

/// Rate management structure specifying the rate at which packets are sent and the
/// maximum size of each packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NetRate {
    /// Minimum millisecond delay (maximum rate) between packet sends.
    pub min_packet_send_period: u32,
    /// Minimum millisecond delay the remote host should allow between sends.
    pub min_packet_recv_period: u32,
    /// Number of bytes per second we can send over the connection.
    pub max_send_bandwidth: u32,
    /// Number of bytes per second max that the remote instance should send.
    pub max_recv_bandwidth: u32,
}

impl Default for NetRate {
    fn default() -> NetRate {
        NetRate {
            min_packet_send_period: DEFAULT_FIXED_SEND_PERIOD,
            min_packet_recv_period: DEFAULT_FIXED_SEND_PERIOD,
            max_send_bandwidth: DEFAULT_FIXED_BANDWIDTH,
            max_recv_bandwidth: DEFAULT_FIXED_BANDWIDTH,
        }
    }
}

/// Tracks what was sent in an individual packet for processing upon notification of
/// delivery success or failure. The event, string-table and ghost sections are filled
/// in by the layers that wrote into the packet.
pub struct PacketNotify {
    pub send_time: u64,
    pub sequence: u32,
    pub rate_changed: bool,
    pub events: Vec<EventNote>,
    pub strings: Vec<StringPacketEntry>,
    pub ghosts: Vec<GhostRef>,
}

impl PacketNotify {
    pub fn new() -> PacketNotify {
        PacketNotify {
            send_time: 0,
            sequence: 0,
            rate_changed: false,
            events: Vec::new(),
            strings: Vec::new(),
            ghosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Start,
    AwaitingChallengeResponse,
    ComputingPuzzleSolution,
    AwaitingConnectResponse,
    SendingPunchPackets,
    Connected,
    Rejected,
    TimedOut,
    Disconnected,
}

#[inline]
fn data_packet_nonce(sequence: u32, from_initiator: bool) -> u64 {
    u64::from(sequence) | ((from_initiator as u64) << 63)
}

/// The packet-level sliding window protocol. Each outgoing packet carries this side's
/// send sequence plus an acknowledgement bitmap of the peer's recent sequences; the
/// peer's bitmap resolves our in-flight packets to delivered or dropped, strictly in
/// send order. Nothing is retransmitted here; the layers above decide what to resend.
pub struct NetConnection {
    address: Address,
    state: ConnectionState,
    params: ConnectionParameters,

    local_rate: NetRate,
    remote_rate: NetRate,
    local_rate_changed: bool,
    current_packet_send_size: usize,
    current_packet_send_period: u32,

    initial_send_sequence: u32,
    last_send_sequence: u32,
    last_recv_sequence: u32,
    recv_ack_mask: u32,
    acked_recv_sequence: u32,
    acked_mask: u32,
    notify_queue: VecDeque<PacketNotify>,

    last_update_time: u64,
    send_delay_credit: u64,
    last_packet_recv_time: u64,
    last_recv_send_delay: u64,
    current_process_time: u64,
    highest_acked_send_time: u64,
    round_trip_time: f32,
    idle_timeout: u64,

    session_key: Option<[u8; crypto::KEY_SIZE]>,

    pub(crate) connect_send_count: u32,
    pub(crate) connect_last_send_time: u64,

    log: Logger,
}

impl NetConnection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(is_initiator: bool, log: L) -> NetConnection {
        let initial_send_sequence = crypto::random_u32();
        let local_rate = NetRate::default();
        let mut conn = NetConnection {
            address: Address::localhost(0),
            state: ConnectionState::Start,
            params: ConnectionParameters::new(is_initiator),
            local_rate,
            remote_rate: local_rate,
            local_rate_changed: true,
            current_packet_send_size: 0,
            current_packet_send_period: 0,
            initial_send_sequence,
            last_send_sequence: initial_send_sequence,
            last_recv_sequence: 0,
            recv_ack_mask: 0,
            acked_recv_sequence: initial_send_sequence,
            acked_mask: 0,
            notify_queue: VecDeque::new(),
            last_update_time: 0,
            send_delay_credit: 0,
            last_packet_recv_time: 0,
            last_recv_send_delay: 0,
            current_process_time: 0,
            highest_acked_send_time: 0,
            round_trip_time: 0.0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            session_key: None,
            connect_send_count: 0,
            connect_last_send_time: 0,
            log: logging::child_logger(log),
        };
        conn.compute_negotiated_rate();
        conn
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    #[inline]
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    #[inline]
    pub fn params_mut(&mut self) -> &mut ConnectionParameters {
        &mut self.params
    }

    #[inline]
    pub fn is_initiator(&self) -> bool {
        self.params.is_initiator
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Marks the connection established, starting the idle timeout clock.
    pub fn set_established(&mut self, now: u64) {
        self.state = ConnectionState::Connected;
        self.last_packet_recv_time = now;
        self.last_update_time = now;
    }

    /// Installs the symmetric session cipher derived from the handshake.
    pub fn set_symmetric_cipher(&mut self, key: [u8; crypto::KEY_SIZE]) {
        self.session_key = Some(key);
    }

    #[inline]
    pub fn initial_send_sequence(&self) -> u32 {
        self.initial_send_sequence
    }

    pub fn set_initial_recv_sequence(&mut self, sequence: u32) {
        self.last_recv_sequence = sequence;
        self.recv_ack_mask = 0;
    }

    #[inline]
    pub fn set_idle_timeout(&mut self, timeout: u64) {
        self.idle_timeout = timeout;
    }

    /// Sets the fixed rate send and receive parameters, flagging the change for
    /// piggy-backed transmission to the peer.
    pub fn set_fixed_rate_parameters(
        &mut self,
        min_packet_send_period: u32,
        min_packet_recv_period: u32,
        max_send_bandwidth: u32,
        max_recv_bandwidth: u32,
    ) {
        self.local_rate.min_packet_send_period = min_packet_send_period.max(1);
        self.local_rate.min_packet_recv_period = min_packet_recv_period.max(1);
        self.local_rate.max_send_bandwidth = max_send_bandwidth.min(MAX_FIXED_BANDWIDTH);
        self.local_rate.max_recv_bandwidth = max_recv_bandwidth.min(MAX_FIXED_BANDWIDTH);
        self.local_rate_changed = true;
        self.compute_negotiated_rate();
    }

    /// Returns the running average packet round trip time.
    #[inline]
    pub fn round_trip_time(&self) -> f32 {
        self.round_trip_time
    }

    /// Returns half of the average round trip packet time.
    #[inline]
    pub fn one_way_time(&self) -> f32 {
        self.round_trip_time * 0.5
    }

    /// Send time of the most recently acknowledged packet.
    #[inline]
    pub fn highest_acked_send_time(&self) -> u64 {
        self.highest_acked_send_time
    }

    #[inline]
    pub fn current_packet_send_period(&self) -> u32 {
        self.current_packet_send_period
    }

    #[inline]
    pub fn current_packet_send_size(&self) -> usize {
        self.current_packet_send_size
    }

    /// True when 32 packets are in flight and unresolved; sends are suppressed and no
    /// notify record may be allocated.
    pub fn window_full(&self) -> bool {
        match self.notify_queue.front() {
            Some(front) => {
                self.last_send_sequence.wrapping_sub(front.sequence) + 1 >= PACKET_WINDOW_SIZE
            }
            None => false,
        }
    }

    /// True once the connection has been silent long enough to force a keepalive send.
    #[inline]
    pub fn needs_keepalive(&self, now: u64) -> bool {
        self.state == ConnectionState::Connected
            && now.saturating_sub(self.last_update_time) >= KEEPALIVE_INTERVAL
    }

    /// True when the peer has been silent past the idle threshold.
    #[inline]
    pub fn check_timeout(&self, now: u64) -> bool {
        self.state == ConnectionState::Connected
            && now.saturating_sub(self.last_packet_recv_time) > self.idle_timeout
    }

    /// Rate gate for the send path. Advances the send delay credit so jittered ticks
    /// catch up without bursting; the credit accrues even when the send is later
    /// suppressed by a full window or lack of data.
    pub fn ready_to_send(&mut self, force: bool, now: u64) -> bool {
        if !force {
            let delay = u64::from(self.current_packet_send_period);
            if now.saturating_sub(self.last_update_time) + self.send_delay_credit < delay {
                return false;
            }
            self.send_delay_credit =
                (now + self.send_delay_credit).saturating_sub(self.last_update_time + delay);
            if self.send_delay_credit > 1000 {
                self.send_delay_credit = 1000;
            }
        }
        true
    }

    /// Stamps the notify record and writes the packet header: sequence prefix, ack
    /// info, optional rate-change block and the quantized observed send delay.
    pub fn begin_packet(&mut self, note: &mut PacketNotify, now: u64) -> BitStream {
        self.last_update_time = now;
        self.last_send_sequence = self.last_send_sequence.wrapping_add(1);
        note.sequence = self.last_send_sequence;
        note.send_time = now;

        let reserve = if self.session_key.is_some() {
            crypto::MAC_SIZE
        } else {
            0
        };
        let target = self.current_packet_send_size.saturating_sub(reserve).max(64);
        let mut stream = BitStream::packet(target);

        stream.write_flag(true);
        stream.write_int(self.last_send_sequence & SEQUENCE_MASK, SEQUENCE_BITS);
        stream.write_int(self.last_recv_sequence & SEQUENCE_MASK, SEQUENCE_BITS);
        stream.write_int(self.recv_ack_mask, 32);
        self.write_packet_rate_info(&mut stream, note);
        let send_delay = now
            .saturating_sub(self.last_packet_recv_time)
            .min(u64::from(MAX_FIXED_SEND_PERIOD));
        stream.write_int((send_delay >> 3) as u32, 8);
        stream
    }

    /// Seals the packet (encrypting from the end of the sequence prefix when the
    /// session cipher is active) and files the notify record in the send window.
    pub fn end_packet(&mut self, mut stream: BitStream, note: PacketNotify) -> BitStream {
        if let Some(key) = &self.session_key {
            let nonce = data_packet_nonce(note.sequence, self.params.is_initiator);
            bitstream::hash_and_encrypt(&mut stream, DATA_HEADER_BYTES, nonce, key);
        }
        logging::trace!(self.log, "data packet sealed";
                        "sequence" => note.sequence,
                        "bytes" => stream.byte_position());
        self.notify_queue.push_back(note);
        stream
    }

    /// Validates and opens an incoming data packet. Returns the payload stream
    /// positioned after the header, or `None` for packets that are silently dropped
    /// (duplicates, stale sequences, failed decryption).
    pub fn begin_read_packet(
        &mut self,
        data: &[u8],
        now: u64,
    ) -> NetworkResult<Option<BitStream>> {
        if data.len() < DATA_HEADER_BYTES {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        let mut stream = BitStream::from_bytes(data);
        if !stream.read_flag() {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        let sequence_low = stream.read_int(SEQUENCE_BITS);
        let advance =
            sequence_low.wrapping_sub(self.last_recv_sequence & SEQUENCE_MASK) & SEQUENCE_MASK;
        if advance == 0 || advance > MAX_SEQUENCE_ADVANCE {
            // duplicate, reordered or stale; the notify protocol never re-delivers
            return Ok(None);
        }
        let sequence = self.last_recv_sequence.wrapping_add(advance);

        if let Some(key) = &self.session_key {
            let nonce = data_packet_nonce(sequence, !self.params.is_initiator);
            if !bitstream::decrypt_and_check_hash(&mut stream, DATA_HEADER_BYTES, nonce, key) {
                logging::debug!(self.log, "packet failed authentication"; "sequence" => sequence);
                return Ok(None);
            }
        }

        if advance >= 32 {
            self.recv_ack_mask = 1;
        } else {
            self.recv_ack_mask = (self.recv_ack_mask << advance) | 1;
        }
        self.last_recv_sequence = sequence;

        let ack_low = stream.read_int(SEQUENCE_BITS);
        let ack_mask = stream.read_int(32);
        let behind =
            (self.last_send_sequence & SEQUENCE_MASK).wrapping_sub(ack_low) & SEQUENCE_MASK;
        if behind <= MAX_SEQUENCE_ADVANCE {
            let acked = self.last_send_sequence.wrapping_sub(behind);
            // ack information only ever moves forward
            if acked.wrapping_sub(self.acked_recv_sequence) < 0x8000_0000 {
                self.acked_recv_sequence = acked;
                self.acked_mask = ack_mask;
            }
        }

        self.read_packet_rate_info(&mut stream);
        self.last_recv_send_delay = (u64::from(stream.read_int(8)) << 3) + 4;
        self.last_packet_recv_time = now;
        self.current_process_time = now;

        if stream.was_error() {
            return Err(NetworkError::Fatal(ErrorType::InvalidPacket));
        }
        logging::trace!(self.log, "data packet accepted"; "sequence" => sequence);
        Ok(Some(stream))
    }

    /// Pops the next in-flight packet whose fate the peer has reported, oldest first.
    /// Also folds the delivery into the RTT estimate and re-flags undelivered rate
    /// changes for resend.
    pub fn next_notify(&mut self) -> Option<(PacketNotify, bool)> {
        let front_sequence = self.notify_queue.front()?.sequence;
        let behind = self.acked_recv_sequence.wrapping_sub(front_sequence);
        if behind >= 0x8000_0000 {
            return None;
        }
        let note = self.notify_queue.pop_front().expect("front checked above");
        let delivered = behind < 32 && (self.acked_mask >> behind) & 1 != 0;

        if note.rate_changed && !delivered {
            self.local_rate_changed = true;
        }
        if delivered {
            self.highest_acked_send_time = note.send_time;
            let sample = self
                .current_process_time
                .saturating_sub(note.send_time + self.last_recv_send_delay)
                as f32;
            self.round_trip_time = self.round_trip_time * 0.9 + sample * 0.1;
            if self.round_trip_time < 0.0 {
                self.round_trip_time = 0.0;
            }
        }
        logging::trace!(self.log, "packet notify";
                        "sequence" => note.sequence,
                        "delivered" => delivered);
        Some((note, delivered))
    }

    /// Drops the ghost records attached to every in-flight packet; used when a
    /// ghosting session is torn down and its lifecycle transitions no longer apply.
    pub(crate) fn clear_notify_ghost_lists(&mut self) {
        for note in self.notify_queue.iter_mut() {
            note.ghosts.clear();
        }
    }

    /// Writes any packet send rate change information into the packet.
    fn write_packet_rate_info(&mut self, stream: &mut BitStream, note: &mut PacketNotify) {
        note.rate_changed = self.local_rate_changed;
        self.local_rate_changed = false;
        if stream.write_flag(note.rate_changed) {
            stream.write_ranged_u32(self.local_rate.max_recv_bandwidth, 0, MAX_FIXED_BANDWIDTH);
            stream.write_ranged_u32(self.local_rate.max_send_bandwidth, 0, MAX_FIXED_BANDWIDTH);
            stream.write_ranged_u32(
                self.local_rate.min_packet_recv_period,
                1,
                MAX_FIXED_SEND_PERIOD,
            );
            stream.write_ranged_u32(
                self.local_rate.min_packet_send_period,
                1,
                MAX_FIXED_SEND_PERIOD,
            );
        }
    }

    /// Reads any rate change requests from the packet and renegotiates.
    fn read_packet_rate_info(&mut self, stream: &mut BitStream) {
        if stream.read_flag() {
            self.remote_rate.max_recv_bandwidth = stream.read_ranged_u32(0, MAX_FIXED_BANDWIDTH);
            self.remote_rate.max_send_bandwidth = stream.read_ranged_u32(0, MAX_FIXED_BANDWIDTH);
            self.remote_rate.min_packet_recv_period =
                stream.read_ranged_u32(1, MAX_FIXED_SEND_PERIOD);
            self.remote_rate.min_packet_send_period =
                stream.read_ranged_u32(1, MAX_FIXED_SEND_PERIOD);
            self.compute_negotiated_rate();
        }
    }

    /// Called when the local or remote rate changes.
    fn compute_negotiated_rate(&mut self) {
        self.current_packet_send_period = self
            .local_rate
            .min_packet_send_period
            .max(self.remote_rate.min_packet_recv_period);

        let max_bandwidth = self
            .local_rate
            .max_send_bandwidth
            .min(self.remote_rate.max_recv_bandwidth);
        let size = (max_bandwidth as u64 * u64::from(self.current_packet_send_period) / 1000)
            as usize;
        self.current_packet_send_size = size.min(MAX_PACKET_DATA_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (NetConnection, NetConnection) {
        let mut a = NetConnection::new(true, None);
        let mut b = NetConnection::new(false, None);
        a.set_initial_recv_sequence(b.initial_send_sequence());
        b.set_initial_recv_sequence(a.initial_send_sequence());
        a.set_established(0);
        b.set_established(0);
        (a, b)
    }

    fn send_packet(from: &mut NetConnection, now: u64) -> Vec<u8> {
        let mut note = PacketNotify::new();
        let stream = from.begin_packet(&mut note, now);
        let stream = from.end_packet(stream, note);
        stream.bytes().to_vec()
    }

    fn deliver(to: &mut NetConnection, data: &[u8], now: u64) {
        let stream = to.begin_read_packet(data, now).unwrap();
        assert!(stream.is_some());
        while to.next_notify().is_some() {}
    }

    #[test]
    fn test_notify_surfaces_in_send_order() {
        let (mut a, mut b) = pair();

        let p1 = send_packet(&mut a, 10);
        let p2 = send_packet(&mut a, 20);
        let p3 = send_packet(&mut a, 30);

        // b receives 1 and 3; 2 is lost and 3's ack mask reports it missing
        deliver(&mut b, &p1, 40);
        drop(p2);
        deliver(&mut b, &p3, 50);

        let ack = send_packet(&mut b, 60);
        let stream = a.begin_read_packet(&ack, 70).unwrap();
        assert!(stream.is_some());

        let seq_base = a.initial_send_sequence();
        let (note, delivered) = a.next_notify().unwrap();
        assert_eq!(note.sequence, seq_base.wrapping_add(1));
        assert!(delivered);
        let (note, delivered) = a.next_notify().unwrap();
        assert_eq!(note.sequence, seq_base.wrapping_add(2));
        assert!(!delivered);
        let (note, delivered) = a.next_notify().unwrap();
        assert_eq!(note.sequence, seq_base.wrapping_add(3));
        assert!(delivered);
        assert!(a.next_notify().is_none());
    }

    #[test]
    fn test_duplicate_and_stale_packets_dropped() {
        let (mut a, mut b) = pair();

        let p1 = send_packet(&mut a, 10);
        let p2 = send_packet(&mut a, 20);

        assert!(b.begin_read_packet(&p2, 30).unwrap().is_some());
        // p1 is now older than the newest received sequence and must be discarded
        assert!(b.begin_read_packet(&p1, 40).unwrap().is_none());
        // and the duplicate of p2 as well
        assert!(b.begin_read_packet(&p2, 50).unwrap().is_none());
    }

    #[test]
    fn test_window_full_suppresses_sends() {
        let (mut a, _b) = pair();

        for i in 0..PACKET_WINDOW_SIZE {
            assert!(!a.window_full(), "window filled early at {}", i);
            send_packet(&mut a, u64::from(i) * 10);
        }
        assert!(a.window_full());
        assert_eq!(a.notify_queue.len(), PACKET_WINDOW_SIZE as usize);
    }

    #[test]
    fn test_rate_negotiation() {
        let (mut a, mut b) = pair();
        a.set_fixed_rate_parameters(50, 50, 10_000, 10_000);

        let p = send_packet(&mut a, 10);
        deliver(&mut b, &p, 20);

        // b demands at least 100ms between receives; a's 50ms send period loses
        b.set_fixed_rate_parameters(96, 100, 2500, 2500);
        let p = send_packet(&mut b, 30);
        deliver(&mut a, &p, 40);

        assert_eq!(a.current_packet_send_period(), 100);
        assert_eq!(a.current_packet_send_size(), 2500 * 100 / 1000);
    }

    #[test]
    fn test_rate_change_requeued_on_drop() {
        let (mut a, mut b) = pair();
        a.set_fixed_rate_parameters(96, 96, 5000, 5000);

        // the packet carrying the rate change is lost
        let lost = send_packet(&mut a, 10);
        drop(lost);
        let p2 = send_packet(&mut a, 20);
        deliver(&mut b, &p2, 30);

        let ack = send_packet(&mut b, 40);
        assert!(a.begin_read_packet(&ack, 50).unwrap().is_some());
        let (note, delivered) = a.next_notify().unwrap();
        assert!(note.rate_changed);
        assert!(!delivered);
        while a.next_notify().is_some() {}

        // the re-flagged change goes out with the next packet
        let mut note = PacketNotify::new();
        let _ = a.begin_packet(&mut note, 60);
        assert!(note.rate_changed);
    }

    #[test]
    fn test_round_trip_time_non_negative() {
        let (mut a, mut b) = pair();

        for step in 0..20u64 {
            let now = step * 100;
            let p = send_packet(&mut a, now);
            deliver(&mut b, &p, now + 1);
            let ack = send_packet(&mut b, now + 2);
            let _ = a.begin_read_packet(&ack, now + 3).unwrap();
            while a.next_notify().is_some() {}
            assert!(a.round_trip_time() >= 0.0);
        }
    }

    #[test]
    fn test_send_delay_credit_capped() {
        let (mut a, _b) = pair();
        assert!(a.ready_to_send(false, 1_000_000));
        assert_eq!(a.send_delay_credit, 1000);
    }

    #[test]
    fn test_encrypted_framing_rejects_tampering() {
        let (mut a, mut b) = pair();
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);
        a.set_symmetric_cipher(key);
        b.set_symmetric_cipher(key);

        let good = send_packet(&mut a, 10);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        assert!(b.begin_read_packet(&bad, 20).unwrap().is_none());
        assert!(b.begin_read_packet(&good, 30).unwrap().is_some());
    }
}
