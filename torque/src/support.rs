use std::io;

/// Fatal error conditions on a connection or socket.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    InvalidPacket,
    InvalidClass,
    GhostRefused,
    Crypto,
    VersionMismatch,
    AddressMalformed,
    Io(io::ErrorKind),
}

/// The result plumbing for every network operation. `Wait` means nothing was available
/// (or nothing could be done) right now and the caller should continue the tick; `Fatal`
/// tears the affected connection down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

impl From<io::Error> for NetworkError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub type NetworkResult<T> = ::std::result::Result<T, NetworkError>;

/// Why a connection went away, delivered with every termination notice.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TerminationReason {
    TimedOut,
    RemoteHostRejected,
    RemoteDisconnect,
    SelfDisconnect,
    Error,
}

/// Protocol constants that are part of the wire contract.
pub mod constants {
    /// Maximum number of bytes written into a single datagram.
    pub const MAX_PACKET_DATA_SIZE: usize = 1490;
    /// Width of the packet delivery window; packets outside it resolve as dropped.
    pub const PACKET_WINDOW_SIZE: u32 = 32;
    /// Number of ghosts that can be simultaneously active on one connection.
    pub const MAX_GHOST_COUNT: usize = 1024;
    /// Size, in bits, of the integer used to transmit ghost IDs.
    pub const GHOST_ID_BIT_SIZE: u32 = 10;
    /// If a puzzle takes longer than this to solve, the connect attempt times out.
    pub const CONNECT_REQUEST_TIMEOUT: u64 = 30_000;
    /// Milliseconds between server puzzle nonce rotations.
    pub const PUZZLE_REFRESH_TIME: u64 = 30_000;
    pub const INITIAL_PUZZLE_DIFFICULTY: u32 = 17;
    pub const MAX_PUZZLE_DIFFICULTY: u32 = 26;
    /// Interval between the interface's pending/active timeout sweeps.
    pub const TIMEOUT_CHECK_INTERVAL: u64 = 1500;
    /// The default send/receive bandwidth - 2.5 Kb per second.
    pub const DEFAULT_FIXED_BANDWIDTH: u32 = 2500;
    /// The default delay between each packet send - approx 10 packets per second.
    pub const DEFAULT_FIXED_SEND_PERIOD: u32 = 96;
    /// Maximum bandwidth a fixed rate connection can request.
    pub const MAX_FIXED_BANDWIDTH: u32 = 65535;
    /// Maximum period between packets a fixed rate connection can request.
    pub const MAX_FIXED_SEND_PERIOD: u32 = 2047;
    /// Bits the packet-fill loops leave free when deciding whether an entry fit.
    pub const MINIMUM_PADDING_BITS: usize = 32;
    /// Addresses carried per message in master-server address relays.
    pub const IP_MESSAGE_ADDRESS_COUNT: usize = 30;
    /// Mission types carried per master-server list packet.
    pub const GAME_MISSION_TYPES_PER_PACKET: usize = 20;
}
