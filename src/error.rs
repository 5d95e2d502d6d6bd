use thiserror::Error;

/// Errors surfaced by the message plane.
///
/// Every fallible call reports exactly one of these; routing failures are
/// additionally reported through the drop-warning callback because the
/// caller of `poll()` is usually not the party that sent the message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("service not found")]
    ServiceNotFound,
    #[error("no handler for address")]
    NoHandler,
    #[error("send would block")]
    Blocked,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("bad service or method name")]
    BadName,
    #[error("invalid message")]
    InvalidMsg,
    #[error("global clock not yet synchronized")]
    NoClock,
    #[error("service already offered locally")]
    ServiceConflict,
    #[error("ensemble is not initialized")]
    NotInitialized,
    #[error("ensemble is already running")]
    AlreadyRunning,
    #[error("hostname resolution failed")]
    HostnameResolution,
    #[error("tcp connect failed")]
    TcpConnectFail,
    #[error("tcp connection hung up")]
    TcpHup,
    #[error("no free discovery port")]
    NoPort,
    #[error("message builder misused")]
    BuilderMisuse,
    #[error("peer process is gone")]
    ProcessGone,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status of a service as seen from this process.
///
/// The `NoTime` variants apply until the local process has synchronized with
/// the ensemble clock; timestamped sends to such a service fail with
/// [`Error::NoClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    LocalNoTime,
    RemoteNoTime,
    BridgeNoTime,
    Local,
    Remote,
    Bridge,
}

/// Wire value carried in `/_o2/si` when a service disappears.
pub const STATUS_GONE: i32 = -1;

impl Status {
    pub fn is_synchronized(self) -> bool {
        matches!(self, Status::Local | Status::Remote | Status::Bridge)
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Status::LocalNoTime => 0,
            Status::RemoteNoTime => 1,
            Status::BridgeNoTime => 2,
            Status::Local => 3,
            Status::Remote => 4,
            Status::Bridge => 5,
        }
    }
}

/// Answer from [`crate::Ensemble::can_send`]: whether a message to the
/// service would be transmitted immediately or buffered behind earlier
/// unsent bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanSend {
    Ready,
    Blocked,
}
