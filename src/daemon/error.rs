use libp2p::PeerId;
use thiserror::Error;

/// Enum representing errors that can happen in skypier's daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("TUN device error: {0}")]
    Tun(#[from] tun::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("private key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("private key could not be decoded: {0}")]
    KeyDecoding(#[from] libp2p::identity::DecodingError),

    #[error("invalid multiaddress: {0}")]
    Multiaddr(#[from] libp2p::multiaddr::Error),

    #[error("invalid peer id: {0}")]
    PeerIdParsing(#[from] libp2p::identity::ParseError),

    #[error("overlay transport error: {0}")]
    Transport(String),

    #[error("peer {0} could not be found in the discovery table")]
    PeerNotFound(PeerId),

    #[error("failed to open a tunnel stream: {0}")]
    OpenStream(#[from] libp2p_stream::OpenStreamError),

    #[error("tunnel protocol handler is already registered")]
    AlreadyRegistered(#[from] libp2p_stream::AlreadyRegistered),

    #[error("stream limit reached for peer {0}")]
    StreamLimit(PeerId),

    #[error("control API error: {0}")]
    Http(#[from] hyper::Error),

    #[error("route error: {0}")]
    Route(#[from] RouteError),

    #[error("actor channel closed")]
    ChannelClosed,

    #[error("initialization was cancelled")]
    Cancelled,

    #[error("an actor died")]
    Died,
}

/// Errors of the tunnel frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("packet of {0} bytes does not fit in a frame")]
    Oversized(usize),

    #[error("stream closed after {received} of {expected} bytes")]
    Truncated { expected: usize, received: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors of route-table operations.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("default route not found")]
    NoDefaultRoute,

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("invalid gateway IP address: {0}")]
    InvalidGateway(String),

    #[error("invalid route destination {0}")]
    InvalidDestination(String),

    #[error("route management is not supported on this platform")]
    Unsupported,
}
