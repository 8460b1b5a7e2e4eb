//! Error types for the intercom endpoint

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire codec errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Encode-side bound: payloads above the protocol maximum are refused.
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Decode-side bound: the header announces more than the receive buffer
    /// can hold. The caller closes the peer.
    #[error("Frame length {0} exceeds receive capacity")]
    Oversize(usize),

    /// Clean EOF mid-read.
    #[error("Peer closed the connection")]
    Closed,

    /// The retry budget ran out before a full frame arrived.
    #[error("Incomplete frame within retry budget")]
    Incomplete,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Bind failed: {0}")]
    BindFailed(std::io::Error),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Send retry budget exhausted")]
    SendBudget,

    #[error("Connection closed")]
    Closed,

    #[error("A peer session is already active")]
    Busy,

    #[error("Codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid AEC frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Call engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine not ready")]
    NotReady,

    #[error("Invalid state for operation: {0}")]
    InvalidState(&'static str),

    #[error("Task spawn failed: {0}")]
    Spawn(String),
}

/// Settings persistence errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Store failure: {0}")]
    Store(String),

    #[error("Unsupported settings version: {0}")]
    Version(u8),

    #[error("Corrupt settings record")]
    Corrupt,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
