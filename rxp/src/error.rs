//! Error types

use rxp_io::SocketError;
use rxp_protocol::{BufferError, ConnectionState, SegmentError};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the demultiplexer and sockets
#[derive(Error, Debug)]
pub enum RxpError {
    #[error("Demultiplexer is already open")]
    AlreadyOpen,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Demultiplexer is not open")]
    NotOpen,

    #[error("Socket is already bound")]
    AlreadyBound,

    #[error("Port {0} is unavailable")]
    PortUnavailable(u16),

    #[error("No free port available")]
    NoFreePort,

    #[error("Cannot {op} in state {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Connection is closed")]
    Closed,

    #[error("Connection with {0} failed")]
    ConnectionFailed(SocketAddr),

    #[error("Operation timed out")]
    TimedOut,

    #[error("Operation would block")]
    WouldBlock,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Socket(#[from] SocketError),

    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}

pub type Result<T> = std::result::Result<T, RxpError>;
