use super::{tcp_parsing::ParseError, PcbId, State};
use crate::{
    buffer::AllocError,
    ip::{IpError, Ipv4Address},
};
use thiserror::Error as ThisError;

/// An error returned by a TCP operation.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] MemoryError),
    #[error("The connection is not in a state that allows sending")]
    NotConnected,
    #[error("Port {0} is already in use")]
    AddressInUse(u16),
    #[error("Operation not allowed in state {0}")]
    InvalidState(State),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("No route to {0}")]
    NoRoute(Ipv4Address),
    #[error("Connection aborted")]
    Aborted,
    #[error("Connection reset by peer")]
    Reset,
    #[error("No connection {0}")]
    UnknownPcb(PcbId),
    #[error("IP output failed: {0}")]
    Ip(#[from] IpError),
    #[error("Malformed segment: {0}")]
    Parse(#[from] ParseError),
}

impl From<AllocError> for TcpError {
    fn from(e: AllocError) -> Self {
        Self::OutOfMemory(MemoryError::PoolExhausted(e))
    }
}

/// The resource-exhaustion class of [`TcpError`].
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error(transparent)]
    PoolExhausted(#[from] AllocError),
    #[error("Too much data: {requested} bytes requested, {available} bytes of send buffer left")]
    SendBuffer { requested: usize, available: usize },
    #[error("Send queue too long: {queued} buffers queued, at most {max}")]
    QueueLength { queued: usize, max: usize },
}
