use super::{PcbId, TcpError, TcpStack};
use crate::buffer::Pbuf;

/// The application's side of a connection.
///
/// Every method except [`error`](Callbacks::error) gets the stack so that it
/// can write, close or tweak the connection on the spot. While a callback
/// runs, the connection's own callbacks are detached from it; installing new
/// ones from inside a callback replaces them.
pub trait Callbacks: Send {
    /// A passive open on `listener` completed and produced `pcb`. Returning an
    /// error aborts the new connection. The default refuses every connection.
    fn accepted(
        &mut self,
        _stack: &mut TcpStack,
        _listener: PcbId,
        _pcb: PcbId,
    ) -> Result<(), TcpError> {
        Err(TcpError::Aborted)
    }

    /// In-order data arrived, or `None` once the peer has closed its side.
    ///
    /// The default discards the data, reopens the window and closes the
    /// connection on end of stream.
    fn received(
        &mut self,
        stack: &mut TcpStack,
        pcb: PcbId,
        data: Option<Pbuf>,
    ) -> Result<(), TcpError> {
        match data {
            Some(data) => stack.recved(pcb, data.len() as u32),
            None => stack.close(pcb),
        }
    }

    /// The peer acknowledged `len` more bytes.
    fn sent(&mut self, _stack: &mut TcpStack, _pcb: PcbId, _len: u32) -> Result<(), TcpError> {
        Ok(())
    }

    /// An active open completed.
    fn connected(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<(), TcpError> {
        Ok(())
    }

    /// Called every poll interval while the connection lives.
    fn poll(&mut self, _stack: &mut TcpStack, _pcb: PcbId) -> Result<(), TcpError> {
        Ok(())
    }

    /// The connection is gone. The block no longer exists when this runs.
    fn error(&mut self, _pcb: PcbId, _err: TcpError) {}
}
