//! Abstract target transport interface.

use crate::error::{Error, Result};

pub use self::serial::{Baudrate, SerialTransport};

pub mod serial;
#[cfg(test)]
pub(crate) mod sim;

/// Byte-level framing against one UPDI target.
///
/// UPDI is electrically half-duplex: the programmer's TX and the target
/// share one wire, so every transmitted byte is also received back. A
/// transport must verify that echo on `send` and fail when it is absent
/// or differs.
pub trait Transport {
    /// Write `data` and consume the mandatory echo.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `n` bytes within the timeout.
    fn receive(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Hold the line in break condition for ~25 ms, then flush stale input.
    fn send_break(&mut self) -> Result<()>;

    /// Two consecutive breaks force a locked-up target back to idle.
    fn send_double_break(&mut self) -> Result<()> {
        self.send_break()?;
        self.send_break()
    }
}

/// Compares sent bytes against their echo.
///
/// A short echo means nothing (or not everything) came back in time; a
/// same-length mismatch means the line is disturbed or the target is
/// driving it.
pub(crate) fn check_echo(sent: &[u8], echoed: &[u8]) -> Result<()> {
    if echoed.len() < sent.len() {
        return Err(Error::TransportTimeout("echo read-back"));
    }
    for (&tx, &rx) in sent.iter().zip(echoed) {
        if tx != rx {
            return Err(Error::ProtocolAck {
                op: "echo read-back",
                expected: tx,
                actual: rx,
            });
        }
    }
    Ok(())
}
