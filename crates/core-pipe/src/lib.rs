//! Buffered, thread-safe pipe between the interpreter and the USB bridge.
//!
//! The [`Controller`] accepts an append-only byte stream, carves it into
//! 30-byte CRC-framed packets, and delivers them from a dedicated sender
//! thread while observing the board's status word. In-band directives and
//! realtime preempts ride the same stream; see the module docs in
//! [`controller`].

pub mod controller;
pub mod driver;

pub use controller::{Controller, PipeError};
pub use driver::{DriverError, DriverProbe, UsbDriver, UsbState};

/// Producer-side view of the pipe. The interpreter writes through this seam
/// so it can be exercised headless against a recorder.
pub trait Pipe: Send + Sync {
    /// Append bytes to the tail of the stream. Never blocks on USB.
    fn write(&self, bytes: &[u8]);
    /// Prepend bytes ahead of everything not yet carved into a packet.
    fn realtime_write(&self, bytes: &[u8]);
    /// Bytes currently pending anywhere in the pipe.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
