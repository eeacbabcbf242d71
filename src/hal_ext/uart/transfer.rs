//! Per-direction transfer state
//!
//! A [`Slot`] holds at most one [`Transfer`]. Buffer, length and completion
//! exist only while the transfer is in progress. When the transfer ends it is
//! moved out of the slot as [`Finished`], which must be dispatched after the
//! channel lock has been released.

use core::mem;
use core::sync::atomic::{AtomicU16, Ordering};

use super::path::TransferPath;
use super::port::SerialPort;
use super::{Direction, Error};

/// Destination of received units when no buffer is needed
static DISCARD: AtomicU16 = AtomicU16::new(0);

/// Completion callback: owner, buffer handed back, number of units transferred, user parameter
pub type Callback<T> = fn(&T, Buffer, u16, usize);

/// Size of a single transferred unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Unit {
    /// Up to 8 data bits, stored as `u8`
    Byte,
    /// 9 data bits, stored as `u16`
    Word,
}

/// Memory lent to the engine for the duration of a transfer
#[derive(Debug)]
pub enum Buffer {
    Bytes(&'static mut [u8]),
    /// Read-only data, can only be written out
    Static(&'static [u8]),
    Words(&'static mut [u16]),
    /// Received data is dropped, writes repeat a single cell
    Discard,
}

impl From<&'static mut [u8]> for Buffer {
    fn from(buf: &'static mut [u8]) -> Self {
        Buffer::Bytes(buf)
    }
}

impl<const N: usize> From<&'static mut [u8; N]> for Buffer {
    fn from(buf: &'static mut [u8; N]) -> Self {
        Buffer::Bytes(buf)
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(buf: &'static [u8]) -> Self {
        Buffer::Static(buf)
    }
}

impl From<&'static mut [u16]> for Buffer {
    fn from(buf: &'static mut [u16]) -> Self {
        Buffer::Words(buf)
    }
}

impl<const N: usize> From<&'static mut [u16; N]> for Buffer {
    fn from(buf: &'static mut [u16; N]) -> Self {
        Buffer::Words(buf)
    }
}

impl Buffer {
    /// Capacity in units, `None` for [`Buffer::Discard`]
    pub fn len(&self) -> Option<usize> {
        match self {
            Buffer::Bytes(b) => Some(b.len()),
            Buffer::Static(b) => Some(b.len()),
            Buffer::Words(w) => Some(w.len()),
            Buffer::Discard => None,
        }
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, Buffer::Discard)
    }

    /// Verify that `len` units of size `unit` can be transferred in direction `dir`
    pub fn check(&self, dir: Direction, unit: Unit, len: u16) -> Result<(), Error> {
        if len == 0 {
            return Err(Error::ZeroLength);
        }
        let capacity = match (self, unit) {
            (Buffer::Discard, _) => return Ok(()),
            (Buffer::Static(_), _) if dir == Direction::Read => return Err(Error::ReadOnlyBuffer),
            (Buffer::Bytes(b), Unit::Byte) => b.len(),
            (Buffer::Static(b), Unit::Byte) => b.len(),
            (Buffer::Words(w), Unit::Word) => w.len(),
            _ => return Err(Error::WidthMismatch),
        };
        if capacity < len as usize {
            return Err(Error::BufferTooShort);
        }
        Ok(())
    }

    /// Memory address of the first unit
    pub fn address(&self) -> u32 {
        match self {
            Buffer::Bytes(b) => b.as_ptr() as u32,
            Buffer::Static(b) => b.as_ptr() as u32,
            Buffer::Words(w) => w.as_ptr() as u32,
            Buffer::Discard => DISCARD.as_ptr() as u32,
        }
    }

    pub(super) fn load(&self, i: usize) -> u16 {
        match self {
            Buffer::Bytes(b) => b.get(i).copied().unwrap_or(0) as u16,
            Buffer::Static(b) => b.get(i).copied().unwrap_or(0) as u16,
            Buffer::Words(w) => w.get(i).copied().unwrap_or(0),
            Buffer::Discard => DISCARD.load(Ordering::Relaxed),
        }
    }

    pub(super) fn store(&mut self, i: usize, word: u16) {
        match self {
            Buffer::Bytes(b) => {
                if let Some(byte) = b.get_mut(i) {
                    *byte = word as u8;
                }
            },
            Buffer::Words(w) => {
                if let Some(w) = w.get_mut(i) {
                    *w = word;
                }
            },
            Buffer::Discard => DISCARD.store(word, Ordering::Relaxed),
            // Rejected by `check`
            Buffer::Static(_) => {},
        }
    }
}

/// In-flight transfer parameters
#[derive(Debug)]
pub struct Descriptor {
    pub(super) buffer: Buffer,
    pub(super) len: u16,
    pub(super) progress: u16,
    pub(super) unit: Unit,
}

impl Descriptor {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    /// Units moved so far by the interrupt path
    pub fn progress(&self) -> u16 {
        self.progress
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.len
    }
}

pub struct Completion<T> {
    callback: Callback<T>,
    param: usize,
}

pub enum Transfer<T> {
    Idle,
    InProgress(Descriptor, Completion<T>),
}

/// Transfer that has been retired from its slot, waiting for its callback
#[must_use = "callback must be dispatched"]
pub struct Finished<T> {
    buffer: Buffer,
    count: u16,
    completion: Completion<T>,
}

impl<T> Finished<T> {
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Invoke completion callback, must be called outside of critical section
    pub fn dispatch(self, owner: &T) {
        (self.completion.callback)(owner, self.buffer, self.count, self.completion.param);
    }
}

/// Transfer state of one direction together with the path that drives it
pub struct Slot<X, T> {
    path: X,
    dir: Direction,
    transfer: Transfer<T>,
}

impl<X: TransferPath, T> Slot<X, T> {
    pub fn new(path: X, dir: Direction) -> Self {
        Self { path, dir, transfer: Transfer::Idle }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.transfer, Transfer::Idle)
    }

    pub fn init(&mut self) {
        self.path.init();
    }

    pub fn deinit<P: SerialPort>(&mut self, port: &mut P) -> Option<Buffer> {
        let buffer = self.cancel(port);
        self.path.deinit();
        buffer
    }

    /// Arm a new transfer, buffer is handed back on rejection
    pub fn start<P: SerialPort>(
        &mut self,
        port: &mut P,
        unit: Unit,
        buffer: Buffer,
        len: u16,
        callback: Callback<T>,
        param: usize,
    ) -> Result<(), (Error, Buffer)> {
        if let Err(e) = buffer.check(self.dir, unit, len) {
            return Err((e, buffer));
        }
        if !self.is_idle() {
            return Err((Error::Busy, buffer));
        }

        let mut desc = Descriptor { buffer, len, progress: 0, unit };
        self.path.start(port, self.dir, &mut desc);
        self.transfer = Transfer::InProgress(desc, Completion { callback, param });
        Ok(())
    }

    /// Abort the transfer without calling its callback
    pub fn cancel<P: SerialPort>(&mut self, port: &mut P) -> Option<Buffer> {
        if self.is_idle() {
            return None;
        }
        self.retire(port).map(|(desc, _)| desc.buffer)
    }

    /// Number of units transferred, `None` if idle
    pub fn progress(&self) -> Option<u16> {
        match &self.transfer {
            Transfer::Idle => None,
            Transfer::InProgress(desc, _) => Some(self.path.progress(desc).min(desc.len)),
        }
    }

    /// Service peripheral interrupt flags
    pub fn on_interrupt<P: SerialPort>(&mut self, port: &mut P) -> Option<Finished<T>> {
        let done = match &mut self.transfer {
            Transfer::Idle => false,
            Transfer::InProgress(desc, _) => self.path.on_interrupt(port, self.dir, desc),
        };
        if done {
            self.finish(port)
        } else {
            None
        }
    }

    /// Service DMA interrupt flags, the path is polled even if idle to clear them
    pub fn on_dma_interrupt<P: SerialPort>(&mut self, port: &mut P) -> Option<Finished<T>> {
        if !self.path.on_dma_interrupt() {
            return None;
        }
        match &mut self.transfer {
            Transfer::Idle => None,
            Transfer::InProgress(desc, _) => {
                desc.progress = desc.len;
                self.finish(port)
            },
        }
    }

    fn finish<P: SerialPort>(&mut self, port: &mut P) -> Option<Finished<T>> {
        self.retire(port).map(|(desc, completion)| Finished {
            count: desc.progress.min(desc.len),
            buffer: desc.buffer,
            completion,
        })
    }

    fn retire<P: SerialPort>(&mut self, port: &mut P) -> Option<(Descriptor, Completion<T>)> {
        self.path.stop(port, self.dir);
        match mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Idle => None,
            Transfer::InProgress(desc, completion) => Some((desc, completion)),
        }
    }
}
