//! Strategies for moving data between a buffer and the peripheral
//!
//! [`IrqPath`] moves one unit per interrupt, [`DmaPath`] hands the whole
//! buffer to a DMA channel and waits for a single completion interrupt.

use crate::hal_ext::dma::{self, DmaStream, Priority, Request, WordSize};
use super::port::{Event, SerialPort};
use super::transfer::{Descriptor, Unit};
use super::Direction;

/// Way of servicing one direction of a channel
pub trait TransferPath: Send {
    fn init(&mut self) {}

    fn deinit(&mut self) {}

    /// Activate the hardware for a freshly armed transfer
    fn start<P: SerialPort>(&mut self, port: &mut P, dir: Direction, desc: &mut Descriptor);

    /// Stop the hardware, must be safe to call at any time
    fn stop<P: SerialPort>(&mut self, port: &mut P, dir: Direction);

    /// Units transferred so far
    fn progress(&self, desc: &Descriptor) -> u16;

    /// Handle peripheral interrupt, returns true when the transfer has completed
    fn on_interrupt<P: SerialPort>(&mut self, _port: &mut P, _dir: Direction, _desc: &mut Descriptor) -> bool {
        false
    }

    /// Handle DMA interrupt, returns true when the transfer has completed
    fn on_dma_interrupt(&mut self) -> bool {
        false
    }
}

/// Interrupt driven transfers
///
/// Reads store one unit on each RXNE. Writes push one unit on each TXE and
/// after the last one wait for TC so that completion means the data has left
/// the shift register.
#[derive(Debug, Default, Clone, Copy)]
pub struct IrqPath;

impl IrqPath {
    fn on_read<P: SerialPort>(port: &mut P, desc: &mut Descriptor) -> bool {
        if port.is_pending(Event::RxNotEmpty) && !desc.is_complete() {
            let word = port.read_data();
            desc.buffer.store(desc.progress as usize, word);
            desc.progress += 1;
        }
        if desc.is_complete() {
            port.unlisten(Event::RxNotEmpty);
            return true;
        }
        false
    }

    fn on_write<P: SerialPort>(port: &mut P, desc: &mut Descriptor) -> bool {
        if port.is_pending(Event::TxEmpty) && !desc.is_complete() {
            let word = desc.buffer.load(desc.progress as usize);
            desc.progress += 1;
            if desc.is_complete() {
                port.unlisten(Event::TxEmpty);
                port.listen(Event::TransmissionComplete);
            }
            port.write_data(word);
            return false;
        }
        if desc.is_complete() && port.is_pending(Event::TransmissionComplete) {
            port.unlisten(Event::TransmissionComplete);
            return true;
        }
        false
    }
}

impl TransferPath for IrqPath {
    fn start<P: SerialPort>(&mut self, port: &mut P, dir: Direction, _desc: &mut Descriptor) {
        match dir {
            Direction::Read => port.listen(Event::RxNotEmpty),
            Direction::Write => port.listen(Event::TxEmpty),
        }
    }

    fn stop<P: SerialPort>(&mut self, port: &mut P, dir: Direction) {
        match dir {
            Direction::Read => port.unlisten(Event::RxNotEmpty),
            Direction::Write => {
                port.unlisten(Event::TxEmpty);
                port.unlisten(Event::TransmissionComplete);
            },
        }
    }

    fn progress(&self, desc: &Descriptor) -> u16 {
        desc.progress
    }

    fn on_interrupt<P: SerialPort>(&mut self, port: &mut P, dir: Direction, desc: &mut Descriptor) -> bool {
        match dir {
            Direction::Read => Self::on_read(port, desc),
            Direction::Write => Self::on_write(port, desc),
        }
    }
}

/// DMA driven transfers
pub struct DmaPath<D> {
    stream: D,
    priority: Priority,
}

impl<D: DmaStream> DmaPath<D> {
    pub fn new(stream: D) -> Self {
        Self { stream, priority: Priority::High }
    }

    pub fn with_priority(stream: D, priority: Priority) -> Self {
        Self { stream, priority }
    }
}

impl<D: DmaStream> TransferPath for DmaPath<D> {
    fn init(&mut self) {
        self.stream.init();
    }

    fn deinit(&mut self) {
        self.stream.cancel();
    }

    fn start<P: SerialPort>(&mut self, port: &mut P, dir: Direction, desc: &mut Descriptor) {
        let direction = match dir {
            Direction::Read => dma::Direction::PeripheralToMemory,
            Direction::Write => dma::Direction::MemoryToPeripheral,
        };
        let word = match desc.unit() {
            Unit::Byte => WordSize::Bits8,
            Unit::Word => WordSize::Bits16,
        };
        let req = Request {
            direction,
            peripheral: port.data_register(dir),
            memory: desc.buffer().address(),
            memory_increment: !desc.buffer().is_discard(),
            len: desc.len(),
            word,
            priority: self.priority,
        };
        self.stream.request(&req);
        port.set_dma_request(dir, true);
    }

    fn stop<P: SerialPort>(&mut self, port: &mut P, dir: Direction) {
        port.set_dma_request(dir, false);
        self.stream.cancel();
    }

    fn progress(&self, desc: &Descriptor) -> u16 {
        desc.len().saturating_sub(self.stream.remaining())
    }

    fn on_dma_interrupt(&mut self) -> bool {
        match self.stream.on_interrupt() {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!("DMA transfer error: {}", e);
                false
            },
            None => false,
        }
    }
}
