//! Asynchronous UART transfers
//!
//! [`Uart`] manages one serial peripheral with one read and one write transfer
//! that can be in progress at the same time. Each direction is serviced either
//! per unit from peripheral interrupts ([`IrqPath`]) or by a DMA channel
//! ([`DmaPath`]); the choice is made with type parameters.
//!
//! Transfers use `'static` buffers that are lent to the driver and handed back
//! in the completion callback, on rejection or on cancellation. Callbacks run
//! from interrupt context after the transfer has been retired, so a callback
//! may immediately start a new transfer in the same direction.
//!
//! Interrupt handlers must forward to [`ROUTER`] (or call
//! [`Uart::on_interrupt`]/[`Uart::on_dma_interrupt`] directly).

use core::cell::RefCell;

use critical_section::Mutex;

pub mod path;
pub mod port;
pub mod router;
pub mod transfer;

pub use path::{DmaPath, IrqPath, TransferPath};
pub use port::{Config, Id, Oversampling, Parity, SerialPort, StopBits, Usart, WordLength};
pub use router::{InterruptHandler, Router, ROUTER};
pub use transfer::{Buffer, Callback, Unit};

use port::divisor;
use transfer::{Finished, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Transfer length is 0
    ZeroLength,
    /// Buffer holds less units than requested
    BufferTooShort,
    /// Buffer element size does not match the configured word length
    WidthMismatch,
    /// Read into a read-only buffer
    ReadOnlyBuffer,
    /// Transfer in this direction is already in progress
    Busy,
    /// Baud rate cannot be reached with the peripheral clock
    InvalidBaudRate,
}

/// Serial channel with independent read and write transfers
pub struct Uart<P, R, W> {
    id: Id,
    inner: Mutex<RefCell<Inner<P, R, W>>>,
}

struct Inner<P, R, W> {
    port: P,
    config: Config,
    rx: Slot<R, Uart<P, R, W>>,
    tx: Slot<W, Uart<P, R, W>>,
}

type Completed<P, R, W> = (Option<Finished<Uart<P, R, W>>>, Option<Finished<Uart<P, R, W>>>);

impl<P, R, W> Uart<P, R, W>
where
    P: SerialPort,
    R: TransferPath,
    W: TransferPath,
{
    /// Create the channel, hardware is not touched until [`Uart::init`]
    pub fn new(port: P, config: Config, rx: R, tx: W) -> Self {
        Self {
            id: port.id(),
            inner: Mutex::new(RefCell::new(Inner {
                port,
                config,
                rx: Slot::new(rx, Direction::Read),
                tx: Slot::new(tx, Direction::Write),
            })),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn config(&self) -> Config {
        self.with(|inner| inner.config)
    }

    /// Configure the peripheral and DMA channels and register in [`ROUTER`]
    pub fn init(&'static self) -> Result<(), Error>
    where
        P: 'static,
        R: 'static,
        W: 'static,
    {
        let brr = self.with(|inner| {
            let config = inner.config;
            let brr = divisor(inner.port.clock_hz(), config.baud_rate, config.oversampling)?;
            inner.port.init(&config, brr);
            inner.rx.init();
            inner.tx.init();
            Ok(brr)
        })?;
        ROUTER.register(self.id, self);
        debug!("{} initialized, BRR={=u16:#x}", self.id, brr);
        Ok(())
    }

    /// Cancel all transfers and disable the peripheral
    ///
    /// Returns buffers of the cancelled (read, write) transfers.
    pub fn deinit(&self) -> (Option<Buffer>, Option<Buffer>) {
        let buffers = self.with(|inner| {
            let Inner { port, rx, tx, .. } = inner;
            let buffers = (rx.deinit(port), tx.deinit(port));
            port.deinit();
            buffers
        });
        ROUTER.unregister(self.id);
        debug!("{} deinitialized", self.id);
        buffers
    }

    /// Change baud rate keeping the rest of the configuration
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<(), Error> {
        self.with(|inner| {
            let brr = divisor(inner.port.clock_hz(), baud_rate, inner.config.oversampling)?;
            inner.port.write_divisor(brr);
            inner.config.baud_rate = baud_rate;
            Ok(())
        })
    }

    /// Unit size implied by current frame format
    pub fn unit(&self) -> Unit {
        self.with(|inner| Self::unit_of(&inner.config))
    }

    fn unit_of(config: &Config) -> Unit {
        match config.word_length {
            WordLength::DataBits9 => Unit::Word,
            WordLength::DataBits8 => Unit::Byte,
        }
    }

    /// Start receiving `len` units into `buffer`
    ///
    /// On success `callback` will be called with `param` once all units have
    /// been received. On error the buffer is returned unchanged.
    pub fn read(&self, buffer: Buffer, len: u16, callback: Callback<Self>, param: usize) -> Result<(), (Error, Buffer)> {
        self.with(|inner| {
            let unit = Self::unit_of(&inner.config);
            inner.rx.start(&mut inner.port, unit, buffer, len, callback, param)
        })
    }

    /// Start transmitting `len` units from `buffer`
    ///
    /// Completion is reported when the last unit has been transmitted.
    pub fn write(&self, buffer: Buffer, len: u16, callback: Callback<Self>, param: usize) -> Result<(), (Error, Buffer)> {
        self.with(|inner| {
            let unit = Self::unit_of(&inner.config);
            inner.tx.start(&mut inner.port, unit, buffer, len, callback, param)
        })
    }

    /// Units received so far, `None` if no read is in progress
    pub fn read_progress(&self) -> Option<u16> {
        self.with(|inner| inner.rx.progress())
    }

    /// Units transmitted so far, `None` if no write is in progress
    pub fn write_progress(&self) -> Option<u16> {
        self.with(|inner| inner.tx.progress())
    }

    /// Abort read without calling its callback, returns the buffer if a read was in progress
    pub fn cancel_read(&self) -> Option<Buffer> {
        self.with(|inner| inner.rx.cancel(&mut inner.port))
    }

    /// Abort write without calling its callback, returns the buffer if a write was in progress
    pub fn cancel_write(&self) -> Option<Buffer> {
        self.with(|inner| inner.tx.cancel(&mut inner.port))
    }

    /// Peripheral interrupt handler
    pub fn on_interrupt(&self) {
        let done = self.with(|inner| {
            let Inner { port, rx, tx, .. } = inner;
            if port.clear_errors() {
                warn!("{}: line error", self.id);
            }
            (tx.on_interrupt(port), rx.on_interrupt(port))
        });
        self.dispatch(done);
    }

    /// DMA interrupt handler, ignores interrupts of channels not used by this UART
    pub fn on_dma_interrupt(&self) {
        let done = self.with(|inner| {
            let Inner { port, rx, tx, .. } = inner;
            (tx.on_dma_interrupt(port), rx.on_dma_interrupt(port))
        });
        self.dispatch(done);
    }

    // Write completion goes first
    fn dispatch(&self, (tx, rx): Completed<P, R, W>) {
        if let Some(finished) = tx {
            trace!("{} write done: {=u16}", self.id, finished.count());
            finished.dispatch(self);
        }
        if let Some(finished) = rx {
            trace!("{} read done: {=u16}", self.id, finished.count());
            finished.dispatch(self);
        }
    }

    fn with<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Inner<P, R, W>) -> T,
    {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

impl<P, R, W> InterruptHandler for Uart<P, R, W>
where
    P: SerialPort,
    R: TransferPath,
    W: TransferPath,
{
    fn on_interrupt(&self) {
        Uart::on_interrupt(self);
    }

    fn on_dma_interrupt(&self) {
        Uart::on_dma_interrupt(self);
    }
}
