use core::sync::atomic;

use crate::hal;

/// Extension trait to split DMA into separate channels
pub trait DmaSplit {
    /// Structure holding DMA channels
    type Channels;

    /// Split DMA into independent channels
    fn split(self, rcc: &mut hal::rcc::Rcc) -> Self::Channels;
}

/// Single channel of DMA1, `C` is the channel number as in the reference manual (1-7)
pub struct DmaChannel<const C: u8>;
pub struct InterruptStatus(u8);
pub struct InterruptClear(u8);

pub struct Dma {
    pub ch1: DmaChannel<1>,
    pub ch2: DmaChannel<2>,
    pub ch3: DmaChannel<3>,
    pub ch4: DmaChannel<4>,
    pub ch5: DmaChannel<5>,
    pub ch6: DmaChannel<6>,
    pub ch7: DmaChannel<7>,
}

impl DmaSplit for hal::pac::DMA1 {
    type Channels = Dma;

    fn split(self, _rcc: &mut hal::rcc::Rcc) -> Self::Channels {
        enable_clock();

        Dma {
            ch1: DmaChannel,
            ch2: DmaChannel,
            ch3: DmaChannel,
            ch4: DmaChannel,
            ch5: DmaChannel,
            ch6: DmaChannel,
            ch7: DmaChannel,
        }
    }
}

fn enable_clock() {
    // Need to access some registers outside of HAL type system (field `regs` is private)
    let rcc_regs = unsafe { &*hal::pac::RCC::ptr() };
    rcc_regs.ahbenr.modify(|_, w| w.dmaen().enabled());
}

/// Direction of a DMA transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    PeripheralToMemory,
    MemoryToPeripheral,
}

/// Size of a single DMA data item, used for both memory and peripheral side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WordSize {
    Bits8,
    Bits16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// One-shot transfer description
///
/// Peripheral address is never incremented. Memory address is incremented only
/// if `memory_increment` is set, otherwise all `len` items use the same cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub peripheral: u32,
    pub memory: u32,
    pub memory_increment: bool,
    pub len: u16,
    pub word: WordSize,
    pub priority: Priority,
}

/// DMA reported a bus error during the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferError;

/// A DMA channel that can run one-shot transfers
pub trait DmaStream: Send {
    /// Prepare the channel for use, may be called multiple times
    fn init(&mut self);

    /// Configure and start a one-shot transfer with completion interrupt
    fn request(&mut self, req: &Request);

    /// Abort any ongoing transfer, a no-op if there is none
    fn cancel(&mut self);

    /// Number of data items that still have to be transferred
    fn remaining(&self) -> u16;

    /// Handle channel interrupt
    ///
    /// Returns `None` if the interrupt did not come from this channel or it
    /// did not end the transfer, otherwise the transfer result. Interrupt
    /// flags are always cleared.
    fn on_interrupt(&mut self) -> Option<Result<(), TransferError>>;
}

macro_rules! dma_channels {
    ($($C:literal => $ch:ident),+ $(,)?) => {
        $(
            impl DmaChannel<$C> {
                pub fn ch(&self) -> &hal::pac::dma1::CH {
                    unsafe { &(*hal::pac::DMA1::ptr()).$ch }
                }

                const OFFSET: usize = 4 * ($C - 1);
                const MASK: u32 = 0b1111;

                pub fn isr(&self) -> InterruptStatus {
                    let dma = unsafe { &*hal::pac::DMA1::ptr() };
                    InterruptStatus(((dma.isr.read().bits() >> Self::OFFSET) & Self::MASK) as u8)
                }

                pub fn ifcr<F>(&mut self, f: F)
                where
                    F: FnOnce(&mut InterruptClear) -> &mut InterruptClear
                {
                    let dma = unsafe { &*hal::pac::DMA1::ptr() };
                    let mut ifcr = InterruptClear(0);
                    let ifcr = f(&mut ifcr);
                    let mask = (ifcr.0 as u32 & Self::MASK) << Self::OFFSET;
                    unsafe { dma.ifcr.write(|w| w.bits(mask)); }
                }
            }

            impl DmaStream for DmaChannel<$C> {
                fn init(&mut self) {
                    enable_clock();
                    self.cancel();
                }

                fn request(&mut self, req: &Request) {
                    // Channel must be disabled to change its configuration
                    self.ch().cr.modify(|_, w| w.en().disabled());
                    self.ifcr(|w| w.all());

                    self.ch().cr.write(|w| {
                        let w = match req.direction {
                            Direction::PeripheralToMemory => w.dir().from_peripheral(),
                            Direction::MemoryToPeripheral => w.dir().from_memory(),
                        };
                        let w = match req.word {
                            WordSize::Bits8 => w.msize().bits8().psize().bits8(),
                            WordSize::Bits16 => w.msize().bits16().psize().bits16(),
                        };
                        let w = match req.priority {
                            Priority::Low => w.pl().low(),
                            Priority::Medium => w.pl().medium(),
                            Priority::High => w.pl().high(),
                        };
                        let w = if req.memory_increment {
                            w.minc().enabled()
                        } else {
                            w.minc().disabled()
                        };
                        w
                            .mem2mem().disabled()
                            .circ().disabled()
                            .pinc().disabled()
                            .htie().disabled()
                            .tcie().enabled()
                            .teie().enabled()
                    });
                    self.ch().par.write(|w| unsafe { w.pa().bits(req.peripheral) });
                    self.ch().mar.write(|w| unsafe { w.ma().bits(req.memory) });
                    self.ch().ndtr.write(|w| w.ndt().bits(req.len));

                    // "Preceding reads and writes cannot be moved past subsequent writes"
                    atomic::compiler_fence(atomic::Ordering::Release);

                    self.ch().cr.modify(|_, w| w.en().enabled());
                }

                fn cancel(&mut self) {
                    self.ch().cr.modify(|_, w| w.en().disabled());
                    self.ifcr(|w| w.all());
                }

                fn remaining(&self) -> u16 {
                    self.ch().ndtr.read().ndt().bits()
                }

                fn on_interrupt(&mut self) -> Option<Result<(), TransferError>> {
                    let isr = self.isr();
                    if !isr.any() {
                        // not an interrupt from our channel
                        return None;
                    }

                    self.ifcr(|w| w.all());

                    if isr.error() {
                        // Hardware already disabled the channel
                        self.ch().cr.modify(|_, w| w.en().disabled());
                        return Some(Err(TransferError));
                    }

                    if isr.complete() {
                        self.ch().cr.modify(|_, w| w.en().disabled());
                        // "Subsequent reads and writes cannot be moved ahead of preceding reads"
                        atomic::compiler_fence(atomic::Ordering::Acquire);
                        Some(Ok(()))
                    } else {
                        None
                    }
                }
            }
        )+
    }
}

dma_channels!(
    1 => ch1,
    2 => ch2,
    3 => ch3,
    4 => ch4,
    5 => ch5,
    6 => ch6,
    7 => ch7,
);

impl InterruptStatus {
    /// GIFx flag
    pub fn any(&self) -> bool {
        (self.0 & 0b0001) != 0
    }

    /// TCIFx flag
    pub fn complete(&self) -> bool {
        (self.0 & 0b0010) != 0
    }

    /// HTIFx flag
    pub fn half_complete(&self) -> bool {
        (self.0 & 0b0100) != 0
    }

    /// TEIFx flag
    pub fn error(&self) -> bool {
        (self.0 & 0b1000) != 0
    }
}

impl InterruptClear {
    pub fn all(&mut self) -> &mut Self {
        self.0 |= 0b0001;
        self
    }

    pub fn complete(&mut self) -> &mut Self {
        self.0 |= 0b0010;
        self
    }

    pub fn half_complete(&mut self) -> &mut Self {
        self.0 |= 0b0100;
        self
    }

    pub fn error(&mut self) -> &mut Self {
        self.0 |= 0b1000;
        self
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_status_flags() {
        let isr = InterruptStatus(0b0011);
        assert!(isr.any());
        assert!(isr.complete());
        assert!(!isr.half_complete());
        assert!(!isr.error());

        let isr = InterruptStatus(0b1001);
        assert!(isr.any());
        assert!(!isr.complete());
        assert!(isr.error());
    }

    #[test]
    fn interrupt_clear_builder() {
        let mut ifcr = InterruptClear(0);
        ifcr.complete().error();
        assert_eq!(ifcr.0, 0b1010);
        ifcr.all().half_complete();
        assert_eq!(ifcr.0, 0b1111);
    }
}
