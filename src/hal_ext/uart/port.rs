//! USART register access
//!
//! [`SerialPort`] is everything the transfer engine needs from the peripheral.
//! [`Usart`] implements it for USART1-USART4 of STM32F072.

use core::ops::Deref;

use bitfield::bitfield;
use cortex_m::peripheral::NVIC;

use crate::hal;
use hal::pac::{self, usart1::RegisterBlock, Interrupt};
use super::{Direction, Error};

/// Hardware identity of a serial peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Id {
    Usart1,
    Usart2,
    Usart3,
    Usart4,
}

impl Id {
    pub const COUNT: usize = 4;
    pub const ALL: [Id; Self::COUNT] = [Id::Usart1, Id::Usart2, Id::Usart3, Id::Usart4];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// NVIC vector; USART3 and USART4 share a single one
    pub fn interrupt(self) -> Interrupt {
        match self {
            Id::Usart1 => Interrupt::USART1,
            Id::Usart2 => Interrupt::USART2,
            Id::Usart3 | Id::Usart4 => Interrupt::USART3_4,
        }
    }

    fn sibling(self) -> Option<Id> {
        match self {
            Id::Usart3 => Some(Id::Usart4),
            Id::Usart4 => Some(Id::Usart3),
            _ => None,
        }
    }
}

/// Number of bits in a frame, including the parity bit if enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WordLength {
    DataBits8,
    DataBits9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Oversampling {
    By16,
    By8,
}

/// Serial line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub baud_rate: u32,
    pub word_length: WordLength,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub oversampling: Oversampling,
    /// NVIC priority, 0 is the highest, at most [`Config::MAX_PRIORITY`]
    pub priority: u8,
}

impl Config {
    /// Lowest priority expressible with the implemented NVIC priority bits
    pub const MAX_PRIORITY: u8 = (1 << pac::NVIC_PRIO_BITS) - 1;

    /// 115200 baud, 8N1
    pub const fn new() -> Self {
        Self {
            baud_rate: 115_200,
            word_length: WordLength::DataBits8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            oversampling: Oversampling::By16,
            priority: 1,
        }
    }

    pub const fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub const fn word_length(mut self, word_length: WordLength) -> Self {
        self.word_length = word_length;
        self
    }

    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub const fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub const fn oversampling(mut self, oversampling: Oversampling) -> Self {
        self.oversampling = oversampling;
        self
    }

    /// Values above [`Config::MAX_PRIORITY`] are clamped to it
    pub const fn priority(mut self, priority: u8) -> Self {
        self.priority = if priority > Self::MAX_PRIORITY { Self::MAX_PRIORITY } else { priority };
        self
    }

    /// Value for the NVIC priority register, unimplemented low bits are zero
    pub const fn nvic_priority(&self) -> u8 {
        let priority = if self.priority > Self::MAX_PRIORITY { Self::MAX_PRIORITY } else { self.priority };
        priority << (8 - pac::NVIC_PRIO_BITS)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt sources used by the engine
///
/// Enable bits in CR1 and status flags in ISR use the same bit positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    RxNotEmpty,
    TransmissionComplete,
    TxEmpty,
}

impl Event {
    pub const fn mask(self) -> u32 {
        match self {
            Event::RxNotEmpty => 1 << 5,
            Event::TransmissionComplete => 1 << 6,
            Event::TxEmpty => 1 << 7,
        }
    }
}

bitfield! {
    /// USART_CR1
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Cr1(u32);
    pub ue, set_ue: 0;
    pub re, set_re: 2;
    pub te, set_te: 3;
    pub rxneie, set_rxneie: 5;
    pub tcie, set_tcie: 6;
    pub txeie, set_txeie: 7;
    pub ps, set_ps: 9;
    pub pce, set_pce: 10;
    pub m0, set_m0: 12;
    pub over8, set_over8: 15;
    pub m1, set_m1: 28;
}

bitfield! {
    /// USART_CR2
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Cr2(u32);
    pub u8, stop, set_stop: 13, 12;
}

impl Cr1 {
    /// Enabled peripheral with both directions, all interrupts disabled
    pub fn from_config(config: &Config) -> Self {
        let mut cr1 = Cr1(0);
        cr1.set_ue(true);
        cr1.set_re(true);
        cr1.set_te(true);
        // M[1:0] = 00: 8 bits, 01: 9 bits
        cr1.set_m0(config.word_length == WordLength::DataBits9);
        cr1.set_m1(false);
        match config.parity {
            Parity::None => {},
            Parity::Even => cr1.set_pce(true),
            Parity::Odd => {
                cr1.set_pce(true);
                cr1.set_ps(true);
            },
        }
        cr1.set_over8(config.oversampling == Oversampling::By8);
        cr1
    }
}

impl Cr2 {
    pub fn from_config(config: &Config) -> Self {
        let mut cr2 = Cr2(0);
        cr2.set_stop(match config.stop_bits {
            StopBits::One => 0b00,
            StopBits::Two => 0b10,
        });
        cr2
    }
}

const CR3_DMAR: u32 = 1 << 6;
const CR3_DMAT: u32 = 1 << 7;
// PE, FE, NF, ORE in ISR; the matching clear bits in ICR are at the same positions
const LINE_ERRORS: u32 = 0b1111;
const RDR_MASK: u32 = 0x1ff;

/// Compute BRR value for the given bus clock
///
/// BRR holds a fixed point number: 12-bit mantissa and a 4-bit (oversampling
/// by 16) or 3-bit (oversampling by 8) fraction. Fraction is rounded to the
/// nearest value; rounding up to a full unit carries into the mantissa.
pub fn divisor(pclk: u32, baud: u32, oversampling: Oversampling) -> Result<u16, Error> {
    if baud == 0 {
        return Err(Error::InvalidBaudRate);
    }

    let (k, scale, max_fraction) = match oversampling {
        Oversampling::By8 => (2, 8, 0x07),
        Oversampling::By16 => (4, 16, 0x0f),
    };

    // Divider scaled by 100 to keep two decimal places
    let integer = 25 * pclk as u64 / (k * baud as u64);
    let mut mantissa = integer / 100;
    let mut fraction = ((integer - 100 * mantissa) * scale + 50) / 100;
    if fraction > max_fraction {
        mantissa += 1;
        fraction = 0;
    }

    let brr = (mantissa << 4) | fraction;
    if mantissa == 0 || brr > u16::MAX as u64 {
        return Err(Error::InvalidBaudRate);
    }
    Ok(brr as u16)
}

/// Serial peripheral as seen by the transfer engine
pub trait SerialPort: Send {
    fn id(&self) -> Id;

    /// Enable clock, configure the line and enable the NVIC vector
    fn init(&mut self, config: &Config, brr: u16);

    /// Disable peripheral, its interrupt vector and clock
    fn deinit(&mut self);

    /// Bus clock feeding the baud rate generator
    fn clock_hz(&self) -> u32;

    /// Program a new baud rate divisor, see [`divisor`]
    fn write_divisor(&mut self, brr: u16);

    fn listen(&mut self, event: Event);

    fn unlisten(&mut self, event: Event);

    /// Event flag is set and its interrupt is enabled
    fn is_pending(&self, event: Event) -> bool;

    /// Clear parity/framing/noise/overrun flags, returns true if any was set
    fn clear_errors(&mut self) -> bool;

    fn read_data(&mut self) -> u16;

    fn write_data(&mut self, word: u16);

    /// Enable/disable DMA request line for the given direction
    fn set_dma_request(&mut self, dir: Direction, enable: bool);

    /// Address of the data register for DMA transfers
    fn data_register(&self, dir: Direction) -> u32;
}

/// USART peripheral that can be used with [`Usart`]
pub trait Instance: Deref<Target = RegisterBlock> + Send + 'static {
    const ID: Id;

    fn regs() -> &'static RegisterBlock;

    #[doc(hidden)]
    fn set_clock(enable: bool);

    #[doc(hidden)]
    fn reset();
}

macro_rules! usart {
    ($($USART:ident => ($id:ident, $enr:ident, $rstr:ident, $bit:literal)),+ $(,)?) => {
        $(
            impl Instance for pac::$USART {
                const ID: Id = Id::$id;

                fn regs() -> &'static RegisterBlock {
                    unsafe { &*pac::$USART::ptr() }
                }

                fn set_clock(enable: bool) {
                    // Need to access `.regs` but it's private
                    let rcc_regs = unsafe { &*pac::RCC::ptr() };
                    rcc_regs.$enr.modify(|r, w| unsafe {
                        if enable {
                            w.bits(r.bits() | (1 << $bit))
                        } else {
                            w.bits(r.bits() & !(1 << $bit))
                        }
                    });
                }

                fn reset() {
                    let rcc_regs = unsafe { &*pac::RCC::ptr() };
                    rcc_regs.$rstr.modify(|r, w| unsafe { w.bits(r.bits() | (1 << $bit)) });
                    rcc_regs.$rstr.modify(|r, w| unsafe { w.bits(r.bits() & !(1 << $bit)) });
                }
            }
        )+
    };
}

usart!(
    USART1 => (Usart1, apb2enr, apb2rstr, 14),
    USART2 => (Usart2, apb1enr, apb1rstr, 17),
    USART3 => (Usart3, apb1enr, apb1rstr, 18),
    USART4 => (Usart4, apb1enr, apb1rstr, 19),
);

/// Register level implementation of [`SerialPort`]
pub struct Usart<USART> {
    usart: USART,
    pclk: u32,
}

impl<USART: Instance> Usart<USART> {
    /// Take ownership of the peripheral; pins must already be in the correct alternate mode
    pub fn new<TX, RX>(usart: USART, _pins: (TX, RX), rcc: &hal::rcc::Rcc) -> Self
    where
        TX: hal::serial::TxPin<USART>,
        RX: hal::serial::RxPin<USART>,
    {
        Self { usart, pclk: rcc.clocks.pclk().0 }
    }

    /// Release the peripheral, it should be deinitialized first
    fn modify_cr1(&mut self, set: u32, clear: u32) {
        self.usart.cr1.modify(|r, w| unsafe { w.bits((r.bits() & !clear) | set) });
    }

    fn is_enabled(id: Id) -> bool {
        let regs = match id {
            Id::Usart1 => pac::USART1::regs(),
            Id::Usart2 => pac::USART2::regs(),
            Id::Usart3 => pac::USART3::regs(),
            Id::Usart4 => pac::USART4::regs(),
        };
        Cr1(regs.cr1.read().bits()).ue()
    }
}

impl<USART: Instance> SerialPort for Usart<USART> {
    fn id(&self) -> Id {
        USART::ID
    }

    fn init(&mut self, config: &Config, brr: u16) {
        USART::set_clock(true);
        USART::reset();

        // Registers have reset values, UE=0 so BRR is writable
        self.usart.brr.write(|w| unsafe { w.bits(brr as u32) });
        self.usart.cr2.write(|w| unsafe { w.bits(Cr2::from_config(config).0) });
        self.usart.cr3.write(|w| unsafe { w.bits(0) });
        self.usart.cr1.write(|w| unsafe { w.bits(Cr1::from_config(config).0) });

        let irq = USART::ID.interrupt();
        unsafe {
            let mut core = cortex_m::Peripherals::steal();
            core.NVIC.set_priority(irq, config.nvic_priority());
            NVIC::unmask(irq);
        }
    }

    fn deinit(&mut self) {
        self.usart.cr1.write(|w| unsafe { w.bits(0) });
        self.usart.cr3.write(|w| unsafe { w.bits(0) });

        // Keep the shared vector enabled if the other USART still uses it
        let shared = USART::ID.sibling().map(Self::is_enabled).unwrap_or(false);
        if !shared {
            NVIC::mask(USART::ID.interrupt());
        }

        USART::set_clock(false);
    }

    fn clock_hz(&self) -> u32 {
        self.pclk
    }

    fn write_divisor(&mut self, brr: u16) {
        // BRR can only be written with UE=0
        let cr1 = self.usart.cr1.read().bits();
        self.usart.cr1.write(|w| unsafe { w.bits(cr1 & !1) });
        self.usart.brr.write(|w| unsafe { w.bits(brr as u32) });
        self.usart.cr1.write(|w| unsafe { w.bits(cr1) });
    }

    fn listen(&mut self, event: Event) {
        self.modify_cr1(event.mask(), 0);
    }

    fn unlisten(&mut self, event: Event) {
        self.modify_cr1(0, event.mask());
    }

    fn is_pending(&self, event: Event) -> bool {
        let cr1 = self.usart.cr1.read().bits();
        let isr = self.usart.isr.read().bits();
        (cr1 & isr & event.mask()) != 0
    }

    fn clear_errors(&mut self) -> bool {
        let errors = self.usart.isr.read().bits() & LINE_ERRORS;
        if errors != 0 {
            self.usart.icr.write(|w| unsafe { w.bits(errors) });
        }
        errors != 0
    }

    fn read_data(&mut self) -> u16 {
        (self.usart.rdr.read().bits() & RDR_MASK) as u16
    }

    fn write_data(&mut self, word: u16) {
        self.usart.tdr.write(|w| unsafe { w.bits(word as u32 & RDR_MASK) });
    }

    fn set_dma_request(&mut self, dir: Direction, enable: bool) {
        let mask = match dir {
            Direction::Read => CR3_DMAR,
            Direction::Write => CR3_DMAT,
        };
        self.usart.cr3.modify(|r, w| unsafe {
            if enable {
                w.bits(r.bits() | mask)
            } else {
                w.bits(r.bits() & !mask)
            }
        });
    }

    fn data_register(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Read => self.usart.rdr.as_ptr() as u32,
            Direction::Write => self.usart.tdr.as_ptr() as u32,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_oversampling_16() {
        assert_eq!(divisor(48_000_000, 115_200, Oversampling::By16), Ok(0x1a1));
        assert_eq!(divisor(8_000_000, 9_600, Oversampling::By16), Ok(833));
        assert_eq!(divisor(24_000_000, 460_800, Oversampling::By16), Ok(0x034));
    }

    #[test]
    fn divisor_oversampling_8() {
        assert_eq!(divisor(48_000_000, 115_200, Oversampling::By8), Ok(0x341));
        // 48MHz / (8 * 3M) = 2.0
        assert_eq!(divisor(48_000_000, 3_000_000, Oversampling::By8), Ok(0x020));
    }

    #[test]
    fn divisor_fraction_carries_into_mantissa() {
        // 48MHz / 231125 = 207.68, fraction rounds up to 16/16
        assert_eq!(divisor(48_000_000, 231_125, Oversampling::By16), Ok(13 << 4));
    }

    #[test]
    fn divisor_out_of_range() {
        assert_eq!(divisor(48_000_000, 0, Oversampling::By16), Err(Error::InvalidBaudRate));
        assert_eq!(divisor(48_000_000, 48_000_000, Oversampling::By16), Err(Error::InvalidBaudRate));
        assert_eq!(divisor(48_000_000, 100, Oversampling::By16), Err(Error::InvalidBaudRate));
    }

    #[test]
    fn priority_is_clamped() {
        assert_eq!(Config::MAX_PRIORITY, 3);
        assert_eq!(Config::new().priority(2).nvic_priority(), 0x80);
        assert_eq!(Config::new().priority(7).priority, Config::MAX_PRIORITY);
        assert_eq!(Config::new().priority(4).nvic_priority(), 0xc0);

        let mut config = Config::new();
        config.priority = 200;
        assert_eq!(config.nvic_priority(), 0xc0);
    }

    #[test]
    fn control_registers_from_config() {
        let config = Config::new();
        assert_eq!(Cr1::from_config(&config).0, 0b1101);
        assert_eq!(Cr2::from_config(&config).0, 0);

        let config = Config::new()
            .word_length(WordLength::DataBits9)
            .parity(Parity::Odd)
            .oversampling(Oversampling::By8)
            .stop_bits(StopBits::Two);
        let cr1 = Cr1::from_config(&config);
        assert!(cr1.m0() && !cr1.m1());
        assert!(cr1.pce() && cr1.ps());
        assert!(cr1.over8());
        assert!(!cr1.rxneie() && !cr1.txeie() && !cr1.tcie());
        assert_eq!(cr1.0, (1 << 15) | (1 << 12) | (1 << 10) | (1 << 9) | 0b1101);
        assert_eq!(Cr2::from_config(&config).0, 0b10 << 12);
    }

    #[test]
    fn event_masks_match_cr1_fields() {
        let mut cr1 = Cr1(0);
        cr1.set_rxneie(true);
        assert_eq!(cr1.0, Event::RxNotEmpty.mask());
        let mut cr1 = Cr1(0);
        cr1.set_txeie(true);
        assert_eq!(cr1.0, Event::TxEmpty.mask());
        let mut cr1 = Cr1(0);
        cr1.set_tcie(true);
        assert_eq!(cr1.0, Event::TransmissionComplete.mask());
    }

    #[test]
    fn shared_vector() {
        assert_eq!(Id::Usart3.interrupt(), Id::Usart4.interrupt());
        assert_ne!(Id::Usart1.interrupt(), Id::Usart2.interrupt());
        for (i, id) in Id::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
    }
}
