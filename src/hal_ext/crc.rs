//! CRC computation with hardware, table or bitwise implementation

use bitfield::bitfield;

use crate::hal;
use super::checksum::{ChecksumGen, Model};

bitfield! {
    /// CRC_CR
    #[derive(Clone, Copy, Default)]
    pub struct Cr(u32);
    pub reset, set_reset: 0;
    pub u8, polysize, set_polysize: 4, 3;
    pub u8, rev_in, set_rev_in: 6, 5;
    pub rev_out, set_rev_out: 7;
}

const HW_POLY: u32 = 0x04c1_1db7;
const HW_INIT: u32 = 0xffff_ffff;

/// Wrapper around CRC peripheral
///
/// The peripheral uses its reset polynomial and initial value, so only 32-bit
/// models with poly 0x04c11db7 and init 0xffffffff can be computed. Input and
/// output reflection are done in hardware, final XOR in software.
pub struct Crc {
    crc: hal::pac::CRC,
    xorout: u32,
}

impl Crc {
    /// Enable the peripheral and configure it for `model`
    ///
    /// Returns the peripheral back if the model cannot be computed in hardware.
    pub fn new(crc: hal::pac::CRC, _rcc: &mut hal::rcc::Rcc, model: &Model) -> Result<Self, hal::pac::CRC> {
        if !Self::supports(model) {
            return Err(crc);
        }

        // Need to access `.regs` but it's private
        let rcc_regs = unsafe { &*hal::pac::RCC::ptr() };
        rcc_regs.ahbenr.modify(|_, w| w.crcen().enabled());

        let mut cr = Cr(0);
        cr.set_polysize(0b00); // 32-bit
        cr.set_rev_in(if model.refin { 0b01 } else { 0b00 }); // bit reversal done by byte
        cr.set_rev_out(model.refout);
        cr.set_reset(true);
        crc.cr.write(|w| unsafe { w.bits(cr.0) });

        Ok(Self { crc, xorout: model.xorout })
    }

    pub fn supports(model: &Model) -> bool {
        model.width == 32 && model.poly == HW_POLY && model.init == HW_INIT
    }

}

impl ChecksumGen for Crc {
    type Output = u32;

    fn reset(&mut self) {
        self.crc.cr.modify(|r, w| unsafe { w.bits(r.bits() | 1) });
    }

    fn push(&mut self, data: &[u8]) {
        let mut chunks32 = data.chunks_exact(4);

        // Feed most of the buffer as 32-bit values for faster calculation
        for c in &mut chunks32 {
            let word = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
            self.crc.dr().write(|w| w.dr().bits(word));
        }

        let mut chunks16 = chunks32.remainder().chunks_exact(2);
        for c in &mut chunks16 {
            let hword = u16::from_be_bytes([c[0], c[1]]);
            self.crc.dr16().write(|w| w.dr16().bits(hword));
        }

        for &byte in chunks16.remainder() {
            self.crc.dr8().write(|w| w.dr8().bits(byte));
        }
    }

    fn get(&self) -> Self::Output {
        self.crc.dr().read().bits() ^ self.xorout
    }
}

/// Requested CRC implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    /// Bit by bit, no memory needed
    Soft,
    /// 256-byte table, 8-bit models only
    Table8,
    /// 1 KiB table
    Table32,
    /// CRC peripheral
    Hard,
    /// Fastest available
    Best,
}

/// Resources that may be used by [`CrcEngine`]
#[derive(Default)]
pub struct Resources<'a> {
    pub hardware: Option<&'a mut Crc>,
    pub table8: Option<&'a [u8; 256]>,
    pub table32: Option<&'a [u32; 256]>,
}

enum Algorithm<'a> {
    Soft,
    Table8(&'a [u8; 256]),
    Table32(&'a [u32; 256]),
    Hard(&'a mut Crc),
}

/// CRC generator for any [`Model`]
///
/// Requested method falls back if its resources are not available or not
/// usable with the model. [`Method::Best`] tries hardware, then a table, then
/// bitwise; [`Method::Hard`] falls back directly to bitwise.
pub struct CrcEngine<'a> {
    model: Model,
    algorithm: Algorithm<'a>,
    reg: u32,
}

impl<'a> CrcEngine<'a> {
    pub fn new(model: Model, method: Method, resources: Resources<'a>) -> Self {
        let Resources { hardware, table8, table32 } = resources;

        let hard = matches!(method, Method::Hard | Method::Best);
        let table = matches!(method, Method::Table8 | Method::Table32 | Method::Best);

        let algorithm = match (hardware, table8, table32) {
            (Some(crc), _, _) if hard && Crc::supports(&model) => Algorithm::Hard(crc),
            (_, Some(t), _) if table && method != Method::Table32 && model.width == 8 => Algorithm::Table8(t),
            (_, _, Some(t)) if table => Algorithm::Table32(t),
            _ => Algorithm::Soft,
        };

        let mut engine = Self { model, algorithm, reg: 0 };
        engine.reset();
        engine
    }

    /// Software only engine
    pub fn soft(model: Model) -> Self {
        Self::new(model, Method::Soft, Resources::default())
    }

    /// Method that has been selected
    pub fn method(&self) -> Method {
        match self.algorithm {
            Algorithm::Soft => Method::Soft,
            Algorithm::Table8(_) => Method::Table8,
            Algorithm::Table32(_) => Method::Table32,
            Algorithm::Hard(_) => Method::Hard,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }
}

impl<'a> ChecksumGen for CrcEngine<'a> {
    type Output = u32;

    fn reset(&mut self) {
        match &mut self.algorithm {
            Algorithm::Hard(crc) => crc.reset(),
            _ => self.reg = self.model.initial(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.reg = match self.algorithm {
            Algorithm::Hard(ref mut crc) => return crc.push(data),
            Algorithm::Soft => self.model.update_soft(self.reg, data),
            Algorithm::Table8(table) => self.model.update_table8(self.reg, table, data),
            Algorithm::Table32(table) => self.model.update_table32(self.reg, table, data),
        };
    }

    fn get(&self) -> Self::Output {
        match &self.algorithm {
            Algorithm::Hard(crc) => crc.get(),
            _ => self.model.finalize(self.reg),
        }
    }
}
