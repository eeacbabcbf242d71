use num::{Bounded, PrimInt, ToPrimitive};

/// Checksum generator
///
/// In principle this is similar to [`core::hash::Hasher`] but allows to use output
/// different than u64.
pub trait ChecksumGen {
    /// Checksum type (e.g. [`u32`])
    type Output: PrimInt;

    /// Reset internal state to start generating checksum for new data
    fn reset(&mut self);

    /// Push data from slice to the generator
    ///
    /// One must call [`Self::reset`] before any [`Self::push`] sequence
    /// followed by [`Self::get`].
    fn push(&mut self, data: &[u8]);

    /// Retrieve checksum of all data pushed since last [`Self::reset`]
    fn get(&self) -> Self::Output;

    /// Push `data` and retrieve the final checksum
    fn decode(&mut self, data: &[u8]) -> Self::Output
    where
        Self: Sized
    {
        self.reset();
        self.push(data);
        self.get()
    }

    /// Number of bytes in the output checksum
    const LEN: usize = core::mem::size_of::<Self::Output>();

    /// Write checksum to `buf` in little-endian byte order
    fn write_le(checksum: Self::Output, buf: &mut [u8]) {
        let mask = <Self::Output as num::NumCast>::from(0xffu8).unwrap_or_else(Self::Output::max_value);
        for (i, byte) in buf.iter_mut().take(Self::LEN).enumerate() {
            *byte = ((checksum >> (8 * i)) & mask).to_u8().unwrap_or(0);
        }
    }

    /// Encode checksum of `buf[..data_len]` at the end of `buf`
    fn encode<'a>(&mut self, buf: &'a mut [u8], data_len: usize) -> Result<&'a [u8], Error>
    where
        Self: Sized
    {
        if buf.len() < data_len + Self::LEN {
            return Err(Error::BufTooShort);
        }
        let checksum = self.decode(&buf[..data_len]);
        Self::write_le(checksum, &mut buf[data_len..data_len + Self::LEN]);
        Ok(&buf[..data_len + Self::LEN])
    }

    /// Verify little-endian checksum at the end of `data`, returns the data without it
    fn verify<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], Error>
    where
        Self: Sized
    {
        if data.len() < Self::LEN {
            return Err(Error::BufTooShort);
        }
        let (data, checksum) = data.split_at(data.len() - Self::LEN);
        let mut computed = [0u8; 16];
        Self::write_le(self.decode(data), &mut computed);
        if checksum == &computed[..Self::LEN] {
            Ok(data)
        } else {
            Err(Error::ChecksumInvalid)
        }
    }
}

/// Checksum error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    ChecksumInvalid,
    BufTooShort,
}

/// CRC algorithm parameters in the Rocksoft model
///
/// Computation uses a 32-bit register with the CRC aligned to its most
/// significant bit, so any width in 8..=32 shares the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub width: u8,
    pub poly: u32,
    pub init: u32,
    pub refin: bool,
    pub refout: bool,
    pub xorout: u32,
    /// CRC of ASCII "123456789"
    pub check: u32,
}

/// CRC-32 as computed by the STM32 CRC unit with bit reversal, also known as CRC-32/ISO-HDLC
pub const CRC_32: Model = Model {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xcbf4_3926,
};

/// Default configuration of the STM32 CRC unit
pub const CRC_32_MPEG_2: Model = Model {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0xffff_ffff,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x0376_e6e7,
};

pub const CRC_16_ARC: Model = Model {
    width: 16,
    poly: 0x8005,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0xbb3d,
};

/// CRC-8/SMBUS
pub const CRC_8: Model = Model {
    width: 8,
    poly: 0x07,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0xf4,
};

impl Model {
    const fn shift(&self) -> u32 {
        32 - self.width as u32
    }

    const fn mask(&self) -> u32 {
        u32::MAX >> self.shift()
    }

    const fn input(&self, byte: u8) -> u32 {
        let byte = if self.refin { byte.reverse_bits() } else { byte };
        (byte as u32) << 24
    }

    /// Register value at the start of computation
    pub const fn initial(&self) -> u32 {
        (self.init & self.mask()) << self.shift()
    }

    const fn step(&self, mut reg: u32) -> u32 {
        let poly = (self.poly & self.mask()) << self.shift();
        let mut bit = 0;
        while bit < 8 {
            reg = if reg & 0x8000_0000 != 0 { (reg << 1) ^ poly } else { reg << 1 };
            bit += 1;
        }
        reg
    }

    /// Bitwise update
    pub fn update_soft(&self, mut reg: u32, data: &[u8]) -> u32 {
        for &byte in data {
            reg = self.step(reg ^ self.input(byte));
        }
        reg
    }

    /// Byte-wise update using a table from [`Model::table32`]
    pub fn update_table32(&self, mut reg: u32, table: &[u32; 256], data: &[u8]) -> u32 {
        for &byte in data {
            let i = ((reg ^ self.input(byte)) >> 24) as usize;
            reg = (reg << 8) ^ table[i];
        }
        reg
    }

    /// Byte-wise update using a table from [`Model::table8`], only for 8-bit models
    pub fn update_table8(&self, reg: u32, table: &[u8; 256], data: &[u8]) -> u32 {
        let mut crc = (reg >> 24) as u8;
        for &byte in data {
            crc = table[(crc ^ (self.input(byte) >> 24) as u8) as usize];
        }
        (crc as u32) << 24
    }

    /// Final CRC value from the register
    pub const fn finalize(&self, reg: u32) -> u32 {
        let crc = if self.refout {
            reg.reverse_bits()
        } else {
            reg >> self.shift()
        };
        (crc ^ self.xorout) & self.mask()
    }

    /// Lookup table for [`Model::update_table32`]
    pub const fn table32(&self) -> [u32; 256] {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            table[i] = self.step((i as u32) << 24);
            i += 1;
        }
        table
    }

    /// Lookup table for [`Model::update_table8`]
    pub const fn table8(&self) -> [u8; 256] {
        let mut table = [0u8; 256];
        let mut i = 0;
        while i < 256 {
            table[i] = (self.step((i as u32) << 24) >> 24) as u8;
            i += 1;
        }
        table
    }

    pub fn compute(&self, data: &[u8]) -> u32 {
        self.finalize(self.update_soft(self.initial(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::vec::Vec;

    const CHECK: &[u8] = b"123456789";
    const MODELS: [Model; 4] = [CRC_32, CRC_32_MPEG_2, CRC_16_ARC, CRC_8];

    fn reference(model: &Model, data: &[u8]) -> u32 {
        match model.width {
            32 if model.refin => crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data),
            32 => crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2).checksum(data),
            16 => crc::Crc::<u16>::new(&crc::CRC_16_ARC).checksum(data) as u32,
            _ => crc::Crc::<u8>::new(&crc::CRC_8_SMBUS).checksum(data) as u32,
        }
    }

    fn random_data(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn check_values() {
        for model in MODELS.iter() {
            assert_eq!(model.compute(CHECK), model.check, "{:?}", model);
            assert_eq!(reference(model, CHECK), model.check, "{:?}", model);
        }
    }

    #[test]
    fn table32_matches_soft() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for model in MODELS.iter() {
            let table = model.table32();
            for len in [0, 1, 3, 4, 17, 100] {
                let data = random_data(&mut rng, len);
                let reg = model.update_table32(model.initial(), &table, &data);
                assert_eq!(model.finalize(reg), reference(model, &data), "{:?} len={}", model, len);
            }
        }
    }

    #[test]
    fn table8_matches_soft() {
        let mut rng = StdRng::seed_from_u64(8);
        let table = CRC_8.table8();
        for len in [1, 2, 64] {
            let data = random_data(&mut rng, len);
            let reg = CRC_8.update_table8(CRC_8.initial(), &table, &data);
            assert_eq!(CRC_8.finalize(reg), reference(&CRC_8, &data));
        }
    }

    #[test]
    fn const_tables() {
        const TABLE: [u32; 256] = CRC_32_MPEG_2.table32();
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 0x04c1_1db7);
        assert_eq!(TABLE[255], 0xb1f7_40b4);
    }

    struct Soft(Model, u32);

    impl ChecksumGen for Soft {
        type Output = u32;

        fn reset(&mut self) {
            self.1 = self.0.initial();
        }

        fn push(&mut self, data: &[u8]) {
            self.1 = self.0.update_soft(self.1, data);
        }

        fn get(&self) -> u32 {
            self.0.finalize(self.1)
        }
    }

    const DATA: [u8; 10] = [0xa5, 0xa5, 0xa5, 0xa5, 0x1b, 0xad, 0xb0, 0x02, 0x0d, 0x15];
    const DATA_CRC: [u8; 14] = [
        0xa5, 0xa5, 0xa5, 0xa5, 0x1b, 0xad, 0xb0, 0x02, 0x0d, 0x15,
        0x49, 0xde, 0xb2, 0xe3,
    ];

    #[test]
    fn encode() {
        let mut buf = [0u8; 32];
        buf[..DATA.len()].copy_from_slice(&DATA);
        let mut gen = Soft(CRC_32_MPEG_2, 0);
        let buf = gen.encode(&mut buf, DATA.len()).unwrap();
        assert_eq!(buf, DATA_CRC);
        assert_eq!(gen.encode(&mut [0u8; 12], 10), Err(Error::BufTooShort));
    }

    #[test]
    fn verify() {
        let mut gen = Soft(CRC_32_MPEG_2, 0);
        assert_eq!(gen.verify(&DATA_CRC).unwrap(), DATA);
        let mut data = DATA_CRC;
        data[0] ^= 0x10;
        assert_eq!(gen.verify(&data).unwrap_err(), Error::ChecksumInvalid);
        assert_eq!(gen.verify(&[1, 2]).unwrap_err(), Error::BufTooShort);
    }
}
