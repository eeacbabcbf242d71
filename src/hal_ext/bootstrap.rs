//! Selecting and starting programs stored in flash
//!
//! Each program image starts with a [`ProgramHeader`]. Program ID 0 is the
//! bootstrap itself. A program can request another one with [`switch`], which
//! stores the requested ID in RAM that is not initialized on startup and
//! resets the MCU; the bootstrap then calls [`boot_requested`].

use core::mem::MaybeUninit;
use core::ptr::{addr_of, addr_of_mut};

use cortex_m::{asm::bootload, peripheral::SCB};
use static_assertions as sa;

use super::checksum::ChecksumGen;

/// Value of [`ProgramHeader::kind`] for program images
pub const PROG_HEADER: u8 = 0x01;

/// Size of the serialized header
pub const HEADER_LEN: usize = 14;
sa::const_assert_eq!(HEADER_LEN, 4 + 4 + 1 + 4 + 1);

/// Offset of the data covered by [`ProgramHeader::crc`]
const CRC_START: usize = 4;

// Upper 24 bits tag the word as valid, lowest byte holds the program ID
const MAGIC_BOOT_PID: u32 = 0xb0075e00;
const MAGIC_MASK: u32 = 0xffffff00;

#[cfg_attr(target_os = "none", link_section = ".uninit.BOOT")]
static mut BOOT_PID: MaybeUninit<u32> = MaybeUninit::uninit();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Less data than the header size
    Truncated,
    /// Length does not cover any program or exceeds the image
    InvalidLength,
    /// Not a program header
    InvalidType,
    ChecksumMismatch,
}

/// Program image header, stored packed in little-endian byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProgramHeader {
    /// CRC-32 of the image excluding this field
    pub crc: u32,
    /// Length of the image including this header
    pub len: u32,
    pub kind: u8,
    /// Address of the program's vector table
    pub isr_vector: u32,
    pub pid: u8,
}

impl ProgramHeader {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let h: &[u8; HEADER_LEN] = data.get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(Error::Truncated)?;
        Ok(Self {
            crc: u32::from_le_bytes([h[0], h[1], h[2], h[3]]),
            len: u32::from_le_bytes([h[4], h[5], h[6], h[7]]),
            kind: h[8],
            isr_vector: u32::from_le_bytes([h[9], h[10], h[11], h[12]]),
            pid: h[13],
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.crc.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8] = self.kind;
        buf[9..13].copy_from_slice(&self.isr_vector.to_le_bytes());
        buf[13] = self.pid;
        buf
    }

    /// Check that `image` (starting with this header) holds a complete, intact program
    pub fn validate<C>(&self, image: &[u8], crc: &mut C) -> Result<(), Error>
    where
        C: ChecksumGen<Output = u32>,
    {
        let len = self.len as usize;
        if len <= HEADER_LEN || len > image.len() {
            return Err(Error::InvalidLength);
        }
        if self.kind != PROG_HEADER {
            return Err(Error::InvalidType);
        }
        if crc.decode(&image[CRC_START..len]) != self.crc {
            return Err(Error::ChecksumMismatch);
        }
        Ok(())
    }
}

/// Parse and validate a program image
pub fn inspect<C>(image: &[u8], crc: &mut C) -> Result<ProgramHeader, Error>
where
    C: ChecksumGen<Output = u32>,
{
    let header = ProgramHeader::parse(image)?;
    header.validate(image, crc)?;
    Ok(header)
}

/// Find the first valid program with the given ID
pub fn select<'a, I, C>(images: I, pid: u8, crc: &mut C) -> Option<(ProgramHeader, &'a [u8])>
where
    I: IntoIterator<Item = &'a [u8]>,
    C: ChecksumGen<Output = u32>,
{
    images.into_iter().find_map(|image| match inspect(image, crc) {
        Ok(header) if header.pid == pid => Some((header, image)),
        Ok(_) => None,
        Err(e) => {
            debug!("Skipping image at 0x{=u32:08x}: {}", image.as_ptr() as u32, e);
            None
        },
    })
}

/// Store program ID to be started after the next reset
pub fn set_boot_pid(pid: u8) {
    // NOTE(safety): single word volatile access, MaybeUninit<u32> has the layout of u32
    unsafe { addr_of_mut!(BOOT_PID).cast::<u32>().write_volatile(MAGIC_BOOT_PID | pid as u32) }
}

/// Program ID requested before the last reset, if any
///
/// Only meaningful after [`set_boot_pid`] or a reset, as the RAM is not
/// initialized on startup.
pub fn boot_pid() -> Option<u8> {
    let word = unsafe { addr_of!(BOOT_PID).cast::<u32>().read_volatile() };
    if word & MAGIC_MASK == MAGIC_BOOT_PID {
        Some(word as u8)
    } else {
        None
    }
}

pub fn clear_boot_pid() {
    unsafe { addr_of_mut!(BOOT_PID).cast::<u32>().write_volatile(0) }
}

/// Jump to the program described by `header`
///
/// # Safety
///
/// The header must have been validated. Peripherals and interrupts are left
/// in their current state.
pub unsafe fn boot(header: &ProgramHeader) -> ! {
    info!("Booting program {=u8} at 0x{=u32:08x}", header.pid, header.isr_vector);
    bootload(header.isr_vector as *const u32)
}

/// Start another program by resetting the MCU
pub fn switch(pid: u8) -> ! {
    set_boot_pid(pid);
    SCB::sys_reset()
}

/// Boot program requested with [`switch`]
///
/// Returns if no program has been requested, or if the requested one cannot
/// be found. The request is cleared so that a faulty program does not boot again.
///
/// # Safety
///
/// Must be called early during startup, see [`boot`].
pub unsafe fn boot_requested<'a, I, C>(images: I, crc: &mut C)
where
    I: IntoIterator<Item = &'a [u8]>,
    C: ChecksumGen<Output = u32>,
{
    let pid = match boot_pid() {
        Some(pid) if pid != 0 => pid,
        _ => return,
    };
    clear_boot_pid();
    match select(images, pid, crc) {
        Some((header, _)) => boot(&header),
        None => warn!("No valid program with pid {=u8}", pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_ext::checksum::CRC_32;
    use crate::hal_ext::crc::CrcEngine;
    use std::boxed::Box;
    use std::vec::Vec;

    fn image(pid: u8, program: &[u8]) -> &'static [u8] {
        let header = ProgramHeader {
            crc: 0,
            len: (HEADER_LEN + program.len()) as u32,
            kind: PROG_HEADER,
            isr_vector: 0x0800_4000,
            pid,
        };
        let mut data: Vec<u8> = header.to_bytes().to_vec();
        data.extend_from_slice(program);
        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&data[4..]);
        data[..4].copy_from_slice(&crc.to_le_bytes());
        Box::leak(data.into_boxed_slice())
    }

    fn corrupt(image: &[u8], f: impl FnOnce(&mut [u8])) -> &'static [u8] {
        let mut data = image.to_vec();
        f(&mut data);
        Box::leak(data.into_boxed_slice())
    }

    #[test]
    fn parse_header() {
        let data = [
            0x78, 0x56, 0x34, 0x12,
            0x20, 0x00, 0x00, 0x00,
            0x01,
            0x00, 0x40, 0x00, 0x08,
            0x03,
            0xff, 0xff,
        ];
        let header = ProgramHeader::parse(&data).unwrap();
        assert_eq!(header, ProgramHeader { crc: 0x12345678, len: 32, kind: 1, isr_vector: 0x0800_4000, pid: 3 });
        assert_eq!(header.to_bytes(), data[..HEADER_LEN]);
        assert_eq!(ProgramHeader::parse(&data[..13]), Err(Error::Truncated));
    }

    #[test]
    fn valid_image() {
        let img = image(2, b"program body");
        let mut crc = CrcEngine::soft(CRC_32);
        let header = inspect(img, &mut crc).unwrap();
        assert_eq!(header.pid, 2);
        assert_eq!(header.len as usize, img.len());

        // trailing data after the image is allowed
        let mut longer = img.to_vec();
        longer.extend_from_slice(&[0xff; 8]);
        assert!(inspect(&longer, &mut crc).is_ok());
    }

    #[test]
    fn invalid_images() {
        let img = image(1, b"abcd");
        let mut crc = CrcEngine::soft(CRC_32);

        assert_eq!(inspect(&img[..10], &mut crc), Err(Error::Truncated));
        assert_eq!(inspect(&img[..img.len() - 1], &mut crc), Err(Error::InvalidLength));
        assert_eq!(inspect(image(1, b""), &mut crc), Err(Error::InvalidLength));

        let bad_kind = corrupt(img, |d| d[8] = 0x02);
        assert_eq!(inspect(bad_kind, &mut crc), Err(Error::InvalidType));

        let bad_data = corrupt(img, |d| d[HEADER_LEN] ^= 0x01);
        assert_eq!(inspect(bad_data, &mut crc), Err(Error::ChecksumMismatch));

        let bad_pid = corrupt(img, |d| d[13] = 5);
        assert_eq!(inspect(bad_pid, &mut crc), Err(Error::ChecksumMismatch));
    }

    #[test]
    fn select_by_pid() {
        let a = image(1, b"first");
        let b_broken = corrupt(image(2, b"second"), |d| d[HEADER_LEN + 1] ^= 0xff);
        let b = image(2, b"second, fixed");
        let c = image(2, b"third");
        let images = [a, b_broken, b, c];
        let mut crc = CrcEngine::soft(CRC_32);

        let (header, img) = select(images, 2, &mut crc).unwrap();
        assert_eq!(header.pid, 2);
        assert_eq!(img.as_ptr(), b.as_ptr());

        assert_eq!(select(images, 1, &mut crc).map(|(_, img)| img.as_ptr()), Some(a.as_ptr()));
        assert!(select(images, 3, &mut crc).is_none());
    }

    #[test]
    fn boot_pid_storage() {
        set_boot_pid(7);
        assert_eq!(boot_pid(), Some(7));
        set_boot_pid(0);
        assert_eq!(boot_pid(), Some(0));
        clear_boot_pid();
        assert_eq!(boot_pid(), None);
        unsafe { boot_requested(core::iter::empty(), &mut CrcEngine::soft(CRC_32)) };
    }
}
