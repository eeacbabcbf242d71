//! Hardware Abstraction Layer
//!
//! This module is an extension to `stm32f0xx_hal` that covers the pieces the
//! HAL does not provide: interrupt/DMA driven UART transfers, DMA channel
//! access, CRC computation and program bootstrapping.

pub mod bootstrap;
pub mod checksum;
pub mod crc;
pub mod dma;
pub mod uart;
