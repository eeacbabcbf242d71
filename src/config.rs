//! Firmware configuration

use crate::hal_ext::uart::{Config, Oversampling, Parity, StopBits, WordLength};

pub const SYSCLK_HZ: u32 = 48_000_000;
pub const PCLK_HZ: u32 = 48_000_000;

/// Serial port settings
///
/// Priority must match the RTIC task priority of the USART interrupt:
/// hardware priority is `(1 << NVIC_PRIO_BITS) - task_priority`.
pub const SERIAL: Config = Config::new()
    .baud_rate(115_200)
    .word_length(WordLength::DataBits8)
    .parity(Parity::None)
    .stop_bits(StopBits::One)
    .oversampling(Oversampling::By16)
    .priority(2);

/// Number of bytes received before they are echoed back
pub const ECHO_LEN: usize = 1;

pub const HEARTBEAT_MS: u64 = 5000;
