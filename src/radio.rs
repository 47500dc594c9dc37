//! Transceiver and clock abstractions.
//!
//! The protocol core never touches SPI or interrupts directly; it drives the
//! narrowband UHF transceiver through [`Radio`] and paces the link through
//! [`Clock`]. Implement both for your chip/board glue; the test suite
//! implements them with a scripted mock.

use thiserror::Error;

/// Link-layer errors a transceive can report.
///
/// These mirror the transceiver's receive status: anything other than
/// `NoResponse` in an inventory slot is treated as a collision by the
/// inventory engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// No tag backscatter within the no-response window.
    #[error("no tag response")]
    NoResponse,
    /// Preamble could not be decoded.
    #[error("preamble error")]
    Preamble,
    /// Receiver flagged a collision.
    #[error("collision")]
    Collision,
    /// Receive CRC mismatch.
    #[error("receive CRC error")]
    Crc,
    /// Expected reply header malformed.
    #[error("header error")]
    Header,
    /// Receive length differs from the expectation programmed into the chip.
    #[error("receive count error")]
    RxCount,
    /// The chip saw a set error-header bit in a delayed tag reply; the first
    /// received byte carries the tag's error code.
    #[error("tag signalled an error header")]
    ChipHeader,
}

/// Transceiver register addresses used by the protocol core.
///
/// The eight link registers starting at `TX_OPTIONS` are consecutive and are
/// programmed in one continuous write.
pub mod reg {
    pub const TX_OPTIONS: u8 = 0x01;
    pub const RX_OPTIONS: u8 = 0x02;
    pub const TRCAL_HIGH: u8 = 0x03;
    pub const TRCAL_LOW: u8 = 0x04;
    pub const AUTO_ACK_TIMER: u8 = 0x05;
    pub const RX_NO_RESPONSE_WAIT: u8 = 0x06;
    pub const RX_WAIT_TIME: u8 = 0x07;
    pub const RX_FILTER: u8 = 0x08;
    pub const PROTOCOL_CTRL: u8 = 0x09;
    pub const TX_SETTING: u8 = 0x0A;
    pub const IRQ_STATUS1: u8 = 0x0C;
    pub const MODULATOR_CONTROL2: u8 = 0x16;
    pub const MODULATOR_CONTROL4: u8 = 0x18;
    /// Receiver coupling/filter trim; poked for the Miller-4 short-preamble
    /// workaround.
    pub const ICD: u8 = 0x1F;
    pub const AGC_AND_STATUS: u8 = 0x2A;
    pub const MEASUREMENT_CONTROL: u8 = 0x2B;
}

/// Transceiver direct commands.
///
/// The Gen2 slot commands make the chip emit the corresponding air-interface
/// PDU (adding preamble, command prefix and CRC where applicable); the
/// transmit commands send the content of the TX buffer with the selected CRC
/// handling.
pub mod cmd {
    /// Transmit with CRC-16 appended.
    pub const TRANSM_CRC: u8 = 0x90;
    /// Transmit with CRC-16 appended, expect a delayed reply with a header bit.
    pub const TRANSM_CRC_EHEAD: u8 = 0x91;
    /// Re-enable the receiver to pick up a pending delayed reply.
    pub const ENABLE_RX: u8 = 0x97;
    pub const QUERY: u8 = 0x98;
    pub const QUERY_REP: u8 = 0x99;
    pub const QUERY_ADJUST_UP: u8 = 0x9A;
    pub const QUERY_ADJUST_NIC: u8 = 0x9B;
    pub const QUERY_ADJUST_DOWN: u8 = 0x9C;
    pub const ACK: u8 = 0x9D;
    pub const NAK: u8 = 0x9E;
    pub const REQ_RN: u8 = 0x9F;
}

/// Response bit for a completed transmission, for [`Radio::wait_for_response`].
pub const RESP_TX_IRQ: u16 = 0x0020;

/// Operations the protocol core needs from the transceiver.
///
/// Register accesses are infallible by design: the underlying SPI transport
/// either works or the board is dead. Only transceive operations carry a
/// protocol-meaningful error.
pub trait Radio {
    /// Read a single register.
    fn register_read(&mut self, reg: u8) -> u8;

    /// Write a single register.
    fn register_write(&mut self, reg: u8, value: u8);

    /// Read consecutive registers starting at `reg`.
    fn register_read_many(&mut self, reg: u8, buf: &mut [u8]);

    /// Write consecutive registers starting at `reg`.
    fn register_write_many(&mut self, reg: u8, data: &[u8]);

    /// Issue a direct command.
    fn direct_command(&mut self, cmd: u8);

    /// Transmit `tx_bits` bits of `tx` under direct command `cmd` (0 = no
    /// transmission, receive only), then collect backscatter into `rx`.
    ///
    /// On entry `rx_bits` holds the expected receive length in bits (or the
    /// buffer capacity for auto-length receives); on exit it holds the number
    /// of bits actually received. `follow_cmd` (0 = none) is chained by the
    /// chip immediately after a successful receive. A `no_resp_time` of 0xFF
    /// selects the maximum delayed-reply window.
    #[allow(clippy::too_many_arguments)]
    fn tx_rx_gen2(
        &mut self,
        cmd: u8,
        tx: &[u8],
        tx_bits: u16,
        rx: &mut [u8],
        rx_bits: &mut u16,
        no_resp_time: u8,
        follow_cmd: u8,
        wait_tx_irq: bool,
    ) -> Result<(), RadioError>;

    /// Specialized PC/XPC/EPC receive following an ACK, with built-in ACK
    /// retry on short receives. `retries` holds the remaining retry budget on
    /// entry and the unused budget on exit.
    fn rx_gen2_epc(
        &mut self,
        rx: &mut [u8],
        rx_bits: &mut u16,
        no_resp_time: u8,
        follow_cmd: u8,
        wait_tx_irq: bool,
        retries: &mut u8,
    ) -> Result<(), RadioError>;

    /// Switch the antenna carrier on or off.
    fn antenna_power(&mut self, on: bool);

    /// Clear latched IRQ/response state.
    fn clear_response(&mut self);

    /// Sample the measurement ADC.
    fn adc_read(&mut self) -> i8;

    /// Block until the response bits in `mask` are set.
    fn wait_for_response(&mut self, mask: u16);
}

/// Monotonic time source and busy-wait for link pacing.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn ticks_ms(&mut self) -> u32;

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);
}
