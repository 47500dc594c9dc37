//! Link-timing profiles: the register image a `(BLF, Tari, coding, TRext)`
//! combination programs into the transceiver.
//!
//! The eight link registers (TX options through RX filter) are consecutive in
//! the register map and written in one burst. TRcal is chosen so the tag
//! derives the requested backscatter frequency from the announced divide
//! ratio; the RX wait and filter values follow the transceiver's
//! characterization tables.

use crate::types::{Coding, DivideRatio, Gen2Config, LinkFrequency, Tari};

/// Register image for one link configuration, index 0 = TX options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkProfile {
    pub regs: [u8; 8],
    pub dr: DivideRatio,
}

impl LinkProfile {
    /// The RX no-response wait value embedded in the profile.
    pub fn no_response_time(&self) -> u8 {
        self.regs[5]
    }
}

/// Derive the register image for `config`.
pub fn derive(config: &Gen2Config) -> LinkProfile {
    let mut dr = DivideRatio::Dr64By3;
    let mut regs: [u8; 8];

    match config.blf {
        LinkFrequency::Khz640 => {
            regs = [0x20, 0xF0, 0x01, 0x4D, 0x03, 0x02, 0x01, 0x02];
        }
        LinkFrequency::Khz320 => {
            regs = [0x20, 0xC0, 0x02, 0x9B, 0x04, 0x02, 0x04, 0x27];
            if config.tari == Tari::Us6_25 {
                // TRcal = 25us
                dr = DivideRatio::Dr8;
                regs[2] = 0x00;
                regs[3] = 0xFA;
            }
            if config.tari == Tari::Us25 {
                regs[6] = 0x05;
            }
            if matches!(config.coding, Coding::Miller4 | Coding::Miller8) {
                regs[7] = 0x24;
            }
        }
        LinkFrequency::Khz256 => {
            regs = [0x20, 0x90, 0x03, 0x41, 0x05, 0x05, 0x05, 0x37];
            if config.tari == Tari::Us6_25 {
                // TRcal = 31.3us
                dr = DivideRatio::Dr8;
                regs[2] = 0x01;
                regs[3] = 0x39;
            }
            if config.tari == Tari::Us25 {
                regs[6] = 0x0B;
            }
            if matches!(config.coding, Coding::Miller4 | Coding::Miller8) {
                regs[7] = 0x34;
            } else if config.coding == Coding::Miller2 && config.trext {
                regs[7] = 0x27;
            }
        }
        LinkFrequency::Khz213 => {
            regs = [0x20, 0x80, 0x03, 0xE8, 0x06, 0x05, 0x06, 0x37];
            if config.tari == Tari::Us6_25 {
                // TRcal = 37.5us
                dr = DivideRatio::Dr8;
                regs[2] = 0x01;
                regs[3] = 0x77;
            }
            if config.tari == Tari::Us25 {
                regs[6] = 0x0B;
            }
            if matches!(config.coding, Coding::Miller4 | Coding::Miller8) {
                regs[7] = 0x34;
            }
        }
        LinkFrequency::Khz160 => {
            regs = [0x20, 0x60, 0x05, 0x35, 0x0A, 0x05, 0x08, 0x3F];
            if config.tari == Tari::Us12_5 {
                // TRcal = 50us
                dr = DivideRatio::Dr8;
                regs[2] = 0x01;
                regs[3] = 0xF4;
                regs[6] = 0x09;
            }
            if config.coding == Coding::Fm0 {
                regs[7] = 0xBF;
            }
        }
        LinkFrequency::Khz40 => {
            regs = [0x30, 0x00, 0x07, 0xD0, 0x3F, 0x0C, 0x24, 0xFF];
            dr = DivideRatio::Dr8;
        }
    }

    regs[0] |= config.tari as u8;
    regs[1] = (regs[1] & 0xF0) | (config.coding as u8) | (u8::from(config.trext) << 3);

    LinkProfile { regs, dr }
}

/// T4 settling delay in microseconds after Select and QueryAdjust.
///
/// 2.0 * 3 * Tari at a Tx-one length of 2; a non-zero `t4_min_us` override
/// wins.
pub fn t4_delay_us(config: &Gen2Config) -> u32 {
    if config.t4_min_us != 0 {
        return u32::from(config.t4_min_us);
    }
    match config.tari {
        Tari::Us25 => 150,
        Tari::Us12_5 => 75,
        Tari::Us6_25 => 38,
    }
}
