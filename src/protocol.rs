// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! MM wire protocol: the 40 byte framed packet shared by all module
//! generations, its opcodes and the CRC-16 that guards the payload.

use crate::error::{self, ErrorKind};

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

/// Packet header magic
pub const MAGIC: [u8; 2] = [b'C', b'N'];

/// Size of the payload carried by every packet
pub const DATA_LEN: usize = 32;

/// Size of a packet on the wire
pub const PACKET_LEN: usize = 40;

/// Length of the module unique identifier
pub const DNA_LEN: usize = 8;

/// Length of the module version string (without NUL)
pub const VERSION_LEN: usize = 15;

/// I2C address used for broadcast sends (no reply expected)
pub const BROADCAST: u8 = 0;

/// Modified coinbase must fit this many bytes (prehash block included)
pub const COINBASE_SIZE_MAX: usize = 6 * 1024 + 64;

/// Upper bound on merkle branches a job may carry
pub const MERKLES_MAX: usize = 30;

/// Packet types sent from host to module
pub mod cmd {
    pub const DETECT: u8 = 0x10;

    pub const STATIC: u8 = 0x11;
    pub const JOB_ID: u8 = 0x12;
    pub const COINBASE: u8 = 0x13;
    pub const MERKLES: u8 = 0x14;
    pub const HEADER: u8 = 0x15;
    pub const TARGET: u8 = 0x16;
    pub const JOB_FIN: u8 = 0x17;

    pub const SET: u8 = 0x20;
    pub const SET_FIN: u8 = 0x21;
    pub const SET_VOLT: u8 = 0x22;
    pub const SET_PMU: u8 = 0x24;
    pub const SET_PLL: u8 = 0x25;
    pub const SET_SS: u8 = 0x26;
    pub const SET_FAC: u8 = 0x28;
    pub const SET_OC: u8 = 0x29;
    /// A9 only
    pub const SET_SS_PARA_EN: u8 = 0x2b;
    /// LC3 only
    pub const SET_ASIC_OTP: u8 = 0x50;
    /// A9 only; shares its number with the module-to-host direction
    pub const SET_ADJUST_VOLT: u8 = 0x51;

    pub const POLLING: u8 = 0x30;
    pub const SYNC: u8 = 0x31;
    pub const TEST: u8 = 0x32;
    pub const RSTMMTX: u8 = 0x33;
    pub const GET_VOLT: u8 = 0x34;
}

/// Packet types sent from module back to host
pub mod status {
    pub const ACKDETECT: u8 = 0x40;
    pub const STATUS: u8 = 0x41;
    pub const NONCE: u8 = 0x42;
    pub const TEST_RET: u8 = 0x43;
    pub const STATUS_VOLT: u8 = 0x46;
    /// STATUS_PMU on A9, STATUS_POWER on LC3
    pub const STATUS_PMU: u8 = 0x48;
    pub const STATUS_PLL: u8 = 0x49;
    pub const STATUS_LOG: u8 = 0x4a;
    pub const STATUS_ASIC: u8 = 0x4b;
    pub const STATUS_PVT: u8 = 0x4c;
    pub const STATUS_FAC: u8 = 0x4d;
    pub const STATUS_OC: u8 = 0x4e;
    /// STATUS_PVT_RO on A9, STATUS_OTP on LC3
    pub const STATUS_PVT_RO: u8 = 0x4f;
    /// A9 only
    pub const SET_ADJUST_VOLT: u8 = 0x51;
    /// A9 only
    pub const STATUS_ASIC_PLL: u8 = 0x52;
    /// A9 only
    pub const STATUS_SS_PARA: u8 = 0x53;
}

/// CRC-16/XMODEM (poly 0x1021, init 0), bit-exact with the MM firmware.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// On-wire packet layout. The CRC only covers the 32 byte payload,
/// the header is unguarded.
#[derive(PackedStruct, Debug, Clone, Copy, PartialEq)]
#[packed_struct(endian = "msb")]
pub struct Packet {
    pub head: [u8; 2],
    pub packet_type: u8,
    pub opt: u8,
    pub idx: u8,
    pub cnt: u8,
    pub data: [u8; DATA_LEN],
    pub crc: u16,
}

impl Packet {
    /// Build an outgoing packet; `opt` is always zero on the host side.
    pub fn new(packet_type: u8, idx: u8, cnt: u8, data: [u8; DATA_LEN]) -> Self {
        Self {
            head: MAGIC,
            packet_type,
            opt: 0,
            idx,
            cnt,
            data,
            crc: crc16(&data),
        }
    }

    #[inline]
    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        self.pack()
    }

    /// Parse and validate a received packet. Magic mismatch and payload CRC
    /// mismatch are distinct rejections so the caller can account them.
    pub fn from_bytes(bytes: &[u8]) -> error::Result<Self> {
        let mut raw = [0u8; PACKET_LEN];
        if bytes.len() != PACKET_LEN {
            Err(ErrorKind::Packet(error::Packet::InvalidHeader))?;
        }
        raw.copy_from_slice(bytes);

        let packet = Self::unpack(&raw)
            .map_err(|_| ErrorKind::Packet(error::Packet::InvalidHeader))?;
        if packet.head != MAGIC {
            Err(ErrorKind::Packet(error::Packet::InvalidHeader))?;
        }
        if crc16(&packet.data) != packet.crc {
            Err(ErrorKind::Packet(error::Packet::BadCrc))?;
        }
        Ok(packet)
    }
}
