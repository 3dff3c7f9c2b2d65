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

//! Telemetry ingester: routes every received packet by type into the
//! owning module slot. Each handler bounds-checks the coordinates a module
//! reports before writing; out-of-range packets are dropped and logged
//! instead of corrupting neighbouring state.

use crate::logging::LOGGER;
use crate::models::{Generation, POWER_INFO_CNT, RO_CHANNEL_CNT};
use crate::protocol::{status, Packet, DNA_LEN, VERSION_LEN};
use crate::registry::ModuleSlot;
use crate::sensor;

use byteorder::{BigEndian, ByteOrder};
use slog::debug;

/// A nonce found by a module, before job matching
#[derive(Debug, Clone, PartialEq)]
pub struct NonceReport {
    pub miner: usize,
    pub chip_id: usize,
    pub nonce2: u32,
    pub ntime: u32,
    pub nonce: u32,
    pub job_id_crc: u16,
    pub pool_no: usize,
}

impl NonceReport {
    pub fn from_packet(packet: &Packet) -> Self {
        let data = &packet.data;
        let miner_word = BigEndian::read_u32(&data[0..4]);
        Self {
            miner: (miner_word & 0xffff) as usize,
            chip_id: ((miner_word >> 16) & 0xffff) as usize,
            nonce2: BigEndian::read_u32(&data[4..8]),
            ntime: BigEndian::read_u32(&data[8..12]),
            nonce: BigEndian::read_u32(&data[12..16]),
            job_id_crc: (data[16] as u16) << 8 | data[17] as u16,
            // unlike everything else this field arrives little endian
            pool_no: (data[18] as usize) | (data[19] as usize) << 8,
        }
    }
}

/// Module self-description carried by ACKDETECT
#[derive(Debug, Clone, PartialEq)]
pub struct AckDetect {
    pub dna: [u8; DNA_LEN],
    pub version: String,
    pub total_asics: u32,
}

impl AckDetect {
    pub fn from_packet(packet: &Packet) -> Self {
        let data = &packet.data;
        let mut dna = [0u8; DNA_LEN];
        dna.copy_from_slice(&data[..DNA_LEN]);

        let raw_version = &data[DNA_LEN..DNA_LEN + VERSION_LEN];
        let version = raw_version
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect();

        Self {
            dna,
            version,
            total_asics: BigEndian::read_u32(&data[DNA_LEN + VERSION_LEN..DNA_LEN + VERSION_LEN + 4]),
        }
    }
}

/// What the ingester made of a packet
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Needs job matching and submission, not applied here
    Nonce(NonceReport),
    /// Discovery handles these
    AckDetect,
    /// Telemetry stored into the slot
    Applied,
    /// Unknown or out-of-range packet, dropped
    Ignored(u8),
}

/// `raw * vout_adc_ratio / asic_count / 100`, the division order matters
fn decode_voltage(slot: &ModuleSlot, raw: u32) -> u32 {
    let asics = slot.asic_count.max(1) as u64;
    (raw as u64 * slot.vout_adc_ratio as u64 / asics / 100) as u32
}

/// `raw * vin_adc_ratio / 1000`
fn decode_vin(slot: &ModuleSlot, raw: u16) -> u16 {
    (raw as u32 * slot.vin_adc_ratio as u32 / 1000) as u16
}

/// Route one received packet into the slot
pub fn ingest(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    match packet.packet_type {
        status::NONCE => Ingested::Nonce(NonceReport::from_packet(packet)),
        status::ACKDETECT => Ingested::AckDetect,
        status::STATUS => apply_status(slot, packet),
        status::STATUS_VOLT => apply_status_volt(slot, packet),
        status::STATUS_PMU => match slot.generation {
            Generation::A9 => apply_status_pmu(slot, packet),
            Generation::Lc3 => apply_status_power(slot, packet),
        },
        status::STATUS_PLL => apply_status_pll(slot, packet),
        status::STATUS_PVT => apply_status_pvt(slot, packet),
        status::STATUS_ASIC => apply_status_asic(slot, packet),
        status::STATUS_ASIC_PLL if slot.generation == Generation::A9 => {
            apply_status_asic_pll(slot, packet)
        }
        status::STATUS_PVT_RO => match slot.generation {
            Generation::A9 => apply_status_pvt_ro(slot, packet),
            Generation::Lc3 => apply_status_otp(slot, packet),
        },
        status::STATUS_FAC => apply_status_fac(slot, packet),
        status::STATUS_OC => {
            slot.overclocking_info[0] = packet.data[0];
            Ingested::Applied
        }
        status::STATUS_SS_PARA if slot.generation == Generation::A9 => {
            slot.ss_para_en = packet.data[0] != 0;
            if slot.ss_para_en {
                slot.ss_para_target_temp = packet.data[1];
            }
            Ingested::Applied
        }
        other => {
            debug!(LOGGER, "module {}: unknown response {:#x}", slot.addr, other);
            Ingested::Ignored(other)
        }
    }
}

fn apply_status(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    slot.temp_mm = BigEndian::read_u32(&data[0..4]) as i32;
    slot.fan_cpm = BigEndian::read_u32(&data[4..8]);

    let miner = packet.idx as usize;
    if miner < slot.miner_count {
        slot.local_works_i[miner] += BigEndian::read_u32(&data[8..12]) as u64;
        slot.hw_works_i[miner] += BigEndian::read_u32(&data[12..16]) as u64;
        slot.error_code[miner] = BigEndian::read_u32(&data[16..20]);
        slot.error_crc[miner] += BigEndian::read_u32(&data[24..28]);
    } else {
        debug!(LOGGER, "module {}: STATUS miner {} out of range", slot.addr, miner);
        return Ingested::Ignored(packet.packet_type);
    }

    // module aggregate error code rides at the cnt index
    let aggregate = packet.cnt as usize;
    if aggregate <= slot.miner_count {
        slot.error_code[aggregate] = BigEndian::read_u32(&data[20..24]);
    }
    Ingested::Applied
}

fn apply_status_volt(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    match slot.generation {
        Generation::A9 => {
            for miner in 0..slot.miner_count {
                let raw = BigEndian::read_u32(&data[miner * 4..miner * 4 + 4]);
                slot.get_voltage[miner] = decode_voltage(slot, raw);
            }
        }
        Generation::Lc3 => {
            slot.get_voltage[0] = BigEndian::read_u16(&data[0..2]) as u32;
        }
    }
    Ingested::Applied
}

fn apply_status_pmu(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    slot.power_good = data[16];
    for (i, version) in slot.pmu_version.iter_mut().enumerate() {
        let raw = &data[24 + i * 4..28 + i * 4];
        *version = raw.iter().map(|byte| *byte as char).collect();
    }
    for miner in 0..slot.miner_count {
        let raw = BigEndian::read_u16(&data[8 + miner * 2..10 + miner * 2]);
        slot.get_vin[miner] = decode_vin(slot, raw);
    }
    Ingested::Applied
}

fn apply_status_power(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    if data[12] != 0 {
        for i in 0..POWER_INFO_CNT - 1 {
            slot.power_info[i] = BigEndian::read_u16(&data[i * 2..i * 2 + 2]);
        }
    }
    Ingested::Applied
}

fn apply_status_pll(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    let miner = packet.idx as usize;
    if miner >= slot.miner_count {
        debug!(LOGGER, "module {}: PLL miner {} out of range", slot.addr, miner);
        return Ingested::Ignored(packet.packet_type);
    }
    let plls = slot.generation.pll_count();

    match slot.generation {
        Generation::A9 => {
            // opt set: observed PLL; opt clear: echo of the commanded table
            for k in 0..plls {
                let value = BigEndian::read_u32(&data[k * 4..k * 4 + 4]);
                if packet.opt != 0 {
                    slot.get_pll[miner][k] = value;
                } else {
                    slot.set_frequency[miner][k] = value;
                }
            }
        }
        Generation::Lc3 => {
            for k in 0..plls {
                slot.get_pll[miner][k] = BigEndian::read_u32(&data[k * 4..k * 4 + 4]);
                let commanded =
                    BigEndian::read_u32(&data[plls * 4 + k * 4..plls * 4 + k * 4 + 4]);
                if commanded != 0 {
                    slot.set_frequency[miner][k] = commanded;
                }
            }
        }
    }
    Ingested::Applied
}

fn apply_status_pvt(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    let asic = packet.idx as usize;
    if slot.asic_count == 0 || asic >= slot.asic_count {
        return Ingested::Ignored(packet.packet_type);
    }

    for miner in 0..slot.miner_count {
        let code = BigEndian::read_u16(&data[miner * 4..miner * 4 + 2]);
        slot.temp[miner][asic] = sensor::decode_pvt_temp(code) as i32;

        let raw = BigEndian::read_u16(&data[miner * 4 + 2..miner * 4 + 4]);
        slot.core_volt[miner][asic] = sensor::decode_pvt_volt(raw);
    }
    Ingested::Applied
}

fn apply_status_asic(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    if slot.asic_count == 0 {
        return Ingested::Ignored(packet.packet_type);
    }
    let miner = packet.idx as usize / slot.asic_count;
    let asic = packet.idx as usize % slot.asic_count;
    if miner >= slot.miner_count {
        debug!(LOGGER, "module {}: ASIC report {} out of range", slot.addr, packet.idx);
        return Ingested::Ignored(packet.packet_type);
    }
    let plls = slot.generation.pll_count();

    match slot.generation {
        Generation::A9 => {
            let pass = BigEndian::read_u32(&data[0..4]);
            if pass != 0 {
                slot.get_asic[miner][asic][0] = pass;
            }
            let fail = BigEndian::read_u32(&data[4..8]);
            if fail != 0 {
                slot.get_asic[miner][asic][1] = fail;
            }
            for k in 0..plls {
                slot.get_asic[miner][asic][2 + k] =
                    BigEndian::read_u16(&data[8 + k * 2..10 + k * 2]) as u32;
            }
        }
        Generation::Lc3 => {
            if data[31] != 0 {
                slot.get_asic[miner][asic][0] = BigEndian::read_u32(&data[0..4]);
                slot.get_asic[miner][asic][1] = BigEndian::read_u32(&data[4..8]);
            }
            for k in 0..plls {
                slot.get_asic[miner][asic][2 + k] = data[8 + k] as u32;
            }
            for k in 0..plls {
                let offset = 8 + plls + k * 2;
                slot.get_frequency[miner][asic][k] =
                    BigEndian::read_u16(&data[offset..offset + 2]) as u32;
            }
        }
    }
    Ingested::Applied
}

fn apply_status_asic_pll(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    if slot.asic_count == 0 {
        return Ingested::Ignored(packet.packet_type);
    }
    let miner = packet.idx as usize / slot.asic_count;
    let asic = packet.idx as usize % slot.asic_count;
    if miner >= slot.miner_count {
        return Ingested::Ignored(packet.packet_type);
    }

    for k in 0..slot.generation.pll_count() {
        slot.get_frequency[miner][asic][k] =
            BigEndian::read_u16(&data[k * 2..k * 2 + 2]) as u32;
    }
    Ingested::Applied
}

fn apply_status_pvt_ro(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    if data[7] == 0 {
        return Ingested::Applied;
    }
    let miner = data[4] as usize;
    let asic = data[5] as usize;
    let channel = data[6] as usize;
    if miner >= slot.miner_count || asic >= slot.asic_count || channel >= RO_CHANNEL_CNT {
        debug!(
            LOGGER,
            "module {}: PVT_RO coordinate {}-{}-{} out of range", slot.addr, miner, asic, channel
        );
        return Ingested::Ignored(packet.packet_type);
    }
    slot.pvt_ro[miner][asic][channel] = BigEndian::read_u32(&data[0..4]);
    Ingested::Applied
}

/// OTP lot-id byte ranges delivered by read step
const OTP_READ_STEP_INDEX: usize = 27;
const OTP_CYCLE_HIT_INDEX: usize = 29;
const OTP_LOTID_CRC_OFFSET: usize = 0;
const OTP_LOTID_OFFSET: usize = 6;

fn apply_status_otp(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    if slot.otp_cycle_hit {
        return Ingested::Applied;
    }
    let data = &packet.data;

    // the ASIC refuses further reads once its cycle limit is reached
    if data[OTP_CYCLE_HIT_INDEX] != 0 {
        debug!(LOGGER, "module {}: OTP read cycle hit", slot.addr);
        slot.otp_cycle_hit = true;
        return Ingested::Applied;
    }

    let miner = packet.idx as usize;
    if miner >= slot.miner_count {
        return Ingested::Ignored(packet.packet_type);
    }

    let range = match data[OTP_READ_STEP_INDEX] {
        0 => OTP_LOTID_CRC_OFFSET..OTP_LOTID_CRC_OFFSET + 4,
        1 => OTP_LOTID_CRC_OFFSET + 4..OTP_LOTID_CRC_OFFSET + 6,
        2 => OTP_LOTID_OFFSET..OTP_LOTID_OFFSET + 4,
        3 => OTP_LOTID_OFFSET + 4..OTP_LOTID_OFFSET + 8,
        4 => OTP_LOTID_OFFSET + 8..OTP_LOTID_OFFSET + 12,
        5 => OTP_LOTID_OFFSET + 12..OTP_LOTID_OFFSET + 16,
        6 => OTP_LOTID_OFFSET + 16..OTP_LOTID_OFFSET + 20,
        _ => 0..0,
    };
    slot.otp_info[miner][range.clone()].copy_from_slice(&data[range]);

    // step/asic/hit trailer kept for the operator surface
    slot.otp_info[miner][OTP_READ_STEP_INDEX..OTP_READ_STEP_INDEX + 4]
        .copy_from_slice(&data[OTP_READ_STEP_INDEX..OTP_READ_STEP_INDEX + 4]);
    Ingested::Applied
}

fn apply_status_fac(slot: &mut ModuleSlot, packet: &Packet) -> Ingested {
    let data = &packet.data;
    match slot.generation {
        Generation::A9 => {
            for miner in 0..slot.miner_count {
                slot.factory_info[miner] = data[miner] as i8;
            }
        }
        Generation::Lc3 => {
            slot.factory_info[0] = data[0] as i8;
        }
    }
    Ingested::Applied
}
