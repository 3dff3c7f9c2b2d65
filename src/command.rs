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

//! Builders for every control packet the host sends to modules. All of
//! them are pure: the driver decides whether a packet goes out addressed
//! or as a broadcast.

use crate::config::{AdjustVolt, Settings};
use crate::models::{Generation, FACTORY_INFO_CNT};
use crate::protocol::{cmd, Packet, DATA_LEN, DNA_LEN};

use byteorder::{BigEndian, ByteOrder};

/// DETECT probe for one candidate slot; the address rides at the payload
/// tail and the packet goes to the broadcast address.
pub fn detect(addr: usize) -> Packet {
    let mut data = [0u8; DATA_LEN];
    BigEndian::write_u32(&mut data[28..32], addr as u32);
    Packet::new(cmd::DETECT, 1, 1, data)
}

/// Confirm a detected module by echoing its DNA back
pub fn sync(dna: &[u8; DNA_LEN]) -> Packet {
    let mut data = [0u8; DATA_LEN];
    data[..DNA_LEN].copy_from_slice(dna);
    Packet::new(cmd::SYNC, 1, 1, data)
}

/// Ask a misbehaving module to reset its I2C transmitter
pub fn rstmmtx(dna: &[u8; DNA_LEN]) -> Packet {
    let mut data = [0u8; DATA_LEN];
    data[..DNA_LEN].copy_from_slice(dna);
    Packet::new(cmd::RSTMMTX, 1, 1, data)
}

/// Periodic poll. `fan_pwm` is only carried on fan adjustment ticks and is
/// marked with the top bit; a pending reboot request rides in byte 8.
pub fn polling(led: u32, fan_pwm: Option<u32>, reboot: bool) -> Packet {
    let mut data = [0u8; DATA_LEN];
    BigEndian::write_u32(&mut data[0..4], led);
    if let Some(pwm) = fan_pwm {
        BigEndian::write_u32(&mut data[4..8], pwm | 0x8000_0000);
    }
    if reboot {
        data[8] = 0x1;
    }
    Packet::new(cmd::POLLING, 1, 1, data)
}

/// First configuration packet: frequency selector, feature flags, nonce
/// mask and the speed mux parameters.
pub fn init_setting(settings: &Settings) -> Packet {
    let tuning = &settings.tuning;
    let mut data = [0u8; DATA_LEN];

    BigEndian::write_u32(&mut data[4..8], tuning.freq_sel);

    // flags: 0 = smart-speed switch, 1 = nonce check, 2 = roll enable
    let mut flags = if settings.smart_speed { 1u32 } else { 0 };
    flags |= tuning.nonce_check << 1;
    flags |= tuning.roll_enable << 2;
    data[8] = flags as u8;
    data[9] = tuning.nonce_mask as u8;

    BigEndian::write_u32(&mut data[10..14], tuning.mux_l2h);
    BigEndian::write_u32(&mut data[14..18], tuning.mux_h2l);
    BigEndian::write_u32(&mut data[18..22], tuning.h2ltime0_spd);
    BigEndian::write_u32(&mut data[22..26], settings.spdlow);
    BigEndian::write_u32(&mut data[26..30], tuning.spdhigh);
    data[30] = tuning.tbase as u8;

    Packet::new(cmd::SET, 1, 1, data)
}

/// Per-miner voltage levels, one encoded word each
pub fn set_voltage_level(gen: Generation, levels: &[i32], offset: i32) -> Packet {
    let mut data = [0u8; DATA_LEN];
    for (miner, level) in levels.iter().enumerate() {
        let encoded = gen.encode_voltage(level + offset);
        BigEndian::write_u32(&mut data[miner * 4..miner * 4 + 4], encoded);
    }
    Packet::new(cmd::SET_VOLT, 1, 1, data)
}

/// Per-miner PLL table as CPM register words plus the derived ASIC work
/// timeout. The generations index the packet differently: A9 packs
/// (miner, asic) into `idx`, LC3 sends the one-based miner.
pub fn set_freq(
    gen: Generation,
    freq: &[u32],
    miner_id: usize,
    asic_id: usize,
    miner_count: usize,
) -> Packet {
    let plls = gen.pll_count();
    let mut data = [0u8; DATA_LEN];
    for k in 0..plls {
        BigEndian::write_u32(&mut data[k * 4..k * 4 + 4], gen.cpm(freq[k]));
    }

    let idx = match gen {
        Generation::A9 => {
            BigEndian::write_u32(&mut data[plls * 4..plls * 4 + 4], gen.asic_timeout(freq));
            (((miner_id & 0x07) << 5) | (asic_id & 0x1f)) as u8
        }
        Generation::Lc3 => {
            BigEndian::write_u32(&mut data[plls * 4..plls * 4 + 4], 100);
            BigEndian::write_u32(
                &mut data[plls * 4 + 4..plls * 4 + 8],
                gen.asic_timeout(freq),
            );
            (miner_id + 1) as u8
        }
    };

    Packet::new(cmd::SET_PLL, idx, miner_count as u8, data)
}

/// Autonomous voltage adjustment window (A9)
pub fn set_adjust_volt(av: &AdjustVolt) -> Packet {
    let mut data = [0u8; DATA_LEN];
    BigEndian::write_u32(&mut data[0..4], av.up_init as u32);
    BigEndian::write_u32(&mut data[4..8], av.up_factor);
    BigEndian::write_u32(&mut data[8..12], av.up_threshold);
    BigEndian::write_u32(&mut data[12..16], av.down_init as u32);
    BigEndian::write_u32(&mut data[16..20], av.down_factor);
    BigEndian::write_u32(&mut data[20..24], av.down_threshold);
    BigEndian::write_u32(&mut data[24..28], av.time);
    BigEndian::write_u32(&mut data[28..32], av.enable);
    Packet::new(cmd::SET_ADJUST_VOLT, 1, 1, data)
}

/// Smart-speed thresholds. The A9 firmware wants them bit-packed together
/// with the per-level step parameters, the LC3 takes six plain words.
pub fn set_ss_param(gen: Generation, settings: &Settings) -> Packet {
    let tuning = &settings.tuning;
    let mut data = [0u8; DATA_LEN];

    match gen {
        Generation::A9 => {
            BigEndian::write_u32(&mut data[0..4], (tuning.th_pass << 16) | tuning.th_fail);
            BigEndian::write_u32(
                &mut data[4..8],
                ((tuning.th_add & 0x1) << 31)
                    | ((tuning.th_mssel & 0x1) << 30)
                    | ((tuning.th_ms & 0x3fff) << 16)
                    | (tuning.th_init & 0xffff),
            );
            BigEndian::write_u32(&mut data[8..12], tuning.th_timeout);

            // lv2..lv7 ride pairwise: (lvN+1 add, lvN add, lvN+1 ms, lvN ms)
            for pair in 0..3 {
                let low = settings.lv_th_ms[pair * 2];
                let high = settings.lv_th_ms[pair * 2 + 1];
                let low_add = settings.lv_th_add[pair * 2];
                let high_add = settings.lv_th_add[pair * 2 + 1];
                let word = ((high_add & 0x1) << 31)
                    | ((low_add & 0x1) << 15)
                    | ((high & 0x7fff) << 16)
                    | (low & 0x7fff);
                BigEndian::write_u32(&mut data[12 + pair * 4..16 + pair * 4], word);
            }
        }
        Generation::Lc3 => {
            BigEndian::write_u32(&mut data[0..4], tuning.th_pass);
            BigEndian::write_u32(&mut data[4..8], tuning.th_fail);
            BigEndian::write_u32(&mut data[8..12], tuning.th_init);
            BigEndian::write_u32(&mut data[12..16], tuning.th_ms);
            BigEndian::write_u32(&mut data[16..20], tuning.th_timeout);
            BigEndian::write_u32(&mut data[20..24], tuning.th_add);
        }
    }

    Packet::new(cmd::SET_SS, 1, 1, data)
}

/// Toggle module-side smart-speed parameter reporting (A9)
pub fn set_ss_param_en(enable: u8) -> Packet {
    let mut data = [0u8; DATA_LEN];
    data[0] = enable;
    Packet::new(cmd::SET_SS_PARA_EN, 1, 1, data)
}

/// Write the factory calibration blob back to the module
pub fn set_factory_info(info: &[i8; FACTORY_INFO_CNT]) -> Packet {
    let mut data = [0u8; DATA_LEN];
    for (byte, value) in data.iter_mut().zip(info.iter()) {
        *byte = *value as u8;
    }
    Packet::new(cmd::SET_FAC, 1, 1, data)
}

pub fn set_overclocking(info: &[u8; 1]) -> Packet {
    let mut data = [0u8; DATA_LEN];
    data[0] = info[0];
    Packet::new(cmd::SET_OC, 1, 1, data)
}

/// Select which ASIC each miner reads OTP from (LC3)
pub fn set_asic_otp(asics: &[u32], asic_max: usize) -> Packet {
    let mut data = [0u8; DATA_LEN];
    for (miner, asic) in asics.iter().enumerate() {
        let clamped = (*asic).min(asic_max as u32 - 1);
        BigEndian::write_u32(&mut data[miner * 4..miner * 4 + 4], clamped);
    }
    Packet::new(cmd::SET_ASIC_OTP, 1, 1, data)
}

/// End of the configuration sequence
pub fn set_finish() -> Packet {
    Packet::new(cmd::SET_FIN, 1, 1, [0u8; DATA_LEN])
}
