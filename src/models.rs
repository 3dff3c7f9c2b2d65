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

//! Device model catalog and the generation strategy.
//!
//! The two MM generations share the wire protocol and the control loop but
//! differ in PLL table width, ASIC counts, voltage level domain, CPM
//! register tables and a handful of tuning defaults. Everything
//! generation-specific is resolved here once, at module attach time.

/// Maximum number of miners (hashboards) a module may report
pub const MINER_MAX: usize = 8;

/// PMU firmware version slots per module (A9)
pub const PMU_CNT: usize = 2;

/// Read-only PVT channels per ASIC (A9)
pub const RO_CHANNEL_CNT: usize = 12;

/// 16-bit words carried by a STATUS_POWER packet (LC3)
pub const POWER_INFO_CNT: usize = 6;

/// Factory info blob length (A9 uses all 8, LC3 the first 4)
pub const FACTORY_INFO_CNT: usize = 8;

/// OTP lot-id buffer length per miner (LC3)
pub const OTP_LEN: usize = 32;

/// `(2^32 * 1000) / (256 * 40)`, base of the per-ASIC timeout computation
const ASIC_TIMEOUT_CONST: u32 = 419_430_400;

/// A9 CPM register values for multiple-of-25 MHz frequencies (index = MHz / 25)
#[rustfmt::skip]
static CPM_TABLE_A9: [u32; 56] = [
    0x00000000, 0x0c041205, 0x0c041203, 0x0c031103, 0x0c041103, 0x0c079183,
    0x0c079503, 0x0c07ed83, 0x0c040603, 0x0c06c703, 0x0c078703, 0x0c042583,
    0x0c078683, 0x0c068603, 0x0c070603, 0x0c078603, 0x0c040503, 0x0c044503,
    0x0c048503, 0x0c04c503, 0x0c050503, 0x0c054503, 0x0c058503, 0x0c05c503,
    0x0c060503, 0x0c064503, 0x0c068503, 0x0c06c503, 0x0c070503, 0x0c074503,
    0x0c078503, 0x0c07c503, 0x0c040483, 0x0c042483, 0x0c044483, 0x0c046483,
    0x0c048483, 0x0c04a483, 0x0c04c483, 0x0c04e483, 0x0c050483, 0x0c052483,
    0x0c054483, 0x0c056483, 0x0c058483, 0x0c05a483, 0x0c05c483, 0x0c05e483,
    0x0c060483, 0x0c062483, 0x0c064483, 0x0c066483, 0x0c068483, 0x0c06a483,
    0x0c06c483, 0x0c06e483,
];

/// A9 CPM register values for the 712.5 + n*25 MHz grid (700-900 MHz band)
#[rustfmt::skip]
static CPM_TABLE2_A9: [u32; 8] = [
    0x0c072503, // 712.5
    0x0c076503, // 737.5
    0x0c07a503, // 765.5
    0x0c07e503, // 787.5
    0x0c082503, // 812.5
    0x0c086503, // 837.5
    0x0c08a503, // 865.5
    0x0c08e503, // 887.5
];

/// LC3 CPM register values (index = MHz / 25)
#[rustfmt::skip]
static CPM_TABLE_LC3: [u32; 49] = [
    0x04400000, 0x04000000, 0x008ffbe1, 0x0097fde1, 0x009fffe1, 0x009ddf61,
    0x009dcf61, 0x009f47c1, 0x009fbfe1, 0x009f37c1, 0x009daf61, 0x009b26c1,
    0x009da761, 0x00999e61, 0x009b9ee1, 0x009d9f61, 0x009f9fe1, 0x00991641,
    0x009a96a1, 0x009c1701, 0x009d9761, 0x009f17c1, 0x00958d61, 0x00968da1,
    0x00978de1, 0x00988e21, 0x00998e61, 0x009a8ea1, 0x009b8ee1, 0x009c8f21,
    0x009d8f61, 0x009e8fa1, 0x009f8fe1, 0x00900401, 0x00908421, 0x00910441,
    0x00918461, 0x00920481, 0x009284a1, 0x009304c1, 0x009384e1, 0x00940501,
    0x00948521, 0x00950541, 0x00958561, 0x00960581, 0x009685a1, 0x009705c1,
    0x009785e1,
];

/// `3.3 / 4095 * 25.62 / 5.62 * 1000 * 100`, truncated as the table stores it
const MM92X_VIN_ADC_RATIO: u16 = 367;
/// `3.3 / 4095 * 72.3 / 20 * 10000 * 100`, truncated as the table stores it
const MM92X_VOUT_ADC_RATIO: u16 = 2913;

/// Protocol generation of a module family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    A9,
    Lc3,
}

/// How the fan PID seeds its accumulator on the first in-band sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FanSeed {
    /// Quadratic curve over the module board temperature (A9)
    BoardQuadratic,
    /// The observed maximum temperature itself (LC3)
    MaxTemperature,
}

/// Temperature below which the PID clamps straight to `fan_min`
/// (before the first initialization)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoolFloor {
    /// `target - diff` (A9)
    BelowTarget(i32),
    /// Fixed threshold (LC3)
    Absolute(i32),
}

/// Generation level tuning defaults; operator configuration can override
/// most of them (see `config::Settings`).
#[derive(Debug, Clone)]
pub struct Tuning {
    pub temp_target: i32,
    pub temp_overheat: i32,
    pub pid_p: i32,
    pub pid_i: i32,
    pub pid_d: i32,
    pub pid_temp_max: i32,
    pub cool_floor: CoolFloor,
    pub fan_seed: FanSeed,
    pub freq_sel: u32,
    pub nonce_mask: u32,
    pub nonce_check: u32,
    pub roll_enable: u32,
    pub mux_l2h: u32,
    pub mux_h2l: u32,
    pub h2ltime0_spd: u32,
    pub spdhigh: u32,
    pub tbase: u32,
    pub th_pass: u32,
    pub th_fail: u32,
    pub th_init: u32,
    pub th_add: u32,
    pub th_ms: u32,
    pub th_mssel: u32,
    pub th_timeout: u32,
    pub auc_xdelay: u32,
}

impl Generation {
    /// PLL (clock domain) entries per miner
    pub fn pll_count(self) -> usize {
        match self {
            Generation::A9 => 7,
            Generation::Lc3 => 4,
        }
    }

    /// Upper bound of ASICs per miner
    pub fn asic_max(self) -> usize {
        match self {
            Generation::A9 => 26,
            Generation::Lc3 => 34,
        }
    }

    /// Share difficulty cap applied before target derivation
    pub fn diff_max(self) -> f64 {
        match self {
            Generation::A9 => 2911.0,
            Generation::Lc3 => 2700.0,
        }
    }

    /// Highest PLL frequency the operator may configure, in MHz
    pub fn freq_max(self) -> u32 {
        match self {
            Generation::A9 => 1200,
            Generation::Lc3 => 1404,
        }
    }

    /// Operator visible voltage level domain (inclusive)
    pub fn voltage_level_range(self) -> (i32, i32) {
        match self {
            Generation::A9 => (-15, 15),
            Generation::Lc3 => (0, 31),
        }
    }

    /// Encode a voltage level into its on-wire form. The A9 PMU wants a
    /// sign-magnitude byte pair, the LC3 takes the level verbatim.
    pub fn encode_voltage(self, level: i32) -> u32 {
        let (min, max) = self.voltage_level_range();
        let level = level.max(min).min(max);
        match self {
            Generation::A9 => {
                if level < 0 {
                    0x8080 | (-level) as u32
                } else {
                    0x8000 | level as u32
                }
            }
            Generation::Lc3 => level as u32,
        }
    }

    /// CPM register value for a PLL frequency in MHz. Frequencies sit on a
    /// 25 MHz grid (A9 additionally knows a 712.5 + n*25 grid); off-grid
    /// values clamp to the nearest table entry below.
    pub fn cpm(self, freq: u32) -> u32 {
        match self {
            Generation::A9 => {
                if freq % 25 == 0 {
                    let index = (freq / 25) as usize;
                    CPM_TABLE_A9[index.min(CPM_TABLE_A9.len() - 1)]
                } else {
                    let index = (freq.saturating_sub(712) / 25) as usize;
                    CPM_TABLE2_A9[index.min(CPM_TABLE2_A9.len() - 1)]
                }
            }
            Generation::Lc3 => {
                let index = (freq / 25) as usize;
                CPM_TABLE_LC3[index.min(CPM_TABLE_LC3.len() - 1)]
            }
        }
    }

    /// Per-ASIC work timeout derived from the fastest configured PLL
    pub fn asic_timeout(self, freq: &[u32]) -> u32 {
        let f = freq.iter().cloned().max().unwrap_or(0).max(1);
        ASIC_TIMEOUT_CONST / f * 83 / 100
    }

    pub fn tuning(self) -> Tuning {
        match self {
            Generation::A9 => Tuning {
                temp_target: 93,
                temp_overheat: 105,
                pid_p: 1,
                pid_i: 5,
                pid_d: 0,
                pid_temp_max: 105,
                cool_floor: CoolFloor::BelowTarget(5),
                fan_seed: FanSeed::BoardQuadratic,
                freq_sel: 7,
                nonce_mask: 24,
                nonce_check: 1,
                roll_enable: 1,
                mux_l2h: 0,
                mux_h2l: 1,
                h2ltime0_spd: 3,
                spdhigh: 7,
                tbase: 0,
                th_pass: 8,
                th_fail: 1000,
                th_init: 32767,
                th_add: 0,
                th_ms: 2,
                th_mssel: 0,
                th_timeout: 1_550_000,
                auc_xdelay: 24000,
            },
            Generation::Lc3 => Tuning {
                temp_target: 90,
                temp_overheat: 105,
                pid_p: 2,
                pid_i: 5,
                pid_d: 0,
                pid_temp_max: 100,
                cool_floor: CoolFloor::Absolute(50),
                fan_seed: FanSeed::MaxTemperature,
                freq_sel: 3,
                nonce_mask: 27,
                nonce_check: 1,
                roll_enable: 1,
                mux_l2h: 0,
                mux_h2l: 1,
                h2ltime0_spd: 3,
                spdhigh: 3,
                tbase: 0,
                th_pass: 200,
                th_fail: 7000,
                th_init: 32767,
                th_add: 1,
                th_ms: 5,
                th_mssel: 0,
                th_timeout: 16000,
                auc_xdelay: 19200,
            },
        }
    }
}

/// One catalog entry, keyed by a version string prefix
#[derive(Debug, Clone)]
pub struct DevDescription {
    pub prefix: &'static str,
    pub generation: Generation,
    pub mod_type: u32,
    pub miner_count: usize,
    /// ASICs per miner, must stay within `generation.asic_max()`
    pub asic_count: usize,
    pub vin_adc_ratio: u16,
    pub vout_adc_ratio: u16,
    pub voltage_level: i32,
    pub freq: &'static [u32],
    /// Model specific low speed level for the SET packet
    pub spdlow: u32,
}

static DEV_TABLE: [DevDescription; 4] = [
    DevDescription {
        prefix: "921",
        generation: Generation::A9,
        mod_type: 921,
        miner_count: 4,
        asic_count: 26,
        vin_adc_ratio: MM92X_VIN_ADC_RATIO,
        vout_adc_ratio: MM92X_VOUT_ADC_RATIO,
        voltage_level: 8,
        freq: &[0, 0, 0, 0, 0, 775, 787],
        spdlow: 6,
    },
    DevDescription {
        prefix: "920P",
        generation: Generation::A9,
        mod_type: 920,
        miner_count: 4,
        asic_count: 26,
        vin_adc_ratio: MM92X_VIN_ADC_RATIO,
        vout_adc_ratio: MM92X_VOUT_ADC_RATIO,
        voltage_level: 8,
        freq: &[0, 0, 0, 0, 0, 775, 787],
        spdlow: 6,
    },
    DevDescription {
        prefix: "920",
        generation: Generation::A9,
        mod_type: 920,
        miner_count: 4,
        asic_count: 26,
        vin_adc_ratio: MM92X_VIN_ADC_RATIO,
        vout_adc_ratio: MM92X_VOUT_ADC_RATIO,
        voltage_level: 5,
        freq: &[0, 0, 0, 0, 0, 700, 750],
        spdlow: 6,
    },
    DevDescription {
        prefix: "LC3",
        generation: Generation::Lc3,
        mod_type: 0xac3,
        miner_count: 4,
        asic_count: 34,
        vin_adc_ratio: 0,
        vout_adc_ratio: 0,
        voltage_level: 5,
        freq: &[0, 0, 0, 500],
        spdlow: 2,
    },
];

/// Find the catalog entry for a module version string. Longer prefixes are
/// listed first so "920P" modules don't fall through to the plain "920"
/// entry.
pub fn lookup(version: &str) -> Option<&'static DevDescription> {
    DEV_TABLE.iter().find(|dev| version.starts_with(dev.prefix))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup_by_prefix() {
        assert_eq!(lookup("9211908-14000").unwrap().mod_type, 921);
        assert_eq!(lookup("920P1908-1400").unwrap().voltage_level, 8);
        assert_eq!(lookup("9201908-14000").unwrap().voltage_level, 5);
        assert_eq!(lookup("LC31908-14000").unwrap().generation, Generation::Lc3);
        assert!(lookup("7411706-3cb4c").is_none());
    }

    #[test]
    fn test_encode_voltage_a9() {
        let gen = Generation::A9;
        assert_eq!(gen.encode_voltage(0), 0x8000);
        assert_eq!(gen.encode_voltage(8), 0x8008);
        assert_eq!(gen.encode_voltage(-3), 0x8083);
        // clamped to the domain
        assert_eq!(gen.encode_voltage(99), 0x800f);
        assert_eq!(gen.encode_voltage(-99), 0x808f);
    }

    #[test]
    fn test_encode_voltage_lc3() {
        let gen = Generation::Lc3;
        assert_eq!(gen.encode_voltage(5), 5);
        assert_eq!(gen.encode_voltage(99), 31);
        assert_eq!(gen.encode_voltage(-4), 0);
    }

    #[test]
    fn test_cpm_grid() {
        assert_eq!(Generation::A9.cpm(0), 0x00000000);
        assert_eq!(Generation::A9.cpm(775), 0x0c07c503);
        assert_eq!(Generation::A9.cpm(787), 0x0c07e503);
        assert_eq!(Generation::Lc3.cpm(500), 0x00940501);
    }

    #[test]
    fn test_asic_timeout() {
        // 419430400 / 787 * 83 / 100 with integer truncation at each step
        assert_eq!(Generation::A9.asic_timeout(&[0, 0, 0, 0, 0, 775, 787]), 442346);
        // all-zero table degrades to 1 MHz, not a division by zero
        assert_eq!(Generation::A9.asic_timeout(&[0, 0]), 419430400 / 1 * 83 / 100);
    }
}
