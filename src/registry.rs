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

//! Registry of module slots, one per I2C address. A slot survives detach
//! (only `enabled` is cleared) so operator statistics keep their history
//! until the address is re-detected.

use crate::config::Settings;
use crate::fan::FanPid;
use crate::models::{
    DevDescription, Generation, FACTORY_INFO_CNT, OTP_LEN, PMU_CNT, POWER_INFO_CNT, RO_CHANNEL_CNT,
};
use crate::protocol::DNA_LEN;
use crate::sensor::TEMP_UNREAD;
use crate::telemetry::AckDetect;

use std::time::Instant;

/// Module slot count; addresses 1..MODULES_MAX-1 are usable, probing
/// MODULES_MAX itself only serves as the connecter overload tripwire.
pub const MODULES_MAX: usize = 7;

/// Frequency management state of one module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreqMode {
    /// Freshly attached, configuration not pushed yet
    Init,
    /// Configured; PLL is under module (smart-speed) authority
    PllAdjust,
}

/// Per-module state: identity, capability, configuration, telemetry and
/// counters. Storage is owned and sized from the device model descriptor;
/// every telemetry write bounds-checks against these dimensions.
pub struct ModuleSlot {
    pub addr: usize,
    pub enabled: bool,
    pub reboot: bool,
    pub attached: Instant,

    pub dna: [u8; DNA_LEN],
    pub version: String,
    pub generation: Generation,
    pub mod_type: u32,
    pub miner_count: usize,
    pub asic_count: usize,
    pub total_asics: u32,
    pub vin_adc_ratio: u16,
    pub vout_adc_ratio: u16,

    pub freq_mode: FreqMode,
    pub led_indicator: u32,
    pub fan_pct: u32,
    pub fan_cpm: u32,

    /// [miner][asic], -273 until first read
    pub temp: Vec<Vec<i32>>,
    pub temp_mm: i32,
    pub cutoff: bool,
    pub temp_overheat: i32,
    pub pid: FanPid,

    pub set_voltage_level: Vec<i32>,
    /// [miner][pll]
    pub set_frequency: Vec<Vec<u32>>,
    /// [miner][asic][pll] observed frequencies
    pub get_frequency: Vec<Vec<Vec<u32>>>,
    /// [miner][pll] PLL report (commanded set lands in set_frequency)
    pub get_pll: Vec<Vec<u32>>,
    pub get_vin: Vec<u16>,
    pub get_voltage: Vec<u32>,
    /// [miner][asic][2 + pll]: pass count, fail count, per-PLL hits
    pub get_asic: Vec<Vec<Vec<u32>>>,
    /// [miner][asic] core voltage in mV
    pub core_volt: Vec<Vec<u32>>,
    /// [miner][asic][channel] read-only PVT words (A9)
    pub pvt_ro: Vec<Vec<Vec<u32>>>,

    pub factory_info: [i8; FACTORY_INFO_CNT],
    pub overclocking_info: [u8; 1],

    pub local_works: u64,
    pub local_works_i: Vec<u64>,
    pub hw_works: u64,
    pub hw_works_i: Vec<u64>,
    /// [miner][asic]
    pub chip_matching_work: Vec<Vec<u64>>,
    /// Per miner plus the module aggregate at index miner_count
    pub error_code: Vec<u32>,
    pub error_crc: Vec<u32>,
    pub error_polling_cnt: u32,
    /// Replies rejected by the packet decoder (bad magic or CRC)
    pub crc_error_cnt: u32,

    pub power_good: u8,
    pub pmu_version: [String; PMU_CNT],
    pub diff1: f64,

    pub ss_para_en: bool,
    pub ss_para_target_temp: u8,

    /// [miner] assembled OTP lot-id slices (LC3)
    pub otp_info: Vec<[u8; OTP_LEN + 1]>,
    pub otp_cycle_hit: bool,
    pub set_asic_otp: Vec<u32>,
    pub power_info: [u16; POWER_INFO_CNT],

    /// Tuning resolved at attach from generation defaults and operator
    /// configuration
    pub settings: Settings,
}

impl ModuleSlot {
    pub fn new(
        addr: usize,
        dev: &DevDescription,
        ack: &AckDetect,
        settings: Settings,
        now: Instant,
    ) -> Self {
        let gen = dev.generation;
        let miners = dev.miner_count;
        let asics = dev.asic_count;
        let plls = gen.pll_count();

        let voltage_level = settings.voltage_level;
        let mut set_frequency = vec![vec![0u32; plls]; miners];
        for freq in set_frequency.iter_mut() {
            freq.copy_from_slice(dev.freq);
        }

        let pid = FanPid::new(&settings.tuning, settings.fan_min, settings.fan_max);

        Self {
            addr,
            enabled: true,
            reboot: false,
            attached: now,
            dna: ack.dna,
            version: ack.version.clone(),
            generation: gen,
            mod_type: dev.mod_type,
            miner_count: miners,
            asic_count: asics,
            total_asics: ack.total_asics,
            vin_adc_ratio: dev.vin_adc_ratio,
            vout_adc_ratio: dev.vout_adc_ratio,
            freq_mode: FreqMode::Init,
            led_indicator: 0,
            fan_pct: settings.fan_min,
            fan_cpm: 0,
            temp: vec![vec![TEMP_UNREAD; asics]; miners],
            temp_mm: TEMP_UNREAD,
            cutoff: false,
            temp_overheat: settings.tuning.temp_overheat,
            pid,
            set_voltage_level: vec![voltage_level; miners],
            set_frequency,
            get_frequency: vec![vec![vec![0; plls]; asics]; miners],
            get_pll: vec![vec![0; plls]; miners],
            get_vin: vec![0; miners],
            get_voltage: vec![0; miners],
            get_asic: vec![vec![vec![0; 2 + plls]; asics]; miners],
            core_volt: vec![vec![0; asics]; miners],
            pvt_ro: vec![vec![vec![0; RO_CHANNEL_CNT]; asics]; miners],
            factory_info: [0; FACTORY_INFO_CNT],
            overclocking_info: [0],
            local_works: 0,
            local_works_i: vec![0; miners],
            hw_works: 0,
            hw_works_i: vec![0; miners],
            chip_matching_work: vec![vec![0; asics]; miners],
            error_code: vec![0; miners + 1],
            error_crc: vec![0; miners],
            error_polling_cnt: 0,
            crc_error_cnt: 0,
            power_good: 0,
            pmu_version: Default::default(),
            diff1: 0.0,
            ss_para_en: false,
            ss_para_target_temp: 0,
            otp_info: vec![[0; OTP_LEN + 1]; miners],
            otp_cycle_hit: false,
            set_asic_otp: vec![settings.asic_otp; miners],
            power_info: [0; POWER_INFO_CNT],
            settings,
        }
    }

    /// Hottest reading across all ASICs and the module board sensor
    pub fn temp_max(&self) -> i32 {
        let mut max = TEMP_UNREAD;
        for miner in &self.temp {
            for t in miner {
                if *t > max {
                    max = *t;
                }
            }
        }
        max.max(self.temp_mm)
    }

    /// Estimated module hash rate in MH/s: per-PLL hit counters weighted by
    /// the observed ASIC frequencies
    pub fn hash_rate_mhs(&self) -> f64 {
        let plls = self.generation.pll_count();
        let mut mhs = 0.0;
        for i in 0..self.miner_count {
            for j in 0..self.asic_count {
                for k in 0..plls {
                    mhs += (self.get_asic[i][j][2 + k] as f64)
                        * (self.get_frequency[i][j][k] as f64);
                }
            }
        }
        mhs
    }

    /// Fraction of dead hashes observed by the ASICs, in percent
    pub fn dead_hash_ratio(&self) -> f64 {
        let mut pass = 0.0;
        let mut fail = 0.0;
        for i in 0..self.miner_count {
            for j in 0..self.asic_count {
                pass += self.get_asic[i][j][0] as f64;
                fail += self.get_asic[i][j][1] as f64;
            }
        }
        if fail > 0.0 {
            fail / (pass + fail) * 100.0
        } else {
            0.0
        }
    }

    /// Roll the per-miner work counters up into the module aggregates
    pub fn refresh_work_totals(&mut self) {
        self.local_works = self.local_works_i.iter().sum();
        self.hw_works = self.hw_works_i.iter().sum();
    }
}

/// Fixed table of module slots indexed by I2C address
pub struct Registry {
    slots: Vec<Option<ModuleSlot>>,
    /// More modules chained than one connecter supports
    pub conn_overloaded: bool,
}

impl Registry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MODULES_MAX);
        for _ in 0..MODULES_MAX {
            slots.push(None);
        }
        Self {
            slots,
            conn_overloaded: false,
        }
    }

    pub fn slot(&self, addr: usize) -> Option<&ModuleSlot> {
        self.slots.get(addr).and_then(|slot| slot.as_ref())
    }

    pub fn slot_mut(&mut self, addr: usize) -> Option<&mut ModuleSlot> {
        self.slots.get_mut(addr).and_then(|slot| slot.as_mut())
    }

    pub fn is_enabled(&self, addr: usize) -> bool {
        self.slot(addr).map(|slot| slot.enabled).unwrap_or(false)
    }

    /// A module observed on another slot must not be registered twice
    pub fn dna_exists(&self, dna: &[u8; DNA_LEN]) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|slot| slot.enabled && slot.dna == *dna)
    }

    pub fn install(&mut self, slot: ModuleSlot) {
        let addr = slot.addr;
        self.slots[addr] = Some(slot);
    }

    /// Clear `enabled` only; state stays for statistics and re-detect
    pub fn detach(&mut self, addr: usize) -> bool {
        match self.slot_mut(addr) {
            Some(slot) if slot.enabled => {
                slot.enabled = false;
                true
            }
            _ => false,
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.enabled)
            .count()
    }

    /// Addresses of enabled modules in polling order
    pub fn enabled_addrs(&self) -> Vec<usize> {
        (1..MODULES_MAX)
            .filter(|addr| self.is_enabled(*addr))
            .collect()
    }
}
