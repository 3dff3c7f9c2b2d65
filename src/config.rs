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

//! Operator configuration. One immutable [`Config`] value is built at
//! startup (TOML file plus command line overrides) and passed by reference
//! into the driver; [`Config::resolve`] turns it into the per-module
//! [`Settings`] once the module generation is known at attach time.

use crate::error::{self, ErrorKind};
use crate::models::{DevDescription, Tuning};

use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Default polling gap between modules
pub const DEFAULT_POLLING_DELAY_MS: u64 = 20;

/// Default fan duty bounds in percent
pub const DEFAULT_FAN_MIN: u32 = 5;
pub const DEFAULT_FAN_MAX: u32 = 100;

/// Voltage level offset domain (inclusive)
const VOLTAGE_OFFSET_MIN: i32 = -2;
const VOLTAGE_OFFSET_MAX: i32 = 1;

/// Union of both generations' per-PLL frequency caps; the generation
/// specific cap is enforced again at resolve time.
const FREQUENCY_CAP: u32 = 1404;

/// Adjust-voltage options broadcast to A9 modules during configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdjustVolt {
    pub up_init: i32,
    pub up_factor: u32,
    pub up_threshold: u32,
    pub down_init: i32,
    pub down_factor: u32,
    pub down_threshold: u32,
    pub time: u32,
    pub enable: u32,
}

impl Default for AdjustVolt {
    fn default() -> Self {
        Self {
            up_init: 5380,
            up_factor: 6,
            up_threshold: 5180,
            down_init: 5100,
            down_factor: 4,
            down_threshold: 5210,
            time: 600,
            enable: 1,
        }
    }
}

/// Raw configuration file shape
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    polling_delay: Option<u64>,
    fan_min: Option<u32>,
    fan_max: Option<u32>,
    temp_target: Option<i32>,
    voltage_level: Option<i32>,
    voltage_level_offset: Option<i32>,
    frequency: Option<Vec<u32>>,
    frequency_sel: Option<u32>,
    smart_speed: Option<bool>,
    nonce_mask: Option<u32>,
    nonce_check: Option<u32>,
    roll_enable: Option<u32>,
    mux_l2h: Option<u32>,
    mux_h2l: Option<u32>,
    h2ltime0_spd: Option<u32>,
    spdlow: Option<u32>,
    spdhigh: Option<u32>,
    tbase: Option<u32>,
    th_pass: Option<u32>,
    th_fail: Option<u32>,
    th_init: Option<u32>,
    th_add: Option<u32>,
    th_ms: Option<u32>,
    th_mssel: Option<u32>,
    th_timeout: Option<u32>,
    pid_p: Option<i32>,
    pid_i: Option<i32>,
    pid_d: Option<i32>,
    adjust_volt: Option<AdjustVolt>,
    lv_th_ms: Option<Vec<u32>>,
    lv_th_add: Option<Vec<u32>>,
    asic_otp: Option<u32>,
    iic_bus: Option<String>,
    auc_speed: Option<u32>,
    auc_xdelay: Option<u32>,
    device_id: Option<usize>,
    total_devices: Option<usize>,
}

/// Validated, immutable operator configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub polling_delay: Duration,
    pub fan_min: u32,
    pub fan_max: u32,
    pub temp_target: Option<i32>,
    pub voltage_level: Option<i32>,
    pub voltage_level_offset: i32,
    /// Per-PLL overrides; zero means "keep the model default slot value",
    /// missing tail entries are zero
    pub frequency: Vec<u32>,
    pub frequency_sel: Option<u32>,
    pub smart_speed: bool,
    pub nonce_mask: Option<u32>,
    pub nonce_check: Option<u32>,
    pub roll_enable: Option<u32>,
    pub mux_l2h: Option<u32>,
    pub mux_h2l: Option<u32>,
    pub h2ltime0_spd: Option<u32>,
    pub spdlow: Option<u32>,
    pub spdhigh: Option<u32>,
    pub tbase: Option<u32>,
    pub th_pass: Option<u32>,
    pub th_fail: Option<u32>,
    pub th_init: Option<u32>,
    pub th_add: Option<u32>,
    pub th_ms: Option<u32>,
    pub th_mssel: Option<u32>,
    pub th_timeout: Option<u32>,
    pub pid_p: Option<i32>,
    pub pid_i: Option<i32>,
    pub pid_d: Option<i32>,
    pub adjust_volt: AdjustVolt,
    /// Smart-speed level 2..7 th-ms values (A9)
    pub lv_th_ms: [u32; 6],
    /// Smart-speed level 2..7 th-add values (A9)
    pub lv_th_add: [u32; 6],
    pub asic_otp: Option<u32>,
    /// Probe this raw I2C bus instead of the AUC when set
    pub iic_bus: Option<String>,
    pub auc_speed: u32,
    pub auc_xdelay: Option<u32>,
    pub device_id: usize,
    pub total_devices: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_delay: Duration::from_millis(DEFAULT_POLLING_DELAY_MS),
            fan_min: DEFAULT_FAN_MIN,
            fan_max: DEFAULT_FAN_MAX,
            temp_target: None,
            voltage_level: None,
            voltage_level_offset: 0,
            frequency: Vec::new(),
            frequency_sel: None,
            smart_speed: true,
            nonce_mask: None,
            nonce_check: None,
            roll_enable: None,
            mux_l2h: None,
            mux_h2l: None,
            h2ltime0_spd: None,
            spdlow: None,
            spdhigh: None,
            tbase: None,
            th_pass: None,
            th_fail: None,
            th_init: None,
            th_add: None,
            th_ms: None,
            th_mssel: None,
            th_timeout: None,
            pid_p: None,
            pid_i: None,
            pid_d: None,
            adjust_volt: AdjustVolt::default(),
            lv_th_ms: [0; 6],
            lv_th_add: [0; 6],
            asic_otp: None,
            iic_bus: None,
            auc_speed: crate::auc::DEFAULT_SPEED,
            auc_xdelay: None,
            device_id: 0,
            total_devices: 1,
        }
    }
}

/// Per-module settings resolved from [`Config`] against a device model
#[derive(Debug, Clone)]
pub struct Settings {
    pub tuning: Tuning,
    pub fan_min: u32,
    pub fan_max: u32,
    pub smart_speed: bool,
    pub voltage_level: i32,
    pub voltage_level_offset: i32,
    /// Per-PLL operator overrides, zero entries keep the model default
    pub frequency: Vec<u32>,
    pub spdlow: u32,
    pub adjust_volt: AdjustVolt,
    pub lv_th_ms: [u32; 6],
    pub lv_th_add: [u32; 6],
    pub asic_otp: u32,
}

impl Config {
    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Path to the TOML configuration file")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("iic-bus")
                .long("iic-bus")
                .help("Probe modules on a raw I2C bus instead of the AUC")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("voltage-level")
                .long("voltage-level")
                .help("Override the per-miner voltage level")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("fan")
                .long("fan")
                .help("Fan duty bounds as MIN-MAX percent")
                .required(false)
                .takes_value(true),
        )
    }

    pub fn parse(matches: &clap::ArgMatches) -> error::Result<Self> {
        let file = match matches.value_of("config") {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&raw)
                    .map_err(|e| ErrorKind::Config(format!("cannot parse {}: {}", path, e)))?
            }
            None => ConfigFile::default(),
        };
        let mut config = Self::from_file(file)?;

        if let Some(bus) = matches.value_of("iic-bus") {
            config.iic_bus = Some(bus.to_string());
        }
        if let Some(level) = matches.value_of("voltage-level") {
            let level = level
                .parse::<i32>()
                .map_err(|_| ErrorKind::Config("voltage-level is not a number".to_string()))?;
            config.voltage_level = Some(level);
        }
        if let Some(fan) = matches.value_of("fan") {
            let mut parts = fan.splitn(2, '-');
            let min = parts.next().unwrap_or("").parse::<u32>();
            let max = parts.next().unwrap_or("").parse::<u32>();
            match (min, max) {
                (Ok(min), Ok(max)) => {
                    config.fan_min = min;
                    config.fan_max = max;
                }
                _ => Err(ErrorKind::Config("fan wants MIN-MAX percent".to_string()))?,
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile) -> error::Result<Self> {
        let defaults = Self::default();

        let mut lv_th_ms = [0u32; 6];
        let mut lv_th_add = [0u32; 6];
        if let Some(values) = &file.lv_th_ms {
            if values.len() > 6 {
                Err(ErrorKind::Config("lv_th_ms takes at most 6 values".to_string()))?;
            }
            lv_th_ms[..values.len()].copy_from_slice(values);
        }
        if let Some(values) = &file.lv_th_add {
            if values.len() > 6 {
                Err(ErrorKind::Config("lv_th_add takes at most 6 values".to_string()))?;
            }
            lv_th_add[..values.len()].copy_from_slice(values);
        }

        Ok(Self {
            polling_delay: Duration::from_millis(
                file.polling_delay.unwrap_or(DEFAULT_POLLING_DELAY_MS),
            ),
            fan_min: file.fan_min.unwrap_or(DEFAULT_FAN_MIN),
            fan_max: file.fan_max.unwrap_or(DEFAULT_FAN_MAX),
            temp_target: file.temp_target,
            voltage_level: file.voltage_level,
            voltage_level_offset: file.voltage_level_offset.unwrap_or(0),
            frequency: file.frequency.unwrap_or_default(),
            frequency_sel: file.frequency_sel,
            smart_speed: file.smart_speed.unwrap_or(true),
            nonce_mask: file.nonce_mask,
            nonce_check: file.nonce_check,
            roll_enable: file.roll_enable,
            mux_l2h: file.mux_l2h,
            mux_h2l: file.mux_h2l,
            h2ltime0_spd: file.h2ltime0_spd,
            spdlow: file.spdlow,
            spdhigh: file.spdhigh,
            tbase: file.tbase,
            th_pass: file.th_pass,
            th_fail: file.th_fail,
            th_init: file.th_init,
            th_add: file.th_add,
            th_ms: file.th_ms,
            th_mssel: file.th_mssel,
            th_timeout: file.th_timeout,
            pid_p: file.pid_p,
            pid_i: file.pid_i,
            pid_d: file.pid_d,
            adjust_volt: file.adjust_volt.unwrap_or_default(),
            lv_th_ms,
            lv_th_add,
            asic_otp: file.asic_otp,
            iic_bus: file.iic_bus,
            auc_speed: file.auc_speed.unwrap_or(defaults.auc_speed),
            auc_xdelay: file.auc_xdelay,
            device_id: file.device_id.unwrap_or(0),
            total_devices: file.total_devices.unwrap_or(1).max(1),
        })
    }

    pub fn validate(&self) -> error::Result<()> {
        let delay = self.polling_delay.as_millis();
        if delay < 1 || delay > 65535 {
            Err(ErrorKind::Config(format!(
                "polling delay {} ms outside 1-65535",
                delay
            )))?;
        }
        if self.fan_min > 100 || self.fan_max > 100 || self.fan_max < self.fan_min {
            Err(ErrorKind::Config(format!(
                "fan bounds {}-{} invalid",
                self.fan_min, self.fan_max
            )))?;
        }
        if let Some(level) = self.voltage_level {
            // union of the A9 and LC3 domains; the model clamp narrows it
            if level < -15 || level > 31 {
                Err(ErrorKind::Config(format!("voltage level {} out of range", level)))?;
            }
        }
        if self.voltage_level_offset < VOLTAGE_OFFSET_MIN
            || self.voltage_level_offset > VOLTAGE_OFFSET_MAX
        {
            Err(ErrorKind::Config(format!(
                "voltage level offset {} outside {}..{}",
                self.voltage_level_offset, VOLTAGE_OFFSET_MIN, VOLTAGE_OFFSET_MAX
            )))?;
        }
        if self.frequency.len() > 7 {
            Err(ErrorKind::Config("at most 7 PLL frequencies".to_string()))?;
        }
        for freq in &self.frequency {
            if *freq > FREQUENCY_CAP {
                Err(ErrorKind::Config(format!("PLL frequency {} above cap", freq)))?;
            }
        }
        if let Some(otp) = self.asic_otp {
            if otp > 33 {
                Err(ErrorKind::Config(format!("asic_otp {} out of range", otp)))?;
            }
        }
        Ok(())
    }

    /// Resolve the per-module settings once the model (and with it the
    /// generation) is known.
    pub fn resolve(&self, dev: &DevDescription) -> Settings {
        let gen = dev.generation;
        let mut tuning = gen.tuning();

        if let Some(value) = self.temp_target {
            tuning.temp_target = value;
        }
        if let Some(value) = self.frequency_sel {
            tuning.freq_sel = value;
        }
        if let Some(value) = self.nonce_mask {
            tuning.nonce_mask = value;
        }
        if let Some(value) = self.nonce_check {
            tuning.nonce_check = value;
        }
        if let Some(value) = self.roll_enable {
            tuning.roll_enable = value;
        }
        if let Some(value) = self.mux_l2h {
            tuning.mux_l2h = value;
        }
        if let Some(value) = self.mux_h2l {
            tuning.mux_h2l = value;
        }
        if let Some(value) = self.h2ltime0_spd {
            tuning.h2ltime0_spd = value;
        }
        if let Some(value) = self.spdhigh {
            tuning.spdhigh = value;
        }
        if let Some(value) = self.tbase {
            tuning.tbase = value;
        }
        if let Some(value) = self.th_pass {
            tuning.th_pass = value;
        }
        if let Some(value) = self.th_fail {
            tuning.th_fail = value;
        }
        if let Some(value) = self.th_init {
            tuning.th_init = value;
        }
        if let Some(value) = self.th_add {
            tuning.th_add = value;
        }
        if let Some(value) = self.th_ms {
            tuning.th_ms = value;
        }
        if let Some(value) = self.th_mssel {
            tuning.th_mssel = value;
        }
        if let Some(value) = self.th_timeout {
            tuning.th_timeout = value;
        }
        if let Some(value) = self.pid_p {
            tuning.pid_p = value;
        }
        if let Some(value) = self.pid_i {
            tuning.pid_i = value;
        }
        if let Some(value) = self.pid_d {
            tuning.pid_d = value;
        }

        let (level_min, level_max) = gen.voltage_level_range();
        let voltage_level = self
            .voltage_level
            .unwrap_or(dev.voltage_level)
            .max(level_min)
            .min(level_max);

        let freq_cap = gen.freq_max();
        let frequency = self
            .frequency
            .iter()
            .map(|freq| (*freq).min(freq_cap))
            .collect();

        Settings {
            tuning,
            fan_min: self.fan_min,
            fan_max: self.fan_max,
            smart_speed: self.smart_speed,
            voltage_level,
            voltage_level_offset: self.voltage_level_offset,
            frequency,
            spdlow: self.spdlow.unwrap_or(dev.spdlow),
            adjust_volt: self.adjust_volt.clone(),
            lv_th_ms: self.lv_th_ms,
            lv_th_add: self.lv_th_add,
            asic_otp: self.asic_otp.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn test_fan_bounds() {
        let mut config = Config::default();
        config.fan_min = 60;
        config.fan_max = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_polling_delay_bounds() {
        let mut config = Config::default();
        config.polling_delay = Duration::from_millis(0);
        assert!(config.validate().is_err());
        config.polling_delay = Duration::from_millis(70000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_uses_model_defaults() {
        let config = Config::default();
        let dev = models::lookup("9211908").unwrap();
        let settings = config.resolve(dev);

        assert_eq!(settings.voltage_level, 8);
        assert_eq!(settings.spdlow, 6);
        assert_eq!(settings.tuning.temp_target, 93);
        assert!(settings.smart_speed);
    }

    #[test]
    fn test_resolve_operator_overrides() {
        let mut config = Config::default();
        config.voltage_level = Some(-3);
        config.temp_target = Some(80);
        config.spdlow = Some(4);
        let dev = models::lookup("9201908").unwrap();
        let settings = config.resolve(dev);

        assert_eq!(settings.voltage_level, -3);
        assert_eq!(settings.tuning.temp_target, 80);
        assert_eq!(settings.spdlow, 4);
    }

    #[test]
    fn test_resolve_clamps_voltage_to_generation_domain() {
        let mut config = Config::default();
        config.voltage_level = Some(-3);
        let dev = models::lookup("LC31908").unwrap();
        // LC3 levels live in 0..=31
        assert_eq!(config.resolve(dev).voltage_level, 0);
    }
}
