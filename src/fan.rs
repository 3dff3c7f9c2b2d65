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

//! Per-module fan control: an incremental PID turning the observed maximum
//! temperature into a fan duty cycle.
//!
//! ```text
//! delta_u = P * [e(k) - e(k-1)] + I * e(k) + D * [e(k) - 2*e(k-1) + e(k-2)]
//! e(k) = t(k) - t[target]
//! u(k) = u(k-1) + delta_u
//! ```
//!
//! The I gain is an integer but acts scaled by 1/100. Until the module has
//! warmed into the control band the accumulator is pinned to `fan_min`; the
//! first in-band sample seeds it (A9 from a board temperature curve, LC3
//! from the sample itself) and only then the incremental updates run.

use crate::models::{CoolFloor, FanSeed, Tuning};

/// Top PWM register value, 0 duty maps here
pub const PWM_MAX: u32 = 0x3ff;

/// Fan duty cycle in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed(u32);

impl Speed {
    pub fn new(pct: u32) -> Self {
        assert!(pct <= 100);
        Speed(pct)
    }

    pub fn pct(&self) -> u32 {
        self.0
    }

    /// Inverted duty: 100 % spins the fans flat out at register value 0
    pub fn to_pwm(&self) -> u32 {
        PWM_MAX - self.0 * PWM_MAX / 100
    }
}

#[derive(Debug, Clone)]
pub struct FanPid {
    p: i32,
    i: i32,
    d: i32,
    /// e[0] newest
    e: [i32; 3],
    u: f64,
    initialized: bool,
    fan_min: u32,
    fan_max: u32,
    pub target: i32,
    overheat: i32,
    cool_floor: CoolFloor,
    seed: FanSeed,
}

impl FanPid {
    pub fn new(tuning: &Tuning, fan_min: u32, fan_max: u32) -> Self {
        Self {
            p: tuning.pid_p,
            i: tuning.pid_i,
            d: tuning.pid_d,
            e: [0; 3],
            u: fan_min as f64,
            initialized: false,
            fan_min,
            fan_max,
            target: tuning.temp_target,
            overheat: tuning.pid_temp_max,
            cool_floor: tuning.cool_floor,
            seed: tuning.fan_seed,
        }
    }

    /// Fresh controller state on module re-attach
    pub fn reset(&mut self) {
        self.e = [0; 3];
        self.u = self.fan_min as f64;
        self.initialized = false;
    }

    pub fn set_limits(&mut self, fan_min: u32, fan_max: u32) {
        self.fan_min = fan_min;
        self.fan_max = fan_max;
    }

    fn floor(&self) -> i32 {
        match self.cool_floor {
            CoolFloor::BelowTarget(diff) => self.target - diff,
            CoolFloor::Absolute(temp) => temp,
        }
    }

    fn seed_value(&self, t: i32, temp_mm: i32) -> f64 {
        match self.seed {
            FanSeed::BoardQuadratic => {
                let tmm = temp_mm as f64;
                0.0327 * tmm * tmm + 0.84 * tmm + 31.0
            }
            FanSeed::MaxTemperature => t as f64,
        }
    }

    /// One controller tick over the observed maximum temperature `t`
    /// (`temp_mm` is the module board temperature used for A9 seeding).
    /// Returns the clamped fan duty.
    pub fn update(&mut self, t: i32, temp_mm: i32) -> Speed {
        self.e[2] = self.e[1];
        self.e[1] = self.e[0];
        self.e[0] = t - self.target;

        if t > self.overheat {
            self.u = self.fan_max as f64;
            // force a re-seed once the module cools back down
            self.initialized = false;
        } else if t < self.floor() && !self.initialized {
            self.u = self.fan_min as f64;
        } else if !self.initialized {
            self.initialized = true;
            self.u = self.seed_value(t, temp_mm);
        } else {
            let delta_p = (self.p * (self.e[0] - self.e[1])) as f64;
            let delta_i = (self.i * self.e[0]) as f64;
            let delta_d = (self.d * (self.e[0] - 2 * self.e[1] + self.e[2])) as f64;

            // I gain is an integer knob used two orders of magnitude smaller
            self.u += delta_p + delta_i / 100.0 + delta_d;
        }

        if self.u > self.fan_max as f64 {
            self.u = self.fan_max as f64;
        }
        if self.u < self.fan_min as f64 {
            self.u = self.fan_min as f64;
        }

        Speed::new((self.u + 0.5) as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Generation;
    use approx::assert_relative_eq;

    fn a9_pid() -> FanPid {
        FanPid::new(&Generation::A9.tuning(), 5, 100)
    }

    #[test]
    fn test_speed_to_pwm() {
        assert_eq!(Speed::new(0).to_pwm(), 1023);
        assert_eq!(Speed::new(100).to_pwm(), 0);
        assert_eq!(Speed::new(40).to_pwm(), 614);
    }

    #[test]
    #[should_panic]
    fn test_speed_out_of_range() {
        Speed::new(101);
    }

    #[test]
    fn test_cold_module_holds_fan_min() {
        let mut pid = a9_pid();
        // far below target - 5 and never initialized: pinned at fan_min
        let speed = pid.update(32, 8);
        assert_eq!(speed.pct(), 5);
        assert!(!pid.initialized);
    }

    #[test]
    fn test_first_in_band_sample_seeds_from_board_curve() {
        let mut pid = a9_pid();
        // target 93, board temperature 8: 0.0327*64 + 0.84*8 + 31 = 39.8
        let speed = pid.update(90, 8);
        assert!(pid.initialized);
        assert_relative_eq!(pid.u, 39.8128, max_relative = 0.0001);
        assert_eq!(speed.pct(), 40);
        assert_eq!(speed.to_pwm(), 614);
    }

    #[test]
    fn test_lc3_seeds_from_sample() {
        let mut pid = FanPid::new(&Generation::Lc3.tuning(), 5, 100);
        let speed = pid.update(75, 0);
        assert!(pid.initialized);
        assert_eq!(speed.pct(), 75);
    }

    #[test]
    fn test_overheat_forces_fan_max_and_reseed() {
        let mut pid = a9_pid();
        pid.update(90, 8);
        assert!(pid.initialized);

        let speed = pid.update(110, 50);
        assert_eq!(speed.pct(), 100);
        assert!(!pid.initialized);
    }

    #[test]
    fn test_converges_on_target() {
        let mut pid = a9_pid();
        pid.update(90, 8);

        // at t == target the error history drains to zero and u stops moving
        let mut last = 0;
        for _ in 0..5 {
            last = pid.update(93, 40).pct();
        }
        assert_eq!(pid.e, [0, 0, 0]);
        let settled = pid.update(93, 40).pct();
        assert_eq!(settled, last);
    }

    #[test]
    fn test_output_always_clamped() {
        let mut pid = a9_pid();
        pid.update(90, 8);
        for t in &[104i32, 104, 104, 104, 104, 60, 60, 60, 60, 60] {
            let speed = pid.update(*t, 40);
            assert!(speed.pct() >= 5 && speed.pct() <= 100);
        }
    }
}
