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

//! The per-device control loop: module discovery and lifecycle, job
//! announcement, configuration scheduling, the polling sweep and the
//! hash accounting roll-up.
//!
//! The embedding framework drives one [`MmDriver`] per connecter from a
//! dedicated device thread, invoking [`MmDriver::scan`] cooperatively and
//! [`MmDriver::update_work`] whenever the pool hands out a new job.

use crate::command;
use crate::config::Config;
use crate::error::{self, ErrorKind};
use crate::hal::{StratumSink, Submission};
use crate::job::{JobRing, JobTemplate};
use crate::logging::LOGGER;
use crate::models::{self, Generation};
use crate::protocol::{cmd, Packet, BROADCAST, PACKET_LEN};
use crate::registry::{FreqMode, ModuleSlot, Registry, MODULES_MAX};
use crate::stratum::{self, PushContext};
use crate::telemetry::{self, AckDetect, Ingested};
use crate::transport::{Connecter, Transport};

use slog::{debug, info, warn};

use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

/// Detach every module once the pool goes quiet for this long
pub const SILENT_POOL_TIMEOUT: Duration = Duration::from_secs(180);

/// Gap between discovery sweeps
pub const DETECT_INTERVAL: Duration = Duration::from_secs(30);

/// Fan PID tick cadence, enforced by the polling sweep
pub const FAN_ADJUST_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive polling failures before a module is detached
pub const POLLING_FAILURE_LIMIT: u32 = 10;

/// Consecutive transport failures before the connecter gets re-initialized
pub const XFER_ERROR_LIMIT: u32 = 100;

/// Settle time before the connecter re-initialization
const XFER_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Transport plus its error-storm accounting, split out so packet exchange
/// can run while the registry lock is held.
struct Link<T: Transport> {
    transport: T,
    xfer_err_cnt: u32,
}

impl<T: Transport> Link<T> {
    /// One request/response exchange. A failed exchange is retried once
    /// (detect probes excepted: a silent slot is an answer, not a fault).
    /// Every 100th consecutive failure pauses the bus and re-initializes
    /// bridge-style transports.
    fn exchange(
        &mut self,
        addr: u8,
        packet: &Packet,
        want_reply: bool,
    ) -> error::Result<Option<Vec<u8>>> {
        if self.transport.is_gone() {
            Err(ErrorKind::DeviceGone)?;
        }

        let write = packet.to_bytes();
        let read_len = if want_reply { PACKET_LEN } else { 0 };

        let mut result = self.transport.xfer(addr, &write, read_len);
        // the AUC retries internally by re-reading; a raw bus gets one full
        // repeat of the transaction instead
        if result.is_err()
            && self.transport.connecter() == Connecter::Iic
            && packet.packet_type != cmd::DETECT
        {
            debug!(LOGGER, "transport: retrying xfer (type {:#x})", packet.packet_type);
            result = self.transport.xfer(addr, &write, read_len);
        }

        match result {
            Ok(reply) => {
                self.xfer_err_cnt = 0;
                if want_reply {
                    Ok(Some(reply))
                } else {
                    Ok(None)
                }
            }
            Err(e) => {
                // lost broadcasts on a raw bus have nobody to answer anyway
                if self.transport.connecter() == Connecter::Iic
                    && addr == BROADCAST
                    && packet.packet_type != cmd::DETECT
                {
                    return Ok(None);
                }

                self.xfer_err_cnt += 1;
                if self.xfer_err_cnt == XFER_ERROR_LIMIT {
                    warn!(
                        LOGGER,
                        "transport: {} consecutive failures, re-initializing", self.xfer_err_cnt
                    );
                    thread::sleep(XFER_ERROR_PAUSE);
                    match self.transport.connecter() {
                        Connecter::Auc => {
                            // a failed re-init marks the transport gone
                            let _ = self.transport.reinit();
                        }
                        Connecter::Iic => {
                            self.xfer_err_cnt = 0;
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Broadcasts never expect a reply and are repeated until the
    /// transport takes them (or disappears altogether).
    fn broadcast(&mut self, packet: &Packet) -> error::Result<()> {
        loop {
            if self.transport.is_gone() {
                Err(ErrorKind::DeviceGone)?;
            }
            if self.exchange(BROADCAST, packet, false).is_ok() {
                return Ok(());
            }
        }
    }
}

/// Host side driver for a chain of MM modules on one connecter
pub struct MmDriver<T: Transport, S: StratumSink> {
    config: Config,
    link: Link<T>,
    sink: S,
    registry: RwLock<Registry>,
    ring: JobRing,

    pool_no: usize,
    work_restart: bool,
    last_jobid: Option<u32>,

    last_stratum: Instant,
    last_detect: Option<Instant>,
    last_fan_adj: Instant,
    first_hash: Option<Instant>,

    last_diff1: f64,
    pending_diff1: f64,
    last_rej: f64,
    mm_count: usize,
    max_ntime: u32,
    auc_sensor: Option<i32>,
}

impl<T: Transport, S: StratumSink> MmDriver<T, S> {
    pub fn new(config: &Config, transport: T, sink: S, now: Instant) -> Self {
        Self {
            config: config.clone(),
            link: Link {
                transport,
                xfer_err_cnt: 0,
            },
            sink,
            registry: RwLock::new(Registry::new()),
            ring: JobRing::new(),
            pool_no: 0,
            work_restart: false,
            last_jobid: None,
            last_stratum: now,
            last_detect: None,
            last_fan_adj: now,
            first_hash: None,
            last_diff1: 0.0,
            pending_diff1: 0.0,
            last_rej: 0.0,
            mm_count: 0,
            max_ntime: 0,
            auc_sensor: None,
        }
    }

    pub fn mm_count(&self) -> usize {
        self.mm_count
    }

    pub fn conn_overloaded(&self) -> bool {
        self.registry.read().expect("registry lock poisoned").conn_overloaded
    }

    /// Pool the currently announced job came from
    pub fn current_pool(&self) -> usize {
        self.pool_no
    }

    /// When the device produced its first accepted work, if it has
    pub fn device_start(&self) -> Option<Instant> {
        self.first_hash
    }

    /// Highest ntime roll observed in nonce reports
    pub fn max_ntime(&self) -> u32 {
        self.max_ntime
    }

    /// Last connecter temperature reading in degrees Celsius
    pub fn connecter_temp(&self) -> Option<f64> {
        self.auc_sensor.map(crate::sensor::decode_auc_temp)
    }

    /// Run one read-only closure over a module slot (operator statistics)
    pub fn with_slot<R>(&self, addr: usize, f: impl FnOnce(&ModuleSlot) -> R) -> Option<R> {
        let registry = self.registry.read().expect("registry lock poisoned");
        registry.slot(addr).map(f)
    }

    /// Difficulty cap for the TARGET packet: the strictest cap among the
    /// attached generations (they share one broadcast domain).
    fn diff_max(&self, registry: &Registry) -> f64 {
        registry
            .enabled_addrs()
            .iter()
            .filter_map(|addr| registry.slot(*addr))
            .map(|slot| slot.generation.diff_max())
            .fold(Generation::A9.diff_max(), f64::min)
    }

    /// New stratum job from the framework: rotate the recent-job ring and
    /// announce the job to all modules.
    pub fn update_work(
        &mut self,
        job: &JobTemplate,
        work_restart: bool,
        now: Instant,
    ) -> error::Result<()> {
        self.last_stratum = now;
        if work_restart {
            // latched privately; consumed by the next STATIC packet
            self.work_restart = true;
        }

        stratum::check_job(job)?;

        let registry = self.registry.write().expect("registry lock poisoned");
        if !self.ring.update(job) {
            // same job id as the newest ring entry: nothing to announce
            return Ok(());
        }
        self.pool_no = job.pool_no;

        info!(
            LOGGER,
            "new stratum job {} (pool {}, diff {})", job.job_id, job.pool_no, job.sdiff
        );

        let ctx = PushContext {
            device_id: self.config.device_id,
            total_devices: self.config.total_devices,
            work_restart: self.work_restart,
            last_jobid: self.last_jobid,
            diff_max: self.diff_max(&registry),
        };
        self.work_restart = false;

        let plan = stratum::build_push(job, &ctx)?;
        for packet in &plan.packets {
            self.link.broadcast(packet)?;
        }
        self.last_jobid = Some(plan.jobid_tag);

        if self.link.transport.connecter() == Connecter::Auc {
            self.auc_sensor = self.link.transport.sensor_probe();
        }
        self.link.broadcast(&stratum::job_fin())?;

        drop(registry);
        Ok(())
    }

    /// Probe unassigned slots and install freshly answering modules
    fn detect_modules(&mut self, now: Instant) {
        for addr in 1..=MODULES_MAX {
            {
                let registry = self.registry.read().expect("registry lock poisoned");
                if registry.is_enabled(addr) {
                    continue;
                }
            }

            debug!(LOGGER, "detect: probing slot {}", addr);
            let reply = match self.link.exchange(BROADCAST, &command::detect(addr), true) {
                Ok(Some(reply)) => reply,
                // transport trouble: don't leak the probe into later slots
                _ => break,
            };
            let packet = match Packet::from_bytes(&reply) {
                Ok(packet) => packet,
                Err(_) => {
                    debug!(LOGGER, "detect: slot {} answered garbage", addr);
                    continue;
                }
            };
            if packet.packet_type != crate::protocol::status::ACKDETECT {
                debug!(
                    LOGGER,
                    "detect: slot {} answered {:#x}, stopping sweep", addr, packet.packet_type
                );
                break;
            }

            let ack = AckDetect::from_packet(&packet);

            let mut registry = self.registry.write().expect("registry lock poisoned");
            if registry.dna_exists(&ack.dna) {
                continue;
            }

            if addr == MODULES_MAX {
                warn!(
                    LOGGER,
                    "more than {} modules chained, this is discouraged",
                    MODULES_MAX - 1
                );
                registry.conn_overloaded = true;
                break;
            }
            registry.conn_overloaded = false;

            let dev = match models::lookup(&ack.version) {
                Some(dev) => dev,
                None => {
                    warn!(LOGGER, "module version {} is not supported", ack.version);
                    break;
                }
            };

            let settings = self.config.resolve(dev);
            let slot = ModuleSlot::new(addr, dev, &ack, settings, now);
            info!(
                LOGGER,
                "new module detected: slot {}, {} (DNA {})",
                addr,
                ack.version,
                hex::encode(&ack.dna)
            );
            let dna = slot.dna;
            registry.install(slot);
            drop(registry);

            // confirm the assignment and clear anything stale off the pipe
            let _ = self.link.exchange(addr as u8, &command::sync(&dna), true);
            self.link.transport.drain();
        }
    }

    /// Push voltage, PLL and smart-speed configuration to a module in INIT
    /// mode and move it to PLL-ADJUST.
    fn configure_module(&mut self, addr: usize) -> error::Result<()> {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        let slot = match registry.slot_mut(addr) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        // operator PLL table overrides replace the model defaults wholesale
        if !slot.settings.frequency.is_empty() {
            let plls = slot.generation.pll_count();
            for freq in slot.set_frequency.iter_mut() {
                for k in 0..plls {
                    freq[k] = slot.settings.frequency.get(k).cloned().unwrap_or(0);
                }
            }
        }

        let gen = slot.generation;
        let settings = slot.settings.clone();
        let voltage_levels = slot.set_voltage_level.clone();
        let frequencies = slot.set_frequency.clone();
        let asic_otp = slot.set_asic_otp.clone();
        let asic_max = slot.asic_count;
        let miner_count = slot.miner_count;
        slot.freq_mode = FreqMode::PllAdjust;

        let addr8 = addr as u8;
        self.link
            .exchange(addr8, &command::init_setting(&settings), false)?;
        self.link.exchange(
            addr8,
            &command::set_voltage_level(gen, &voltage_levels, settings.voltage_level_offset),
            false,
        )?;
        if gen == Generation::Lc3 {
            self.link
                .exchange(addr8, &command::set_asic_otp(&asic_otp, asic_max), false)?;
        }
        for (miner, freq) in frequencies.iter().enumerate() {
            self.link.exchange(
                addr8,
                &command::set_freq(gen, freq, miner, 0, miner_count),
                false,
            )?;
        }
        if gen == Generation::A9 {
            self.link
                .exchange(addr8, &command::set_adjust_volt(&settings.adjust_volt), false)?;
        }
        if settings.smart_speed {
            self.link
                .exchange(addr8, &command::set_ss_param(gen, &settings), false)?;
        }
        self.link.exchange(addr8, &command::set_finish(), false)?;

        info!(LOGGER, "module {}: configuration pushed", addr);
        Ok(())
    }

    /// Account one NONCE report: match it against the recent-job ring and
    /// hand it to the framework, or book a hardware error.
    fn handle_nonce(&mut self, addr: usize, report: telemetry::NonceReport) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        let slot = match registry.slot_mut(addr) {
            Some(slot) => slot,
            None => return,
        };

        if report.miner >= slot.miner_count || report.pool_no >= self.sink.total_pools() {
            debug!(
                LOGGER,
                "module {}: nonce names miner {} pool {}, dropped",
                addr,
                report.miner,
                report.pool_no
            );
            return;
        }
        if report.ntime > self.max_ntime {
            self.max_ntime = report.ntime;
        }

        let matched = self.ring.match_job(report.job_id_crc);
        let (depth, job) = match matched {
            Some(found) => found,
            None => {
                debug!(
                    LOGGER,
                    "module {}: nonce {:#010x} matches no recent job", addr, report.nonce
                );
                slot.hw_works_i[report.miner] += 1;
                return;
            }
        };
        debug!(
            LOGGER,
            "module {}: nonce {:#010x} miner {} chip {} (job {} depth {})",
            addr,
            report.nonce,
            report.miner,
            report.chip_id,
            job.job_id,
            depth
        );

        let before = self.sink.accepted_diff1();
        let accepted = self.sink.submit_nonce(Submission {
            pool_no: report.pool_no,
            job_id: job.job_id,
            nonce2: report.nonce2,
            nonce: report.nonce,
            ntime: report.ntime,
        });

        if accepted {
            slot.diff1 += self.sink.accepted_diff1() - before;
            if report.chip_id < slot.asic_count {
                slot.chip_matching_work[report.miner][report.chip_id] += 1;
            }
        } else {
            slot.hw_works_i[report.miner] += 1;
        }
    }

    /// One polling pass over every enabled module
    fn polling(&mut self, now: Instant) {
        let adjust_fans = now.duration_since(self.last_fan_adj) > FAN_ADJUST_INTERVAL;
        if adjust_fans {
            self.last_fan_adj = now;
        }

        let addrs = self
            .registry
            .read()
            .expect("registry lock poisoned")
            .enabled_addrs();

        for addr in addrs {
            thread::sleep(self.config.polling_delay);

            // assemble the poll under the write lock: the fan PID mutates
            let (packet, dna) = {
                let mut registry = self.registry.write().expect("registry lock poisoned");
                let slot = match registry.slot_mut(addr) {
                    Some(slot) if slot.enabled => slot,
                    _ => continue,
                };

                let fan_pwm = if adjust_fans {
                    // module-side smart-speed owns the thermal target
                    if slot.ss_para_en {
                        slot.pid.target = slot.ss_para_target_temp as i32;
                    }
                    let speed = slot.pid.update(slot.temp_max(), slot.temp_mm);
                    slot.fan_pct = speed.pct();
                    Some(speed.to_pwm())
                } else {
                    None
                };
                let reboot = slot.reboot;
                slot.reboot = false;

                (
                    command::polling(slot.led_indicator, fan_pwm, reboot),
                    slot.dna,
                )
            };

            let outcome = self
                .link
                .exchange(addr as u8, &packet, true)
                .and_then(|reply| {
                    Packet::from_bytes(&reply.unwrap_or_default())
                });

            match outcome {
                Ok(reply) => {
                    let collision = reply.opt != dna[crate::protocol::DNA_LEN - 1];
                    let mut nonce = None;
                    {
                        let mut registry =
                            self.registry.write().expect("registry lock poisoned");
                        if let Some(slot) = registry.slot_mut(addr) {
                            slot.error_polling_cnt = 0;
                            if !collision {
                                match telemetry::ingest(slot, &reply) {
                                    Ingested::Nonce(report) => nonce = Some(report),
                                    _ => {}
                                }
                                slot.refresh_work_totals();
                            }
                        }
                        if collision {
                            warn!(
                                LOGGER,
                                "module {}: reply opt {:#x} contradicts DNA, address collision",
                                addr,
                                reply.opt
                            );
                            registry.detach(addr);
                        }
                    }
                    if let Some(report) = nonce {
                        self.handle_nonce(addr, report);
                    }
                }
                Err(e) => {
                    debug!(LOGGER, "module {}: polling failed: {}", addr, e);
                    let failures = {
                        let mut registry =
                            self.registry.write().expect("registry lock poisoned");
                        match registry.slot_mut(addr) {
                            Some(slot) => {
                                slot.error_polling_cnt += 1;
                                if let ErrorKind::Packet(_) = e.kind() {
                                    slot.crc_error_cnt += 1;
                                }
                                slot.error_polling_cnt
                            }
                            None => continue,
                        }
                    };

                    // kick the module transmitter in case two modules
                    // ended up sharing an address
                    let _ = self.link.exchange(addr as u8, &command::rstmmtx(&dna), false);

                    if failures >= POLLING_FAILURE_LIMIT {
                        let mut registry =
                            self.registry.write().expect("registry lock poisoned");
                        registry.detach(addr);
                        info!(LOGGER, "module {}: detached after {} failed polls", addr, failures);
                    }
                }
            }
        }
    }

    /// One cooperative driver pass. Returns the number of hashes to credit
    /// this device for the pass; a vanished USB device is the only fatal
    /// error.
    pub fn scan(&mut self, now: Instant) -> error::Result<u64> {
        if self.link.transport.is_gone() {
            Err(ErrorKind::DeviceGone)?;
        }

        // a silent pool means stale work: stop hashing rather than waste power
        if now.duration_since(self.last_stratum) > SILENT_POOL_TIMEOUT {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            for addr in registry.enabled_addrs() {
                registry.detach(addr);
                info!(LOGGER, "module {}: detached, no stratum for 3 minutes", addr);
            }
            self.mm_count = 0;
            return Ok(0);
        }

        let detect_due = match self.last_detect {
            Some(last) => now.duration_since(last) > DETECT_INTERVAL,
            None => true,
        };
        if detect_due || self.mm_count == 0 {
            self.last_detect = Some(now);
            self.detect_modules(now);
        }

        // configuration scheduler
        let addrs = self
            .registry
            .read()
            .expect("registry lock poisoned")
            .enabled_addrs();
        for addr in addrs {
            let needs_config = {
                let mut registry = self.registry.write().expect("registry lock poisoned");
                let slot = match registry.slot_mut(addr) {
                    Some(slot) => slot,
                    None => continue,
                };

                let temp_max = slot.temp_max();
                if temp_max >= slot.temp_overheat {
                    if !slot.cutoff {
                        warn!(LOGGER, "module {}: overheat at {} C, cutoff", addr, temp_max);
                    }
                    slot.cutoff = true;
                }
                if slot.cutoff && temp_max <= slot.temp_overheat - 10 {
                    slot.cutoff = false;
                }

                slot.freq_mode == FreqMode::Init
            };

            if needs_config {
                if let Err(e) = self.configure_module(addr) {
                    debug!(LOGGER, "module {}: configuration failed: {}", addr, e);
                }
            }
            // in PLL-ADJUST mode the module governs itself (smart-speed);
            // the host only observes
        }

        self.polling(now);

        self.mm_count = self
            .registry
            .read()
            .expect("registry lock poisoned")
            .enabled_count();

        // difficulty accounting: credit scaled diff1 minus rejected work
        let diff1 = self.sink.accepted_diff1();
        self.pending_diff1 += diff1 - self.last_diff1;
        self.last_diff1 = diff1;
        let rejected = self.sink.rejected_diff();
        self.pending_diff1 -= rejected - self.last_rej;
        self.last_rej = rejected;

        if self.pending_diff1 != 0.0 && self.first_hash.is_none() {
            self.first_hash = Some(now);
        }

        if self.pending_diff1 <= 0.0 {
            Ok(0)
        } else {
            let hashes = self.pending_diff1 * 4294967296.0;
            self.pending_diff1 = 0.0;
            Ok(hashes as u64)
        }
    }

    // --- operator control surface ---

    fn for_each_target(
        &mut self,
        addr: usize,
        mut apply: impl FnMut(&mut Self, usize) -> error::Result<()>,
    ) -> error::Result<()> {
        if addr == 0 {
            let addrs = self
                .registry
                .read()
                .expect("registry lock poisoned")
                .enabled_addrs();
            for addr in addrs {
                apply(self, addr)?;
            }
            Ok(())
        } else {
            if !self.registry.read().expect("registry lock poisoned").is_enabled(addr) {
                Err(ErrorKind::Module(addr, "module disabled".to_string()))?;
            }
            apply(self, addr)
        }
    }

    /// Set the voltage level of one miner (or all, `miner = None`) on one
    /// module (or all enabled, `addr = 0`) and push it out immediately.
    pub fn set_voltage_level(
        &mut self,
        addr: usize,
        miner: Option<usize>,
        level: i32,
    ) -> error::Result<()> {
        self.for_each_target(addr, |driver, addr| {
            let (gen, levels, offset) = {
                let mut registry = driver.registry.write().expect("registry lock poisoned");
                let slot = registry
                    .slot_mut(addr)
                    .ok_or_else(|| ErrorKind::Module(addr, "no such module".to_string()))?;
                let (min, max) = slot.generation.voltage_level_range();
                if level < min || level > max {
                    Err(ErrorKind::Config(format!("voltage level {} out of range", level)))?;
                }
                match miner {
                    Some(miner) => {
                        if miner >= slot.miner_count {
                            Err(ErrorKind::Module(addr, format!("no miner {}", miner)))?;
                        }
                        slot.set_voltage_level[miner] = level;
                    }
                    None => {
                        for entry in slot.set_voltage_level.iter_mut() {
                            *entry = level;
                        }
                    }
                }
                (
                    slot.generation,
                    slot.set_voltage_level.clone(),
                    slot.settings.voltage_level_offset,
                )
            };
            driver.link.exchange(
                addr as u8,
                &command::set_voltage_level(gen, &levels, offset),
                false,
            )?;
            info!(LOGGER, "module {}: voltage level set to {}", addr, level);
            Ok(())
        })
    }

    /// Replace the PLL table of one miner (or all miners) and push it out
    pub fn set_frequency(
        &mut self,
        addr: usize,
        miner: Option<usize>,
        freq: &[u32],
    ) -> error::Result<()> {
        self.for_each_target(addr, |driver, addr| {
            let (gen, frequencies, miner_count) = {
                let mut registry = driver.registry.write().expect("registry lock poisoned");
                let slot = registry
                    .slot_mut(addr)
                    .ok_or_else(|| ErrorKind::Module(addr, "no such module".to_string()))?;
                let plls = slot.generation.pll_count();
                if freq.len() > plls {
                    Err(ErrorKind::Config(format!("{} PLL entries, max {}", freq.len(), plls)))?;
                }
                if freq.iter().any(|f| *f > slot.generation.freq_max()) {
                    Err(ErrorKind::Config("PLL frequency above model cap".to_string()))?;
                }
                let miners: Vec<usize> = match miner {
                    Some(miner) => {
                        if miner >= slot.miner_count {
                            Err(ErrorKind::Module(addr, format!("no miner {}", miner)))?;
                        }
                        vec![miner]
                    }
                    None => (0..slot.miner_count).collect(),
                };
                for m in &miners {
                    for (k, f) in freq.iter().enumerate() {
                        slot.set_frequency[*m][k] = *f;
                    }
                }
                (
                    slot.generation,
                    miners
                        .iter()
                        .map(|m| (*m, slot.set_frequency[*m].clone()))
                        .collect::<Vec<_>>(),
                    slot.miner_count,
                )
            };
            for (m, table) in frequencies {
                driver.link.exchange(
                    addr as u8,
                    &command::set_freq(gen, &table, m, 0, miner_count),
                    false,
                )?;
            }
            Ok(())
        })
    }

    /// Toggle (None) or set the red LED of one module
    pub fn set_led(&mut self, addr: usize, on: Option<bool>) -> error::Result<bool> {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        let slot = registry
            .slot_mut(addr)
            .filter(|slot| slot.enabled)
            .ok_or_else(|| ErrorKind::Module(addr, "module disabled".to_string()))?;
        slot.led_indicator = match on {
            Some(true) => 1,
            Some(false) => 0,
            None => 1 - slot.led_indicator,
        };
        Ok(slot.led_indicator != 0)
    }

    /// Ask a module to reboot on its next poll
    pub fn request_reboot(&mut self, addr: usize) -> error::Result<()> {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        let slot = registry
            .slot_mut(addr)
            .filter(|slot| slot.enabled)
            .ok_or_else(|| ErrorKind::Module(addr, "module disabled".to_string()))?;
        slot.reboot = true;
        Ok(())
    }

    /// Write the factory info blob to every enabled module
    pub fn set_factory_info(&mut self, info: [i8; models::FACTORY_INFO_CNT]) -> error::Result<()> {
        self.for_each_target(0, |driver, addr| {
            {
                let mut registry = driver.registry.write().expect("registry lock poisoned");
                if let Some(slot) = registry.slot_mut(addr) {
                    slot.factory_info = info;
                }
            }
            driver
                .link
                .exchange(addr as u8, &command::set_factory_info(&info), false)?;
            Ok(())
        })
    }

    /// Broadcast the overclocking blob
    pub fn set_overclocking(&mut self, value: u8) -> error::Result<()> {
        self.link.broadcast(&command::set_overclocking(&[value]))
    }

    /// Enable or disable module-side smart-speed reporting (A9 modules)
    pub fn set_ss_param_en(&mut self, enable: bool) -> error::Result<()> {
        self.for_each_target(0, |driver, addr| {
            let is_a9 = driver
                .registry
                .read()
                .expect("registry lock poisoned")
                .slot(addr)
                .map(|slot| slot.generation == Generation::A9)
                .unwrap_or(false);
            if is_a9 {
                driver.link.exchange(
                    addr as u8,
                    &command::set_ss_param_en(enable as u8),
                    false,
                )?;
            }
            Ok(())
        })
    }
}
