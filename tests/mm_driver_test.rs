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

//! Driver scenarios against a scripted module chain standing in for the
//! real transport. The fake models the protocol's address assignment:
//! modules have no address until a DETECT answer is confirmed with SYNC.

use avalon_mm::driver::MmDriver;
use avalon_mm::error::ErrorKind;
use avalon_mm::hal::{StratumSink, Submission};
use avalon_mm::job::JobTemplate;
use avalon_mm::protocol::{cmd, crc16, status, Packet, BROADCAST, DATA_LEN, DNA_LEN};
use avalon_mm::transport::{Connecter, Transport};
use avalon_mm::Config;

use byteorder::{BigEndian, ByteOrder};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct FakeModule {
    dna: [u8; DNA_LEN],
    version: &'static str,
    total_asics: u32,
    /// Address the host confirmed with SYNC, none until then
    assigned: Option<usize>,
    /// Module answers DETECT probes while unassigned
    answers_detect: bool,
    /// Reply `opt` override, simulating an address collision
    reply_opt: Option<u8>,
    /// Drop every poll on the floor
    fail_polls: bool,
}

impl FakeModule {
    fn new(version: &'static str, dna_tail: u8) -> Self {
        Self {
            dna: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, dna_tail],
            version,
            total_asics: 104,
            assigned: None,
            answers_detect: true,
            reply_opt: None,
            fail_polls: false,
        }
    }

    fn opt(&self) -> u8 {
        self.reply_opt.unwrap_or(self.dna[DNA_LEN - 1])
    }

    fn ack_detect(&self) -> Packet {
        let mut data = [0u8; DATA_LEN];
        data[..DNA_LEN].copy_from_slice(&self.dna);
        data[DNA_LEN..DNA_LEN + self.version.len()].copy_from_slice(self.version.as_bytes());
        BigEndian::write_u32(&mut data[23..27], self.total_asics);
        Packet::new(status::ACKDETECT, 1, 1, data)
    }

    fn status_reply(&self) -> Packet {
        let mut packet = Packet::new(status::STATUS, 0, 4, [0u8; DATA_LEN]);
        packet.opt = self.opt();
        packet
    }
}

#[derive(Default)]
struct ChainState {
    modules: Vec<FakeModule>,
    /// Raw replies queued per address, served before the default STATUS
    queued: VecDeque<(usize, Vec<u8>)>,
    /// Every packet the host sent, with its destination
    sent: Vec<(u8, Packet)>,
    /// Emulate a dead bus
    fail_all: bool,
    reinit_calls: usize,
    reinit_fails: bool,
    gone: bool,
}

#[derive(Clone)]
struct FakeChain {
    state: Arc<Mutex<ChainState>>,
    connecter: Connecter,
}

impl FakeChain {
    fn new(connecter: Connecter) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState::default())),
            connecter,
        }
    }

    fn add_module(&self, module: FakeModule) {
        self.state.lock().unwrap().modules.push(module);
    }

    fn queue_reply(&self, addr: usize, packet: Packet) {
        self.state
            .lock()
            .unwrap()
            .queued
            .push_back((addr, packet.to_bytes().to_vec()));
    }

    /// Mutate the module the host assigned to `addr`
    fn with_module_at(&self, addr: usize, f: impl FnOnce(&mut FakeModule)) {
        let mut state = self.state.lock().unwrap();
        let module = state
            .modules
            .iter_mut()
            .find(|m| m.assigned == Some(addr))
            .expect("no fake module assigned to address");
        f(module);
    }

    fn sent_types(&self) -> Vec<(u8, u8)> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(addr, packet)| (*addr, packet.packet_type))
            .collect()
    }
}

impl Transport for FakeChain {
    fn xfer(
        &mut self,
        slave_addr: u8,
        write: &[u8],
        read_len: usize,
    ) -> avalon_mm::error::Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_all {
            return Err(ErrorKind::Transport("bus dead".to_string()).into());
        }

        let packet = Packet::from_bytes(write).expect("host sent an invalid packet");
        state.sent.push((slave_addr, packet));

        // SYNC confirms the assignment even though the reply is discarded
        if packet.packet_type == cmd::SYNC {
            let mut dna = [0u8; DNA_LEN];
            dna.copy_from_slice(&packet.data[..DNA_LEN]);
            if let Some(module) = state
                .modules
                .iter_mut()
                .find(|m| m.dna == dna && m.assigned.is_none())
            {
                module.assigned = Some(slave_addr as usize);
            }
        }

        if read_len == 0 {
            return Ok(Vec::new());
        }

        match packet.packet_type {
            cmd::DETECT => {
                assert_eq!(slave_addr, BROADCAST);
                // the first unassigned module claims the probed slot
                match state
                    .modules
                    .iter()
                    .find(|m| m.assigned.is_none() && m.answers_detect)
                {
                    Some(module) => Ok(module.ack_detect().to_bytes().to_vec()),
                    None => Err(ErrorKind::Transport("detect timeout".to_string()).into()),
                }
            }
            _ => {
                let addr = slave_addr as usize;
                if let Some(pos) = state.queued.iter().position(|(a, _)| *a == addr) {
                    let (_, raw) = state.queued.remove(pos).unwrap();
                    return Ok(raw);
                }
                match state.modules.iter().find(|m| m.assigned == Some(addr)) {
                    Some(module) => {
                        if module.fail_polls && packet.packet_type == cmd::POLLING {
                            Err(ErrorKind::Transport("module silent".to_string()).into())
                        } else {
                            Ok(module.status_reply().to_bytes().to_vec())
                        }
                    }
                    None => Err(ErrorKind::Transport("nothing there".to_string()).into()),
                }
            }
        }
    }

    fn connecter(&self) -> Connecter {
        self.connecter
    }

    fn reinit(&mut self) -> avalon_mm::error::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reinit_calls += 1;
        if state.reinit_fails {
            state.gone = true;
            Err(ErrorKind::Usb("bridge did not come back".to_string()).into())
        } else {
            state.fail_all = false;
            Ok(())
        }
    }

    fn is_gone(&self) -> bool {
        self.state.lock().unwrap().gone
    }
}

#[derive(Default)]
struct MockSink {
    submissions: Mutex<Vec<Submission>>,
    accepted: Mutex<f64>,
    reject_everything: Mutex<bool>,
    share_diff: f64,
}

impl MockSink {
    fn new(share_diff: f64) -> Arc<Self> {
        Arc::new(Self {
            share_diff,
            ..Default::default()
        })
    }
}

impl StratumSink for MockSink {
    fn submit_nonce(&self, submission: Submission) -> bool {
        if *self.reject_everything.lock().unwrap() {
            return false;
        }
        self.submissions.lock().unwrap().push(submission);
        *self.accepted.lock().unwrap() += self.share_diff;
        true
    }

    fn accepted_diff1(&self) -> f64 {
        *self.accepted.lock().unwrap()
    }

    fn rejected_diff(&self) -> f64 {
        0.0
    }

    fn total_pools(&self) -> usize {
        4
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.polling_delay = Duration::from_millis(1);
    config
}

fn job(id: &str, pool_no: usize) -> JobTemplate {
    JobTemplate {
        job_id: id.to_string(),
        pool_no,
        coinbase: (0..250u32).map(|i| i as u8).collect(),
        nonce1: "00000000".to_string(),
        nonce2_offset: 130,
        n2size: 4,
        merkles: vec![[0x11; 32], [0x22; 32]],
        header: [0x44; 128],
        ntime: *b"5d0a1b2c",
        sdiff: 8.0,
    }
}

fn nonce_packet(module_opt: u8, job_id: &str, pool_no: u16, miner: u16, chip: u16) -> Packet {
    let mut data = [0u8; DATA_LEN];
    BigEndian::write_u32(&mut data[0..4], (chip as u32) << 16 | miner as u32);
    BigEndian::write_u32(&mut data[4..8], 0x0000_0001); // nonce2
    BigEndian::write_u32(&mut data[8..12], 0x5d0a_1b2c); // ntime
    BigEndian::write_u32(&mut data[12..16], 0x1234_5678); // nonce
    let crc = crc16(job_id.as_bytes());
    data[16] = (crc >> 8) as u8;
    data[17] = (crc & 0xff) as u8;
    data[18] = (pool_no & 0xff) as u8;
    data[19] = (pool_no >> 8) as u8;

    let mut packet = Packet::new(status::NONCE, 1, 1, data);
    packet.opt = module_opt;
    packet
}

#[test]
fn test_discovery_installs_and_configures_module() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(8.0);
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, Instant::now());

    driver.scan(Instant::now()).expect("scan failed");

    assert_eq!(driver.mm_count(), 1);
    driver
        .with_slot(1, |slot| {
            assert_eq!(slot.version, "9211908-14000");
            assert_eq!(slot.miner_count, 4);
            assert_eq!(slot.total_asics, 104);
        })
        .expect("slot missing");

    // the configuration round went out in order and ended with SET_FIN
    let to_module: Vec<u8> = chain
        .sent_types()
        .iter()
        .filter(|(addr, _)| *addr == 1)
        .map(|(_, t)| *t)
        .collect();
    let set_pos = to_module.iter().position(|t| *t == cmd::SET).unwrap();
    let volt_pos = to_module.iter().position(|t| *t == cmd::SET_VOLT).unwrap();
    let fin_pos = to_module.iter().position(|t| *t == cmd::SET_FIN).unwrap();
    assert!(set_pos < volt_pos && volt_pos < fin_pos);
    // four miners get their PLL tables
    assert_eq!(to_module.iter().filter(|t| **t == cmd::SET_PLL).count(), 4);
    assert!(to_module.contains(&cmd::SYNC));
}

#[test]
fn test_job_push_sequence_is_broadcast_in_order() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(8.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);
    driver.scan(t0).expect("scan failed");

    driver
        .update_work(&job("abc", 0), false, t0)
        .expect("job push failed");

    let broadcast: Vec<u8> = chain
        .sent_types()
        .iter()
        .filter(|(addr, t)| *addr == BROADCAST && *t >= cmd::STATIC && *t <= cmd::JOB_FIN)
        .map(|(_, t)| *t)
        .collect();
    let order = [
        cmd::STATIC,
        cmd::TARGET,
        cmd::JOB_ID,
        cmd::COINBASE,
        cmd::MERKLES,
        cmd::HEADER,
        cmd::JOB_FIN,
    ];
    let mut last = 0;
    for t in &broadcast {
        let rank = order.iter().position(|o| o == t).unwrap();
        assert!(rank >= last, "packet {:#x} out of order", t);
        last = rank;
    }
    assert_eq!(*broadcast.last().unwrap(), cmd::JOB_FIN);
}

#[test]
fn test_happy_path_nonce_submission() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(8.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink.clone(), t0);

    driver.scan(t0).expect("scan failed");
    driver
        .update_work(&job("abc", 0), false, t0)
        .expect("job push failed");

    chain.queue_reply(1, nonce_packet(0xaa, "abc", 0, 0, 1));
    let hashes = driver.scan(t0 + Duration::from_secs(1)).expect("scan failed");

    {
        let submissions = sink.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].job_id, "abc");
        assert_eq!(submissions[0].nonce, 0x12345678);
        assert_eq!(submissions[0].nonce2, 1);
        assert_eq!(submissions[0].pool_no, 0);
    }

    driver
        .with_slot(1, |slot| {
            assert_eq!(slot.chip_matching_work[0][1], 1);
            assert!(slot.diff1 >= 8.0);
            assert_eq!(slot.hw_works_i[0], 0);
        })
        .expect("slot missing");

    // 8 diff1 shares worth of hashes credited on this pass
    assert_eq!(hashes, 8 * 4294967296);
}

#[test]
fn test_late_nonce_matches_oldest_ring_entry() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink.clone(), t0);

    driver.scan(t0).expect("scan failed");
    for id in &["j1", "j2", "j3"] {
        driver.update_work(&job(id, 0), false, t0).expect("push failed");
    }

    chain.queue_reply(1, nonce_packet(0xaa, "j1", 0, 0, 2));
    driver.scan(t0 + Duration::from_secs(1)).expect("scan failed");

    {
        let submissions = sink.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].job_id, "j1");
    }

    driver
        .with_slot(1, |slot| assert_eq!(slot.hw_works_i[0], 0))
        .expect("slot missing");
}

#[test]
fn test_unmatched_nonce_counts_as_hardware_error() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink.clone(), t0);

    driver.scan(t0).expect("scan failed");
    driver.update_work(&job("known", 0), false, t0).expect("push failed");

    chain.queue_reply(1, nonce_packet(0xaa, "forgotten", 0, 2, 1));
    driver.scan(t0 + Duration::from_secs(1)).expect("scan failed");

    assert!(sink.submissions.lock().unwrap().is_empty());
    driver
        .with_slot(1, |slot| assert_eq!(slot.hw_works_i[2], 1))
        .expect("slot missing");
}

#[test]
fn test_rejected_share_books_hardware_error() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink.clone(), t0);

    driver.scan(t0).expect("scan failed");
    driver.update_work(&job("abc", 0), false, t0).expect("push failed");

    *sink.reject_everything.lock().unwrap() = true;
    chain.queue_reply(1, nonce_packet(0xaa, "abc", 0, 1, 0));
    driver.scan(t0 + Duration::from_secs(1)).expect("scan failed");

    driver
        .with_slot(1, |slot| {
            assert_eq!(slot.hw_works_i[1], 1);
            assert_eq!(slot.chip_matching_work[1][0], 0);
        })
        .expect("slot missing");
}

#[test]
fn test_silent_pool_detaches_everything() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    chain.add_module(FakeModule::new("9201908-14000", 0xbb));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain, sink, t0);

    driver.scan(t0).expect("scan failed");
    assert_eq!(driver.mm_count(), 2);

    // three minutes of stratum silence
    let hashes = driver
        .scan(t0 + Duration::from_secs(181))
        .expect("scan failed");
    assert_eq!(hashes, 0);
    assert_eq!(driver.mm_count(), 0);
    driver
        .with_slot(1, |slot| assert!(!slot.enabled))
        .expect("slot missing");
}

#[test]
fn test_duplicate_dna_not_registered_twice() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xcc));
    // same DNA showing up again (module echoed on two chains)
    chain.add_module(FakeModule::new("9211908-14000", 0xcc));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain, sink, t0);

    driver.scan(t0).expect("scan failed");
    assert_eq!(driver.mm_count(), 1);
    assert!(driver.with_slot(2, |slot| slot.enabled).is_none());
}

#[test]
fn test_address_collision_detaches_module() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);

    driver.scan(t0).expect("scan failed");
    assert_eq!(driver.mm_count(), 1);

    // replies stop carrying the expected DNA tail; the wedged module also
    // stops answering probes
    chain.with_module_at(1, |module| {
        module.reply_opt = Some(0x55);
        module.answers_detect = false;
    });
    driver.scan(t0 + Duration::from_secs(1)).expect("scan failed");
    assert_eq!(driver.mm_count(), 0);

    // stays detached as long as DETECT goes unanswered
    driver.scan(t0 + Duration::from_secs(2)).expect("scan failed");
    assert_eq!(driver.mm_count(), 0);

    // after a power cycle a fresh DETECT brings it back
    chain.with_module_at(1, |module| {
        module.reply_opt = None;
        module.answers_detect = true;
        module.assigned = None;
    });
    driver.scan(t0 + Duration::from_secs(3)).expect("scan failed");
    assert_eq!(driver.mm_count(), 1);
}

#[test]
fn test_repeated_poll_failures_detach_with_rstmmtx() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);

    driver.scan(t0).expect("scan failed");
    chain.with_module_at(1, |module| {
        module.fail_polls = true;
        module.answers_detect = false;
    });

    for i in 1..=10 {
        driver
            .scan(t0 + Duration::from_secs(i))
            .expect("scan failed");
    }

    assert_eq!(driver.mm_count(), 0);
    let rstmmtx = chain
        .sent_types()
        .iter()
        .filter(|(addr, t)| *addr == 1 && *t == cmd::RSTMMTX)
        .count();
    assert_eq!(rstmmtx, 10);
}

#[test]
fn test_transport_storm_reinit_failure_is_fatal() {
    let chain = FakeChain::new(Connecter::Auc);
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);

    {
        let mut state = chain.state.lock().unwrap();
        state.fail_all = true;
        state.reinit_fails = true;
    }

    // every pass fails one DETECT probe; the hundredth consecutive failure
    // pauses the bus and attempts the bridge re-init, which also fails
    let mut outcome = Ok(0);
    for _ in 0..200 {
        outcome = driver.scan(t0);
        if outcome.is_err() {
            break;
        }
    }

    assert_eq!(chain.state.lock().unwrap().reinit_calls, 1);
    match outcome {
        Err(e) => assert_eq!(e.kind(), ErrorKind::DeviceGone),
        Ok(_) => panic!("driver survived a dead bridge"),
    }
}

#[test]
fn test_duplicate_job_not_reannounced() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);
    driver.scan(t0).expect("scan failed");

    driver.update_work(&job("abc", 0), false, t0).expect("push failed");
    let sent_before = chain.sent_types().len();
    driver.update_work(&job("abc", 0), false, t0).expect("push failed");

    assert_eq!(chain.sent_types().len(), sent_before);
}

#[test]
fn test_operator_voltage_update_pushes_packet() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("9211908-14000", 0xaa));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);
    driver.scan(t0).expect("scan failed");

    driver
        .set_voltage_level(1, Some(2), -3)
        .expect("voltage update failed");
    driver
        .with_slot(1, |slot| {
            assert_eq!(slot.set_voltage_level[2], -3);
            assert_eq!(slot.set_voltage_level[0], 8);
        })
        .expect("slot missing");

    // out-of-domain level is refused
    assert!(driver.set_voltage_level(1, None, 20).is_err());
}

#[test]
fn test_lc3_module_uses_its_own_generation_settings() {
    let chain = FakeChain::new(Connecter::Iic);
    chain.add_module(FakeModule::new("LC31908-14000", 0x42));
    let sink = MockSink::new(1.0);
    let t0 = Instant::now();
    let mut driver = MmDriver::new(&test_config(), chain.clone(), sink, t0);

    driver.scan(t0).expect("scan failed");
    driver
        .with_slot(1, |slot| {
            assert_eq!(slot.asic_count, 34);
            assert_eq!(slot.set_frequency[0], vec![0, 0, 0, 500]);
            assert_eq!(slot.settings.spdlow, 2);
        })
        .expect("slot missing");

    // LC3 configuration selects the OTP read target
    let to_module: Vec<u8> = chain
        .sent_types()
        .iter()
        .filter(|(addr, _)| *addr == 1)
        .map(|(_, t)| *t)
        .collect();
    assert!(to_module.contains(&cmd::SET_ASIC_OTP));
    // and never the A9-only voltage adjustment window
    assert!(!to_module.contains(&cmd::SET_ADJUST_VOLT));
}
