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

//! Stratum job snapshots and the three-deep recent-job ring.
//!
//! Modules identify the job a nonce belongs to only by the CRC-16 of its
//! id string, so the host keeps the last three distinct jobs around to
//! match late reports. Two distinct ids can collide in CRC-16
//! (probability ~1.5e-5); that is inherent to the wire protocol.

use crate::protocol::crc16;

use std::sync::Mutex;
use uint::construct_uint;

construct_uint! {
    struct U256(4);
}

/// Everything needed to reconstruct and resubmit a share for one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub job_id: String,
    pub pool_no: usize,
    /// Full modified coinbase
    pub coinbase: Vec<u8>,
    pub nonce1: String,
    /// Byte offset of the nonce2 window inside the coinbase
    pub nonce2_offset: usize,
    pub n2size: usize,
    pub merkles: Vec<[u8; 32]>,
    /// Block header template
    pub header: [u8; 128],
    pub ntime: [u8; 8],
    /// Share difficulty the pool asked for
    pub sdiff: f64,
}

impl JobTemplate {
    pub fn id_crc(&self) -> u16 {
        crc16(self.job_id.as_bytes())
    }
}

/// Ring of the three most recent distinct jobs, newest first.
/// Each slot carries its own lock held only for the duration of a copy,
/// matching the per-snapshot locking of the update path.
pub struct JobRing {
    pools: [Mutex<Option<JobTemplate>>; 3],
}

impl JobRing {
    pub fn new() -> Self {
        Self {
            pools: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
        }
    }

    fn id_crc_of(&self, index: usize) -> Option<u16> {
        self.pools[index]
            .lock()
            .expect("job ring lock poisoned")
            .as_ref()
            .map(|job| job.id_crc())
    }

    /// Copy `src` over slot `dst_index` unless the ids already match by CRC.
    fn copy_into(&self, dst_index: usize, src: Option<JobTemplate>) {
        let src = match src {
            Some(job) => job,
            None => return,
        };
        if self.id_crc_of(dst_index) == Some(src.id_crc()) {
            return;
        }
        let mut dst = self.pools[dst_index].lock().expect("job ring lock poisoned");
        *dst = Some(src);
    }

    /// Rotate the ring and store a new job. Returns false (and leaves the
    /// ring untouched) when the job id matches the current newest entry.
    pub fn update(&self, job: &JobTemplate) -> bool {
        if self.id_crc_of(0) == Some(job.id_crc()) {
            return false;
        }

        let pool1 = self.pools[1].lock().expect("job ring lock poisoned").clone();
        self.copy_into(2, pool1);
        let pool0 = self.pools[0].lock().expect("job ring lock poisoned").clone();
        self.copy_into(1, pool0);

        let mut newest = self.pools[0].lock().expect("job ring lock poisoned");
        *newest = Some(job.clone());
        true
    }

    /// Find the job a nonce report refers to: first CRC match wins, newest
    /// entries take precedence.
    pub fn match_job(&self, job_id_crc: u16) -> Option<(usize, JobTemplate)> {
        for (depth, pool) in self.pools.iter().enumerate() {
            let guard = pool.lock().expect("job ring lock poisoned");
            if let Some(job) = guard.as_ref() {
                if job.id_crc() == job_id_crc {
                    return Some((depth, job.clone()));
                }
            }
        }
        None
    }

    pub fn newest(&self) -> Option<JobTemplate> {
        self.pools[0].lock().expect("job ring lock poisoned").clone()
    }
}

/// 256 bit difficulty-1 target (0x00000000ffff0000...)
fn diff_one() -> U256 {
    let mut diff1 = [0u8; 32];
    diff1[4] = 0xff;
    diff1[5] = 0xff;
    U256::from_big_endian(&diff1)
}

/// Derive the 32 byte share target for a difficulty, in the 256 bit
/// little-endian layout the modules expect. The driver level cap is applied
/// by the caller; fractional difficulties floor at one.
pub fn target_from_diff(diff: f64) -> [u8; 32] {
    let diff = if diff < 1.0 { 1 } else { diff as u64 };
    let target = diff_one() / U256::from(diff);

    let mut bytes = [0u8; 32];
    target.to_little_endian(&mut bytes);
    bytes
}
