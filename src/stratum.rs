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

//! Translation of a stratum job into the bounded multi-packet broadcast
//! sequence of the wire protocol: STATIC, TARGET, JOB_ID (when it changed),
//! COINBASE (midstate first), MERKLES, HEADER, and the closing JOB_FIN.

use crate::error::{self, ErrorKind};
use crate::job::{target_from_diff, JobTemplate};
use crate::protocol::{cmd, crc16, Packet, COINBASE_SIZE_MAX, DATA_LEN, MERKLES_MAX};

use bitcoin_hashes::{sha256, Hash, HashEngine};
use byteorder::{BigEndian, ByteOrder};

/// SHA-256 block granularity of the coinbase prehash split
const SHA256_BLOCK_SIZE: usize = 64;

/// Job-push inputs that don't come from the job itself
#[derive(Debug, Clone)]
pub struct PushContext {
    pub device_id: usize,
    pub total_devices: usize,
    /// One-shot work restart indication, consumed by the STATIC packet
    pub work_restart: bool,
    /// `(job id CRC << 16) | pool_no` of the previously announced job
    pub last_jobid: Option<u32>,
    /// Driver difficulty cap for the TARGET packet
    pub diff_max: f64,
}

/// The ordered packet sequence for one job plus the tag to remember as
/// `last_jobid` once it went out.
pub struct PushPlan {
    pub packets: Vec<Packet>,
    pub jobid_tag: u32,
}

/// Wire protocol preconditions; a violating job is refused before any
/// packet goes out.
pub fn check_job(job: &JobTemplate) -> error::Result<()> {
    if job.nonce2_offset > job.coinbase.len() {
        Err(ErrorKind::Job(format!(
            "nonce2 offset {} outside coinbase of {} bytes",
            job.nonce2_offset,
            job.coinbase.len()
        )))?;
    }
    let prehash_len = job.nonce2_offset - (job.nonce2_offset % SHA256_BLOCK_SIZE);
    let posthash_len = job.coinbase.len() - prehash_len;
    if posthash_len + SHA256_BLOCK_SIZE > COINBASE_SIZE_MAX {
        Err(ErrorKind::Job(format!(
            "modified coinbase of {} bytes exceeds {}",
            posthash_len + SHA256_BLOCK_SIZE,
            COINBASE_SIZE_MAX
        )))?;
    }
    if job.merkles.len() > MERKLES_MAX {
        Err(ErrorKind::Job(format!(
            "{} merkle branches exceed {}",
            job.merkles.len(),
            MERKLES_MAX
        )))?;
    }
    if job.n2size < 3 {
        Err(ErrorKind::Job(format!("nonce2 size {} below 3", job.n2size)))?;
    }
    Ok(())
}

/// SHA-256 internal state after hashing the prehash prefix, serialized the
/// way the modules continue from it.
fn coinbase_midstate(coinbase: &[u8], prehash_len: usize) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&coinbase[..prehash_len]);
    engine.midstate().0
}

/// Build the full announcement sequence. JOB_FIN is not part of the plan;
/// it goes out separately once the update critical section completes.
pub fn build_push(job: &JobTemplate, ctx: &PushContext) -> error::Result<PushPlan> {
    check_job(job)?;
    let mut packets = Vec::new();

    // STATIC: geometry of the job plus this host's slice of nonce2 space
    let n2size = job.n2size.min(4);
    let merkle_offset: u32 = 36;
    let total_devices = ctx.total_devices.max(1) as u32;
    let range = if job.n2size == 3 {
        0xffffffu32 / total_devices
    } else {
        u32::max_value() / total_devices
    };
    let start = range.wrapping_mul(ctx.device_id as u32);

    let mut data = [0u8; DATA_LEN];
    BigEndian::write_u32(&mut data[0..4], job.coinbase.len() as u32);
    BigEndian::write_u32(&mut data[4..8], job.nonce2_offset as u32);
    BigEndian::write_u32(&mut data[8..12], n2size as u32);
    BigEndian::write_u32(&mut data[12..16], merkle_offset);
    BigEndian::write_u32(&mut data[16..20], job.merkles.len() as u32);
    BigEndian::write_u32(&mut data[20..24], start);
    BigEndian::write_u32(&mut data[24..28], range);
    if ctx.work_restart {
        BigEndian::write_u32(&mut data[28..32], 0x1);
    }
    packets.push(Packet::new(cmd::STATIC, 1, 1, data));

    // TARGET, with the driver difficulty cap applied
    let mut data = [0u8; DATA_LEN];
    data.copy_from_slice(&target_from_diff(job.sdiff.min(ctx.diff_max)));
    packets.push(Packet::new(cmd::TARGET, 1, 1, data));

    // JOB_ID only when the (id, pool) pair actually changed
    let crc = crc16(job.job_id.as_bytes());
    let jobid_tag = (crc as u32) << 16 | job.pool_no as u32;
    if ctx.last_jobid != Some(jobid_tag) {
        let mut data = [0u8; DATA_LEN];
        data[0] = (crc >> 8) as u8;
        data[1] = (crc & 0xff) as u8;
        data[2] = (job.pool_no & 0xff) as u8;
        data[3] = ((job.pool_no >> 8) & 0xff) as u8;
        packets.push(Packet::new(cmd::JOB_ID, 1, 1, data));
    }

    // COINBASE: the midstate over the prehash prefix first, then the
    // remainder in 32 byte slices
    let prehash_len = job.nonce2_offset - (job.nonce2_offset % SHA256_BLOCK_SIZE);
    let posthash_len = job.coinbase.len() - prehash_len;
    let full_slices = posthash_len / DATA_LEN + 1;
    let tail = posthash_len % DATA_LEN;
    let slice_count = (full_slices + if tail != 0 { 1 } else { 0 }) as u8;

    let mut data = [0u8; DATA_LEN];
    data.copy_from_slice(&coinbase_midstate(&job.coinbase, prehash_len));
    packets.push(Packet::new(cmd::COINBASE, 1, slice_count, data));

    for i in 1..full_slices {
        let offset = prehash_len + (i - 1) * DATA_LEN;
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&job.coinbase[offset..offset + DATA_LEN]);
        packets.push(Packet::new(cmd::COINBASE, (i + 1) as u8, slice_count, data));
    }
    if tail != 0 {
        let offset = prehash_len + (full_slices - 1) * DATA_LEN;
        let mut data = [0u8; DATA_LEN];
        data[..tail].copy_from_slice(&job.coinbase[offset..offset + tail]);
        packets.push(Packet::new(
            cmd::COINBASE,
            (full_slices + 1) as u8,
            slice_count,
            data,
        ));
    }

    // MERKLES, one branch per packet
    let merkle_count = job.merkles.len() as u8;
    for (i, branch) in job.merkles.iter().enumerate() {
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(branch);
        packets.push(Packet::new(cmd::MERKLES, (i + 1) as u8, merkle_count, data));
    }

    // HEADER template in four slices
    for i in 0..4 {
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&job.header[i * DATA_LEN..(i + 1) * DATA_LEN]);
        packets.push(Packet::new(cmd::HEADER, (i + 1) as u8, 4, data));
    }

    Ok(PushPlan { packets, jobid_tag })
}

/// End-of-job marker
pub fn job_fin() -> Packet {
    Packet::new(cmd::JOB_FIN, 1, 1, [0u8; DATA_LEN])
}
