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

//! Seam towards the embedding mining framework. The driver reports found
//! nonces through [`StratumSink`] and reads back the share accounting the
//! framework keeps; everything stratum related stays on the framework side.

/// A share reconstructed from a module NONCE report
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Pool the matched job belongs to
    pub pool_no: usize,
    /// Job id of the ring entry the report was matched against
    pub job_id: String,
    pub nonce2: u32,
    pub nonce: u32,
    pub ntime: u32,
}

/// Framework-side share bookkeeping hook.
///
/// `submit_nonce` returning `false` means the share failed validation and
/// the driver accounts it as a hardware error on the reporting miner.
pub trait StratumSink {
    fn submit_nonce(&self, submission: Submission) -> bool;

    /// Cumulative difficulty-1 shares credited to this device
    fn accepted_diff1(&self) -> f64;

    /// Cumulative rejected share difficulty of this device
    fn rejected_diff(&self) -> f64;

    /// Number of pools the framework currently knows; NONCE reports naming
    /// a pool outside this range are dropped.
    fn total_pools(&self) -> usize;
}

/// The framework usually keeps the sink shared with its own bookkeeping
impl<S: StratumSink + ?Sized> StratumSink for std::sync::Arc<S> {
    fn submit_nonce(&self, submission: Submission) -> bool {
        (**self).submit_nonce(submission)
    }

    fn accepted_diff1(&self) -> f64 {
        (**self).accepted_diff1()
    }

    fn rejected_diff(&self) -> f64 {
        (**self).rejected_diff()
    }

    fn total_pools(&self) -> usize {
        (**self).total_pools()
    }
}
