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

//! Host side control driver for Avalon MM SHA-256 mining modules.
//!
//! Modules sit on an I2C chain reached either directly or through the AUC
//! USB bridge. The driver discovers them, announces stratum jobs over the
//! MM wire protocol, collects nonces and telemetry, keeps each module in
//! its thermal envelope with a per-module fan PID and hands found shares
//! to the embedding mining framework.

pub mod auc;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod fan;
pub mod hal;
pub mod job;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod sensor;
pub mod stratum;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use driver::MmDriver;
pub use error::{Error, ErrorKind};
pub use hal::{StratumSink, Submission};
pub use job::JobTemplate;
