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

//! Bring-up utility: finds a connecter, runs the driver loop and logs what
//! the modules report. Share submission is stubbed out; production use
//! embeds [`avalon_mm::MmDriver`] into a mining framework instead.

use avalon_mm::driver::MmDriver;
use avalon_mm::error::{ErrorKind, Result};
use avalon_mm::hal::{StratumSink, Submission};
use avalon_mm::logging::LOGGER;
use avalon_mm::transport::I2cBus;
use avalon_mm::{auc, Config};

use slog::{error, info};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Accepts everything and counts shares; good enough to watch modules hash
struct LogSink {
    accepted: AtomicUsize,
}

impl StratumSink for LogSink {
    fn submit_nonce(&self, submission: Submission) -> bool {
        info!(
            LOGGER,
            "share: job {} nonce {:#010x} nonce2 {:#010x}",
            submission.job_id,
            submission.nonce,
            submission.nonce2
        );
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn accepted_diff1(&self) -> f64 {
        self.accepted.load(Ordering::Relaxed) as f64
    }

    fn rejected_diff(&self) -> f64 {
        0.0
    }

    fn total_pools(&self) -> usize {
        1
    }
}

fn run(config: &Config) -> Result<()> {
    let sink = LogSink {
        accepted: AtomicUsize::new(0),
    };

    match &config.iic_bus {
        Some(bus) => {
            info!(LOGGER, "probing modules on {}", bus);
            let transport = I2cBus::open(bus)?;
            drive(MmDriver::new(config, transport, sink, Instant::now()))
        }
        None => {
            let context = libusb::Context::new()
                .map_err(|e| ErrorKind::Usb(format!("cannot create USB context: {}", e)))?;
            let xdelay = config.auc_xdelay.unwrap_or(24000);
            let mut bridge = auc::AucBridge::find(&context, config.auc_speed, xdelay)
                .ok_or_else(|| ErrorKind::Usb("no AUC found".to_string()))?;
            // the bridge occasionally needs a second nudge after power-up
            if bridge.init().is_err() {
                bridge.init()?;
            }
            info!(LOGGER, "AUC {} at {} Hz", bridge.version(), bridge.speed());

            drive(MmDriver::new(config, bridge, sink, Instant::now()))
        }
    }
}

fn drive<T, S>(mut driver: MmDriver<T, S>) -> Result<()>
where
    T: avalon_mm::transport::Transport,
    S: StratumSink,
{
    loop {
        driver.scan(Instant::now())?;
        info!(LOGGER, "modules online: {}", driver.mm_count());
        thread::sleep(Duration::from_secs(1));
    }
}

fn main() {
    let app = Config::add_args(
        clap::App::new("avalon-mm")
            .version(clap::crate_version!())
            .about("Avalon MM module bring-up tool"),
    );
    let matches = app.get_matches();

    let config = match Config::parse(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!(LOGGER, "configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config) {
        error!(LOGGER, "driver stopped: {}", e);
        std::process::exit(1);
    }
}
