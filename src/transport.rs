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

//! Byte transport facade: both the raw I2C bus and the AUC USB bridge end
//! up behind the same half-duplex `xfer` contract.

use crate::error::{self, ErrorKind};

use embedded_hal::blocking::i2c::{Read, Write};
use linux_embedded_hal::I2cdev;

use std::path::Path;
use std::thread;
use std::time::Duration;

/// Which physical connecter the modules hang off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connecter {
    /// USB to I2C bridge
    Auc,
    /// Direct I2C bus
    Iic,
}

/// Settling gap between a raw I2C write and the follow-up read
const IIC_SETTLE_DELAY: Duration = Duration::from_millis(5);

/// Half duplex packet exchange with one module (or the broadcast address).
///
/// `xfer` blocks the device thread: transports are owned by exactly one
/// driver instance and never shared.
pub trait Transport {
    /// Write `write` to `slave_addr`, then read back exactly `read_len`
    /// bytes (zero means fire-and-forget).
    fn xfer(&mut self, slave_addr: u8, write: &[u8], read_len: usize) -> error::Result<Vec<u8>>;

    fn connecter(&self) -> Connecter;

    /// Throw away any stale bytes buffered on the far side.
    fn drain(&mut self) {}

    /// Ask the connecter for its temperature sensor reading, when it has one.
    fn sensor_probe(&mut self) -> Option<i32> {
        None
    }

    /// Full re-initialization after an error storm. Transports without a
    /// session concept have nothing to do here.
    fn reinit(&mut self) -> error::Result<()> {
        Ok(())
    }

    /// The underlying device disappeared and cannot come back.
    fn is_gone(&self) -> bool {
        false
    }
}

/// Direct I2C bus: every module is a slave at its own address.
pub struct I2cBus {
    dev: I2cdev,
}

impl I2cBus {
    pub fn open<P: AsRef<Path>>(path: P) -> error::Result<Self> {
        let dev = I2cdev::new(path)?;
        Ok(Self { dev })
    }
}

impl Transport for I2cBus {
    fn xfer(&mut self, slave_addr: u8, write: &[u8], read_len: usize) -> error::Result<Vec<u8>> {
        if !write.is_empty() {
            self.dev
                .write(slave_addr, write)
                .map_err(|e| ErrorKind::I2c(e.to_string()))?;
        }

        thread::sleep(IIC_SETTLE_DELAY);

        let mut buf = vec![0u8; read_len];
        if read_len > 0 {
            self.dev
                .read(slave_addr, &mut buf)
                .map_err(|e| ErrorKind::I2c(e.to_string()))?;
        }
        Ok(buf)
    }

    fn connecter(&self) -> Connecter {
        Connecter::Iic
    }
}
