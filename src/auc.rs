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

//! AUC (USB to I2C converter) session. The bridge speaks 64 byte frames
//! over a bulk pipe:
//!
//! ```text
//! length[1] + transId[1] + sesId[1] + op[1] + body[60]
//!   INIT: clock_rate[4] + xfer_delay[4] (little endian)
//!   XFER: txSz[1] + rxSz[1] + options[1] + slaveAddr[1] + payload[56]
//! ```
//!
//! Frame header integers are little endian, unlike everything the modules
//! themselves speak.

use crate::error::{self, ErrorKind};
use crate::logging::LOGGER;
use crate::sensor;
use crate::transport::{Connecter, Transport};

use byteorder::{ByteOrder, LittleEndian};
use failure::ResultExt;
use slog::{debug, error, info};

use std::str;
use std::thread;
use std::time::Duration;

pub const ID_VENDOR: u16 = 0x29f1;
pub const ID_PRODUCT: u16 = 0x33f2;

const DEVICE_IFACE: u8 = 1;
const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x81;
const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Bridge frame size, both directions
pub const FRAME_LEN: usize = 64;

/// Bridge frame header size echoed back in front of every read
const FRAME_HEADER_LEN: usize = 4;

/// Version string length (AUC-YYYYMMDD)
pub const VER_LEN: usize = 12;

/// Default I2C clock rate of the bridge
pub const DEFAULT_SPEED: u32 = 400_000;

/// One millisecond expressed in bridge xdelay units
const XDELAY_PER_MS: u32 = 4800;

mod op {
    pub const RESET: u8 = 0xa0;
    pub const INIT: u8 = 0xa1;
    pub const DEINIT: u8 = 0xa2;
    pub const XFER: u8 = 0xa5;
    pub const INFO: u8 = 0xa6;
}

fn frame_simple(op: u8) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = FRAME_HEADER_LEN as u8;
    frame[3] = op;
    frame
}

fn frame_init(clock: u32, xdelay: u32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = (FRAME_HEADER_LEN + 8) as u8;
    frame[3] = op::INIT;
    LittleEndian::write_u32(&mut frame[4..8], clock);
    LittleEndian::write_u32(&mut frame[8..12], xdelay);
    frame
}

fn frame_xfer(slave_addr: u8, write: &[u8], read_len: usize) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = (FRAME_HEADER_LEN + 4 + write.len()) as u8;
    frame[3] = op::XFER;
    frame[4] = write.len() as u8;
    frame[5] = read_len as u8;
    frame[7] = slave_addr;
    frame[8..8 + write.len()].copy_from_slice(write);
    frame
}

/// An initialized AUC session on one USB device
pub struct AucBridge<'a> {
    context: &'a libusb::Context,
    device: libusb::DeviceHandle<'a>,
    speed: u32,
    xdelay: u32,
    version: String,
    gone: bool,
}

impl<'a> AucBridge<'a> {
    /// Try to find an AUC on the bus and claim it
    pub fn find(context: &'a libusb::Context, speed: u32, xdelay: u32) -> Option<Self> {
        context
            .open_device_with_vid_pid(ID_VENDOR, ID_PRODUCT)
            .map(|device| Self {
                context,
                device,
                speed,
                xdelay,
                version: String::new(),
                gone: false,
            })
    }

    /// Reset the bridge and (re)establish an I2C session. Fills in the
    /// bridge firmware version string.
    pub fn init(&mut self) -> error::Result<()> {
        if self.context.supports_detach_kernel_driver() {
            if self
                .device
                .kernel_driver_active(DEVICE_IFACE)
                .with_context(|_| ErrorKind::Usb("cannot detect kernel driver".to_string()))?
            {
                self.device
                    .detach_kernel_driver(DEVICE_IFACE)
                    .with_context(|_| ErrorKind::Usb("cannot detach kernel driver".to_string()))?;
            }
        }
        self.device
            .claim_interface(DEVICE_IFACE)
            .with_context(|_| ErrorKind::Usb("cannot claim interface".to_string()))?;

        // Throw away whatever the bridge has buffered from a previous run
        self.drain();

        self.raw_xfer(&frame_simple(op::RESET), 0)
            .with_context(|_| ErrorKind::Usb("failed to reset AUC".to_string()))?;
        self.raw_xfer(&frame_simple(op::DEINIT), 0)
            .with_context(|_| ErrorKind::Usb("failed to deinit AUC".to_string()))?;

        let reply = self
            .raw_xfer(&frame_init(self.speed, self.xdelay), VER_LEN)
            .with_context(|_| ErrorKind::Usb("failed to init AUC".to_string()))?;

        self.version = str::from_utf8(&reply)
            .unwrap_or("")
            .trim_end_matches('\0')
            .to_string();
        debug!(LOGGER, "AUC: converter version: {}", self.version);

        Ok(())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn speed(&self) -> u32 {
        self.speed
    }

    pub fn xdelay(&self) -> u32 {
        self.xdelay
    }

    /// Write one frame and read back `read_len` payload bytes. The bridge
    /// prefixes every read with its 4 byte header which carries the echoed
    /// length; the header is validated and stripped here.
    fn raw_xfer(&mut self, frame: &[u8], read_len: usize) -> error::Result<Vec<u8>> {
        if self.gone {
            Err(ErrorKind::DeviceGone)?;
        }

        let written = self
            .device
            .write_bulk(EP_OUT, frame, WAIT_TIMEOUT)
            .map_err(|e| self.on_usb_error(e))?;
        if written != frame.len() {
            Err(ErrorKind::Usb(format!(
                "short AUC write ({}/{})",
                written,
                frame.len()
            )))?;
        }

        thread::sleep(Duration::from_millis(
            (self.xdelay / XDELAY_PER_MS + 1) as u64,
        ));

        let total = read_len + FRAME_HEADER_LEN;
        let mut buf = [0u8; FRAME_LEN];
        let read = self
            .device
            .read_bulk(EP_IN, &mut buf[..total], WAIT_TIMEOUT)
            .map_err(|e| self.on_usb_error(e))?;
        if read != total || read != buf[0] as usize {
            Err(ErrorKind::Usb(format!(
                "AUC read mismatch ({}, echoed {})",
                read, buf[0]
            )))?;
        }

        Ok(buf[FRAME_HEADER_LEN..total].to_vec())
    }

    /// A vanished device is unrecoverable; everything else is an ordinary
    /// transport failure that the retry/re-init ladder deals with.
    fn on_usb_error(&mut self, e: libusb::Error) -> error::Error {
        if let libusb::Error::NoDevice = e {
            error!(LOGGER, "AUC: USB device disappeared");
            self.gone = true;
            ErrorKind::DeviceGone.into()
        } else {
            ErrorKind::Usb(e.to_string()).into()
        }
    }
}

impl<'a> Transport for AucBridge<'a> {
    fn xfer(&mut self, slave_addr: u8, write: &[u8], read_len: usize) -> error::Result<Vec<u8>> {
        let result = match self.raw_xfer(&frame_xfer(slave_addr, write, read_len), read_len) {
            Err(_) if read_len > 0 && !self.gone => {
                // the module may have answered while the first read came up
                // short; ask the bridge for the queued reply without
                // re-sending the request
                debug!(LOGGER, "AUC: reading again from {:#x}", slave_addr);
                self.raw_xfer(&frame_xfer(slave_addr, &[], read_len), read_len)
            }
            other => other,
        };
        result
            .context(ErrorKind::Transport("AUC xfer failed".to_string()))
            .map_err(|e| e.into())
    }

    fn connecter(&self) -> Connecter {
        Connecter::Auc
    }

    fn drain(&mut self) {
        let mut scratch = [0u8; FRAME_LEN];
        // short timeout, a clean pipe times out immediately
        let _ = self
            .device
            .read_bulk(EP_IN, &mut scratch, Duration::from_millis(10));
    }

    /// Device info op returns 7 bytes: tempadc(2), reqRdIndex, reqWrIndex,
    /// respRdIndex, respWrIndex, state. Only the ADC reading is consumed.
    fn sensor_probe(&mut self) -> Option<i32> {
        match self.raw_xfer(&frame_simple(op::INFO), 7) {
            Ok(reply) => {
                let adc = (reply[1] as u16) << 8 | reply[0] as u16;
                Some(sensor::auc_sensor_value(adc))
            }
            Err(_) => {
                debug!(LOGGER, "AUC: failed to get info");
                None
            }
        }
    }

    fn reinit(&mut self) -> error::Result<()> {
        info!(LOGGER, "AUC: re-initializing bridge session");
        let result = self.init();
        if result.is_err() {
            // failed recovery means the device is lost until re-plug
            self.gone = true;
        }
        result
    }

    fn is_gone(&self) -> bool {
        self.gone
    }
}
