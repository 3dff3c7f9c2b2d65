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

//! The Avalon MM driver errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// USB error on the AUC bridge.
    #[fail(display = "USB: {}", _0)]
    Usb(String),

    /// Raw I2C bus error.
    #[fail(display = "I2C: {}", _0)]
    I2c(String),

    /// Transport failed to complete a packet exchange.
    #[fail(display = "Transport: {}", _0)]
    Transport(String),

    /// A received wire packet was rejected.
    #[fail(display = "Packet: {}", _0)]
    Packet(Packet),

    /// Module reported a version prefix the device model table doesn't know.
    #[fail(display = "Unknown module model: {}", _0)]
    UnknownModel(String),

    /// Reply `opt` byte doesn't match the DNA tail of the addressed module.
    #[fail(display = "Module {}: I2C address collision", _0)]
    AddressCollision(usize),

    /// Error concerning module with specific address.
    #[fail(display = "Module {}: {}", _0, _1)]
    Module(usize, String),

    /// Stratum job violates a wire protocol precondition, push refused.
    #[fail(display = "Job: {}", _0)]
    Job(String),

    /// Invalid operator configuration.
    #[fail(display = "Config: {}", _0)]
    Config(String),

    /// The USB device disappeared and could not be recovered.
    #[fail(display = "Device gone")]
    DeviceGone,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum Packet {
    #[fail(display = "invalid header magic")]
    InvalidHeader,
    #[fail(display = "payload CRC mismatch")]
    BadCrc,
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

impl From<libusb::Error> for Error {
    fn from(usb_error: libusb::Error) -> Self {
        let msg = usb_error.to_string();
        Self {
            inner: usb_error.context(ErrorKind::Usb(msg)),
        }
    }
}

impl From<linux_embedded_hal::i2cdev::linux::LinuxI2CError> for Error {
    fn from(i2c_error: linux_embedded_hal::i2cdev::linux::LinuxI2CError) -> Self {
        let msg = i2c_error.to_string();
        Self {
            inner: i2c_error.context(ErrorKind::I2c(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
