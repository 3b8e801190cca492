// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too large: {0}")]
    TooLarge(String),

    #[error("bad version: {0}")]
    BadVersion(u8),

    #[error("trailing data: {0} bytes")]
    TrailingData(usize),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("disconnected")]
    Disconnected,

    #[error("Error code")]
    ErrorCode(#[from] TryFromPrimitiveError<crate::messages::ErrorCode>),

    #[error("message parse error")]
    Parse(nom::Err<(Vec<u8>, nom::error::ErrorKind)>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl<'a> From<nom::Err<(&'a [u8], nom::error::ErrorKind)>> for Error {
    fn from(e: nom::Err<(&'a [u8], nom::error::ErrorKind)>) -> Error {
        Error::Parse(e.to_owned())
    }
}
