//! Error codes shared by the kernel primitives and the user library
//!
//! Every fallible substrate operation reports one of these. The numeric
//! values follow the kernel's negative return convention so that raw
//! syscall results can be converted with [`ExoError::check`].

use thiserror::Error;

/// Kernel and library error codes
///
/// The spawn path uses [`ExoError::NotFound`] for a missing image,
/// [`ExoError::NotExec`] for a bad header, [`ExoError::NoMem`] for
/// exhausted frames or an oversized argument list and
/// [`ExoError::Fault`] for a failed page translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ExoError {
    #[error("unspecified error")]
    Unspecified,

    #[error("bad environment")]
    BadEnv,

    #[error("invalid parameter")]
    Invalid,

    #[error("out of memory")]
    NoMem,

    #[error("out of environments")]
    NoFreeEnv,

    #[error("segmentation fault")]
    Fault,

    #[error("env is not recving")]
    IpcNotRecv,

    #[error("unexpected end of file")]
    Eof,

    #[error("too many files are open")]
    MaxOpen,

    #[error("file or block not found")]
    NotFound,

    #[error("invalid path")]
    BadPath,

    #[error("file already exists")]
    FileExists,

    #[error("file is not a valid executable")]
    NotExec,
}

pub type Result<T> = core::result::Result<T, ExoError>;

impl ExoError {
    /// Negative kernel return code for this error
    pub const fn code(self) -> i32 {
        -(match self {
            ExoError::Unspecified => 1,
            ExoError::BadEnv => 2,
            ExoError::Invalid => 3,
            ExoError::NoMem => 4,
            ExoError::NoFreeEnv => 5,
            ExoError::Fault => 6,
            ExoError::IpcNotRecv => 7,
            ExoError::Eof => 8,
            ExoError::MaxOpen => 10,
            ExoError::NotFound => 11,
            ExoError::BadPath => 12,
            ExoError::FileExists => 13,
            ExoError::NotExec => 14,
        })
    }

    /// Decode a negative kernel return code
    ///
    /// Unknown negative codes decode as [`ExoError::Unspecified`]; zero and
    /// positive values are not errors and return `None`.
    pub const fn from_code(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Some(match -code {
            2 => ExoError::BadEnv,
            3 => ExoError::Invalid,
            4 => ExoError::NoMem,
            5 => ExoError::NoFreeEnv,
            6 => ExoError::Fault,
            7 => ExoError::IpcNotRecv,
            8 => ExoError::Eof,
            10 => ExoError::MaxOpen,
            11 => ExoError::NotFound,
            12 => ExoError::BadPath,
            13 => ExoError::FileExists,
            14 => ExoError::NotExec,
            _ => ExoError::Unspecified,
        })
    }

    /// Convert a raw syscall return value
    pub const fn check(ret: i32) -> Result<i32> {
        match Self::from_code(ret) {
            Some(err) => Err(err),
            None => Ok(ret),
        }
    }
}
