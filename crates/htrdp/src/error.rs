// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for all public PD engine operations.
//!
//! Every fallible operation returns one of these discriminants. Per-frame
//! receive errors are counted and logged but never tear down the session;
//! per-publication send errors are accumulated and the last one is returned
//! after the full send pass.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by htrdp operations.
#[derive(Debug)]
pub enum Error {
    /// Session not yet initialised (or a session-level lock failed).
    Init,
    /// Caller supplied invalid arguments.
    Param(&'static str),
    /// Allocation failed or an internal table is too small.
    Mem(&'static str),
    /// Referenced publication not found (stale or foreign handle).
    NoPub,
    /// Referenced subscription not found (stale or foreign handle).
    NoSub,
    /// Frame fails structural checks (size, version, msgType, datasetLength).
    Wire(WireFault),
    /// Frame check sum mismatch.
    Crc,
    /// Topography counter mismatch between peer and session.
    Topo,
    /// Subscription has exceeded its interval.
    Timeout,
    /// Underlying socket operation failed.
    Sock(&'static str),
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Subscription exists but no data has ever been staged.
    NoData,
    /// Non-blocking receive would block (normal end-of-read).
    Block,
}

/// Which structural check a frame failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFault {
    /// Datagram shorter than the minimal header or longer than the maximum packet.
    Size,
    /// Protocol version field not recognised (v1 mask 0xFF00, v2 exact).
    Version,
    /// Message type outside the accepted set for the frame version.
    MsgType,
    /// datasetLength exceeds the per-version payload bound.
    DatasetLength,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Init => write!(f, "Session not initialised"),
            Error::Param(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::Mem(msg) => write!(f, "Out of memory: {}", msg),
            Error::NoPub => write!(f, "Publication not found"),
            Error::NoSub => write!(f, "Subscription not found"),
            Error::Wire(fault) => write!(f, "Malformed PD frame: {:?}", fault),
            Error::Crc => write!(f, "Frame check sum mismatch"),
            Error::Topo => write!(f, "Topography counter mismatch"),
            Error::Timeout => write!(f, "Subscription timed out"),
            Error::Sock(msg) => write!(f, "Socket error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::NoData => write!(f, "No data received yet"),
            Error::Block => write!(f, "Operation would block"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            Error::Block
        } else {
            Error::Io(e)
        }
    }
}
