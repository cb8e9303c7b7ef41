//! Unified error types for the network stack.
//!
//! Each subsystem defines a small `Copy` error enum with a hand-written
//! [`fmt::Display`] impl, in the same shape the rest of this codebase's
//! donor uses for its memory-management errors: no boxed dynamic error
//! type, no derive-macro crate.
//!
//! The socket-facing layer additionally exposes [`Errno`], a POSIX-shaped
//! error code that every internal error maps onto at the API boundary.

use core::fmt;

/// Error raised by the device engine (`device.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    UnknownDevice,
    PayloadTooLarge { len: usize },
    CaptureOpenFailed,
    NoAddressForInterface,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDevice => write!(f, "unknown device"),
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds the 1500-byte MTU")
            }
            Self::CaptureOpenFailed => write!(f, "failed to open capture handle"),
            Self::NoAddressForInterface => {
                write!(f, "could not resolve MAC/IPv4 for interface")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Error raised while resolving an address via ARP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    NotFound,
}

impl fmt::Display for ArpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no ARP entry and resolution timed out"),
        }
    }
}

impl std::error::Error for ArpError {}

/// Error raised by the IPv4 forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpError {
    NoDeviceForSource,
    NoRoute,
    TtlExceeded,
    ChecksumMismatch,
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDeviceForSource => write!(f, "no owned device with the given source IP"),
            Self::NoRoute => write!(f, "no route to destination"),
            Self::TtlExceeded => write!(f, "TTL reached zero while forwarding"),
            Self::ChecksumMismatch => write!(f, "IPv4 header checksum mismatch"),
        }
    }
}

impl std::error::Error for IpError {}

/// POSIX-shaped error code surfaced at the socket API boundary.
///
/// Named and numbered loosely after the errnos the specification calls out
/// by name; values are internal to this crate and not meant to match the
/// host libc's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EafNoSupport,
    EProtoType,
    EProtoNoSupport,
    EConnReset,
    ETimedOut,
    ENotConn,
    EAddrInUse,
    EInval,
    EBadF,
    EAiFamily,
    EAiSockType,
    EAiBadFlags,
    EAiNoName,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EafNoSupport => "EAFNOSUPPORT",
            Self::EProtoType => "EPROTOTYPE",
            Self::EProtoNoSupport => "EPROTONOSUPPORT",
            Self::EConnReset => "ECONNRESET",
            Self::ETimedOut => "ETIMEDOUT",
            Self::ENotConn => "ENOTCONN",
            Self::EAddrInUse => "EADDRINUSE",
            Self::EInval => "EINVAL",
            Self::EBadF => "EBADF",
            Self::EAiFamily => "EAI_FAMILY",
            Self::EAiSockType => "EAI_SOCKTYPE",
            Self::EAiBadFlags => "EAI_BADFLAGS",
            Self::EAiNoName => "EAI_NONAME",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Errno {}

pub type DeviceResult<T> = Result<T, DeviceError>;
pub type ArpResult<T> = Result<T, ArpError>;
pub type IpResult<T> = Result<T, IpError>;
/// Sockets report failure as `-1` paired with an [`Errno`]; this alias keeps
/// call sites honest about which half of that pair they are returning.
pub type SockResult<T> = Result<T, Errno>;
