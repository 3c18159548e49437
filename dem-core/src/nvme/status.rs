//! Completion status codes

use std::fmt;

/// Do Not Retry bit of the status field
pub const STATUS_DNR: u16 = 0x4000;

/// Status code of a completion, SCT and SC combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    InvalidOpcode,
    InvalidField,
    Internal,
    InvalidLogPage,
    FeatureNotChangeable,
    BadAttributes,
    ConnectInvalidParam,
    ConnectInvalidHost,
    WriteFault,
    AccessDenied,
    Other(u16),
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            Self::Success => 0x000,
            Self::InvalidOpcode => 0x001,
            Self::InvalidField => 0x002,
            Self::Internal => 0x006,
            Self::InvalidLogPage => 0x109,
            Self::FeatureNotChangeable => 0x10e,
            Self::BadAttributes => 0x180,
            Self::ConnectInvalidParam => 0x182,
            Self::ConnectInvalidHost => 0x184,
            Self::WriteFault => 0x280,
            Self::AccessDenied => 0x286,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x000 => Self::Success,
            0x001 => Self::InvalidOpcode,
            0x002 => Self::InvalidField,
            0x006 => Self::Internal,
            0x109 => Self::InvalidLogPage,
            0x10e => Self::FeatureNotChangeable,
            0x180 => Self::BadAttributes,
            0x182 => Self::ConnectInvalidParam,
            0x184 => Self::ConnectInvalidHost,
            0x280 => Self::WriteFault,
            0x286 => Self::AccessDenied,
            other => Self::Other(other),
        }
    }

    /// Completion status field: errors carry DNR, the phase bit stays clear
    pub fn to_wire(&self) -> u16 {
        match self {
            Self::Success => 0,
            other => (other.code() | STATUS_DNR) << 1,
        }
    }

    pub fn from_wire(status: u16) -> Self {
        Self::from_code((status >> 1) & 0x7ff)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "status {:#05x}", code),
            known => write!(f, "{:?} ({:#05x})", known, known.code()),
        }
    }
}
