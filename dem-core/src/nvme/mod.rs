//! NVMe over Fabrics wire format
//!
//! Fixed-size little-endian structures shared by the host and controller
//! sides: submission queue entries, completions, the connect payload, the
//! identify controller page, the discovery log and the resource-config
//! payloads. Every decoder checks the buffer length first and every string
//! encoder checks the field width.

use bytes::{Buf, BufMut};
use thiserror::Error;

pub mod command;
pub mod discovery;
pub mod resource;
pub mod status;

pub use command::{
    AdminOpcode, Command, Completion, FabricsType, KeyedSgl, COMMAND_SIZE, COMPLETION_SIZE,
    MAX_SGL_LEN,
};
pub use discovery::{
    CmRequest, ConnectData, DiscoveryLogEntry, DiscoveryLogHeader, IdentifyController, RdmaTsas,
    SubsystemType, LOG_COUNT_LEN, LOG_ENTRY_SIZE, LOG_HEADER_SIZE,
};
pub use resource::{
    ConfigId, ConfigRequest, HostConfig, HostLink, NsConfig, NsDevice, PortConfig, PortLink,
    SubsysConfig, TransportEntry,
};
pub use status::StatusCode;

/// Well-known discovery subsystem NQN
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Subsystem NQN accepted for the management domain controller
pub const DOMAIN_NQN: &str = "nqn.2014-08.org.nvmexpress.domain";

/// Prefix of generated host NQNs; a UUID follows
pub const HOST_NQN_PREFIX: &str = "nqn.2014-08.org.nvmexpress:NVMf:uuid:";

/// Width of every NQN field on the wire
pub const NQN_FIELD_LEN: usize = 256;
pub const TRSVCID_LEN: usize = 32;
pub const TRADDR_LEN: usize = 256;
pub const TSAS_LEN: usize = 256;

// Controller registers
pub const REG_CAP: u32 = 0x00;
pub const REG_VS: u32 = 0x08;
pub const REG_CC: u32 = 0x14;
pub const REG_CSTS: u32 = 0x1c;

/// CAP as reported by the emulated controller
pub const CAP_VALUE: u64 = 0x200f_0003ff;

/// NVMe 1.2.1
pub const VS_VALUE: u64 = (1 << 16) | (2 << 8) | 1;

pub const CC_ENABLE: u64 = 0x46_0001;
pub const CC_DISABLE: u64 = 0x46_4001;
pub const CSTS_READY: u32 = 1;
pub const CSTS_SHUTDOWN_COMPLETE: u32 = 8;

// Features
pub const FEAT_ASYNC_EVENT: u8 = 0x0b;
pub const FEAT_KATO: u8 = 0x0f;

/// Async event configuration bit: discovery log page change
pub const AEN_DISC_LOG_CHANGE: u32 = 1 << 31;

/// Completion result of a discovery-log-change async event (log id 0x70)
pub const AEN_DISC_LOG_RESULT: u64 = 0x70_f002;

/// Notice type/info part of [`AEN_DISC_LOG_RESULT`]
pub const AEN_NOTICE_DISC_CHANGE: u64 = 0xf002;

pub const LID_DISCOVERY: u8 = 0x70;
pub const CNS_CTRL: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("{field} is {len} bytes but the field holds {max}")]
    FieldTooLong {
        field: &'static str,
        max: usize,
        len: usize,
    },

    #[error("{0} is not valid UTF-8")]
    BadUtf8(&'static str),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

pub(crate) fn ensure_len(buf: &[u8], need: usize) -> WireResult<()> {
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Decode a NUL-terminated (or full-width) ASCII field, dropping padding
pub(crate) fn read_str(field: &'static str, raw: &[u8]) -> WireResult<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end]).map_err(|_| WireError::BadUtf8(field))?;
    Ok(text.trim_end_matches(' ').to_string())
}

/// Copy `value` into a fixed-width field; the remainder stays zeroed
pub(crate) fn write_str(field: &'static str, dst: &mut [u8], value: &str) -> WireResult<()> {
    if value.len() > dst.len() {
        return Err(WireError::FieldTooLong {
            field,
            max: dst.len(),
            len: value.len(),
        });
    }
    dst[..value.len()].copy_from_slice(value.as_bytes());
    dst[value.len()..].fill(0);
    Ok(())
}

pub(crate) fn get_u16(buf: &[u8], offset: usize) -> u16 {
    (&buf[offset..]).get_u16_le()
}

pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    (&buf[offset..]).get_u32_le()
}

pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    (&buf[offset..]).get_u64_le()
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    (&mut buf[offset..]).put_u16_le(value);
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    (&mut buf[offset..]).put_u32_le(value);
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    (&mut buf[offset..]).put_u64_le(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_fields() {
        let mut field = [0xffu8; 8];
        write_str("traddr", &mut field, "abc").unwrap();
        assert_eq!(&field, b"abc\0\0\0\0\0");
        assert_eq!(read_str("traddr", &field).unwrap(), "abc");

        let padded = *b"4420    ";
        assert_eq!(read_str("trsvcid", &padded).unwrap(), "4420");

        let err = write_str("trsvcid", &mut field, "123456789").unwrap_err();
        assert_eq!(
            err,
            WireError::FieldTooLong {
                field: "trsvcid",
                max: 8,
                len: 9
            }
        );

        assert_eq!(
            read_str("subnqn", &[0xc3, 0x28, 0]),
            Err(WireError::BadUtf8("subnqn"))
        );
    }

    #[test]
    fn test_ensure_len() {
        assert!(ensure_len(&[0; 16], 16).is_ok());
        assert_eq!(
            ensure_len(&[0; 10], 16),
            Err(WireError::Truncated { need: 16, got: 10 })
        );
    }

    #[test]
    fn test_register_values() {
        assert_eq!(VS_VALUE, 0x0001_0201);
        assert_eq!(AEN_DISC_LOG_RESULT & 0xffff, AEN_NOTICE_DISC_CHANGE);
        assert_eq!((AEN_DISC_LOG_RESULT >> 16) as u8, LID_DISCOVERY);
    }
}
