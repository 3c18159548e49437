//! Submission queue entries and completions
//!
//! Only the admin and fabrics commands a discovery controller handles are
//! modelled. Command-specific dwords are kept raw in `cdw` and read through
//! typed accessors, so a decoded command can be re-encoded byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fabric_transport::RemoteBuffer;

use super::status::StatusCode;
use super::{ensure_len, WireError, WireResult};

pub const COMMAND_SIZE: usize = 64;
pub const COMPLETION_SIZE: usize = 16;

pub const FABRICS_OPCODE: u8 = 0x7f;

/// SGL used for the data pointer; metadata pointer unused
pub const CMD_FLAGS_SGL_METABUF: u8 = 0x40;

/// Keyed data block descriptor, address + key
pub const SGL_KEYED_DATA_BLOCK: u8 = 0x40;

/// Admin opcodes understood by the emulated controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    GetLogPage = 0x02,
    Identify = 0x06,
    SetFeatures = 0x09,
    GetFeatures = 0x0a,
    AsyncEventRequest = 0x0c,
    KeepAlive = 0x18,
    Fabrics = 0x7f,
}

impl AdminOpcode {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::GetLogPage),
            0x06 => Some(Self::Identify),
            0x09 => Some(Self::SetFeatures),
            0x0a => Some(Self::GetFeatures),
            0x0c => Some(Self::AsyncEventRequest),
            0x18 => Some(Self::KeepAlive),
            0x7f => Some(Self::Fabrics),
            _ => None,
        }
    }
}

/// Fabrics command type (byte 4 of a fabrics command)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FabricsType {
    PropertySet = 0x00,
    Connect = 0x01,
    PropertyGet = 0x04,
    ResourceConfigReset = 0x08,
    ResourceConfigSet = 0x09,
    ResourceConfigGet = 0x0a,
}

impl FabricsType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::PropertySet),
            0x01 => Some(Self::Connect),
            0x04 => Some(Self::PropertyGet),
            0x08 => Some(Self::ResourceConfigReset),
            0x09 => Some(Self::ResourceConfigSet),
            0x0a => Some(Self::ResourceConfigGet),
            _ => None,
        }
    }
}

/// Largest length a keyed SGL data block can describe (24 bits)
pub const MAX_SGL_LEN: usize = 0xff_ffff;

/// Keyed SGL data block descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyedSgl {
    pub addr: u64,
    /// 24-bit on the wire
    pub len: u32,
    pub key: u32,
}

impl KeyedSgl {
    pub fn from_remote(remote: RemoteBuffer) -> WireResult<Self> {
        if remote.len > MAX_SGL_LEN {
            return Err(WireError::FieldTooLong {
                field: "sgl length",
                max: MAX_SGL_LEN,
                len: remote.len,
            });
        }
        Ok(Self {
            addr: remote.addr,
            len: remote.len as u32,
            key: remote.key,
        })
    }

    pub fn remote(&self) -> RemoteBuffer {
        RemoteBuffer {
            addr: self.addr,
            len: self.len as usize,
            key: self.key,
        }
    }
}

/// 64-byte submission queue entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub flags: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub sgl: KeyedSgl,
    /// cdw10 through cdw15
    pub cdw: [u32; 6],
}

impl Command {
    fn admin(opcode: AdminOpcode, command_id: u16) -> Self {
        Self {
            opcode: opcode as u8,
            command_id,
            ..Default::default()
        }
    }

    fn fabrics(fctype: FabricsType, command_id: u16) -> Self {
        Self {
            opcode: FABRICS_OPCODE,
            command_id,
            nsid: fctype as u32,
            ..Default::default()
        }
    }

    fn with_sgl(mut self, sgl: KeyedSgl) -> Self {
        self.flags = CMD_FLAGS_SGL_METABUF;
        self.sgl = sgl;
        self
    }

    pub fn property_set(command_id: u16, offset: u32, value: u64) -> Self {
        let mut cmd = Self::fabrics(FabricsType::PropertySet, command_id);
        cmd.cdw[0] = 1; // 8-byte attribute
        cmd.cdw[1] = offset;
        cmd.cdw[2] = value as u32;
        cmd.cdw[3] = (value >> 32) as u32;
        cmd
    }

    pub fn property_get(command_id: u16, offset: u32) -> Self {
        let mut cmd = Self::fabrics(FabricsType::PropertyGet, command_id);
        cmd.cdw[0] = 1;
        cmd.cdw[1] = offset;
        cmd
    }

    /// Admin queue connect; the connect payload is read through `sgl`
    pub fn connect(command_id: u16, sqsize: u16, kato: u32, sgl: KeyedSgl) -> Self {
        let mut cmd = Self::fabrics(FabricsType::Connect, command_id).with_sgl(sgl);
        cmd.cdw[0] = 0; // recfmt 0, qid 0
        cmd.cdw[1] = sqsize as u32;
        cmd.cdw[2] = kato;
        cmd
    }

    pub fn identify(command_id: u16, cns: u8, sgl: KeyedSgl) -> Self {
        let mut cmd = Self::admin(AdminOpcode::Identify, command_id).with_sgl(sgl);
        cmd.cdw[0] = cns as u32;
        cmd
    }

    /// Get log page of `sgl.len` bytes
    pub fn get_log_page(command_id: u16, lid: u8, sgl: KeyedSgl) -> Self {
        let numd = (sgl.len / 4).saturating_sub(1);
        let mut cmd = Self::admin(AdminOpcode::GetLogPage, command_id).with_sgl(sgl);
        cmd.cdw[0] = lid as u32 | (numd & 0xffff) << 16;
        cmd.cdw[1] = numd >> 16;
        cmd
    }

    pub fn keep_alive(command_id: u16) -> Self {
        Self::admin(AdminOpcode::KeepAlive, command_id)
    }

    pub fn set_features(command_id: u16, fid: u8, value: u32) -> Self {
        let mut cmd = Self::admin(AdminOpcode::SetFeatures, command_id);
        cmd.cdw[0] = fid as u32;
        cmd.cdw[1] = value;
        cmd
    }

    pub fn get_features(command_id: u16, fid: u8) -> Self {
        let mut cmd = Self::admin(AdminOpcode::GetFeatures, command_id);
        cmd.cdw[0] = fid as u32;
        cmd
    }

    pub fn async_event_request(command_id: u16) -> Self {
        Self::admin(AdminOpcode::AsyncEventRequest, command_id)
    }

    /// Resource-config command; the sub-operation travels in the command id
    pub fn resource_config(fctype: FabricsType, sub_id: u16, sgl: KeyedSgl) -> Self {
        Self::fabrics(fctype, sub_id).with_sgl(sgl)
    }

    pub fn admin_opcode(&self) -> Option<AdminOpcode> {
        AdminOpcode::from_raw(self.opcode)
    }

    pub fn fabrics_type(&self) -> Option<FabricsType> {
        FabricsType::from_raw(self.nsid as u8)
    }

    // Property get/set
    pub fn attrib(&self) -> u8 {
        self.cdw[0] as u8
    }

    pub fn property_offset(&self) -> u32 {
        self.cdw[1]
    }

    pub fn property_value(&self) -> u64 {
        self.cdw[2] as u64 | (self.cdw[3] as u64) << 32
    }

    // Connect
    pub fn recfmt(&self) -> u16 {
        self.cdw[0] as u16
    }

    pub fn qid(&self) -> u16 {
        (self.cdw[0] >> 16) as u16
    }

    pub fn sqsize(&self) -> u16 {
        self.cdw[1] as u16
    }

    pub fn cattr(&self) -> u8 {
        (self.cdw[1] >> 16) as u8
    }

    pub fn kato(&self) -> u32 {
        self.cdw[2]
    }

    // Identify
    pub fn cns(&self) -> u8 {
        self.cdw[0] as u8
    }

    // Get log page
    pub fn lid(&self) -> u8 {
        self.cdw[0] as u8
    }

    /// Requested log length in bytes
    pub fn log_len(&self) -> usize {
        let numdl = self.cdw[0] >> 16;
        let numdu = self.cdw[1] & 0xffff;
        (((numdu << 16) | numdl) as usize + 1) * 4
    }

    // Set/get features
    pub fn fid(&self) -> u8 {
        self.cdw[0] as u8
    }

    pub fn feature_value(&self) -> u32 {
        self.cdw[1]
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        buf.put_u8(self.opcode);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.command_id);
        buf.put_u32_le(self.nsid);
        buf.put_bytes(0, 16); // cdw2, cdw3, metadata pointer
        buf.put_u64_le(self.sgl.addr);
        buf.put_uint_le(self.sgl.len as u64 & 0xff_ffff, 3);
        buf.put_u32_le(self.sgl.key);
        buf.put_u8(if self.flags & CMD_FLAGS_SGL_METABUF != 0 {
            SGL_KEYED_DATA_BLOCK
        } else {
            0
        });
        for dword in self.cdw {
            buf.put_u32_le(dword);
        }
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, COMMAND_SIZE)?;
        let mut buf = &raw[..COMMAND_SIZE];

        let opcode = buf.get_u8();
        let flags = buf.get_u8();
        let command_id = buf.get_u16_le();
        let nsid = buf.get_u32_le();
        buf.advance(16);
        let sgl = KeyedSgl {
            addr: buf.get_u64_le(),
            len: buf.get_uint_le(3) as u32,
            key: buf.get_u32_le(),
        };
        buf.advance(1); // descriptor type

        let mut cdw = [0u32; 6];
        for dword in cdw.iter_mut() {
            *dword = buf.get_u32_le();
        }

        Ok(Self {
            opcode,
            flags,
            command_id,
            nsid,
            sgl,
            cdw,
        })
    }

    /// Describe the command for debug logs
    pub fn describe(&self) -> String {
        match self.admin_opcode() {
            Some(AdminOpcode::Fabrics) => match self.fabrics_type() {
                Some(fctype) => format!("{:?}", fctype),
                None => format!("fabrics fctype {:#04x}", self.nsid as u8),
            },
            Some(op) => format!("{:?}", op),
            None => format!("opcode {:#04x}", self.opcode),
        }
    }
}

/// 16-byte completion queue entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub result: u64,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    pub status: u16,
}

impl Completion {
    pub fn new(command_id: u16, status: StatusCode, result: u64) -> Self {
        Self {
            result,
            command_id,
            status: status.to_wire(),
            ..Default::default()
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_wire(self.status)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMPLETION_SIZE);
        buf.put_u64_le(self.result);
        buf.put_u16_le(self.sq_head);
        buf.put_u16_le(self.sq_id);
        buf.put_u16_le(self.command_id);
        buf.put_u16_le(self.status);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, COMPLETION_SIZE)?;
        let mut buf = raw;

        Ok(Self {
            result: buf.get_u64_le(),
            sq_head: buf.get_u16_le(),
            sq_id: buf.get_u16_le(),
            command_id: buf.get_u16_le(),
            status: buf.get_u16_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::{LID_DISCOVERY, REG_CC};

    #[test]
    fn test_command_layout() {
        let sgl = KeyedSgl {
            addr: 0x1122_3344_5566_7788,
            len: 0x0004_00,
            key: 0xdead_beef,
        };
        let raw = Command::get_log_page(7, LID_DISCOVERY, sgl).encode();

        assert_eq!(raw.len(), COMMAND_SIZE);
        assert_eq!(raw[0], AdminOpcode::GetLogPage as u8);
        assert_eq!(raw[1], CMD_FLAGS_SGL_METABUF);
        assert_eq!(&raw[2..4], &7u16.to_le_bytes());
        assert_eq!(&raw[24..32], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&raw[32..35], &[0x00, 0x04, 0x00]);
        assert_eq!(&raw[35..39], &0xdead_beefu32.to_le_bytes());
        assert_eq!(raw[39], SGL_KEYED_DATA_BLOCK);
        assert_eq!(raw[40], LID_DISCOVERY);
        // numd = 1024 / 4 - 1
        assert_eq!(&raw[42..44], &255u16.to_le_bytes());

        let cmd = Command::decode(&raw).unwrap();
        assert_eq!(cmd.lid(), LID_DISCOVERY);
        assert_eq!(cmd.log_len(), 1024);
        assert_eq!(cmd.sgl, sgl);
    }

    #[test]
    fn test_fabrics_views() {
        let raw = Command::property_set(3, REG_CC, 0x46_0001).encode();
        assert_eq!(raw[0], FABRICS_OPCODE);
        assert_eq!(raw[4], FabricsType::PropertySet as u8);
        assert_eq!(&raw[44..48], &REG_CC.to_le_bytes());

        let cmd = Command::decode(&raw).unwrap();
        assert_eq!(cmd.fabrics_type(), Some(FabricsType::PropertySet));
        assert_eq!(cmd.property_offset(), REG_CC);
        assert_eq!(cmd.property_value(), 0x46_0001);

        let connect = Command::connect(1, 31, 120_000, KeyedSgl::default());
        assert_eq!(connect.qid(), 0);
        assert_eq!(connect.sqsize(), 31);
        assert_eq!(connect.kato(), 120_000);
        assert_eq!(connect.describe(), "Connect");

        let features = Command::set_features(9, 0x0f, 30_000);
        assert_eq!(features.fid(), 0x0f);
        assert_eq!(features.feature_value(), 30_000);
        assert_eq!(features.describe(), "SetFeatures");
    }

    #[test]
    fn test_completion_layout() {
        let cpl = Completion::new(0x1234, StatusCode::InvalidLogPage, 0x70_f002);
        let raw = cpl.encode();
        assert_eq!(raw.len(), COMPLETION_SIZE);
        assert_eq!(&raw[12..14], &0x1234u16.to_le_bytes());

        let back = Completion::decode(&raw).unwrap();
        assert_eq!(back.status_code(), StatusCode::InvalidLogPage);
        assert_eq!(back.result, 0x70_f002);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert_eq!(
            Command::decode(&[0u8; 63]),
            Err(WireError::Truncated { need: 64, got: 63 })
        );
        assert!(Completion::decode(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_sgl_length_limit() {
        let remote = |len| RemoteBuffer {
            addr: 0x1000,
            len,
            key: 7,
        };

        let sgl = KeyedSgl::from_remote(remote(MAX_SGL_LEN)).unwrap();
        assert_eq!(sgl.len as usize, MAX_SGL_LEN);
        assert_eq!(sgl.remote(), remote(MAX_SGL_LEN));

        assert_eq!(
            KeyedSgl::from_remote(remote((1 << 24) + 1024)),
            Err(WireError::FieldTooLong {
                field: "sgl length",
                max: MAX_SGL_LEN,
                len: (1 << 24) + 1024,
            })
        );
    }
}
