//! Resource-config payloads exchanged with a supervisory controller
//!
//! The sub-operation is carried in the command id of the fabrics command,
//! the payload travels through the keyed SGL.

use serde::{Deserialize, Serialize};

use super::{
    ensure_len, get_u16, get_u32, put_u16, put_u32, read_str, write_str, WireError, WireResult,
    NQN_FIELD_LEN, TRADDR_LEN, TRSVCID_LEN,
};

/// Resource-config sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConfigId {
    GetNsDevices = 0x01,
    GetTransports = 0x02,
    Reset = 0x03,
    SetPort = 0x04,
    DelPort = 0x05,
    LinkPort = 0x06,
    UnlinkPort = 0x07,
    SetSubsys = 0x08,
    DelSubsys = 0x09,
    SetNs = 0x0a,
    DelNs = 0x0b,
    SetHost = 0x0c,
    DelHost = 0x0d,
    LinkHost = 0x0e,
    UnlinkHost = 0x0f,
}

impl ConfigId {
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::GetNsDevices),
            0x02 => Some(Self::GetTransports),
            0x03 => Some(Self::Reset),
            0x04 => Some(Self::SetPort),
            0x05 => Some(Self::DelPort),
            0x06 => Some(Self::LinkPort),
            0x07 => Some(Self::UnlinkPort),
            0x08 => Some(Self::SetSubsys),
            0x09 => Some(Self::DelSubsys),
            0x0a => Some(Self::SetNs),
            0x0b => Some(Self::DelNs),
            0x0c => Some(Self::SetHost),
            0x0d => Some(Self::DelHost),
            0x0e => Some(Self::LinkHost),
            0x0f => Some(Self::UnlinkHost),
            _ => None,
        }
    }
}

/// Port definition on the managed target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub portid: u16,
    pub trtype: u8,
    pub adrfam: u8,
    pub treq: u8,
    pub traddr: String,
    pub trsvcid: String,
}

impl PortConfig {
    const SIZE: usize = 6 + TRSVCID_LEN + TRADDR_LEN;

    fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0] = self.trtype;
        buf[1] = self.adrfam;
        buf[3] = self.treq;
        put_u16(&mut buf, 4, self.portid);
        write_str("trsvcid", &mut buf[6..6 + TRSVCID_LEN], &self.trsvcid)?;
        write_str("traddr", &mut buf[38..38 + TRADDR_LEN], &self.traddr)?;
        Ok(buf)
    }

    fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, Self::SIZE)?;
        Ok(Self {
            trtype: raw[0],
            adrfam: raw[1],
            treq: raw[3],
            portid: get_u16(raw, 4),
            trsvcid: read_str("trsvcid", &raw[6..6 + TRSVCID_LEN])?,
            traddr: read_str("traddr", &raw[38..38 + TRADDR_LEN])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsysConfig {
    pub subnqn: String,
    pub allow_any: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsConfig {
    pub subnqn: String,
    pub nsid: u32,
    pub deviceid: u32,
    pub devicensid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostnqn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLink {
    pub subnqn: String,
    pub hostnqn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLink {
    pub subnqn: String,
    pub portid: u16,
}

/// Decoded resource-config set request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    SetPort(PortConfig),
    DelPort(u16),
    LinkPort(PortLink),
    UnlinkPort(PortLink),
    SetSubsys(SubsysConfig),
    DelSubsys(String),
    SetNs(NsConfig),
    DelNs { subnqn: String, nsid: u32 },
    SetHost(HostConfig),
    DelHost(String),
    LinkHost(HostLink),
    UnlinkHost(HostLink),
}

fn nqn(field: &'static str, raw: &[u8], offset: usize) -> WireResult<String> {
    ensure_len(raw, offset + NQN_FIELD_LEN)?;
    read_str(field, &raw[offset..offset + NQN_FIELD_LEN])
}

fn put_nqn(field: &'static str, buf: &mut Vec<u8>, offset: usize, value: &str) -> WireResult<()> {
    if buf.len() < offset + NQN_FIELD_LEN {
        buf.resize(offset + NQN_FIELD_LEN, 0);
    }
    write_str(field, &mut buf[offset..offset + NQN_FIELD_LEN], value)
}

impl ConfigRequest {
    pub fn id(&self) -> ConfigId {
        match self {
            Self::SetPort(_) => ConfigId::SetPort,
            Self::DelPort(_) => ConfigId::DelPort,
            Self::LinkPort(_) => ConfigId::LinkPort,
            Self::UnlinkPort(_) => ConfigId::UnlinkPort,
            Self::SetSubsys(_) => ConfigId::SetSubsys,
            Self::DelSubsys(_) => ConfigId::DelSubsys,
            Self::SetNs(_) => ConfigId::SetNs,
            Self::DelNs { .. } => ConfigId::DelNs,
            Self::SetHost(_) => ConfigId::SetHost,
            Self::DelHost(_) => ConfigId::DelHost,
            Self::LinkHost(_) => ConfigId::LinkHost,
            Self::UnlinkHost(_) => ConfigId::UnlinkHost,
        }
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::SetPort(port) => return port.encode(),
            Self::DelPort(portid) => {
                buf.resize(2, 0);
                put_u16(&mut buf, 0, *portid);
            }
            Self::LinkPort(link) | Self::UnlinkPort(link) => {
                put_nqn("subnqn", &mut buf, 0, &link.subnqn)?;
                buf.resize(NQN_FIELD_LEN + 2, 0);
                put_u16(&mut buf, NQN_FIELD_LEN, link.portid);
            }
            Self::SetSubsys(subsys) => {
                put_nqn("subnqn", &mut buf, 0, &subsys.subnqn)?;
                buf.push(subsys.allow_any as u8);
            }
            Self::DelSubsys(subnqn) => put_nqn("subnqn", &mut buf, 0, subnqn)?,
            Self::SetNs(ns) => {
                put_nqn("subnqn", &mut buf, 0, &ns.subnqn)?;
                buf.resize(NQN_FIELD_LEN + 12, 0);
                put_u32(&mut buf, NQN_FIELD_LEN, ns.nsid);
                put_u32(&mut buf, NQN_FIELD_LEN + 4, ns.deviceid);
                put_u32(&mut buf, NQN_FIELD_LEN + 8, ns.devicensid);
            }
            Self::DelNs { subnqn, nsid } => {
                put_nqn("subnqn", &mut buf, 0, subnqn)?;
                buf.resize(NQN_FIELD_LEN + 4, 0);
                put_u32(&mut buf, NQN_FIELD_LEN, *nsid);
            }
            Self::SetHost(host) => put_nqn("hostnqn", &mut buf, 0, &host.hostnqn)?,
            Self::DelHost(hostnqn) => put_nqn("hostnqn", &mut buf, 0, hostnqn)?,
            Self::LinkHost(link) | Self::UnlinkHost(link) => {
                put_nqn("subnqn", &mut buf, 0, &link.subnqn)?;
                put_nqn("hostnqn", &mut buf, NQN_FIELD_LEN, &link.hostnqn)?;
            }
        }
        Ok(buf)
    }

    /// Decode a set request; `None` for a sub-id that is not a set operation
    pub fn decode(id: ConfigId, raw: &[u8]) -> WireResult<Option<Self>> {
        let request = match id {
            ConfigId::GetNsDevices | ConfigId::GetTransports | ConfigId::Reset => return Ok(None),
            ConfigId::SetPort => Self::SetPort(PortConfig::decode(raw)?),
            ConfigId::DelPort => {
                ensure_len(raw, 2)?;
                Self::DelPort(get_u16(raw, 0))
            }
            ConfigId::LinkPort | ConfigId::UnlinkPort => {
                ensure_len(raw, NQN_FIELD_LEN + 2)?;
                let link = PortLink {
                    subnqn: nqn("subnqn", raw, 0)?,
                    portid: get_u16(raw, NQN_FIELD_LEN),
                };
                if id == ConfigId::LinkPort {
                    Self::LinkPort(link)
                } else {
                    Self::UnlinkPort(link)
                }
            }
            ConfigId::SetSubsys => {
                ensure_len(raw, NQN_FIELD_LEN + 1)?;
                Self::SetSubsys(SubsysConfig {
                    subnqn: nqn("subnqn", raw, 0)?,
                    allow_any: raw[NQN_FIELD_LEN] != 0,
                })
            }
            ConfigId::DelSubsys => Self::DelSubsys(nqn("subnqn", raw, 0)?),
            ConfigId::SetNs => {
                ensure_len(raw, NQN_FIELD_LEN + 12)?;
                Self::SetNs(NsConfig {
                    subnqn: nqn("subnqn", raw, 0)?,
                    nsid: get_u32(raw, NQN_FIELD_LEN),
                    deviceid: get_u32(raw, NQN_FIELD_LEN + 4),
                    devicensid: get_u32(raw, NQN_FIELD_LEN + 8),
                })
            }
            ConfigId::DelNs => {
                ensure_len(raw, NQN_FIELD_LEN + 4)?;
                Self::DelNs {
                    subnqn: nqn("subnqn", raw, 0)?,
                    nsid: get_u32(raw, NQN_FIELD_LEN),
                }
            }
            ConfigId::SetHost => Self::SetHost(HostConfig {
                hostnqn: nqn("hostnqn", raw, 0)?,
            }),
            ConfigId::DelHost => Self::DelHost(nqn("hostnqn", raw, 0)?),
            ConfigId::LinkHost | ConfigId::UnlinkHost => {
                let link = HostLink {
                    subnqn: nqn("subnqn", raw, 0)?,
                    hostnqn: nqn("hostnqn", raw, NQN_FIELD_LEN)?,
                };
                if id == ConfigId::LinkHost {
                    Self::LinkHost(link)
                } else {
                    Self::UnlinkHost(link)
                }
            }
        };
        Ok(Some(request))
    }
}

/// Namespace-capable device on the managed target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsDevice {
    pub devid: u8,
    pub nsid: u8,
}

impl NsDevice {
    /// Device id reported for a null block device
    pub const NULLB_DEVID: u8 = 255;
    const SIZE: usize = 8;

    pub fn encode_list(devices: &[NsDevice]) -> WireResult<Vec<u8>> {
        let count = list_count("ns devices", devices.len())?;
        let mut buf = vec![0u8; 1 + devices.len() * Self::SIZE];
        buf[0] = count;
        for (i, dev) in devices.iter().enumerate() {
            let at = 1 + i * Self::SIZE;
            buf[at] = dev.devid;
            buf[at + 1] = dev.nsid;
        }
        Ok(buf)
    }

    pub fn decode_list(raw: &[u8]) -> WireResult<Vec<NsDevice>> {
        ensure_len(raw, 1)?;
        let count = raw[0] as usize;
        ensure_len(raw, 1 + count * Self::SIZE)?;
        Ok(raw[1..]
            .chunks_exact(Self::SIZE)
            .take(count)
            .map(|e| NsDevice {
                devid: e[0],
                nsid: e[1],
            })
            .collect())
    }
}

/// Fabric interface available on the managed target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEntry {
    pub trtype: u8,
    pub adrfam: u8,
    pub traddr: String,
}

impl TransportEntry {
    const SIZE: usize = 8 + TRADDR_LEN;

    pub fn encode_list(entries: &[TransportEntry]) -> WireResult<Vec<u8>> {
        let count = list_count("transports", entries.len())?;
        let mut buf = vec![0u8; 1 + entries.len() * Self::SIZE];
        buf[0] = count;
        for (i, entry) in entries.iter().enumerate() {
            let at = 1 + i * Self::SIZE;
            buf[at] = entry.trtype;
            buf[at + 1] = entry.adrfam;
            write_str("traddr", &mut buf[at + 8..at + Self::SIZE], &entry.traddr)?;
        }
        Ok(buf)
    }

    pub fn decode_list(raw: &[u8]) -> WireResult<Vec<TransportEntry>> {
        ensure_len(raw, 1)?;
        let count = raw[0] as usize;
        ensure_len(raw, 1 + count * Self::SIZE)?;
        raw[1..]
            .chunks_exact(Self::SIZE)
            .take(count)
            .map(|e| {
                Ok(TransportEntry {
                    trtype: e[0],
                    adrfam: e[1],
                    traddr: read_str("traddr", &e[8..])?,
                })
            })
            .collect()
    }
}

// List headers carry a one-byte count
fn list_count(field: &'static str, len: usize) -> WireResult<u8> {
    u8::try_from(len).map_err(|_| WireError::FieldTooLong {
        field,
        max: u8::MAX as usize,
        len,
    })
}
