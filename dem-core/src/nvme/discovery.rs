//! Connect payload, identify controller page and discovery log format

use bytes::{BufMut, BytesMut};

use super::{
    ensure_len, get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, read_str, write_str,
    WireError, WireResult, NQN_FIELD_LEN, TRADDR_LEN, TRSVCID_LEN, VS_VALUE,
};
use super::command::MAX_SGL_LEN;

/// RDMA-CM connect request private data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmRequest {
    pub recfmt: u16,
    pub qid: u16,
    pub hrqsize: u16,
    pub hsqsize: u16,
}

impl CmRequest {
    pub const SIZE: usize = 32;

    /// Admin queue request sized for `depth` outstanding commands
    pub fn admin(depth: u16) -> Self {
        Self {
            recfmt: 0,
            qid: 0,
            hrqsize: depth,
            hsqsize: depth,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u16_le(self.recfmt);
        buf.put_u16_le(self.qid);
        buf.put_u16_le(self.hrqsize);
        buf.put_u16_le(self.hsqsize);
        buf.put_bytes(0, Self::SIZE - 8);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, 8)?;
        Ok(Self {
            recfmt: get_u16(raw, 0),
            qid: get_u16(raw, 2),
            hrqsize: get_u16(raw, 4),
            hsqsize: get_u16(raw, 6),
        })
    }
}

/// Fabrics connect data, read by the controller from host memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    pub hostid: [u8; 16],
    pub cntlid: u16,
    pub subsysnqn: String,
    pub hostnqn: String,
}

impl ConnectData {
    pub const SIZE: usize = 1024;

    /// Dynamic controller requested
    pub const CNTLID_DYNAMIC: u16 = 0xffff;

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[..16].copy_from_slice(&self.hostid);
        put_u16(&mut buf, 16, self.cntlid);
        write_str("subsysnqn", &mut buf[256..256 + NQN_FIELD_LEN], &self.subsysnqn)?;
        write_str("hostnqn", &mut buf[512..512 + NQN_FIELD_LEN], &self.hostnqn)?;
        Ok(buf)
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, Self::SIZE)?;
        let mut hostid = [0u8; 16];
        hostid.copy_from_slice(&raw[..16]);

        Ok(Self {
            hostid,
            cntlid: get_u16(raw, 16),
            subsysnqn: read_str("subsysnqn", &raw[256..256 + NQN_FIELD_LEN])?,
            hostnqn: read_str("hostnqn", &raw[512..512 + NQN_FIELD_LEN])?,
        })
    }
}

/// Identify controller data of the emulated discovery controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyController {
    pub firmware_rev: String,
    pub version: u32,
    pub lpa: u8,
    pub maxcmd: u16,
    pub sgls: u32,
    pub subnqn: String,
}

impl IdentifyController {
    pub const SIZE: usize = 4096;

    /// Log page attributes: extended data for get log page
    pub const LPA_EXTENDED: u8 = 1 << 2;

    /// SGL support: keyed data block, SGL data block descriptor, address as offset
    pub const SGLS: u32 = 1 | 1 << 2 | 1 << 20;

    pub fn discovery(subnqn: &str) -> Self {
        Self {
            firmware_rev: String::new(),
            version: VS_VALUE as u32,
            lpa: Self::LPA_EXTENDED,
            maxcmd: 1,
            sgls: Self::SGLS,
            subnqn: subnqn.to_string(),
        }
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        let mut buf = vec![0u8; Self::SIZE];
        let fr = &mut buf[64..72];
        fr.fill(b' ');
        if self.firmware_rev.len() > fr.len() {
            return Err(WireError::FieldTooLong {
                field: "fr",
                max: fr.len(),
                len: self.firmware_rev.len(),
            });
        }
        fr[..self.firmware_rev.len()].copy_from_slice(self.firmware_rev.as_bytes());

        put_u32(&mut buf, 80, self.version);
        buf[261] = self.lpa;
        put_u16(&mut buf, 514, self.maxcmd);
        put_u32(&mut buf, 536, self.sgls);
        write_str("subnqn", &mut buf[768..768 + NQN_FIELD_LEN], &self.subnqn)?;
        Ok(buf)
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, 768 + NQN_FIELD_LEN)?;
        Ok(Self {
            firmware_rev: read_str("fr", &raw[64..72])?,
            version: get_u32(raw, 80),
            lpa: raw[261],
            maxcmd: get_u16(raw, 514),
            sgls: get_u32(raw, 536),
            subnqn: read_str("subnqn", &raw[768..768 + NQN_FIELD_LEN])?,
        })
    }
}

pub const LOG_HEADER_SIZE: usize = 1024;
pub const LOG_ENTRY_SIZE: usize = 1024;

/// Get-log-page length that asks for the header counters only
pub const LOG_COUNT_LEN: usize = 16;

/// Discovery log page header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryLogHeader {
    pub genctr: u64,
    pub numrec: u64,
    pub recfmt: u16,
}

impl DiscoveryLogHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_HEADER_SIZE];
        put_u64(&mut buf, 0, self.genctr);
        put_u64(&mut buf, 8, self.numrec);
        put_u16(&mut buf, 16, self.recfmt);
        buf
    }

    /// Decode the counters; a count-only reply carries just 16 bytes
    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, LOG_COUNT_LEN)?;
        Ok(Self {
            genctr: get_u64(raw, 0),
            numrec: get_u64(raw, 8),
            recfmt: if raw.len() >= 18 { get_u16(raw, 16) } else { 0 },
        })
    }
}

/// Discovery log entry subsystem type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubsystemType {
    Discovery,
    Nvme,
    Other(u8),
}

impl SubsystemType {
    pub fn raw(&self) -> u8 {
        match self {
            Self::Discovery => 1,
            Self::Nvme => 2,
            Self::Other(value) => *value,
        }
    }

    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Discovery,
            2 => Self::Nvme,
            other => Self::Other(other),
        }
    }
}

/// RDMA transport specific address subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaTsas {
    pub qptype: u8,
    pub prtype: u8,
    pub cms: u8,
    pub pkey: u16,
}

impl Default for RdmaTsas {
    /// Reliable connected QP, no provider specified, RDMA-CM
    fn default() -> Self {
        Self {
            qptype: 1,
            prtype: 1,
            cms: 1,
            pkey: 0,
        }
    }
}

/// One discovery log page entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLogEntry {
    pub trtype: u8,
    pub adrfam: u8,
    pub subtype: SubsystemType,
    pub treq: u8,
    pub portid: u16,
    pub cntlid: u16,
    pub asqsz: u16,
    pub trsvcid: String,
    pub subnqn: String,
    pub traddr: String,
    pub tsas: RdmaTsas,
}

impl DiscoveryLogEntry {
    pub fn encode_into(&self, buf: &mut [u8]) -> WireResult<()> {
        ensure_len(buf, LOG_ENTRY_SIZE)?;
        let buf = &mut buf[..LOG_ENTRY_SIZE];
        buf.fill(0);

        buf[0] = self.trtype;
        buf[1] = self.adrfam;
        buf[2] = self.subtype.raw();
        buf[3] = self.treq;
        put_u16(buf, 4, self.portid);
        put_u16(buf, 6, self.cntlid);
        put_u16(buf, 8, self.asqsz);
        write_str("trsvcid", &mut buf[32..32 + TRSVCID_LEN], &self.trsvcid)?;
        write_str("subnqn", &mut buf[256..256 + NQN_FIELD_LEN], &self.subnqn)?;
        write_str("traddr", &mut buf[512..512 + TRADDR_LEN], &self.traddr)?;

        buf[768] = self.tsas.qptype;
        buf[769] = self.tsas.prtype;
        buf[770] = self.tsas.cms;
        put_u16(buf, 776, self.tsas.pkey);
        Ok(())
    }

    pub fn decode(raw: &[u8]) -> WireResult<Self> {
        ensure_len(raw, LOG_ENTRY_SIZE)?;
        Ok(Self {
            trtype: raw[0],
            adrfam: raw[1],
            subtype: SubsystemType::from_raw(raw[2]),
            treq: raw[3],
            portid: get_u16(raw, 4),
            cntlid: get_u16(raw, 6),
            asqsz: get_u16(raw, 8),
            trsvcid: read_str("trsvcid", &raw[32..32 + TRSVCID_LEN])?,
            subnqn: read_str("subnqn", &raw[256..256 + NQN_FIELD_LEN])?,
            traddr: read_str("traddr", &raw[512..512 + TRADDR_LEN])?,
            tsas: RdmaTsas {
                qptype: raw[768],
                prtype: raw[769],
                cms: raw[770],
                pkey: get_u16(raw, 776),
            },
        })
    }
}

/// Encode a full discovery log: header then as many entries as fit in `len`
///
/// The header always reports the full `numrec`; a host that asked for less
/// learns the real size and asks again.
pub fn encode_log(genctr: u64, entries: &[DiscoveryLogEntry], len: usize) -> WireResult<Vec<u8>> {
    let header = DiscoveryLogHeader {
        genctr,
        numrec: entries.len() as u64,
        recfmt: 0,
    };

    let fit = len.saturating_sub(LOG_HEADER_SIZE) / LOG_ENTRY_SIZE;
    let shown = entries.len().min(fit);

    let mut buf = header.encode();
    buf.resize(LOG_HEADER_SIZE + shown * LOG_ENTRY_SIZE, 0);
    for (i, entry) in entries.iter().take(shown).enumerate() {
        let start = LOG_HEADER_SIZE + i * LOG_ENTRY_SIZE;
        entry.encode_into(&mut buf[start..start + LOG_ENTRY_SIZE])?;
    }

    buf.truncate(len);
    Ok(buf)
}

/// Bytes needed for a log of `numrec` entries
///
/// Fails when the log cannot be described by a single keyed SGL.
pub fn log_size(numrec: u64) -> WireResult<usize> {
    let too_long = || WireError::FieldTooLong {
        field: "discovery log",
        max: MAX_SGL_LEN,
        len: usize::MAX,
    };

    let len = usize::try_from(numrec)
        .ok()
        .and_then(|n| n.checked_mul(LOG_ENTRY_SIZE))
        .and_then(|n| n.checked_add(LOG_HEADER_SIZE))
        .ok_or_else(too_long)?;

    if len > MAX_SGL_LEN {
        return Err(WireError::FieldTooLong {
            field: "discovery log",
            max: MAX_SGL_LEN,
            len,
        });
    }
    Ok(len)
}

/// Decode a discovery log of `numrec` entries
pub fn decode_log(raw: &[u8]) -> WireResult<(DiscoveryLogHeader, Vec<DiscoveryLogEntry>)> {
    let header = DiscoveryLogHeader::decode(raw)?;
    ensure_len(raw, log_size(header.numrec)?)?;
    let count = header.numrec as usize;

    let entries = raw[LOG_HEADER_SIZE..]
        .chunks_exact(LOG_ENTRY_SIZE)
        .take(count)
        .map(DiscoveryLogEntry::decode)
        .collect::<WireResult<Vec<_>>>()?;

    Ok((header, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::DISCOVERY_NQN;

    fn entry(subnqn: &str) -> DiscoveryLogEntry {
        DiscoveryLogEntry {
            trtype: 1,
            adrfam: 1,
            subtype: SubsystemType::Nvme,
            treq: 0,
            portid: 2,
            cntlid: 0xffff,
            asqsz: 32,
            trsvcid: "4420".into(),
            subnqn: subnqn.into(),
            traddr: "192.168.22.1".into(),
            tsas: RdmaTsas::default(),
        }
    }

    #[test]
    fn test_log_entry_offsets() {
        let mut raw = vec![0u8; LOG_ENTRY_SIZE];
        entry("nqn.2017-01.com.example:sub1")
            .encode_into(&mut raw)
            .unwrap();

        assert_eq!(raw[2], 2);
        assert_eq!(&raw[32..36], b"4420");
        assert_eq!(&raw[256..260], b"nqn.");
        assert_eq!(&raw[512..515], b"192");
        assert_eq!(raw[770], 1);
    }

    #[test]
    fn test_connect_data() {
        let data = ConnectData {
            hostid: [7; 16],
            cntlid: ConnectData::CNTLID_DYNAMIC,
            subsysnqn: DISCOVERY_NQN.into(),
            hostnqn: "nqn.2014-08.org.nvmexpress:NVMf:uuid:abc".into(),
        };
        let raw = data.encode().unwrap();
        assert_eq!(raw.len(), ConnectData::SIZE);
        assert_eq!(&raw[16..18], &[0xff, 0xff]);
        assert_eq!(ConnectData::decode(&raw).unwrap(), data);

        let oversized = ConnectData {
            hostnqn: "x".repeat(300),
            ..data
        };
        assert!(matches!(
            oversized.encode(),
            Err(WireError::FieldTooLong { field: "hostnqn", .. })
        ));
    }

    #[test]
    fn test_identify_page() {
        let raw = IdentifyController::discovery(DISCOVERY_NQN).encode().unwrap();
        assert_eq!(raw.len(), IdentifyController::SIZE);
        assert_eq!(&raw[64..72], b"        ");
        assert_eq!(raw[261], 1 << 2);
        assert_eq!(&raw[514..516], &1u16.to_le_bytes());
        assert_eq!(&raw[536..540], &0x0010_0005u32.to_le_bytes());

        let id = IdentifyController::decode(&raw).unwrap();
        assert_eq!(id.subnqn, DISCOVERY_NQN);
        assert_eq!(id.version, 0x0001_0201);
    }

    #[test]
    fn test_encode_log_truncates_to_request() {
        let entries = vec![entry("nqn.a"), entry("nqn.b"), entry("nqn.c")];

        let counts = encode_log(5, &entries, LOG_COUNT_LEN).unwrap();
        assert_eq!(counts.len(), LOG_COUNT_LEN);
        let header = DiscoveryLogHeader::decode(&counts).unwrap();
        assert_eq!((header.genctr, header.numrec), (5, 3));

        // Room for two entries only
        let partial = encode_log(5, &entries, LOG_HEADER_SIZE + 2 * LOG_ENTRY_SIZE).unwrap();
        assert!(decode_log(&partial).is_err());

        let full = encode_log(5, &entries, LOG_HEADER_SIZE + 3 * LOG_ENTRY_SIZE).unwrap();
        let (_, decoded) = decode_log(&full).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_decode_log_rejects_huge_numrec() {
        let raw = DiscoveryLogHeader {
            genctr: 1,
            numrec: u64::MAX / 512,
            recfmt: 0,
        }
        .encode();

        assert!(matches!(
            decode_log(&raw),
            Err(WireError::FieldTooLong { field: "discovery log", .. })
        ));
        assert!(log_size(u64::MAX).is_err());

        // Largest log one SGL can carry
        let fits = ((MAX_SGL_LEN - LOG_HEADER_SIZE) / LOG_ENTRY_SIZE) as u64;
        assert_eq!(
            log_size(fits).unwrap(),
            LOG_HEADER_SIZE + fits as usize * LOG_ENTRY_SIZE
        );
        assert!(log_size(fits + 1).is_err());
    }

    #[test]
    fn test_cm_request() {
        let raw = CmRequest::admin(1).encode();
        assert_eq!(raw.len(), CmRequest::SIZE);
        assert_eq!(CmRequest::decode(&raw).unwrap().hsqsize, 1);
        assert!(CmRequest::decode(&raw[..4]).is_err());
    }
}
