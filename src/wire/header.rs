use crate::util::buf_ext::BufExt;
use crate::wire::guid::GuidPrefix;
use bytes::{Buf, BufMut};

pub const RTPS_MAGIC: [u8; 4] = *b"RTPS";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}
impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 2, minor: 4 };
}

/// The fixed 20 byte header that starts every RTPS datagram. It identifies the sending
///  participant, whose prefix completes the entity ids in all sub-messages that follow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtpsHeader {
    pub magic: [u8; 4],
    pub version: ProtocolVersion,
    pub vendor_id: [u8; 2],
    pub guid_prefix: GuidPrefix,
}

impl RtpsHeader {
    pub const SERIALIZED_LEN: usize = 20;
    pub const VENDOR_ID_UNKNOWN: [u8; 2] = [0, 0];

    pub fn new(guid_prefix: GuidPrefix) -> RtpsHeader {
        RtpsHeader {
            magic: RTPS_MAGIC,
            version: ProtocolVersion::CURRENT,
            vendor_id: Self::VENDOR_ID_UNKNOWN,
            guid_prefix,
        }
    }

    /// A header is usable if it carries the RTPS magic and a major version this implementation
    ///  understands. Minor versions are backwards compatible by protocol definition.
    pub fn is_valid(&self) -> bool {
        self.magic == RTPS_MAGIC && self.version.major == ProtocolVersion::CURRENT.major
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.magic);
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        buf.put_slice(&self.vendor_id);
        self.guid_prefix.ser(buf);
    }

    /// Parsing only fails if there are not enough bytes - a header with wrong magic or version
    ///  is returned as-is for the caller to check [RtpsHeader::is_valid]
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RtpsHeader> {
        let magic = buf.read_checked_array()?;
        let major = buf.read_checked_u8()?;
        let minor = buf.read_checked_u8()?;
        let vendor_id = buf.read_checked_array()?;
        let guid_prefix = GuidPrefix::deser(buf)?;
        Ok(RtpsHeader {
            magic,
            version: ProtocolVersion { major, minor },
            vendor_id,
            guid_prefix,
        })
    }
}
