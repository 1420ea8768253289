use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{ProtoError, ProtoResult};

/// Slice type byte for a standard (whole-chunk) part.
pub const SLICE_TYPE_STANDARD: u8 = 0;
/// Slice type byte base for XOR parts; the byte stores the XOR level.
pub const SLICE_TYPE_XOR_MIN: u8 = 2;
pub const SLICE_TYPE_XOR_MAX: u8 = 9;

/// Identity of one stored part of a chunk: either a full standard replica or
/// one piece of an XOR-striped layout. For level `L`, pieces `1..=L` hold
/// data and piece `L + 1` holds parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkPartType {
    Standard,
    Xor { level: u8, piece: u8 },
}

impl ChunkPartType {
    pub fn xor(level: u8, piece: u8) -> ProtoResult<ChunkPartType> {
        if !(SLICE_TYPE_XOR_MIN..=SLICE_TYPE_XOR_MAX).contains(&level) {
            return Err(ProtoError::InvalidField(format!("xor level {}", level)));
        }
        if piece == 0 || piece > level + 1 {
            return Err(ProtoError::InvalidField(format!(
                "xor piece {} for level {}",
                piece, level
            )));
        }
        Ok(ChunkPartType::Xor { level, piece })
    }

    pub fn xor_parity(level: u8) -> ProtoResult<ChunkPartType> {
        Self::xor(level, level + 1)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            ChunkPartType::Standard => {
                buf.put_u8(SLICE_TYPE_STANDARD);
                buf.put_u8(1);
            }
            ChunkPartType::Xor { level, piece } => {
                buf.put_u8(*level);
                buf.put_u8(*piece);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> ProtoResult<ChunkPartType> {
        if buf.remaining() < 2 {
            return Err(ProtoError::Truncated("chunk part type".to_string()));
        }
        let slice_type = buf.get_u8();
        let slice_piece = buf.get_u8();
        match slice_type {
            SLICE_TYPE_STANDARD => Ok(ChunkPartType::Standard),
            level => ChunkPartType::xor(level, slice_piece),
        }
    }
}

impl std::fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkPartType::Standard => write!(f, "std"),
            ChunkPartType::Xor { level, piece } => {
                if *piece == level + 1 {
                    write!(f, "xor{}/parity", level)
                } else {
                    write!(f, "xor{}/{}", level, piece)
                }
            }
        }
    }
}

/// IPv4 address + port, the protocol's server identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: u32,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.ip);
        buf.put_u16(self.port);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtoResult<NetworkAddress> {
        if buf.remaining() < 6 {
            return Err(ProtoError::Truncated("network address".to_string()));
        }
        Ok(NetworkAddress {
            ip: buf.get_u32(),
            port: buf.get_u16(),
        })
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        let octets = self.ip.to_be_bytes();
        std::net::SocketAddr::from((octets, self.port))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.ip.to_be_bytes();
        write!(f, "{}.{}.{}.{}:{}", o[0], o[1], o[2], o[3], self.port)
    }
}

/// A chunk part location: where it lives, which part it is, and the version
/// of the chunkserver software holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkTypeWithAddress {
    pub address: NetworkAddress,
    pub part_type: ChunkPartType,
    pub chunkserver_version: u32,
}

impl ChunkTypeWithAddress {
    pub fn encode(&self, buf: &mut impl BufMut) {
        self.address.encode(buf);
        self.part_type.encode(buf);
        buf.put_u32(self.chunkserver_version);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtoResult<ChunkTypeWithAddress> {
        let address = NetworkAddress::decode(buf)?;
        let part_type = ChunkPartType::decode(buf)?;
        if buf.remaining() < 4 {
            return Err(ProtoError::Truncated("chunkserver version".to_string()));
        }
        Ok(ChunkTypeWithAddress {
            address,
            part_type,
            chunkserver_version: buf.get_u32(),
        })
    }
}

/// A chunk id paired with the part type stored for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkWithType {
    pub id: u64,
    pub part_type: ChunkPartType,
}

impl ChunkWithType {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        self.part_type.encode(buf);
    }

    pub fn decode(buf: &mut impl Buf) -> ProtoResult<ChunkWithType> {
        if buf.remaining() < 8 {
            return Err(ProtoError::Truncated("chunk with type".to_string()));
        }
        let id = buf.get_u64();
        let part_type = ChunkPartType::decode(buf)?;
        Ok(ChunkWithType { id, part_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn chunk_part_type_codec() {
        let mut buf = BytesMut::new();
        ChunkPartType::Standard.encode(&mut buf);
        ChunkPartType::xor(3, 2).unwrap().encode(&mut buf);
        ChunkPartType::xor_parity(5).unwrap().encode(&mut buf);

        let mut cursor = buf.freeze();
        assert_eq!(
            ChunkPartType::decode(&mut cursor).unwrap(),
            ChunkPartType::Standard
        );
        assert_eq!(
            ChunkPartType::decode(&mut cursor).unwrap(),
            ChunkPartType::Xor { level: 3, piece: 2 }
        );
        assert_eq!(
            ChunkPartType::decode(&mut cursor).unwrap(),
            ChunkPartType::Xor { level: 5, piece: 6 }
        );
    }

    #[test]
    fn chunk_part_type_rejects_bad_level() {
        assert!(ChunkPartType::xor(1, 1).is_err());
        assert!(ChunkPartType::xor(10, 1).is_err());
        assert!(ChunkPartType::xor(4, 6).is_err());
        assert!(ChunkPartType::xor(4, 0).is_err());
    }

    #[test]
    fn address_codec_and_display() {
        let addr = NetworkAddress::new(u32::from_be_bytes([10, 0, 0, 7]), 9422);
        let mut buf = BytesMut::new();
        addr.encode(&mut buf);
        let mut cursor = buf.freeze();
        let decoded = NetworkAddress::decode(&mut cursor).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(decoded.to_string(), "10.0.0.7:9422");
    }

    #[test]
    fn chunk_type_with_address_codec() {
        let value = ChunkTypeWithAddress {
            address: NetworkAddress::new(0x7f000001, 9522),
            part_type: ChunkPartType::Xor { level: 2, piece: 3 },
            chunkserver_version: 0x030b00,
        };
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        let mut cursor = buf.freeze();
        assert_eq!(ChunkTypeWithAddress::decode(&mut cursor).unwrap(), value);
        assert_eq!(cursor.remaining(), 0);
    }
}
