use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProtoError, ProtoResult, MAX_PACKET_SIZE};

/// Every packet on every link is `<u32 type><u32 payload_length><payload>`,
/// all integers big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub msg_type: u32,
    pub length: u32,
}

pub const PACKET_HEADER_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(msg_type: u32, payload: Bytes) -> Self {
        Self { msg_type, payload }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.msg_type);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> ProtoResult<Packet> {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let msg_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if length > MAX_PACKET_SIZE {
        return Err(ProtoError::TooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::new(msg_type, Bytes::from(payload)))
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> ProtoResult<()> {
    writer.write_all(&packet.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Length-prefixed byte string: `<u32 length><bytes>`.
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn get_bytes(buf: &mut impl Buf) -> ProtoResult<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated("byte string length".to_string()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(format!("byte string of {} bytes", len)));
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> ProtoResult<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw).map_err(|e| ProtoError::InvalidField(format!("utf-8 string: {}", e)))
}

pub fn need(buf: &impl Buf, bytes: usize, what: &str) -> ProtoResult<()> {
    if buf.remaining() < bytes {
        return Err(ProtoError::Truncated(what.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let packet = Packet::new(0x191, Bytes::from_static(b"\x00\x01\x02payload"));
        let encoded = packet.to_bytes();
        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let decoded = read_packet(&mut cursor).await.unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&(MAX_PACKET_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(
            read_packet(&mut cursor).await,
            Err(ProtoError::TooLarge(_))
        ));
    }

    #[test]
    fn byte_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "with,escaped)chars");
        put_bytes(&mut buf, &[0, 1, 2]);
        let mut cursor = buf.freeze();
        assert_eq!(get_string(&mut cursor).unwrap(), "with,escaped)chars");
        assert_eq!(get_bytes(&mut cursor).unwrap(), vec![0, 1, 2]);
        assert!(get_bytes(&mut cursor).is_err());
    }
}
