use log::debug;
use tokio::net::TcpStream;

use wire_proto::{read_packet, reply_type, write_packet, Packet};

use crate::{ClientError, ClientResult};

/// One connection to the master. Requests are strictly serialized: every
/// request has exactly one reply, identified by the reply message type.
pub struct MasterConn {
    stream: TcpStream,
}

impl MasterConn {
    pub async fn connect(host: &str, port: u16) -> ClientResult<MasterConn> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| ClientError::Connection(format!("{}:{}: {}", host, port, err)))?;
        debug!("connected to master {}:{}", host, port);
        Ok(MasterConn { stream })
    }

    pub async fn request(&mut self, packet: Packet) -> ClientResult<Packet> {
        let expected = reply_type(packet.msg_type);
        write_packet(&mut self.stream, &packet).await?;
        loop {
            let reply = read_packet(&mut self.stream).await?;
            if reply.msg_type == expected {
                return Ok(reply);
            }
            debug!(
                "ignoring out-of-band message {} while waiting for {}",
                reply.msg_type, expected
            );
        }
    }
}
