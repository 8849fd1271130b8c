use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, AnnounceResponse, Event, Result, Tracker, TrackerError, ANNOUNCE_TIMEOUT};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64      = 0x41727101980;
const ACTION_CONNECT: i32   = 0;
const ACTION_ANNOUNCE: i32  = 1;

pub struct UdpTracker {

    url: Url,

}

impl UdpTracker {

    pub fn new(url: Url) -> Self {
        Self { url }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)
    }

    // Connect handshake: the tracker hands out a connection id to be quoted
    // in the announce that follows.
    async fn connect(&self, socket: &UdpSocket) -> Result<i64> {

        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);
        socket.send(&buf).await?;

        let mut resp_buf = [0u8; 16];
        let n = time::timeout(ANNOUNCE_TIMEOUT, socket.recv(&mut resp_buf)).await??;
        if n < 16 {
            return Err(TrackerError::ResponseError("invalid connect response length".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_CONNECT {
            return Err(TrackerError::ResponseError("expected action 0".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
        }

        tracing::trace!("connected to tracker");
        Ok(resp.get_i64())
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let addr = self.resolve()?;
        // Uses first available local port.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        time::timeout(ANNOUNCE_TIMEOUT, socket.connect(addr)).await??;

        let conn_id = self.connect(&socket).await?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.peer_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(
            match params.event {
                Some(Event::Completed) => 1,
                Some(Event::Started) => 2,
                Some(Event::Stopped) => 3,
                Some(Event::Empty) | None => 0,
            }
        );
        buf.put_i32(0); // IP address, default = 0.
        buf.put_i32(rand::random()); // Key, random.
        buf.put_i32(
            match params.num_want {
                Some(num_want) => num_want as i32,
                None => -1,
            }
        );
        buf.put_u16(params.port);
        socket.send(&buf).await?;

        let mut resp_buf = [0u8; 1024];
        let n = time::timeout(ANNOUNCE_TIMEOUT, socket.recv(&mut resp_buf)).await??;
        if n < 20 {
            return Err(TrackerError::ResponseError("invalid announce response length".to_string()));
        }
        let mut resp = &resp_buf[..n];
        if resp.get_i32() != ACTION_ANNOUNCE {
            return Err(TrackerError::ResponseError("expected action 1".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
        }
        let interval = resp.get_i32();
        let _leechers = resp.get_i32();
        let _seeders = resp.get_i32();

        let num_peers = (n - 20) / 6;
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let ip = resp.get_u32();
            let port = resp.get_u16();
            peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        Ok(AnnounceResponse {
            peers,
            interval: (interval > 0).then(|| Duration::from_secs(interval as u64)),
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}
