use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{AnnounceParams, AnnounceResponse, Result, Tracker, TrackerError, ANNOUNCE_TIMEOUT};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // A tracker may hand out an id to be echoed on later announces.
    tracker_id: Option<String>,

}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            tracker_id: None,
        }
    }
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .timeout(ANNOUNCE_TIMEOUT)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)?;
        tracing::debug!("announce response: {:#?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::ResponseError(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.tracker_id = Some(tracker_id);
        }
        tracing::debug!(
            "seeders: {:?}, leechers: {:?}",
            resp.complete, resp.incomplete,
        );

        Ok(AnnounceResponse {
            peers: resp.peers,
            interval: resp.interval.or(resp.min_interval).map(Duration::from_secs),
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, no other keys are; a human-readable error message.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Like failure reason, but the response still gets processed normally.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Seconds the client should wait between regular announces.
    pub interval: Option<u64>,

    // If present clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // A string that the client should send back on its next announcements.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Number of peers with the entire file, i.e. seeders (integer).
    pub complete: Option<u64>,

    // Number of non-seeder peers, aka "leechers" (integer).
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,

}

// The tracker returns either a compact string (6 bytes per peer, 4 of IPv4
// and 2 of big-endian port) or a list of dictionaries, regardless of which
// one was asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // Compact model.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }

            Ok(peers)
        }

        // Dictionary model: a list of dicts with "ip" and "port" keys.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    #[test]
    fn test_parse_response_compact() {
        let raw = hex!("64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565");
        let response: HttpResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers.len(), 10);
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_dictionary() {
        let raw = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip7:8.8.8.84:porti51413eeee";
        let response: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(response.peers, vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 51413),
        ]);
    }

    #[test]
    fn test_parse_response_failure() {
        let raw = b"d14:failure reason15:torrent unknowne";
        let response: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("torrent unknown"));
        assert!(response.peers.is_empty());
    }
}
