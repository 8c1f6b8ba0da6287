//! BluOS player discovery via LSDP (Lenbrook Service Discovery Protocol)
//!
//! Players announce themselves with UDP broadcasts on port 11430 and answer
//! broadcast queries for their class id. Announce and delete messages are
//! folded into a node table whose flattened player list is published as the
//! roster.
//!
//! Packet layout:
//! - header: length (6), magic `LSDP`, version (1)
//! - messages, each: length, type, body
//!   - `Q` query: count, class ids (u16 BE)
//!   - `A` announce: node id (len-prefixed), address (len-prefixed), record
//!     count, records of class id, txt count, txt key/value pairs (len-prefixed)
//!   - `D` delete: node id (len-prefixed), count, class ids

use anyhow::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Player, DEFAULT_PLAYER_PORT};

pub const LSDP_PORT: u16 = 11430;

/// Class id BluOS players announce under
pub const PLAYER_CLASS_ID: u16 = 0x0001;

const MAGIC: &[u8; 4] = b"LSDP";
const VERSION: u8 = 1;
const HEADER_LEN: u8 = 6;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LsdpError {
    #[error("packet truncated")]
    Truncated,

    #[error("not an LSDP packet")]
    BadMagic,

    #[error("unsupported LSDP version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid address length {0}")]
    BadAddress(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LsdpMessage {
    Query { class_ids: Vec<u16> },
    Announce(Announcement),
    Delete { node_id: Vec<u8>, class_ids: Vec<u16> },
    Other(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub node_id: Vec<u8>,
    pub address: IpAddr,
    pub records: Vec<AnnounceRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRecord {
    pub class_id: u16,
    pub txt: HashMap<String, String>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, LsdpError> {
        let b = *self.data.get(self.pos).ok_or(LsdpError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, LsdpError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], LsdpError> {
        let end = self.pos.checked_add(n).ok_or(LsdpError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(LsdpError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn len_prefixed(&mut self) -> Result<&'a [u8], LsdpError> {
        let n = self.u8()? as usize;
        self.bytes(n)
    }

    fn string(&mut self) -> Result<String, LsdpError> {
        Ok(String::from_utf8_lossy(self.len_prefixed()?).into_owned())
    }

    fn class_ids(&mut self) -> Result<Vec<u16>, LsdpError> {
        let count = self.u8()?;
        (0..count).map(|_| self.u16()).collect()
    }
}

/// Encode a standard (broadcast answer) query for `class_ids`.
pub fn encode_query(class_ids: &[u16]) -> Vec<u8> {
    let mut packet = vec![HEADER_LEN];
    packet.extend_from_slice(MAGIC);
    packet.push(VERSION);

    let message_len = 3 + 2 * class_ids.len();
    packet.push(message_len as u8);
    packet.push(b'Q');
    packet.push(class_ids.len() as u8);
    for id in class_ids {
        packet.extend_from_slice(&id.to_be_bytes());
    }
    packet
}

/// Decode every message in one datagram.
pub fn decode_packet(data: &[u8]) -> Result<Vec<LsdpMessage>, LsdpError> {
    let mut header = Reader::new(data);
    let header_len = header.u8()? as usize;
    if header.bytes(4)? != MAGIC {
        return Err(LsdpError::BadMagic);
    }
    let version = header.u8()?;
    if version != VERSION {
        return Err(LsdpError::UnsupportedVersion(version));
    }

    let mut messages = Vec::new();
    let mut pos = header_len.max(header.pos);
    while pos < data.len() {
        let message_len = data[pos] as usize;
        if message_len < 2 {
            return Err(LsdpError::Truncated);
        }
        let end = (pos + message_len).min(data.len());
        let kind = *data.get(pos + 1).ok_or(LsdpError::Truncated)?;
        let body = data.get(pos + 2..end).ok_or(LsdpError::Truncated)?;
        messages.push(decode_message(kind, body)?);
        pos += message_len;
    }
    Ok(messages)
}

fn decode_message(kind: u8, body: &[u8]) -> Result<LsdpMessage, LsdpError> {
    let mut r = Reader::new(body);
    match kind {
        b'Q' | b'R' => Ok(LsdpMessage::Query {
            class_ids: r.class_ids()?,
        }),
        b'A' => {
            let node_id = r.len_prefixed()?.to_vec();
            let address = decode_address(r.len_prefixed()?)?;
            let count = r.u8()?;
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let class_id = r.u16()?;
                let txt_count = r.u8()?;
                let mut txt = HashMap::with_capacity(txt_count as usize);
                for _ in 0..txt_count {
                    let key = r.string()?;
                    let value = r.string()?;
                    txt.insert(key, value);
                }
                records.push(AnnounceRecord { class_id, txt });
            }
            Ok(LsdpMessage::Announce(Announcement {
                node_id,
                address,
                records,
            }))
        }
        b'D' => Ok(LsdpMessage::Delete {
            node_id: r.len_prefixed()?.to_vec(),
            class_ids: r.class_ids()?,
        }),
        other => Ok(LsdpMessage::Other(other)),
    }
}

fn decode_address(bytes: &[u8]) -> Result<IpAddr, LsdpError> {
    match bytes.len() {
        4 => Ok(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(LsdpError::BadAddress(n)),
    }
}

/// Announcements by node id
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<Vec<u8>, Announcement>,
}

impl NodeTable {
    pub fn apply(&mut self, message: LsdpMessage) {
        match message {
            LsdpMessage::Announce(announcement) => {
                self.nodes
                    .insert(announcement.node_id.clone(), announcement);
            }
            LsdpMessage::Delete { node_id, .. } => {
                self.nodes.remove(&node_id);
            }
            LsdpMessage::Query { .. } | LsdpMessage::Other(_) => {}
        }
    }

    /// Players announced under the player class, sorted and deduplicated
    pub fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self
            .nodes
            .values()
            .flat_map(|a| {
                a.records
                    .iter()
                    .filter(|r| r.class_id == PLAYER_CLASS_ID)
                    .map(move |r| {
                        let port = r
                            .txt
                            .get("port")
                            .and_then(|p| p.parse::<u16>().ok())
                            .unwrap_or(DEFAULT_PLAYER_PORT);
                        Player::new(a.address.to_string(), port)
                    })
            })
            .collect();
        players.sort();
        players.dedup();
        players
    }
}

/// Restart policy for the discovery socket
#[derive(Debug, Clone)]
pub struct DiscoveryRetry {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A run at least this long resets the backoff to `initial_delay`
    pub stable_run_threshold: Duration,
}

impl Default for DiscoveryRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            stable_run_threshold: Duration::from_secs(30),
        }
    }
}

pub struct LsdpDiscovery {
    pub query_interval: Duration,
    pub retry: DiscoveryRetry,
    table: NodeTable,
}

impl LsdpDiscovery {
    pub fn new(query_interval: Duration) -> Self {
        Self {
            query_interval,
            retry: DiscoveryRetry::default(),
            table: NodeTable::default(),
        }
    }

    /// Publish discovered players to `roster` until `shutdown` fires,
    /// restarting the socket with exponential backoff on errors.
    pub async fn run(mut self, roster: watch::Sender<Vec<Player>>, shutdown: CancellationToken) {
        let mut delay = self.retry.initial_delay;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let start = Instant::now();
            match self.run_once(&roster, &shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    if start.elapsed() >= self.retry.stable_run_threshold {
                        delay = self.retry.initial_delay;
                    }
                    warn!("LSDP discovery error ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {
                            delay = (delay * 2).min(self.retry.max_delay);
                        }
                    }
                }
            }
        }
        info!("LSDP discovery stopped");
    }

    async fn run_once(
        &mut self,
        roster: &watch::Sender<Vec<Player>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", LSDP_PORT)).await?;
        socket.set_broadcast(true)?;
        let dest = SocketAddr::from((Ipv4Addr::BROADCAST, LSDP_PORT));
        let query = encode_query(&[PLAYER_CLASS_ID]);
        info!("LSDP discovery listening on port {}", LSDP_PORT);

        let mut ticker = tokio::time::interval(self.query_interval);
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    socket.send_to(&query, dest).await?;
                    debug!("Sent LSDP query for class {:04x}", PLAYER_CLASS_ID);
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    match decode_packet(&buf[..len]) {
                        Ok(messages) => {
                            for message in messages {
                                self.table.apply(message);
                            }
                            publish(roster, self.table.players());
                        }
                        Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
                    }
                }
            }
        }
    }
}

/// Send `players` to the roster only when it differs from the current value.
pub fn publish(roster: &watch::Sender<Vec<Player>>, players: Vec<Player>) {
    roster.send_if_modified(|current| {
        if *current == players {
            return false;
        }
        info!("Discovered players: {:?}", players);
        *current = players;
        true
    });
}
