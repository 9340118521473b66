//! HTTP tracker communication: announces, peer list decoding and the tier
//! discipline that decides which tracker of a torrent is contacted when.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::Buf;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;

use crate::{PeerId, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, TrackerError>;

/// How long a tracker is out of rotation after a hard failure, and the
/// announce interval assumed when a tracker doesn't provide one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Percent-encode all non-alphanumeric bytes except `-._~`.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// All errors that may occur when contacting a tracker.
#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum TrackerError {
    /// Bencode (de)serialization errors.
    Bencode(serde_bencode::Error),
    /// HTTP errors from reqwest.
    Http(reqwest::Error),
    /// The response parsed but its contents are invalid (e.g. a compact peer
    /// string whose length is not a multiple of the record size).
    MalformedResponse(String),
    /// The tracker answered with a `failure reason`.
    Failure(String),
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        TrackerError::Bencode(e)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::Http(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Bencode(e) => write!(f, "bencode error: {}", e),
            TrackerError::Http(e) => write!(f, "http error: {}", e),
            TrackerError::MalformedResponse(reason) => {
                write!(f, "malformed response: {}", reason)
            }
            TrackerError::Failure(reason) => write!(f, "tracker failure: {}", reason),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Optional announce events.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(&self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// Parameters of an HTTP announce.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// The bencoded announce response.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Response {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,
    #[serde(default)]
    peers: Option<PeerEntries>,
    #[serde(default, rename = "peers6")]
    peers6: Option<PeerEntries>,
}

/// Peers come either as packed binary records or as a list of dictionaries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerEntries {
    Compact(serde_bytes::ByteBuf),
    Dicts(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Response {
    /// Decodes and concatenates the v4 and v6 peer lists.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::new();
        if let Some(peers) = &self.peers {
            decode_peers(peers, 6, &mut addrs)?;
        }
        if let Some(peers) = &self.peers6 {
            decode_peers(peers, 18, &mut addrs)?;
        }
        Ok(addrs)
    }
}

fn decode_peers(
    entries: &PeerEntries,
    record_len: usize,
    addrs: &mut Vec<SocketAddr>,
) -> Result<()> {
    match entries {
        PeerEntries::Compact(bytes) => {
            if bytes.len() % record_len != 0 {
                return Err(TrackerError::MalformedResponse(format!(
                    "compact peer string of {} bytes is not a multiple of {}",
                    bytes.len(),
                    record_len
                )));
            }
            let mut buf = &bytes[..];
            while !buf.is_empty() {
                let ip: IpAddr = if record_len == 6 {
                    Ipv4Addr::from(buf.get_u32()).into()
                } else {
                    Ipv6Addr::from(buf.get_u128()).into()
                };
                let port = buf.get_u16();
                addrs.push(SocketAddr::new(ip, port));
            }
        }
        PeerEntries::Dicts(dicts) => {
            for dict in dicts {
                if let Ok(ip) = dict.ip.parse() {
                    addrs.push(SocketAddr::new(ip, dict.port));
                }
            }
        }
    }
    Ok(())
}

/// A single announce URL with its schedule and health.
pub(crate) struct Tracker {
    url: String,
    /// The earliest time the tracker may be contacted again. None before the
    /// first announce.
    next_announce: Option<Instant>,
    /// The last failure, kept as display text for the status surface.
    pub last_error: Option<String>,
    /// How many peers the last successful announce returned.
    pub peer_count: usize,
    /// Whether the tracker has ever answered an announce; only such trackers
    /// get a stop event.
    announced: bool,
}

impl Tracker {
    fn new(url: String) -> Self {
        Self {
            url,
            next_announce: None,
            last_error: None,
            peer_count: 0,
            announced: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_due(&self) -> bool {
        self.next_announce.map_or(true, |at| Instant::now() >= at)
    }

    fn announce_url(&self, params: &Announce) -> String {
        let mut url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}&port={port}\
             &compact=1&uploaded={uploaded}&downloaded={downloaded}&left={left}",
            url = self.url,
            sep = if self.url.contains('?') { '&' } else { '?' },
            info_hash = percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
            peer_id = percent_encode(&params.peer_id, URL_ENCODE_RESERVED),
            port = params.port,
            uploaded = params.uploaded,
            downloaded = params.downloaded,
            left = params.left,
        );
        if let Some(event) = params.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        url
    }

    /// Sends one announce and applies the response to the tracker's
    /// schedule. Returns the decoded peer list on success.
    async fn announce(
        &mut self,
        client: &Client,
        params: &Announce,
    ) -> Result<Vec<SocketAddr>> {
        log::trace!("announcing to {}", self.url);
        let result = self.try_announce(client, params).await;
        match &result {
            Ok(addrs) => {
                self.announced = true;
                self.last_error = None;
                self.peer_count = addrs.len();
            }
            Err(TrackerError::Failure(reason)) => {
                // the tracker is alive and talking to us, so it keeps its
                // regular schedule
                log::warn!("tracker {} failure: {}", self.url, reason);
                self.announced = true;
                self.last_error = Some(reason.clone());
            }
            Err(e) => {
                log::warn!("tracker {} error: {}", self.url, e);
                self.next_announce = Some(Instant::now() + DEFAULT_INTERVAL);
                self.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn try_announce(
        &mut self,
        client: &Client,
        params: &Announce,
    ) -> Result<Vec<SocketAddr>> {
        let bytes = client
            .get(self.announce_url(params))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let response: Response = serde_bencode::from_bytes(&bytes)?;

        let interval = response
            .interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);
        self.next_announce = Some(Instant::now() + interval);

        if let Some(reason) = response.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        response.peer_addrs()
    }

    /// Sends the stop event; the response is of no interest.
    async fn announce_stop(&self, client: &Client, params: &Announce) {
        let mut params = *params;
        params.event = Some(Event::Stopped);
        if let Err(e) = client.get(self.announce_url(&params)).send().await {
            log::debug!("stop announce to {} failed: {}", self.url, e);
        }
    }
}

/// An ordered group of trackers tried in turn until one answers.
pub(crate) struct TrackerTier {
    pub trackers: Vec<Tracker>,
}

impl TrackerTier {
    /// Creates the tier, shuffling the URLs once as BEP 12 prescribes for
    /// the `announce-list` key. URLs that don't parse (or aren't HTTP, such
    /// as udp trackers) are dropped here rather than failing every
    /// announce.
    pub fn new(mut urls: Vec<String>) -> Self {
        urls.retain(|raw| match url::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => true,
            Ok(url) => {
                log::debug!("skipping tracker {} with scheme {}", raw, url.scheme());
                false
            }
            Err(e) => {
                log::warn!("skipping unparsable tracker url {}: {}", raw, e);
                false
            }
        });
        urls.shuffle(&mut rand::thread_rng());
        Self {
            trackers: urls.into_iter().map(Tracker::new).collect(),
        }
    }

    /// Announces to the tier: trackers are tried in order until one answers.
    /// The answering tracker moves to the front of the tier. Returns the
    /// peers of the first successful announce, or none if the tier is not
    /// due yet or every tracker failed.
    pub async fn announce(
        &mut self,
        client: &Client,
        params: &Announce,
    ) -> Option<Vec<SocketAddr>> {
        for index in 0..self.trackers.len() {
            if !self.trackers[index].is_due() {
                // the tier answered recently; don't bother the backups
                return None;
            }
            match self.trackers[index].announce(client, params).await {
                Ok(mut addrs) => {
                    addrs.sort();
                    addrs.dedup();
                    let tracker = self.trackers.remove(index);
                    self.trackers.insert(0, tracker);
                    return Some(addrs);
                }
                Err(TrackerError::Failure(_)) => {
                    // an answer, even if an unhelpful one
                    return None;
                }
                Err(_) => continue,
            }
        }
        None
    }

    /// Sends the stop event to every tracker that has answered before.
    pub async fn announce_stop(&self, client: &Client, params: &Announce) {
        for tracker in self.trackers.iter().filter(|t| t.announced) {
            tracker.announce_stop(client, params).await;
        }
    }
}
