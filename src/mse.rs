//! Message Stream Encryption (the RC4 based obfuscation handshake used
//! between BitTorrent peers).
//!
//! The codec layer always talks to an [`MseStream`], which is either a plain
//! passthrough or carries an RC4 cipher per direction, so the rest of the
//! engine never needs to know whether a connection is obfuscated. The
//! handshake itself is a Diffie-Hellman exchange over the well-known 768 bit
//! prime, followed by a synchronization pattern derived from the shared
//! secret and the torrent's info hash.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{
    conf::CryptoMode,
    error::{Error, Result},
    Sha1Hash,
};

/// The 768 bit prime of the MSE key exchange.
const PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                         020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                         4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563";
const GENERATOR: u32 = 2;

/// The byte length of public keys and the shared secret.
const KEY_LEN: usize = 96;
/// The verification constant that marks the encrypted part of the handshake.
const VC: [u8; 8] = [0; 8];
/// Peers may pad handshake steps with up to this many random bytes.
const MAX_PAD_LEN: usize = 512;

const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// RC4 with the key scheduling applied up front. The first 1024 keystream
/// bytes are discarded separately, as required by MSE.
#[derive(Clone)]
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    /// Applies the keystream to the buffer in place. XOR is its own inverse,
    /// so this both encrypts and decrypts.
    pub fn apply(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize]
                .wrapping_add(self.s[self.j as usize]))
                as usize];
            *b ^= k;
        }
    }

    pub fn discard(&mut self, n: usize) {
        let mut sink = [0u8; 256];
        let mut left = n;
        while left > 0 {
            let take = left.min(sink.len());
            self.apply(&mut sink[..take]);
            left -= take;
        }
    }
}

/// A duplex stream with optional RC4 obfuscation per direction.
pub(crate) struct MseStream<S> {
    io: S,
    recv: Option<Rc4>,
    send: Option<Rc4>,
    /// Decrypted bytes read ahead during the handshake but not yet consumed.
    read_buf: Vec<u8>,
    read_pos: usize,
    /// Encrypted bytes of the write in progress; the cipher has already
    /// advanced over them, so they must not be re-encrypted on retry.
    write_buf: Vec<u8>,
    write_pos: usize,
    /// How many caller bytes `write_buf` stands for.
    claimed: usize,
}

impl<S> MseStream<S> {
    /// A passthrough stream for connections without obfuscation.
    pub fn plaintext(io: S) -> Self {
        Self::new(io, None, None, Vec::new())
    }

    /// A passthrough stream with bytes that were already read off the
    /// socket (e.g. while sniffing whether the peer speaks the encrypted
    /// handshake).
    pub fn plaintext_with_leftover(io: S, leftover: Vec<u8>) -> Self {
        Self::new(io, None, None, leftover)
    }

    fn new(io: S, send: Option<Rc4>, recv: Option<Rc4>, leftover: Vec<u8>) -> Self {
        Self {
            io,
            recv,
            send,
            read_buf: leftover,
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            claimed: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.send.is_some()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // leftover handshake payload is served before the socket is touched
        if this.read_pos < this.read_buf.len() {
            let n = (this.read_buf.len() - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            if this.read_pos == this.read_buf.len() {
                this.read_buf.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(cipher) = &mut this.recv {
                    cipher.apply(&mut buf.filled_mut()[filled_before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let cipher = match &mut this.send {
            None => return Pin::new(&mut this.io).poll_write(cx, data),
            Some(cipher) => cipher,
        };

        if this.write_buf.is_empty() {
            this.write_buf.extend_from_slice(data);
            cipher.apply(&mut this.write_buf);
            this.write_pos = 0;
            this.claimed = data.len();
        }

        while this.write_pos < this.write_buf.len() {
            match Pin::new(&mut this.io)
                .poll_write(cx, &this.write_buf[this.write_pos..])
            {
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let claimed = this.claimed;
        this.write_buf.clear();
        this.write_pos = 0;
        this.claimed = 0;
        Poll::Ready(Ok(claimed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.write_pos < this.write_buf.len() {
            match Pin::new(&mut this.io)
                .poll_write(cx, &this.write_buf[this.write_pos..])
            {
                Poll::Ready(Ok(n)) => this.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

/// Performs the initiator side of the handshake, offering the methods the
/// mode allows and verifying the peer's selection against it.
pub(crate) async fn initiate<S>(
    mut io: S,
    info_hash: &Sha1Hash,
    mode: CryptoMode,
) -> Result<MseStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert_ne!(mode, CryptoMode::Disable);

    let (secret, pubkey) = gen_keypair();
    send_with_pad(&mut io, &pubkey).await?;

    let mut buf = HsBuf::new();
    let peer_pub = buf.read_exact(&mut io, KEY_LEN).await?;
    let s = shared_secret(&peer_pub, &secret);

    // HASH('req1', S), then HASH('req2', SKEY) xor HASH('req3', S), then the
    // encrypted negotiation
    let mut enc = Rc4::new(&hash(&[b"keyA", &s, info_hash]));
    enc.discard(1024);
    let mut dec = Rc4::new(&hash(&[b"keyB", &s, info_hash]));
    dec.discard(1024);

    let mut msg = Vec::with_capacity(20 + 20 + 8 + 4 + 2 + 2);
    msg.extend_from_slice(&hash(&[b"req1", &s]));
    msg.extend_from_slice(&xor20(
        hash(&[b"req2", info_hash]),
        hash(&[b"req3", &s]),
    ));
    let mut negotiation = Vec::with_capacity(8 + 4 + 2 + 2);
    negotiation.extend_from_slice(&VC);
    negotiation.extend_from_slice(&provide_bits(mode).to_be_bytes());
    // no padC and an empty initial payload
    negotiation.extend_from_slice(&0u16.to_be_bytes());
    negotiation.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut negotiation);
    msg.extend_from_slice(&negotiation);
    tokio::io::AsyncWriteExt::write_all(&mut io, &msg).await?;

    // the peer's reply starts with ENCRYPT(VC) somewhere after its padding;
    // the pattern is the first 8 keystream bytes of our receive cipher
    let mut marker = VC;
    dec.clone().apply(&mut marker);
    buf.sync_to_marker(&mut io, &marker, MAX_PAD_LEN).await?;
    dec.discard(VC.len());

    let mut select = buf.read_exact(&mut io, 4 + 2).await?;
    dec.apply(&mut select);
    let crypto_select = u32::from_be_bytes(select[..4].try_into().unwrap());
    let pad_len = u16::from_be_bytes(select[4..].try_into().unwrap()) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(Error::Encryption(format!("pad of {} bytes", pad_len)));
    }
    let mut pad = buf.read_exact(&mut io, pad_len).await?;
    dec.apply(&mut pad);

    let use_rc4 = validate_selection(mode, crypto_select)?;
    let mut leftover = buf.into_unread();
    if use_rc4 {
        dec.apply(&mut leftover);
        Ok(MseStream::new(io, Some(enc), Some(dec), leftover))
    } else {
        Ok(MseStream::new(io, None, None, leftover))
    }
}

/// Performs the receiving side of the handshake. The initiator only proves
/// knowledge of an info hash, so every served torrent is tried until the
/// synchronization tag matches; the matching hash is returned for routing.
///
/// `preread` holds bytes the caller already consumed from the socket while
/// deciding whether the connection is obfuscated at all.
pub(crate) async fn accept<S>(
    mut io: S,
    info_hashes: &[Sha1Hash],
    mode: CryptoMode,
    preread: Vec<u8>,
) -> Result<(MseStream<S>, Sha1Hash)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug_assert_ne!(mode, CryptoMode::Disable);

    let (secret, pubkey) = gen_keypair();

    let mut buf = HsBuf::from(preread);
    let peer_pub = buf.read_exact(&mut io, KEY_LEN).await?;
    send_with_pad(&mut io, &pubkey).await?;
    let s = shared_secret(&peer_pub, &secret);

    buf.sync_to_marker(&mut io, &hash(&[b"req1", &s]), MAX_PAD_LEN)
        .await?;

    let tag = buf.read_exact(&mut io, 20).await?;
    let hash3 = hash(&[b"req3", &s]);
    let info_hash = info_hashes
        .iter()
        .find(|ih| xor20(hash(&[b"req2", &ih[..]]), hash3) == tag[..])
        .copied()
        .ok_or(Error::InfoHashUnknown)?;

    let mut dec = Rc4::new(&hash(&[b"keyA", &s, &info_hash]));
    dec.discard(1024);
    let mut enc = Rc4::new(&hash(&[b"keyB", &s, &info_hash]));
    enc.discard(1024);

    let mut head = buf.read_exact(&mut io, 8 + 4 + 2).await?;
    dec.apply(&mut head);
    if head[..8] != VC {
        return Err(Error::Encryption("bad verification constant".into()));
    }
    let crypto_provide = u32::from_be_bytes(head[8..12].try_into().unwrap());
    let pad_len = u16::from_be_bytes(head[12..].try_into().unwrap()) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(Error::Encryption(format!("pad of {} bytes", pad_len)));
    }
    let mut pad = buf.read_exact(&mut io, pad_len).await?;
    dec.apply(&mut pad);

    let mut ia_len = buf.read_exact(&mut io, 2).await?;
    dec.apply(&mut ia_len);
    let ia_len = u16::from_be_bytes(ia_len[..].try_into().unwrap()) as usize;
    let mut initial_payload = buf.read_exact(&mut io, ia_len).await?;
    dec.apply(&mut initial_payload);

    let crypto_select = choose(mode, crypto_provide)?;
    let mut reply = Vec::with_capacity(8 + 4 + 2);
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&crypto_select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut reply);
    tokio::io::AsyncWriteExt::write_all(&mut io, &reply).await?;

    let mut leftover = initial_payload;
    let mut extra = buf.into_unread();
    if crypto_select == CRYPTO_RC4 {
        dec.apply(&mut extra);
        leftover.extend_from_slice(&extra);
        Ok((MseStream::new(io, Some(enc), Some(dec), leftover), info_hash))
    } else {
        leftover.extend_from_slice(&extra);
        Ok((MseStream::new(io, None, None, leftover), info_hash))
    }
}

/// The methods offered in `crypto_provide` under the given mode.
fn provide_bits(mode: CryptoMode) -> u32 {
    match mode {
        CryptoMode::Force => CRYPTO_RC4,
        CryptoMode::Prefer | CryptoMode::PreferPlaintext => CRYPTO_RC4 | CRYPTO_PLAINTEXT,
        CryptoMode::Disable => unreachable!("plaintext connections skip the handshake"),
    }
}

/// Picks our `crypto_select` answer from the methods the initiator offered.
fn choose(mode: CryptoMode, offered: u32) -> Result<u32> {
    let pick = match mode {
        CryptoMode::Force => CRYPTO_RC4,
        CryptoMode::Prefer => {
            if offered & CRYPTO_RC4 != 0 {
                CRYPTO_RC4
            } else {
                CRYPTO_PLAINTEXT
            }
        }
        CryptoMode::PreferPlaintext => {
            if offered & CRYPTO_PLAINTEXT != 0 {
                CRYPTO_PLAINTEXT
            } else {
                CRYPTO_RC4
            }
        }
        CryptoMode::Disable => unreachable!("plaintext connections skip the handshake"),
    };
    if offered & pick == 0 {
        return Err(Error::Encryption(format!(
            "peer offered {:#x}, none acceptable",
            offered
        )));
    }
    Ok(pick)
}

/// Validates the peer's `crypto_select` against what we offered and returns
/// whether RC4 was chosen.
fn validate_selection(mode: CryptoMode, selected: u32) -> Result<bool> {
    if selected.count_ones() != 1 || selected & provide_bits(mode) == 0 {
        return Err(Error::Encryption(format!(
            "peer selected {:#x}, which was not offered",
            selected
        )));
    }
    Ok(selected == CRYPTO_RC4)
}

async fn send_with_pad<S: AsyncWrite + Unpin>(io: &mut S, pubkey: &[u8]) -> Result<()> {
    // the rng handle must not live across the await below
    let msg = {
        let mut rng = rand::thread_rng();
        let mut msg = pubkey.to_vec();
        let pad_len = rng.gen_range(0..=MAX_PAD_LEN / 2);
        msg.resize(pubkey.len() + pad_len, 0);
        rng.fill(&mut msg[pubkey.len()..]);
        msg
    };
    tokio::io::AsyncWriteExt::write_all(io, &msg).await?;
    Ok(())
}

fn prime() -> BigUint {
    let hex: String = PRIME_HEX.chars().filter(|c| !c.is_whitespace()).collect();
    BigUint::parse_bytes(hex.as_bytes(), 16).expect("the prime constant parses")
}

fn gen_keypair() -> ([u8; 20], Vec<u8>) {
    let mut secret = [0u8; 20];
    rand::thread_rng().fill(&mut secret);
    let pubkey = BigUint::from(GENERATOR)
        .modpow(&BigUint::from_bytes_be(&secret), &prime());
    (secret, pad_to_key_len(pubkey))
}

fn shared_secret(peer_pub: &[u8], secret: &[u8]) -> Vec<u8> {
    let s = BigUint::from_bytes_be(peer_pub)
        .modpow(&BigUint::from_bytes_be(secret), &prime());
    pad_to_key_len(s)
}

fn pad_to_key_len(n: BigUint) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    let mut padded = vec![0u8; KEY_LEN - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

fn hash(parts: &[&[u8]]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor20(mut a: Sha1Hash, b: Sha1Hash) -> Sha1Hash {
    for (a, b) in a.iter_mut().zip(b.iter()) {
        *a ^= b;
    }
    a
}

/// A growable read buffer for the handshake phase. Bytes read past what a
/// step needed are kept for the next step or handed to the [`MseStream`].
struct HsBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl HsBuf {
    fn new() -> Self {
        Self::from(Vec::new())
    }

    fn from(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    fn unread_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    async fn fill<S: AsyncRead + Unpin>(&mut self, io: &mut S, n: usize) -> Result<()> {
        let mut chunk = [0u8; 1024];
        while self.unread_len() < n {
            let read = io.read(&mut chunk).await?;
            if read == 0 {
                return Err(Error::Encryption("peer closed mid-handshake".into()));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    async fn read_exact<S: AsyncRead + Unpin>(
        &mut self,
        io: &mut S,
        n: usize,
    ) -> Result<Vec<u8>> {
        self.fill(io, n).await?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// Consumes bytes up to and including the marker, which must appear
    /// within `limit` bytes.
    async fn sync_to_marker<S: AsyncRead + Unpin>(
        &mut self,
        io: &mut S,
        marker: &[u8],
        limit: usize,
    ) -> Result<()> {
        loop {
            let unread = &self.buf[self.pos..];
            if let Some(at) = unread
                .windows(marker.len())
                .position(|window| window == marker)
            {
                self.pos += at + marker.len();
                return Ok(());
            }
            if self.unread_len() > limit + marker.len() {
                return Err(Error::Encryption(
                    "could not synchronize on the handshake pattern".into(),
                ));
            }
            self.fill(io, self.unread_len() + 1).await?;
        }
    }

    fn into_unread(self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rc4_vector() {
        // the classic test vector: key "Key", plaintext "Plaintext"
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply(&mut data);
        assert_eq!(hex::encode(data), "bbf316e8d940af0ad3");

        let mut rc4 = Rc4::new(b"Key");
        rc4.apply(&mut data);
        assert_eq!(&data, b"Plaintext");
    }

    #[test]
    fn test_rc4_discard_continues_keystream() {
        let mut a = Rc4::new(b"some key");
        let mut b = Rc4::new(b"some key");
        let mut head = [0u8; 100];
        a.apply(&mut head);
        b.discard(100);
        let mut x = [1u8; 32];
        let mut y = [1u8; 32];
        a.apply(&mut x);
        b.apply(&mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn test_choose_respects_mode() {
        let both = CRYPTO_RC4 | CRYPTO_PLAINTEXT;
        assert_eq!(choose(CryptoMode::Force, both).unwrap(), CRYPTO_RC4);
        assert_eq!(choose(CryptoMode::Prefer, both).unwrap(), CRYPTO_RC4);
        assert_eq!(
            choose(CryptoMode::PreferPlaintext, both).unwrap(),
            CRYPTO_PLAINTEXT
        );
        assert_eq!(
            choose(CryptoMode::Prefer, CRYPTO_PLAINTEXT).unwrap(),
            CRYPTO_PLAINTEXT
        );
        assert!(choose(CryptoMode::Force, CRYPTO_PLAINTEXT).is_err());
    }

    #[test]
    fn test_validate_selection() {
        assert!(validate_selection(CryptoMode::Force, CRYPTO_RC4).unwrap());
        assert!(validate_selection(CryptoMode::Force, CRYPTO_PLAINTEXT).is_err());
        assert!(!validate_selection(CryptoMode::Prefer, CRYPTO_PLAINTEXT).unwrap());
        assert!(validate_selection(CryptoMode::Prefer, both_bits()).is_err());
    }

    fn both_bits() -> u32 {
        CRYPTO_RC4 | CRYPTO_PLAINTEXT
    }

    async fn loopback(mode: CryptoMode) -> (bool, bool) {
        let info_hash = [0x42u8; 20];
        let (a, b) = tokio::io::duplex(4096);

        let initiator = tokio::spawn(async move {
            let mut stream = initiate(a, &info_hash, mode).await.unwrap();
            stream.write_all(b"ping from initiator").await.unwrap();
            stream.flush().await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"pong");
            stream.is_encrypted()
        });

        let acceptor = tokio::spawn(async move {
            let served = [[0x13u8; 20], info_hash];
            let (mut stream, matched) =
                accept(b, &served, mode, Vec::new()).await.unwrap();
            assert_eq!(matched, info_hash);
            let mut msg = [0u8; 19];
            stream.read_exact(&mut msg).await.unwrap();
            assert_eq!(&msg, b"ping from initiator");
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
            stream.is_encrypted()
        });

        (initiator.await.unwrap(), acceptor.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_loopback_rc4() {
        let (initiator_rc4, acceptor_rc4) = loopback(CryptoMode::Prefer).await;
        assert!(initiator_rc4);
        assert!(acceptor_rc4);
    }

    #[tokio::test]
    async fn test_handshake_loopback_plaintext() {
        let (initiator_rc4, acceptor_rc4) = loopback(CryptoMode::PreferPlaintext).await;
        assert!(!initiator_rc4);
        assert!(!acceptor_rc4);
    }

    #[tokio::test]
    async fn test_accept_rejects_unknown_info_hash() {
        let (a, b) = tokio::io::duplex(4096);
        let initiator =
            tokio::spawn(
                async move { initiate(a, &[0x99u8; 20], CryptoMode::Prefer).await },
            );
        let acceptor = accept(b, &[[0x11u8; 20]], CryptoMode::Prefer, Vec::new()).await;
        assert!(matches!(acceptor, Err(Error::InfoHashUnknown)));
        drop(initiator);
    }
}
