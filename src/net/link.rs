use std::{net::SocketAddr, time::Duration};

use byteorder::{ByteOrder, LittleEndian};
use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::wire::{
    parse_addr, Directive, Hello, HelloType, SessionToken, MAX_ADDRESS_LEN, TOKEN_LEN,
};
use crate::{life::grid::cell_from_wire, Error, Result};

/// A QUIC connection carrying one bidirectional stream, split into framed
/// halves. The halves are generic so the same framing runs over in-memory
/// pipes.
pub struct Link<W = SendStream, R = RecvStream> {
    pub tx: LinkTx<W>,
    pub rx: LinkRx<R>,
    conn: Option<quinn::Connection>,
}

impl Link {
    pub(crate) fn quic(conn: quinn::Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            tx: LinkTx::new(send),
            rx: LinkRx::new(recv),
            conn: Some(conn),
        }
    }
}

impl<W, R> Link<W, R> {
    pub fn from_halves(tx: W, rx: R) -> Self {
        Self {
            tx: LinkTx::new(tx),
            rx: LinkRx::new(rx),
            conn: None,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(|c| c.remote_address())
    }

    pub fn split(self) -> (LinkTx<W>, LinkRx<R>) {
        (self.tx, self.rx)
    }

    /// Resolves once the peer (or we) closed the underlying connection.
    pub async fn closed(&self) {
        if let Some(conn) = &self.conn {
            let _ = conn.closed().await;
        }
    }
}

impl<W: AsyncWrite + Unpin, R> Link<W, R> {
    /// Finishes our half and waits up to `limit` for the peer to hang up.
    /// The side that reads last closes the connection, so nothing it still
    /// has buffered is lost. That close may overtake the acknowledgement of
    /// our finish, so a failed finish only gets logged.
    pub async fn drain(mut self, limit: Duration) {
        if let Err(err) = self.tx.finish().await {
            debug!(%err, "peer hung up before acknowledging our finish");
        }
        if tokio::time::timeout(limit, self.closed()).await.is_err() {
            debug!("peer did not hang up within {limit:?}");
        }
    }
}

/// Cells are converted to and from int32 in blocks of this many, which
/// bounds the staging buffer no matter how large the grid is.
const CELLS_PER_BLOCK: usize = 16 * 1024;

pub struct LinkTx<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W> LinkTx<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

impl<W: AsyncWrite + Unpin> LinkTx<W> {
    pub async fn send_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes()).await?;
        Ok(())
    }

    pub async fn send_directive(&mut self, directive: Directive) -> Result<()> {
        trace!(%directive, "sending directive");
        self.send_i32(directive.into()).await
    }

    /// Writes consecutive rows of cells as int32 values. `cells` may hold any
    /// whole number of rows.
    pub async fn send_cells(&mut self, cells: &[u8]) -> Result<()> {
        for block in cells.chunks(CELLS_PER_BLOCK) {
            self.buf.clear();
            self.buf.resize(block.len() * 4, 0);
            for (chunk, &cell) in self.buf.chunks_exact_mut(4).zip(block) {
                LittleEndian::write_i32(chunk, i32::from(cell));
            }
            self.inner.write_all(&self.buf).await?;
        }
        Ok(())
    }

    pub async fn send_str(&mut self, s: &str) -> Result<()> {
        if s.len() > MAX_ADDRESS_LEN {
            return Err(Error::protocol(format!(
                "refusing to send a {}-byte address",
                s.len()
            )));
        }
        self.buf.clear();
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.inner.write_all(&self.buf).await?;
        Ok(())
    }

    pub async fn send_addr(&mut self, addr: Option<SocketAddr>) -> Result<()> {
        match addr {
            Some(addr) => self.send_str(&addr.to_string()).await,
            None => self.send_str("").await,
        }
    }

    pub async fn send_hello(&mut self, hello: &Hello) -> Result<()> {
        self.inner.write_all(&[hello.hello_type() as u8]).await?;
        match hello {
            Hello::RequestCohort | Hello::Session => {}
            Hello::Member {
                token,
                rank,
                contact,
            } => {
                self.inner.write_all(&token.0).await?;
                self.send_i32(*rank as i32).await?;
                self.send_addr(*contact).await?;
            }
            Hello::Worker { rank, halo } => {
                self.send_i32(*rank as i32).await?;
                self.send_addr(Some(*halo)).await?;
            }
            Hello::Halo { rank } => self.send_i32(*rank as i32).await?,
        }
        Ok(())
    }

    /// Flushes and closes our half of the stream. On QUIC this completes once
    /// the peer has acknowledged everything written.
    pub async fn finish(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub struct LinkRx<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> LinkRx<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

impl<R: AsyncRead + Unpin> LinkRx<R> {
    pub async fn recv_i32(&mut self) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.inner.read_exact(&mut bytes).await?;
        Ok(i32::from_le_bytes(bytes))
    }

    pub async fn recv_u32(&mut self, what: &str) -> Result<u32> {
        let value = self.recv_i32().await?;
        u32::try_from(value).map_err(|_| Error::protocol(format!("negative {what} {value}")))
    }

    pub async fn recv_directive(&mut self) -> Result<Directive> {
        Directive::try_from(self.recv_i32().await?)
    }

    /// Fills `cells` with as many int32 cell values as it has room for,
    /// rejecting anything that is not 0 or 1.
    pub async fn recv_cells_into(&mut self, cells: &mut [u8]) -> Result<()> {
        for block in cells.chunks_mut(CELLS_PER_BLOCK) {
            self.buf.clear();
            self.buf.resize(block.len() * 4, 0);
            self.inner.read_exact(&mut self.buf).await?;
            for (cell, chunk) in block.iter_mut().zip(self.buf.chunks_exact(4)) {
                *cell = cell_from_wire(LittleEndian::read_i32(chunk))?;
            }
        }
        Ok(())
    }

    pub async fn recv_str(&mut self) -> Result<String> {
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len).await?;
        let len = LittleEndian::read_u32(&len) as usize;
        if len > MAX_ADDRESS_LEN {
            return Err(Error::protocol(format!(
                "address of {len} bytes exceeds the {MAX_ADDRESS_LEN}-byte limit"
            )));
        }
        self.buf.clear();
        self.buf.resize(len, 0);
        self.inner.read_exact(&mut self.buf).await?;
        String::from_utf8(self.buf.clone())
            .map_err(|_| Error::protocol("address is not valid UTF-8"))
    }

    /// An empty string decodes to `None`.
    pub async fn recv_addr(&mut self) -> Result<Option<SocketAddr>> {
        let s = self.recv_str().await?;
        if s.is_empty() {
            Ok(None)
        } else {
            parse_addr(&s).map(Some)
        }
    }

    pub async fn recv_hello(&mut self) -> Result<Hello> {
        let mut tag = [0u8; 1];
        self.inner.read_exact(&mut tag).await?;
        let hello = match HelloType::try_from(tag[0])? {
            HelloType::RequestCohort => Hello::RequestCohort,
            HelloType::Session => Hello::Session,
            HelloType::Member => {
                let mut token = [0u8; TOKEN_LEN];
                self.inner.read_exact(&mut token).await?;
                Hello::Member {
                    token: SessionToken(token),
                    rank: self.recv_u32("rank").await?,
                    contact: self.recv_addr().await?,
                }
            }
            HelloType::Worker => Hello::Worker {
                rank: self.recv_u32("rank").await?,
                halo: self
                    .recv_addr()
                    .await?
                    .ok_or_else(|| Error::protocol("worker did not send a halo address"))?,
            },
            HelloType::Halo => Hello::Halo {
                rank: self.recv_u32("rank").await?,
            },
        };
        Ok(hello)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    pub type PipeLink = Link<WriteHalf<DuplexStream>, ReadHalf<DuplexStream>>;

    /// Two links wired back to back through an in-memory pipe.
    pub fn pipe() -> (PipeLink, PipeLink) {
        let (a, b) = duplex(64 * 1024);
        let (a_rx, a_tx) = split(a);
        let (b_rx, b_tx) = split(b);
        (Link::from_halves(a_tx, a_rx), Link::from_halves(b_tx, b_rx))
    }

    #[tokio::test]
    async fn hellos_survive_the_wire() {
        let (mut a, mut b) = pipe();
        let hellos = vec![
            Hello::RequestCohort,
            Hello::Member {
                token: SessionToken([7; TOKEN_LEN]),
                rank: 0,
                contact: Some("127.0.0.1:9000".parse().unwrap()),
            },
            Hello::Member {
                token: SessionToken([9; TOKEN_LEN]),
                rank: 3,
                contact: None,
            },
            Hello::Session,
            Hello::Worker {
                rank: 2,
                halo: "[::1]:4711".parse().unwrap(),
            },
            Hello::Halo { rank: 1 },
        ];
        for hello in &hellos {
            a.tx.send_hello(hello).await.unwrap();
        }
        for hello in &hellos {
            assert_eq!(&b.rx.recv_hello().await.unwrap(), hello);
        }
    }

    #[tokio::test]
    async fn cells_travel_as_int32() {
        let (mut a, mut b) = pipe();
        a.tx.send_cells(&[1, 0, 0, 1]).await.unwrap();
        a.tx.send_i32(2).await.unwrap();

        let mut raw = [0u8; 16];
        b.rx.inner.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &1i32.to_le_bytes());
        assert_eq!(&raw[4..8], &0i32.to_le_bytes());
        assert_eq!(b.rx.recv_directive().await.unwrap(), Directive::Snapshot);
    }

    #[test]
    fn links_build_from_any_halves() {
        let link: Link<Vec<u8>, &[u8]> = Link::from_halves(Vec::new(), &[][..]);
        assert!(link.remote_addr().is_none());
    }

    #[tokio::test]
    async fn large_grids_cross_in_bounded_blocks() {
        let (mut a, mut b) = pipe();
        let cells: Vec<u8> = (0..3 * CELLS_PER_BLOCK + 17).map(|i| (i % 3 == 0) as u8).collect();
        let mut received = vec![0u8; cells.len()];
        let (sent, got) = tokio::join!(a.tx.send_cells(&cells), b.rx.recv_cells_into(&mut received));
        sent.unwrap();
        got.unwrap();
        assert_eq!(received, cells);
        assert!(b.rx.buf.len() <= CELLS_PER_BLOCK * 4);
        assert!(a.tx.buf.len() <= CELLS_PER_BLOCK * 4);
    }

    #[tokio::test]
    async fn non_binary_cells_are_rejected() {
        let (mut a, mut b) = pipe();
        a.tx.send_i32(1).await.unwrap();
        a.tx.send_i32(5).await.unwrap();
        let mut row = [0u8; 2];
        let err = b.rx.recv_cells_into(&mut row).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn oversized_addresses_are_rejected() {
        let (mut a, mut b) = pipe();
        a.tx.send_i32(MAX_ADDRESS_LEN as i32 + 1).await.unwrap();
        let err = b.rx.recv_str().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
        assert!(a.tx.send_str(&"x".repeat(MAX_ADDRESS_LEN + 1)).await.is_err());
    }

    #[tokio::test]
    async fn empty_address_means_none() {
        let (mut a, mut b) = pipe();
        a.tx.send_addr(None).await.unwrap();
        a.tx.send_addr(Some("10.0.0.1:1".parse().unwrap())).await.unwrap();
        assert_eq!(b.rx.recv_addr().await.unwrap(), None);
        assert_eq!(
            b.rx.recv_addr().await.unwrap(),
            Some("10.0.0.1:1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn closed_pipe_is_a_transport_error() {
        let (a, mut b) = pipe();
        drop(a);
        let err = b.rx.recv_i32().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
    }
}
