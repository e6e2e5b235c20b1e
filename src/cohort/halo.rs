use std::net::SocketAddr;

use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::{
    life::{Partition, Topology},
    net::{Endpoint, Hello, Link},
    Error, Result,
};

/// A worker's links to its ring neighbours. Either side is absent at the
/// ends of the ring.
pub struct Halo<W = SendStream, R = RecvStream> {
    topology: Topology,
    prev: Option<Link<W, R>>,
    next: Option<Link<W, R>>,
}

impl Halo {
    /// Dials the successor and accepts the predecessor at the same time.
    /// Worker `r` always dials `r + 1`, so each edge is opened exactly once.
    pub async fn establish(
        endpoint: &Endpoint,
        topology: Topology,
        next_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let rank = topology.rank as u32;
        let dial_next = async {
            let Some(addr) = next_addr else {
                return Ok::<_, Error>(None);
            };
            let mut link = endpoint.connect(addr).await?;
            link.tx.send_hello(&Hello::Halo { rank }).await?;
            Ok(Some(link))
        };
        let accept_prev = async {
            let Some(prev_rank) = topology.prev else {
                return Ok::<_, Error>(None);
            };
            let mut link = endpoint.accept().await?;
            match link.rx.recv_hello().await? {
                Hello::Halo { rank } if rank as usize == prev_rank => Ok(Some(link)),
                other => Err(Error::protocol(format!(
                    "expected a halo link from worker {prev_rank}, got {other:?}"
                ))),
            }
        };
        let (next, prev) = tokio::try_join!(dial_next, accept_prev)?;
        debug!(
            prev = prev.is_some(),
            next = next.is_some(),
            "halo links established"
        );
        Ok(Self {
            topology,
            prev,
            next,
        })
    }
}

impl<W, R> Halo<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    pub fn new(topology: Topology, prev: Option<Link<W, R>>, next: Option<Link<W, R>>) -> Self {
        Self {
            topology,
            prev,
            next,
        }
    }

    /// Swaps boundary rows with both neighbours. Even ranks handle their
    /// successor first and send before receiving; odd ranks handle their
    /// predecessor first and receive before sending. A missing neighbour is
    /// skipped, leaving that ghost row untouched.
    pub async fn exchange(&mut self, partition: &mut Partition) -> Result<()> {
        if self.topology.sends_first() {
            if let Some(next) = self.next.as_mut() {
                next.tx.send_cells(partition.last_row()).await?;
                next.rx.recv_cells_into(partition.bottom_ghost_mut()).await?;
            }
            if let Some(prev) = self.prev.as_mut() {
                prev.tx.send_cells(partition.first_row()).await?;
                prev.rx.recv_cells_into(partition.top_ghost_mut()).await?;
            }
        } else {
            if let Some(prev) = self.prev.as_mut() {
                prev.rx.recv_cells_into(partition.top_ghost_mut()).await?;
                prev.tx.send_cells(partition.first_row()).await?;
            }
            if let Some(next) = self.next.as_mut() {
                next.rx.recv_cells_into(partition.bottom_ghost_mut()).await?;
                next.tx.send_cells(partition.last_row()).await?;
            }
        }
        trace!(rank = self.topology.rank, "halo exchanged");
        Ok(())
    }
}
