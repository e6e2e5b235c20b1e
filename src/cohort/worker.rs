use std::net::SocketAddr;

use quinn::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace};

use super::halo::Halo;
use crate::{
    config::SessionSettings,
    life::{Partition, Topology},
    net::{Directive, Endpoint, Hello, Link, LinkRx},
    Error, Result,
};

/// What the manager ships a worker once, before the first tick.
#[derive(Debug)]
pub struct Assignment {
    pub prev: Option<SocketAddr>,
    pub next: Option<SocketAddr>,
    pub partition: Partition,
}

impl Assignment {
    /// Reads the neighbour table, the `(padded_height, width)` header and the
    /// padded rows. A neighbour table that disagrees with `topology`, or a
    /// partition owning more than `max_cells` cells, is a protocol error.
    pub async fn receive<R>(rx: &mut LinkRx<R>, topology: &Topology, max_cells: usize) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let prev = rx.recv_addr().await?;
        let next = rx.recv_addr().await?;
        if prev.is_some() != topology.prev.is_some() || next.is_some() != topology.next.is_some()
        {
            return Err(Error::protocol(format!(
                "neighbour table (prev {prev:?}, next {next:?}) does not fit worker {} of {}",
                topology.rank, topology.num_workers
            )));
        }

        let padded_height = rx.recv_u32("partition height").await? as usize;
        let width = rx.recv_u32("width").await? as usize;
        if padded_height < 3 || width == 0 {
            return Err(Error::protocol(format!(
                "cannot hold a {padded_height}x{width} partition"
            )));
        }
        let cells = padded_height
            .checked_mul(width)
            .filter(|cells| cells - 2 * width <= max_cells)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "a {padded_height}x{width} partition exceeds the limit of {max_cells} cells"
                ))
            })?;
        let mut slab = vec![0; cells];
        rx.recv_cells_into(&mut slab).await?;
        let partition = Partition::from_padded(width, slab)?;
        Ok(Self {
            prev,
            next,
            partition,
        })
    }
}

/// A cohort member that owns one partition and advances it once per tick.
pub struct Worker<W = SendStream, R = RecvStream> {
    topology: Topology,
    manager: Link<W, R>,
    halo: Halo<W, R>,
    partition: Partition,
    generation: i32,
}

impl Worker {
    /// Attaches to the manager, takes delivery of the partition and opens the
    /// halo links.
    pub async fn join(
        endpoint: &Endpoint,
        manager: SocketAddr,
        topology: Topology,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let mut link = endpoint.connect(manager).await?;
        link.tx
            .send_hello(&Hello::Worker {
                rank: topology.rank as u32,
                halo: endpoint.contact(),
            })
            .await?;
        let assignment = Assignment::receive(&mut link.rx, &topology, settings.max_cells).await?;
        debug!(
            rows = assignment.partition.rows(),
            width = assignment.partition.width(),
            "partition received"
        );
        let halo = Halo::establish(endpoint, topology, assignment.next).await?;
        Ok(Worker::new(topology, link, halo, assignment.partition))
    }
}

impl<W, R> Worker<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    pub fn new(
        topology: Topology,
        manager: Link<W, R>,
        halo: Halo<W, R>,
        partition: Partition,
    ) -> Self {
        Self {
            topology,
            manager,
            halo,
            partition,
            generation: 0,
        }
    }

    /// Runs ticks until the manager says `STOP`.
    ///
    /// `SNAPSHOT` sends the owned rows as they stand before the tick's step.
    /// Every tick other than `STOP` ends with the new generation number sent
    /// back as an acknowledgement.
    pub async fn run(mut self) -> Result<()> {
        info!(
            rank = self.topology.rank,
            rows = self.partition.rows(),
            "worker running"
        );
        loop {
            let directive = self.manager.rx.recv_directive().await?;
            trace!(%directive, generation = self.generation, "tick");
            match directive {
                Directive::Stop => break,
                Directive::Snapshot => self.manager.tx.send_cells(self.partition.interior()).await?,
                Directive::Continue => {}
            }
            self.partition.step();
            self.halo.exchange(&mut self.partition).await?;
            self.generation = self.generation.wrapping_add(1);
            self.manager.tx.send_i32(self.generation).await?;
        }
        info!(generation = self.generation, "worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DEFAULT_MAX_CELLS,
        life::{partition_rows, Grid},
        net::link::tests::pipe,
        ErrorKind,
    };

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn assignment_arrives_with_its_ghosts() {
        let grid = Grid::from_rows(&[[1u8, 0, 1], [0, 1, 0], [1, 1, 1], [0, 0, 1]]).unwrap();
        let range = partition_rows(4, 2).unwrap()[1];
        let topology = Topology::resolve(1, 2).unwrap();

        let (mut manager, mut worker) = pipe();
        manager.tx.send_addr(Some(addr(9000))).await.unwrap();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_i32(4).await.unwrap();
        manager.tx.send_i32(3).await.unwrap();
        manager.tx.send_cells(&grid.padded_rows(range)).await.unwrap();

        let assignment = Assignment::receive(&mut worker.rx, &topology, DEFAULT_MAX_CELLS).await.unwrap();
        assert_eq!(assignment.prev, Some(addr(9000)));
        assert_eq!(assignment.next, None);
        assert_eq!(assignment.partition.rows(), 2);
        assert_eq!(assignment.partition.row(0), grid.row(1));
        assert_eq!(assignment.partition.interior(), &[1, 1, 1, 0, 0, 1]);
        assert_eq!(assignment.partition.row(3), &[0, 0, 0]);
    }

    #[tokio::test]
    async fn neighbour_table_must_match_the_ring() {
        let (mut manager, mut worker) = pipe();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_addr(None).await.unwrap();

        let topology = Topology::resolve(1, 3).unwrap();
        let err = Assignment::receive(&mut worker.rx, &topology, DEFAULT_MAX_CELLS).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn partitions_without_interior_rows_are_rejected() {
        let (mut manager, mut worker) = pipe();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_i32(2).await.unwrap();
        manager.tx.send_i32(4).await.unwrap();

        let topology = Topology::resolve(0, 1).unwrap();
        let err = Assignment::receive(&mut worker.rx, &topology, DEFAULT_MAX_CELLS).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn oversize_partitions_are_refused_before_allocating() {
        let (mut manager, mut worker) = pipe();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_i32(i32::MAX).await.unwrap();
        manager.tx.send_i32(i32::MAX).await.unwrap();

        let topology = Topology::resolve(0, 1).unwrap();
        let err = Assignment::receive(&mut worker.rx, &topology, DEFAULT_MAX_CELLS)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn ghost_rows_do_not_count_against_the_cell_limit() {
        let grid = Grid::from_rows(&[[1u8, 0], [0, 1], [1, 1]]).unwrap();
        let topology = Topology::resolve(0, 1).unwrap();
        let (mut manager, mut worker) = pipe();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_addr(None).await.unwrap();
        manager.tx.send_i32(5).await.unwrap();
        manager.tx.send_i32(2).await.unwrap();
        manager.tx.send_cells(&grid.padded_rows(partition_rows(3, 1).unwrap()[0])).await.unwrap();

        let assignment = Assignment::receive(&mut worker.rx, &topology, 6).await.unwrap();
        assert_eq!(assignment.partition.interior(), grid.cells());
    }

    #[tokio::test]
    async fn snapshot_reports_rows_before_stepping() {
        let grid = Grid::from_rows(&[[1u8, 1, 1, 0], [1, 1, 0, 0], [0, 1, 0, 1], [1, 0, 1, 0]]).unwrap();
        let topology = Topology::resolve(0, 1).unwrap();
        let partition = Partition::from_padded(
            4,
            grid.padded_rows(partition_rows(4, 1).unwrap()[0]),
        )
        .unwrap();

        let (mut manager, link) = pipe();
        let worker = Worker::new(topology, link, Halo::new(topology, None, None), partition);
        let running = tokio::spawn(worker.run());

        let mut rows = vec![0u8; 16];
        manager.tx.send_directive(Directive::Snapshot).await.unwrap();
        manager.rx.recv_cells_into(&mut rows).await.unwrap();
        assert_eq!(rows.as_slice(), grid.cells());
        assert_eq!(manager.rx.recv_i32().await.unwrap(), 1);

        manager.tx.send_directive(Directive::Continue).await.unwrap();
        assert_eq!(manager.rx.recv_i32().await.unwrap(), 2);

        manager.tx.send_directive(Directive::Snapshot).await.unwrap();
        manager.rx.recv_cells_into(&mut rows).await.unwrap();
        assert_eq!(rows.as_slice(), grid.step().step().cells());
        assert_eq!(manager.rx.recv_i32().await.unwrap(), 3);

        manager.tx.send_directive(Directive::Stop).await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_ends_the_loop_without_an_ack() {
        let topology = Topology::resolve(0, 1).unwrap();
        let partition = Partition::from_padded(2, vec![0; 6]).unwrap();
        let (mut manager, link) = pipe();
        let worker = Worker::new(topology, link, Halo::new(topology, None, None), partition);
        let running = tokio::spawn(worker.run());

        manager.tx.send_directive(Directive::Stop).await.unwrap();
        running.await.unwrap().unwrap();
        // the worker dropped its link without writing anything
        let err = manager.rx.recv_i32().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn lost_manager_is_a_transport_error() {
        let topology = Topology::resolve(0, 1).unwrap();
        let partition = Partition::from_padded(2, vec![0; 6]).unwrap();
        let (manager, link) = pipe();
        let worker = Worker::new(topology, link, Halo::new(topology, None, None), partition);
        drop(manager);
        assert_eq!(worker.run().await.unwrap_err().kind(), ErrorKind::Transport);
    }
}
