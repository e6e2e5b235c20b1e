use std::{net::SocketAddr, time::Duration};

use futures::future::{join_all, try_join_all};
use quinn::{RecvStream, SendStream};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use super::mailbox::Mailbox;
use crate::{
    config::SessionSettings,
    life::{partition_rows, Grid, RowRange},
    net::{Directive, Endpoint, Hello, Link, LinkRx, LinkTx},
    Error, Result,
};

/// Coordinates one client session: owns the grid, feeds the workers their
/// partitions and drives the tick loop.
pub struct Manager<W = SendStream, R = RecvStream> {
    client: LinkTx<W>,
    mailbox: Mailbox,
    workers: Vec<Link<W, R>>,
    ranges: Vec<RowRange>,
    grid: Grid,
    generation: i32,
    tick_interval: Duration,
    linger: Duration,
}

impl Manager {
    /// Accepts the client and all `num_workers` workers on `endpoint`, in
    /// whatever order they arrive, then sets the session up.
    pub async fn establish(
        endpoint: &Endpoint,
        num_workers: usize,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let mut client = None;
        let mut workers: Vec<Option<(Link, SocketAddr)>> = (0..num_workers).map(|_| None).collect();
        let mut missing = num_workers + 1;

        while missing > 0 {
            let mut link = endpoint.accept().await?;
            match link.rx.recv_hello().await? {
                Hello::Session if client.is_none() => {
                    debug!(remote = ?link.remote_addr(), "client attached");
                    client = Some(link);
                }
                Hello::Worker { rank, halo } => {
                    let slot = workers.get_mut(rank as usize).ok_or_else(|| {
                        Error::protocol(format!(
                            "worker rank {rank} is outside a cohort of {num_workers} workers"
                        ))
                    })?;
                    if slot.is_some() {
                        return Err(Error::protocol(format!("worker {rank} attached twice")));
                    }
                    debug!(rank, %halo, "worker attached");
                    *slot = Some((link, halo));
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected {:?} hello at the manager",
                        other.hello_type()
                    )))
                }
            }
            missing -= 1;
        }

        let client = client.ok_or_else(|| Error::protocol("no client attached"))?;
        let workers = workers
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::protocol("a worker never attached"))?;
        Self::setup(client, workers, settings).await
    }
}

impl<W, R> Manager<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Reads the grid from the client, cuts it into row ranges and ships each
    /// worker its neighbour table and padded partition. `workers` is in rank
    /// order, each with the address its halo links are accepted on.
    pub async fn setup(
        client: Link<W, R>,
        workers: Vec<(Link<W, R>, SocketAddr)>,
        settings: &SessionSettings,
    ) -> Result<Self> {
        let (client_tx, mut client_rx) = client.split();
        let grid = receive_grid(&mut client_rx, settings.max_cells).await?;
        let ranges = partition_rows(grid.height(), workers.len())?;
        info!(
            height = grid.height(),
            width = grid.width(),
            workers = workers.len(),
            "grid received"
        );

        let halos: Vec<SocketAddr> = workers.iter().map(|(_, halo)| *halo).collect();
        let mut workers: Vec<Link<W, R>> = workers.into_iter().map(|(link, _)| link).collect();
        let width = grid.width() as i32;
        try_join_all(workers.iter_mut().zip(&ranges).enumerate().map(
            |(rank, (link, range))| {
                let prev = rank.checked_sub(1).map(|r| halos[r]);
                let next = halos.get(rank + 1).copied();
                let slab = grid.padded_rows(*range);
                async move {
                    link.tx.send_addr(prev).await?;
                    link.tx.send_addr(next).await?;
                    link.tx.send_i32((range.count + 2) as i32).await?;
                    link.tx.send_i32(width).await?;
                    link.tx.send_cells(&slab).await
                }
            },
        ))
        .await?;
        debug!("partitions distributed");

        Ok(Self {
            client: client_tx,
            mailbox: Mailbox::spawn(client_rx),
            workers,
            ranges,
            grid,
            generation: 0,
            tick_interval: settings.tick_interval,
            linger: settings.transport.linger,
        })
    }

    /// Runs the tick loop until the client says `STOP`.
    ///
    /// Each tick broadcasts exactly one directive: the client's pending one if
    /// it has arrived, `CONTINUE` otherwise. A tick ends once every worker has
    /// acknowledged the new generation.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = self.ticker();
        loop {
            match ticker.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => tokio::task::yield_now().await,
            }

            let directive = match self.mailbox.poll() {
                None => Directive::Continue,
                Some(Ok(directive)) => directive,
                Some(Err(err)) => {
                    warn!(%err, generation = self.generation, "client control channel failed, halting");
                    let _ = self.broadcast(Directive::Stop).await;
                    self.release().await;
                    return Err(err);
                }
            };
            trace!(%directive, generation = self.generation, "tick");
            self.broadcast(directive).await?;

            match directive {
                Directive::Stop => break,
                Directive::Snapshot => {
                    self.collect_snapshot().await?;
                    self.client.send_cells(self.grid.cells()).await?;
                    debug!(generation = self.generation, "snapshot delivered");
                }
                Directive::Continue => {}
            }
            self.await_acks().await?;
        }

        info!(generation = self.generation, "session stopped");
        self.release().await;
        Ok(())
    }

    fn ticker(&self) -> Option<Interval> {
        if self.tick_interval.is_zero() {
            return None;
        }
        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn broadcast(&mut self, directive: Directive) -> Result<()> {
        try_join_all(
            self.workers
                .iter_mut()
                .map(|link| link.tx.send_directive(directive)),
        )
        .await?;
        Ok(())
    }

    /// Reads every worker's rows in rank order straight into the grid.
    async fn collect_snapshot(&mut self) -> Result<()> {
        for (link, range) in self.workers.iter_mut().zip(&self.ranges) {
            link.rx.recv_cells_into(self.grid.block_mut(*range)).await?;
        }
        Ok(())
    }

    async fn await_acks(&mut self) -> Result<()> {
        self.generation = self.generation.wrapping_add(1);
        let acks = try_join_all(self.workers.iter_mut().map(|link| link.rx.recv_i32())).await?;
        if let Some((rank, ack)) = acks
            .into_iter()
            .enumerate()
            .find(|(_, ack)| *ack != self.generation)
        {
            return Err(Error::protocol(format!(
                "worker {rank} acknowledged generation {ack}, expected {}",
                self.generation
            )));
        }
        Ok(())
    }

    /// Finishes every stream we still write to and waits, bounded by the
    /// linger time, for the readers to hang up.
    async fn release(mut self) {
        let linger = self.linger;
        join_all(self.workers.drain(..).map(|link| link.drain(linger))).await;
        match tokio::time::timeout(linger, self.client.finish()).await {
            Ok(Err(err)) => debug!(%err, "client link did not drain cleanly"),
            Err(_) => debug!("client did not acknowledge within {linger:?}"),
            Ok(Ok(())) => {}
        }
    }
}

/// Reads `(height, width)` followed by `height` rows of `width` cells. A
/// grid of more than `max_cells` cells is refused before any of it is read.
pub async fn receive_grid<R>(rx: &mut LinkRx<R>, max_cells: usize) -> Result<Grid>
where
    R: AsyncRead + Unpin,
{
    let height = rx.recv_i32().await?;
    let width = rx.recv_i32().await?;
    if height <= 0 || width <= 0 {
        return Err(Error::protocol(format!(
            "grid dimensions must be positive, got {height}x{width}"
        )));
    }
    let (height, width) = (height as usize, width as usize);
    match height.checked_mul(width) {
        Some(cells) if cells <= max_cells => {}
        _ => {
            return Err(Error::protocol(format!(
                "a {height}x{width} grid exceeds the limit of {max_cells} cells"
            )))
        }
    }
    let mut grid = Grid::new(height, width)?;
    rx.recv_cells_into(grid.cells_mut()).await?;
    Ok(grid)
}
