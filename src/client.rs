//! The client side of a session: ask the broker for a cohort, hand the
//! manager a grid and steer the run with directives.

use std::{net::SocketAddr, time::Duration};

use tracing::{debug, info};

use crate::{
    config::SessionSettings,
    life::Grid,
    net::{Directive, Endpoint, Hello, Link},
    Error, Result,
};

pub struct Client {
    endpoint: Endpoint,
    linger: Duration,
}

impl Client {
    pub fn bind(settings: &SessionSettings) -> Result<Self> {
        let endpoint = Endpoint::bind(
            SocketAddr::new(settings.bind_ip, 0),
            settings.advertise_ip,
            &settings.transport,
        )?;
        Ok(Self {
            endpoint,
            linger: settings.transport.linger,
        })
    }

    /// Asks the broker for a cohort of `num_workers` workers and returns the
    /// address of its manager.
    pub async fn request_cohort(&self, broker: SocketAddr, num_workers: u32) -> Result<SocketAddr> {
        let num_workers = i32::try_from(num_workers)
            .map_err(|_| Error::config(format!("{num_workers} workers is not representable")))?;
        let mut link = self.endpoint.connect(broker).await?;
        link.tx.send_hello(&Hello::RequestCohort).await?;
        link.tx.send_i32(num_workers).await?;
        let manager = link
            .rx
            .recv_addr()
            .await?
            .ok_or_else(|| Error::protocol("broker sent an empty manager address"))?;
        debug!(%manager, "cohort ready");
        Ok(manager)
    }

    /// Requests a cohort and hands its manager `grid`.
    pub async fn start(&self, broker: SocketAddr, num_workers: u32, grid: &Grid) -> Result<Session> {
        let manager = self.request_cohort(broker, num_workers).await?;
        self.attach(manager, grid).await
    }

    /// Opens a session with a manager that is already waiting for its client.
    pub async fn attach(&self, manager: SocketAddr, grid: &Grid) -> Result<Session> {
        let (height, width) = wire_dimensions(grid.height(), grid.width())?;
        let mut link = self.endpoint.connect(manager).await?;
        link.tx.send_hello(&Hello::Session).await?;
        link.tx.send_i32(height).await?;
        link.tx.send_i32(width).await?;
        link.tx.send_cells(grid.cells()).await?;
        info!(%manager, height = grid.height(), width = grid.width(), "session started");
        Ok(Session {
            link,
            height: grid.height(),
            width: grid.width(),
            linger: self.linger,
        })
    }

    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }
}

/// A grid's dimensions as the int32 pair the manager expects.
fn wire_dimensions(height: usize, width: usize) -> Result<(i32, i32)> {
    match (i32::try_from(height), i32::try_from(width)) {
        (Ok(height), Ok(width)) => Ok((height, width)),
        _ => Err(Error::config(format!(
            "a {height}x{width} grid does not fit the wire format"
        ))),
    }
}

/// A running simulation. Dropping it without `stop` leaves the cohort to
/// notice the closed connection and halt on its own.
pub struct Session {
    link: Link,
    height: usize,
    width: usize,
    linger: Duration,
}

impl Session {
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub async fn send(&mut self, directive: Directive) -> Result<()> {
        self.link.tx.send_directive(directive).await
    }

    /// Fetches the grid as of the tick that picks the request up.
    pub async fn snapshot(&mut self) -> Result<Grid> {
        self.send(Directive::Snapshot).await?;
        let mut grid = Grid::new(self.height, self.width)?;
        self.link.rx.recv_cells_into(grid.cells_mut()).await?;
        Ok(grid)
    }

    /// Halts the cohort and waits for the manager to hang up.
    pub async fn stop(mut self) -> Result<()> {
        self.send(Directive::Stop).await?;
        self.link.drain(self.linger).await;
        debug!("session stopped");
        Ok(())
    }
}
