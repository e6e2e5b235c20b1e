//! The well-known rendezvous point. Turns a client's request for N workers
//! into a running cohort and tells the client where its manager listens.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hashbrown::{HashMap, HashSet};
use quinn::Connecting;
use tokio::{
    sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore},
    time::timeout,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    cohort::{Cohort, CohortRequest, CohortSpawner},
    config::{BrokerConfig, OverflowPolicy},
    life::MANAGER_RANK,
    net::{Endpoint, Hello, Link, SessionToken},
    Error, Result,
};

/// A cohort whose members are still checking in.
struct PendingCohort {
    manager: watch::Sender<Option<SocketAddr>>,
    num_workers: u32,
    /// Worker ranks seen so far; each may check in once.
    checked_in: HashSet<u32>,
    /// Workers not yet sent to their manager.
    workers_left: u32,
}

impl PendingCohort {
    fn new(num_workers: u32) -> (Self, watch::Receiver<Option<SocketAddr>>) {
        let (manager, reported) = watch::channel(None);
        let cohort = Self {
            manager,
            num_workers,
            checked_in: HashSet::new(),
            workers_left: num_workers,
        };
        (cohort, reported)
    }
}

type PendingCohorts = Arc<RwLock<HashMap<SessionToken, PendingCohort>>>;

/// Can be cloned to obtain another handle to the same broker.
#[derive(Clone)]
pub struct Broker {
    endpoint: Endpoint,
    config: Arc<BrokerConfig>,
    spawner: Arc<dyn CohortSpawner>,
    pending: PendingCohorts,
    slots: Arc<Semaphore>,
}

impl Broker {
    pub fn bind(config: BrokerConfig, spawner: impl CohortSpawner) -> Result<Self> {
        if config.max_pending_sessions == 0 {
            return Err(Error::config("max_pending_sessions must be at least 1"));
        }
        let endpoint = Endpoint::bind(
            config.listen,
            config.advertise_ip,
            &config.session.transport,
        )?;
        info!(contact = %endpoint.contact(), "broker listening");
        Ok(Self {
            endpoint,
            slots: Arc::new(Semaphore::new(config.max_pending_sessions)),
            config: Arc::new(config),
            spawner: Arc::new(spawner),
            pending: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The address clients and cohort members dial.
    pub fn contact(&self) -> SocketAddr {
        self.endpoint.contact()
    }

    /// Accepts connections until the endpoint is shut down. Each connection
    /// is handled in its own task; a failing one never takes the broker down.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let in_progress = match self.endpoint.incoming().await {
                Ok(in_progress) => in_progress,
                Err(Error::EndpointClosed) => return Ok(()),
                Err(err) => return Err(err),
            };
            let broker = self.clone();
            let span = info_span!("broker", remote = %in_progress.remote_address());
            tokio::spawn(
                async move {
                    if let Err(err) = broker.handle(in_progress).await {
                        warn!(%err, kind = %err.kind(), "connection failed");
                    }
                }
                .instrument(span),
            );
        }
    }

    pub async fn shutdown(&self) {
        self.endpoint.shutdown().await;
    }

    async fn handle(&self, in_progress: Connecting) -> Result<()> {
        let mut link = Endpoint::establish(in_progress).await?;
        match link.rx.recv_hello().await? {
            Hello::RequestCohort => self.accept_session(link).await,
            Hello::Member {
                token,
                rank,
                contact,
            } => self.member_report(link, token, rank, contact).await,
            other => Err(Error::protocol(format!(
                "unexpected {:?} hello at the broker",
                other.hello_type()
            ))),
        }
    }

    /// Reads the worker count, spawns a cohort of that many workers plus a
    /// manager and replies with the manager's contact address.
    async fn accept_session(&self, mut link: Link) -> Result<()> {
        let num_workers = link.rx.recv_i32().await?;
        if num_workers < 1 {
            return Err(Error::protocol(format!(
                "a session needs at least one worker, asked for {num_workers}"
            )));
        }
        let num_workers = num_workers as u32;
        if num_workers > self.config.max_workers {
            return Err(Error::config(format!(
                "{num_workers} workers exceeds the limit of {}",
                self.config.max_workers
            )));
        }

        let _permit = self.pending_slot().await?;
        let token = SessionToken::generate();
        let (pending, mut manager_rx) = PendingCohort::new(num_workers);
        self.pending.write().await.insert(token, pending);

        let request = CohortRequest {
            token,
            size: num_workers + 1,
            broker: self.contact(),
            session: self.config.session.clone(),
        };
        let cohort = match self.spawner.spawn(&request) {
            Ok(cohort) => cohort,
            Err(err) => {
                self.forget(&token).await;
                return Err(err);
            }
        };
        info!(%token, num_workers, "cohort spawned");

        let reported = timeout(self.config.spawn_timeout, manager_rx.wait_for(Option::is_some))
            .await
            .map(|seen| seen.map(|addr| *addr));
        let manager = match reported {
            Ok(Ok(Some(manager))) => manager,
            Ok(_) => return self.abandon(token, cohort, "cohort went away before reporting").await,
            Err(_) => {
                return self
                    .abandon(token, cohort, "manager did not report in time")
                    .await
            }
        };

        if let Err(err) = link.tx.send_addr(Some(manager)).await {
            return self.abandon(token, cohort, &err.to_string()).await;
        }
        cohort.detach();
        self.expire(token);
        info!(%token, %manager, "session handed to its manager");
        link.drain(self.config.session.transport.linger).await;
        Ok(())
    }

    async fn pending_slot(&self) -> Result<OwnedSemaphorePermit> {
        match self.config.overflow {
            OverflowPolicy::Queue => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::EndpointClosed),
            OverflowPolicy::Reject => self.slots.clone().try_acquire_owned().map_err(|_| {
                Error::Spawn(format!(
                    "already setting up {} sessions",
                    self.config.max_pending_sessions
                ))
            }),
        }
    }

    /// Records the manager's contact address, or hands it to a worker once
    /// the manager has reported. Each rank of the cohort may report once.
    async fn member_report(
        &self,
        mut link: Link,
        token: SessionToken,
        rank: u32,
        contact: Option<SocketAddr>,
    ) -> Result<()> {
        if rank == MANAGER_RANK {
            let contact =
                contact.ok_or_else(|| Error::protocol("manager report carries no address"))?;
            let pending = self.pending.read().await;
            let cohort = pending
                .get(&token)
                .ok_or_else(|| Error::protocol(format!("unknown session {token}")))?;
            let first = cohort.manager.send_if_modified(|manager| {
                if manager.is_some() {
                    return false;
                }
                *manager = Some(contact);
                true
            });
            if !first {
                return Err(Error::protocol(format!("manager of {token} reported twice")));
            }
            debug!(%token, %contact, "manager reported");
            return Ok(());
        }

        let mut manager_rx = {
            let mut pending = self.pending.write().await;
            let cohort = pending
                .get_mut(&token)
                .ok_or_else(|| Error::protocol(format!("unknown session {token}")))?;
            if rank > cohort.num_workers {
                return Err(Error::protocol(format!(
                    "rank {rank} is outside session {token} of {} workers",
                    cohort.num_workers
                )));
            }
            if !cohort.checked_in.insert(rank) {
                return Err(Error::protocol(format!(
                    "rank {rank} of {token} checked in twice"
                )));
            }
            cohort.manager.subscribe()
        };
        let manager = {
            let seen = timeout(self.config.spawn_timeout, manager_rx.wait_for(Option::is_some))
                .await
                .map_err(|_| Error::Spawn(format!("manager of {token} never reported")))?
                .map_err(|_| Error::Spawn(format!("session {token} was abandoned")))?;
            *seen
        };
        let manager = manager.ok_or_else(|| Error::protocol("manager address vanished"))?;

        link.tx.send_addr(Some(manager)).await?;
        {
            let mut pending = self.pending.write().await;
            if let Some(cohort) = pending.get_mut(&token) {
                cohort.workers_left = cohort.workers_left.saturating_sub(1);
                if cohort.workers_left == 0 {
                    pending.remove(&token);
                    debug!(%token, "every member checked in");
                }
            }
        }
        debug!(%token, rank, "worker sent to its manager");
        link.drain(self.config.session.transport.linger).await;
        Ok(())
    }

    async fn abandon(&self, token: SessionToken, cohort: Cohort, reason: &str) -> Result<()> {
        self.forget(&token).await;
        cohort.abort();
        Err(Error::Spawn(format!("session {token}: {reason}")))
    }

    async fn forget(&self, token: &SessionToken) {
        self.pending.write().await.remove(token);
    }

    /// Drops the session's entry if some worker never checks in.
    fn expire(&self, token: SessionToken) {
        let pending = self.pending.clone();
        let after = self.config.spawn_timeout;
        tokio::spawn(
            async move {
                tokio::time::sleep(after).await;
                if let Some(cohort) = pending.write().await.remove(&token) {
                    warn!(%token, workers_left = cohort.workers_left, "workers never checked in");
                }
            }
            .in_current_span(),
        );
    }
}
