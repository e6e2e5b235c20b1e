//! The members a broker spawns for one session: a manager at rank 0 and
//! workers at ranks 1..=N.

use std::net::SocketAddr;

use tracing::{debug, info_span, Instrument};
use typed_builder::TypedBuilder;

use crate::{
    config::SessionSettings,
    life::{Topology, MANAGER_RANK},
    net::{Endpoint, Hello, SessionToken},
    Error, Result,
};

pub mod halo;
pub mod mailbox;
pub mod manager;
pub mod spawner;
pub mod worker;

pub use manager::Manager;
pub use spawner::{Cohort, CohortRequest, CohortSpawner, ProcessSpawner, TaskSpawner};
pub use worker::Worker;

/// What a cohort member does, fixed once from its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manager { num_workers: usize },
    Worker { topology: Topology },
}

impl Role {
    pub fn from_rank(rank: u32, cohort_size: u32) -> Result<Self> {
        if cohort_size < 2 {
            return Err(Error::config(format!(
                "a cohort of {cohort_size} has no room for a manager and a worker"
            )));
        }
        if rank >= cohort_size {
            return Err(Error::config(format!(
                "rank {rank} is outside a cohort of {cohort_size}"
            )));
        }
        let num_workers = (cohort_size - 1) as usize;
        if rank == MANAGER_RANK {
            Ok(Role::Manager { num_workers })
        } else {
            let topology = Topology::resolve((rank - 1) as usize, num_workers)?;
            Ok(Role::Worker { topology })
        }
    }
}

/// Everything a spawned member is started with.
#[derive(Debug, Clone, TypedBuilder)]
pub struct MemberConfig {
    pub token: SessionToken,
    pub rank: u32,
    pub cohort_size: u32,
    /// Where to report in once the member's endpoint is up.
    pub broker: SocketAddr,
    #[builder(default)]
    pub session: SessionSettings,
}

/// Runs one cohort member to completion: binds its endpoint, checks in with
/// the broker and plays the role its rank dictates.
pub async fn run_member(config: MemberConfig) -> Result<()> {
    let role = Role::from_rank(config.rank, config.cohort_size)?;
    let span = match role {
        Role::Manager { num_workers } => {
            info_span!("manager", token = %config.token, num_workers)
        }
        Role::Worker { topology } => {
            info_span!("worker", token = %config.token, rank = topology.rank)
        }
    };

    async move {
        let settings = &config.session;
        let endpoint = Endpoint::bind(
            SocketAddr::new(settings.bind_ip, 0),
            settings.advertise_ip,
            &settings.transport,
        )?;
        let result = play(&endpoint, role, &config).await;
        endpoint.shutdown().await;
        result
    }
    .instrument(span)
    .await
}

async fn play(endpoint: &Endpoint, role: Role, config: &MemberConfig) -> Result<()> {
    match role {
        Role::Manager { num_workers } => {
            announce(endpoint, config).await?;
            Manager::establish(endpoint, num_workers, &config.session)
                .await?
                .run()
                .await
        }
        Role::Worker { topology } => {
            let manager = locate_manager(endpoint, config).await?;
            Worker::join(endpoint, manager, topology, &config.session)
                .await?
                .run()
                .await
        }
    }
}

/// Tells the broker where the client should find this manager.
async fn announce(endpoint: &Endpoint, config: &MemberConfig) -> Result<()> {
    let mut link = endpoint.connect(config.broker).await?;
    link.tx
        .send_hello(&Hello::Member {
            token: config.token,
            rank: MANAGER_RANK,
            contact: Some(endpoint.contact()),
        })
        .await?;
    link.drain(config.session.transport.linger).await;
    debug!(contact = %endpoint.contact(), "announced to broker");
    Ok(())
}

/// Asks the broker for the manager's address, which it hands out once the
/// manager has announced itself.
async fn locate_manager(endpoint: &Endpoint, config: &MemberConfig) -> Result<SocketAddr> {
    let mut link = endpoint.connect(config.broker).await?;
    link.tx
        .send_hello(&Hello::Member {
            token: config.token,
            rank: config.rank,
            contact: None,
        })
        .await?;
    let manager = link
        .rx
        .recv_addr()
        .await?
        .ok_or_else(|| Error::protocol("broker sent no manager address"))?;
    debug!(%manager, "manager located");
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn rank_zero_manages() {
        assert_eq!(
            Role::from_rank(0, 4).unwrap(),
            Role::Manager { num_workers: 3 }
        );
    }

    #[test]
    fn worker_ranks_shift_down_by_one() {
        let Role::Worker { topology } = Role::from_rank(1, 4).unwrap() else {
            panic!("rank 1 should be a worker");
        };
        assert_eq!(topology.rank, 0);
        assert_eq!(topology.prev, None);
        assert_eq!(topology.next, Some(1));

        let Role::Worker { topology } = Role::from_rank(3, 4).unwrap() else {
            panic!("rank 3 should be a worker");
        };
        assert_eq!(topology.rank, 2);
        assert_eq!(topology.next, None);
    }

    #[test]
    fn cohorts_need_a_manager_and_a_worker() {
        assert_eq!(Role::from_rank(0, 1).unwrap_err().kind(), ErrorKind::Config);
        assert_eq!(Role::from_rank(0, 0).unwrap_err().kind(), ErrorKind::Config);
        assert_eq!(Role::from_rank(4, 4).unwrap_err().kind(), ErrorKind::Config);
    }
}
