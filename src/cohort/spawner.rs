use std::{ffi::OsString, net::SocketAddr, path::PathBuf, process::Stdio};

use tokio::{
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn, Instrument};

use super::{run_member, MemberConfig};
use crate::{config::SessionSettings, net::SessionToken, Error, Result};

/// One cohort the broker wants started.
#[derive(Debug, Clone)]
pub struct CohortRequest {
    pub token: SessionToken,
    /// Manager plus workers.
    pub size: u32,
    pub broker: SocketAddr,
    pub session: SessionSettings,
}

impl CohortRequest {
    pub fn member(&self, rank: u32) -> MemberConfig {
        MemberConfig::builder()
            .token(self.token)
            .rank(rank)
            .cohort_size(self.size)
            .broker(self.broker)
            .session(self.session.clone())
            .build()
    }
}

/// Starts the members of a cohort. Members find their way back to the broker
/// on their own; the spawner only has to get them running.
pub trait CohortSpawner: Send + Sync + 'static {
    fn spawn(&self, request: &CohortRequest) -> Result<Cohort>;
}

enum Member {
    Process(Child),
    Task(JoinHandle<Result<()>>),
}

/// Handles on every member of a running cohort.
pub struct Cohort {
    token: SessionToken,
    members: Vec<Member>,
}

impl Cohort {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Kills every member.
    pub fn abort(self) {
        warn!(token = %self.token, "aborting cohort");
        for member in self.members {
            match member {
                Member::Process(mut child) => {
                    if let Err(err) = child.start_kill() {
                        debug!(%err, "member already gone");
                    }
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                Member::Task(handle) => handle.abort(),
            }
        }
    }

    /// Lets the members run on their own and logs how each one ends.
    pub fn detach(self) {
        let token = self.token;
        for (rank, member) in self.members.into_iter().enumerate() {
            match member {
                Member::Process(mut child) => {
                    tokio::spawn(async move {
                        match child.wait().await {
                            Ok(status) if status.success() => debug!(%token, rank, "member exited"),
                            Ok(status) => warn!(%token, rank, %status, "member failed"),
                            Err(err) => warn!(%token, rank, %err, "could not reap member"),
                        }
                    });
                }
                Member::Task(handle) => {
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(Ok(())) => debug!(%token, rank, "member finished"),
                            Ok(Err(err)) => warn!(%token, rank, %err, kind = %err.kind(), "member failed"),
                            Err(err) if err.is_cancelled() => {}
                            Err(err) => warn!(%token, rank, %err, "member panicked"),
                        }
                    });
                }
            }
        }
    }
}

/// Runs every member as a task inside the current runtime. Members still
/// talk to each other over QUIC, so this behaves like a cohort of processes
/// on one host.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskSpawner;

impl CohortSpawner for TaskSpawner {
    fn spawn(&self, request: &CohortRequest) -> Result<Cohort> {
        let members = (0..request.size)
            .map(|rank| {
                let config = request.member(rank);
                Member::Task(tokio::spawn(run_member(config).in_current_span()))
            })
            .collect();
        Ok(Cohort {
            token: request.token,
            members,
        })
    }
}

/// Launches each member as its own OS process running `program member ...`.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Spawns copies of the running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Command line for one member, as understood by the `member`
    /// subcommand of the `lifenet` binary.
    pub fn member_args(request: &CohortRequest, rank: u32) -> Vec<OsString> {
        let session = &request.session;
        let mut args: Vec<OsString> = vec![
            "member".into(),
            "--broker".into(),
            request.broker.to_string().into(),
            "--token".into(),
            request.token.to_string().into(),
            "--rank".into(),
            rank.to_string().into(),
            "--size".into(),
            request.size.to_string().into(),
            "--bind-ip".into(),
            session.bind_ip.to_string().into(),
            "--tick-ms".into(),
            session.tick_interval.as_millis().to_string().into(),
            "--max-cells".into(),
            session.max_cells.to_string().into(),
            "--keep-alive-ms".into(),
            session.transport.keep_alive_interval.as_millis().to_string().into(),
            "--linger-ms".into(),
            session.transport.linger.as_millis().to_string().into(),
        ];
        if let Some(ip) = session.advertise_ip {
            args.push("--advertise-ip".into());
            args.push(ip.to_string().into());
        }
        args
    }
}

impl CohortSpawner for ProcessSpawner {
    fn spawn(&self, request: &CohortRequest) -> Result<Cohort> {
        let mut members = Vec::with_capacity(request.size as usize);
        for rank in 0..request.size {
            let spawned = Command::new(&self.program)
                .args(Self::member_args(request, rank))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!(rank, pid = ?child.id(), "member spawned");
                    members.push(Member::Process(child));
                }
                Err(err) => {
                    // leave nothing of a half-started cohort behind
                    Cohort {
                        token: request.token,
                        members,
                    }
                    .abort();
                    return Err(Error::Spawn(format!(
                        "could not start rank {rank} from {}: {err}",
                        self.program.display()
                    )));
                }
            }
        }
        Ok(Cohort {
            token: request.token,
            members,
        })
    }
}
