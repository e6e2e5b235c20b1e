use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use typed_builder::TypedBuilder;

/// Port the broker listens on unless told otherwise.
pub const DEFAULT_BROKER_PORT: u16 = 4710;

/// Largest grid a manager accepts from a client, in cells (4096 x 4096).
pub const DEFAULT_MAX_CELLS: usize = 1 << 24;

/// QUIC tuning shared by every endpoint a process opens.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TransportSettings {
    #[builder(default = Duration::from_secs(1))]
    pub keep_alive_interval: Duration,
    /// How long a side that has said its last word waits for the peer to
    /// hang up before closing anyway.
    #[builder(default = Duration::from_secs(5))]
    pub linger: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Settings every member of a cohort is started with.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SessionSettings {
    /// Spacing between ticks. Zero lets the control loop free-run.
    #[builder(default)]
    pub tick_interval: Duration,
    /// Upper bound on `height * width` for a session's grid. Larger grids
    /// are refused before anything is allocated for them.
    #[builder(default = DEFAULT_MAX_CELLS)]
    pub max_cells: usize,
    #[builder(default = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind_ip: IpAddr,
    /// IP put into contact addresses when `bind_ip` is not reachable as is.
    #[builder(default, setter(strip_option))]
    pub advertise_ip: Option<IpAddr>,
    #[builder(default)]
    pub transport: TransportSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What the broker does with a client once `max_pending_sessions` cohorts
/// are already being set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Hold the client until a slot frees up.
    #[default]
    Queue,
    /// Close the client's connection straight away.
    Reject,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct BrokerConfig {
    #[builder(default = SocketAddr::from(([127, 0, 0, 1], DEFAULT_BROKER_PORT)))]
    pub listen: SocketAddr,
    #[builder(default, setter(strip_option))]
    pub advertise_ip: Option<IpAddr>,
    #[builder(default = 5)]
    pub max_pending_sessions: usize,
    #[builder(default)]
    pub overflow: OverflowPolicy,
    #[builder(default = 64)]
    pub max_workers: u32,
    /// Upper bound on waiting for a spawned cohort to check in.
    #[builder(default = Duration::from_secs(30))]
    pub spawn_timeout: Duration,
    #[builder(default)]
    pub session: SessionSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
