#![cfg(all(feature = "client", feature = "broker"))]

use std::{net::SocketAddr, time::Duration};

use lifenet::{
    broker::Broker,
    client::Client,
    cohort::TaskSpawner,
    config::{BrokerConfig, SessionSettings},
    life::Grid,
    ErrorKind,
};
use rand::{rngs::StdRng, SeedableRng};

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn paced(millis: u64) -> SessionSettings {
    SessionSettings::builder()
        .tick_interval(Duration::from_millis(millis))
        .build()
}

/// A broker running in the background whose cohorts are tasks of this test.
fn broker(session: SessionSettings) -> Broker {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = BrokerConfig::builder()
        .listen(loopback())
        .spawn_timeout(Duration::from_secs(10))
        .session(session)
        .build();
    let broker = Broker::bind(config, TaskSpawner).unwrap();
    let serving = broker.clone();
    tokio::spawn(async move { serving.serve().await });
    broker
}

fn client() -> Client {
    Client::bind(&SessionSettings::default()).unwrap()
}

fn generations_between(start: &Grid, later: &Grid, limit: usize) -> Option<usize> {
    let mut grid = start.clone();
    for n in 0..=limit {
        if &grid == later {
            return Some(n);
        }
        grid = grid.step();
    }
    None
}

#[tokio::test]
async fn snapshot_before_any_tick_returns_the_grid_sent() {
    let broker = broker(paced(300));
    let client = client();
    let grid = Grid::random(20, 12, 0.5, &mut StdRng::seed_from_u64(1)).unwrap();

    let mut session = client.start(broker.contact(), 3, &grid).await.unwrap();
    assert_eq!(session.snapshot().await.unwrap(), grid);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn paced_snapshots_advance_one_generation_per_tick() {
    let broker = broker(paced(150));
    let client = client();
    let grid = Grid::random(16, 16, 0.45, &mut StdRng::seed_from_u64(7)).unwrap();

    let mut session = client.start(broker.contact(), 4, &grid).await.unwrap();
    let mut expected = grid.clone();
    for _ in 0..3 {
        assert_eq!(session.snapshot().await.unwrap(), expected);
        // the tick that carried the snapshot also stepped the grid
        expected = expected.step();
    }
    session.stop().await.unwrap();
}

#[tokio::test]
async fn free_running_cohort_matches_sequential_steps() {
    let broker = broker(SessionSettings::default());
    let client = client();
    let grid = Grid::random(30, 10, 0.4, &mut StdRng::seed_from_u64(99)).unwrap();

    let mut session = client.start(broker.contact(), 5, &grid).await.unwrap();
    let mut previous = grid.clone();
    for _ in 0..3 {
        let snapshot = session.snapshot().await.unwrap();
        assert!(
            generations_between(&previous, &snapshot, 100_000).is_some(),
            "snapshot is not a later generation"
        );
        previous = snapshot;
    }
    session.stop().await.unwrap();
}

#[tokio::test]
async fn single_worker_cohort() {
    let broker = broker(paced(100));
    let client = client();
    let grid = Grid::from_rows(&[[1u8, 1, 1, 0], [1, 1, 0, 0], [0, 1, 0, 1], [1, 0, 1, 0]]).unwrap();

    let mut session = client.start(broker.contact(), 1, &grid).await.unwrap();
    assert_eq!(session.snapshot().await.unwrap(), grid);
    assert_eq!(session.snapshot().await.unwrap(), grid.step());
    session.stop().await.unwrap();
}

#[tokio::test]
async fn one_row_per_worker() {
    let broker = broker(paced(100));
    let client = client();
    let grid = Grid::random(6, 5, 0.5, &mut StdRng::seed_from_u64(3)).unwrap();

    let mut session = client.start(broker.contact(), 6, &grid).await.unwrap();
    assert_eq!(session.snapshot().await.unwrap(), grid);
    assert_eq!(session.snapshot().await.unwrap(), grid.step());
    session.stop().await.unwrap();
}

#[tokio::test]
async fn stop_right_after_setup() {
    let broker = broker(SessionSettings::default());
    let client = client();
    let grid = Grid::random(8, 8, 0.5, &mut StdRng::seed_from_u64(4)).unwrap();

    let session = client.start(broker.contact(), 2, &grid).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), session.stop())
        .await
        .expect("cohort did not wind down")
        .unwrap();
}

#[tokio::test]
async fn concurrent_sessions_are_independent() {
    let broker = broker(paced(100));
    let a = Grid::random(10, 10, 0.5, &mut StdRng::seed_from_u64(10)).unwrap();
    let b = Grid::random(12, 6, 0.5, &mut StdRng::seed_from_u64(11)).unwrap();

    let run = |grid: Grid, workers| {
        let contact = broker.contact();
        async move {
            let client = client();
            let mut session = client.start(contact, workers, &grid).await.unwrap();
            assert_eq!(session.snapshot().await.unwrap(), grid);
            session.stop().await.unwrap();
        }
    };
    tokio::join!(run(a, 2), run(b, 3));
}

#[tokio::test]
async fn zero_workers_are_refused() {
    let broker = broker(SessionSettings::default());
    let err = client()
        .request_cohort(broker.contact(), 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn worker_limit_is_enforced() {
    let broker = broker(SessionSettings::default());
    let err = client()
        .request_cohort(broker.contact(), 65)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn more_workers_than_rows_ends_the_session() {
    let broker = broker(SessionSettings::default());
    let client = client();
    let grid = Grid::random(2, 4, 0.5, &mut StdRng::seed_from_u64(5)).unwrap();

    let mut session = client.start(broker.contact(), 3, &grid).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), session.snapshot())
        .await
        .expect("manager kept the session open")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn grid_over_the_cell_limit_ends_the_session_and_spares_the_broker() {
    let broker = broker(SessionSettings::builder().max_cells(64).build());
    let client = client();
    let big = Grid::random(9, 8, 0.5, &mut StdRng::seed_from_u64(6)).unwrap();

    let refused = async {
        let mut session = client.start(broker.contact(), 2, &big).await?;
        session.snapshot().await
    };
    let err = tokio::time::timeout(Duration::from_secs(10), refused)
        .await
        .expect("manager accepted an oversize grid")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    // the broker still serves sessions within the limit
    let small = Grid::random(8, 8, 0.5, &mut StdRng::seed_from_u64(6)).unwrap();
    let mut session = client.start(broker.contact(), 2, &small).await.unwrap();
    assert_eq!(session.snapshot().await.unwrap().height(), 8);
    session.stop().await.unwrap();
}
