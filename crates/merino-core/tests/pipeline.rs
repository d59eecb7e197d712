//! End-to-end pipeline tests: control channel + dispatch queue + worker
//! pool against an in-memory shepherd and a scripted sandbox provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use merino_config::ShepherdConfig;
use merino_core::environment::EnvironmentDescriptor;
use merino_core::job::{OrphanedResult, TestRequest, TestResult};
use merino_core::orphanage::OrphanSink;
use merino_core::protocol::SheepMessage;
use merino_core::provider::{HandleRange, SandboxProvider};
use merino_core::queue::DispatchQueue;
use merino_core::shepherd::{ControlChannel, SessionState};
use merino_core::shutdown::Shutdown;
use merino_core::worker::{WorkerContext, WorkerPool};
use merino_test_utils::provider::ScriptedProvider;
use merino_test_utils::shepherd::{ChannelTransport, ShepherdEnd};
use merino_test_utils::tracing_setup::init_test_tracing;

struct Fleet {
    shutdown: Shutdown,
    queue: Arc<DispatchQueue>,
    orphans: Arc<OrphanSink>,
    provider: Arc<ScriptedProvider>,
    sessions: mpsc::UnboundedReceiver<ShepherdEnd>,
    state: tokio::sync::watch::Receiver<SessionState>,
    channel_task: tokio::task::JoinHandle<()>,
    pool: WorkerPool,
}

/// Wire up a single-worker sheep against the in-memory shepherd. Fast
/// heartbeats and backoff keep reconnect tests snappy.
fn fleet(config: ShepherdConfig) -> Fleet {
    init_test_tracing();
    let shutdown = Shutdown::new();
    let queue = Arc::new(DispatchQueue::new(8, shutdown.clone()));
    let orphans = Arc::new(OrphanSink::new());
    let provider = Arc::new(ScriptedProvider::new(HandleRange::new(700, 709)));
    let (transport, sessions) = ChannelTransport::new();
    let (channel, router, state) = ControlChannel::new(
        Box::new(transport),
        &config,
        EnvironmentDescriptor::detect(),
        1,
        Arc::clone(&queue),
        Arc::clone(&orphans),
        shutdown.clone(),
    );
    let channel_task = tokio::spawn(channel.run());
    let pool = WorkerPool::spawn(
        1,
        WorkerContext {
            queue: Arc::clone(&queue),
            provider: Arc::clone(&provider) as Arc<dyn SandboxProvider>,
            router,
            shutdown: shutdown.clone(),
            create_timeout: Duration::from_secs(5),
        },
    );
    Fleet {
        shutdown,
        queue,
        orphans,
        provider,
        sessions,
        state,
        channel_task,
        pool,
    }
}

impl Fleet {
    async fn stop(self) {
        self.shutdown.trigger();
        self.pool.join().await;
        let _ = self.channel_task.await;
    }
}

fn quick_config() -> ShepherdConfig {
    ShepherdConfig {
        heartbeat_interval_ms: 50,
        heartbeat_failure_threshold: 2,
        reconnect_backoff_ms: 10,
        reconnect_backoff_max_ms: 50,
        ..ShepherdConfig::default()
    }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test step timed out")
}

fn orphan(request_id: u64) -> OrphanedResult {
    let request = TestRequest::new(request_id, "pass.sh", "sub");
    OrphanedResult {
        result: TestResult::infrastructure_failure(request_id, "produced offline"),
        request,
    }
}

#[tokio::test]
async fn test_assignments_processed_fifo_and_acked() {
    let mut fleet = fleet(ShepherdConfig::default());
    let mut end = within(fleet.sessions.recv()).await.unwrap();
    assert_eq!(within(end.accept(1)).await, 1);

    for id in 1..=4 {
        end.assign(TestRequest::new(id, "pass.sh", "sub"));
    }
    for expected in 1..=4u64 {
        let result = within(end.expect_result()).await;
        assert_eq!(result.request_id, expected);
        assert!(!result.failed);
    }

    // Every sandbox torn down.
    assert_eq!(fleet.provider.created().len(), 4);
    assert_eq!(fleet.provider.destroyed().len(), 4);
    assert!(fleet.orphans.is_empty().await);
    fleet.stop().await;
}

#[tokio::test]
async fn test_orphans_redelivered_in_order_before_new_assigns() {
    let fleet_cfg = ShepherdConfig::default();
    let mut fleet = fleet(fleet_cfg);
    // Results completed while no shepherd was reachable.
    fleet.orphans.push(orphan(100)).await;
    fleet.orphans.push(orphan(101)).await;

    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;

    // First frame after the handshake must be the oldest orphan.
    let first = match within(end.recv()).await.unwrap() {
        SheepMessage::SubmitResult { result } => result,
        other => panic!("expected submit_result, got {other:?}"),
    };
    assert_eq!(first.request_id, 100);

    // Assign mid-drain; it must not jump the redelivery.
    end.assign(TestRequest::new(5, "pass.sh", "sub"));
    end.ack_submit(100);

    let second = within(end.expect_result()).await;
    assert_eq!(second.request_id, 101);

    // Only now does the deferred assignment flow through a worker.
    let third = within(end.expect_result()).await;
    assert_eq!(third.request_id, 5);

    assert!(fleet.orphans.is_empty().await);
    fleet.stop().await;
}

#[tokio::test]
async fn test_assignment_during_failed_drain_survives_reconnect() {
    let mut fleet = fleet(quick_config());
    fleet.orphans.push(orphan(100)).await;
    fleet.orphans.push(orphan(101)).await;

    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;
    let first = match within(end.recv()).await.unwrap() {
        SheepMessage::SubmitResult { result } => result,
        other => panic!("expected submit_result, got {other:?}"),
    };
    assert_eq!(first.request_id, 100);

    // Assigned mid-drain, then the session dies before the orphan is
    // acked. The assignment must not vanish with it.
    end.assign(TestRequest::new(5, "pass.sh", "sub"));
    drop(end);

    // Next session: the full redelivery first, then the result of the
    // recovered assignment, executed exactly once.
    let mut next = within(fleet.sessions.recv()).await.unwrap();
    within(next.accept(2)).await;
    assert_eq!(within(next.expect_result()).await.request_id, 100);
    assert_eq!(within(next.expect_result()).await.request_id, 101);
    let recovered = within(next.expect_result()).await;
    assert_eq!(recovered.request_id, 5);
    assert!(!recovered.failed);
    assert_eq!(fleet.provider.created().len(), 1);
    assert_eq!(fleet.provider.destroyed().len(), 1);
    fleet.stop().await;
}

#[tokio::test]
async fn test_unacked_result_parked_before_disconnect_is_published() {
    // Long backoff so Disconnected stays observable on the state watch.
    let mut fleet = fleet(ShepherdConfig::default());
    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;

    let mut observer = fleet.state.clone();
    end.assign(TestRequest::new(7, "pass.sh", "sub"));
    loop {
        match within(end.recv()).await.unwrap() {
            SheepMessage::SubmitResult { result } => {
                assert_eq!(result.request_id, 7);
                break;
            }
            SheepMessage::Heartbeat => end.ack_heartbeat(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    drop(end);

    // By the time the disconnect is visible, the unacked result has
    // already been parked; a worker orphaning at this instant cannot get
    // ahead of it in the sink.
    within(observer.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .unwrap();
    assert_eq!(fleet.orphans.len().await, 1);
    fleet.stop().await;
}

#[tokio::test]
async fn test_heartbeat_loss_triggers_reconnect_with_new_epoch() {
    let mut fleet = fleet(quick_config());

    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;
    within(fleet.state.wait_for(|s| *s == SessionState::Connected { epoch: 1 }))
        .await
        .unwrap();

    // Ignore every heartbeat; after the threshold the sheep declares the
    // session lost and dials again.
    let mut next = within(fleet.sessions.recv()).await.unwrap();
    within(fleet.state.wait_for(|s| !s.is_connected()))
        .await
        .unwrap();
    within(next.accept(2)).await;
    within(fleet.state.wait_for(|s| *s == SessionState::Connected { epoch: 2 }))
        .await
        .unwrap();

    drop(end);
    fleet.stop().await;
}

#[tokio::test]
async fn test_session_drop_orphans_unacked_result_then_redelivers() {
    let mut fleet = fleet(quick_config());

    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;

    end.assign(TestRequest::new(7, "pass.sh", "sub"));
    // Wait for the submission but never ack it; then hang up.
    loop {
        match within(end.recv()).await.unwrap() {
            SheepMessage::SubmitResult { result } => {
                assert_eq!(result.request_id, 7);
                break;
            }
            SheepMessage::Heartbeat => end.ack_heartbeat(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    drop(end);

    // The unacked result survives as an orphan and leads the next session.
    let mut next = within(fleet.sessions.recv()).await.unwrap();
    within(next.accept(2)).await;
    let redelivered = within(next.expect_result()).await;
    assert_eq!(redelivered.request_id, 7);
    assert!(fleet.orphans.is_empty().await);

    // At-least-once delivery: the same request id may reach the shepherd
    // twice, exactly one sandbox ran it.
    assert_eq!(fleet.provider.created().len(), 1);
    assert_eq!(fleet.provider.destroyed().len(), 1);
    fleet.stop().await;
}

#[tokio::test]
async fn test_workers_keep_draining_while_disconnected() {
    // Default timings: the first dial's handshake wait is far longer than
    // this test, so the session end stays live until accepted.
    let mut fleet = fleet(ShepherdConfig::default());

    // Requests queued directly (as if assigned just before the loss).
    for id in 20..23 {
        fleet.queue.put(TestRequest::new(id, "pass.sh", "sub")).await.unwrap();
    }

    // No session accepted yet: the channel is still handshaking, but the
    // workers run every request anyway; results pile up in the sink.
    within(async {
        while fleet.orphans.len().await < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(fleet.queue.is_empty().await);
    assert_eq!(fleet.provider.destroyed().len(), 3);

    // First accepted session starts with the full backlog, in order.
    let mut end = within(fleet.sessions.recv()).await.unwrap();
    within(end.accept(1)).await;
    for expected in 20..23u64 {
        let result = within(end.expect_result()).await;
        assert_eq!(result.request_id, expected);
    }
    fleet.stop().await;
}
