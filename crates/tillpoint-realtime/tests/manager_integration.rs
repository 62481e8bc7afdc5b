//! Integration tests for the channel connection manager.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::{fast_config, settle, TestContext};
use tillpoint_proto::{ChangeNotification, ChannelStatus, EventKind};
use tillpoint_realtime::{ConnectionPhase, SubscriptionSpec};

fn counting(table: &str, counter: &Arc<AtomicUsize>) -> SubscriptionSpec {
    let counter = counter.clone();
    SubscriptionSpec::new(table, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn test_insert_routed_to_filtered_subscription() {
    let ctx = TestContext::new(fast_config());
    let calls = Arc::new(AtomicUsize::new(0));

    ctx.manager
        .subscribe(
            counting("orders", &calls)
                .with_event(EventKind::Insert)
                .with_filter("franchise_id=eq.F1"),
        )
        .await
        .unwrap();
    settle().await;
    assert!(ctx.manager.state().is_connected());

    ctx.backend.publish(ChangeNotification::insert(
        "orders",
        json!({"id": "o1", "franchise_id": "F1", "status": "pending"}),
    ));
    ctx.backend.publish(ChangeNotification::insert(
        "orders",
        json!({"id": "o2", "franchise_id": "F2", "status": "pending"}),
    ));
    ctx.backend.publish(ChangeNotification::update(
        "orders",
        json!({"id": "o1"}),
        json!({"id": "o1", "franchise_id": "F1", "status": "ready"}),
    ));
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_channel_under_churn() {
    let ctx = TestContext::new(fast_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for round in 0..5 {
        let subscribes = (0..4).map(|_| ctx.manager.subscribe(counting("orders", &calls)));
        for id in futures::future::join_all(subscribes).await {
            ids.push(id.unwrap());
        }
        if round % 2 == 0 {
            ctx.backend.emit_status(ChannelStatus::ChannelError, Some("socket reset"));
        }
        let unsubscribes = ids.drain(..2).map(|id| {
            let manager = ctx.manager.clone();
            async move { manager.unsubscribe(id).await }
        });
        futures::future::join_all(unsubscribes).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ctx.backend.live_channels() <= 1);
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ctx.backend.peak_live_channels(), 1);
    assert_eq!(ctx.backend.live_channels(), 1);
    assert_eq!(ctx.manager.state().subscriptions, ids.len());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_added_during_setup_receives_events() {
    let ctx = TestContext::new(fast_config());
    ctx.backend.set_auto_ack(false);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    ctx.manager.subscribe(counting("orders", &first)).await.unwrap();
    settle().await;
    assert_eq!(ctx.manager.state().phase, ConnectionPhase::Connecting);

    ctx.manager
        .subscribe(counting("order_items", &second))
        .await
        .unwrap();
    settle().await;
    assert_eq!(ctx.backend.channel_opens().len(), 1);

    ctx.backend.acknowledge();
    settle().await;
    assert!(ctx.manager.state().is_connected());
    assert_eq!(ctx.backend.current_bindings().len(), 2);

    ctx.backend
        .publish(ChangeNotification::insert("order_items", json!({"id": "i1", "order_id": "o1"})));
    settle().await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(first.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_added_during_backoff_is_rearmed() {
    let ctx = TestContext::new(fast_config());
    let late = Arc::new(AtomicUsize::new(0));

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    settle().await;
    assert_eq!(ctx.manager.state().phase, ConnectionPhase::Reconnecting);

    ctx.manager.subscribe(counting("menu_items", &late)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let state = ctx.manager.state();
    assert!(state.is_connected());
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(ctx.backend.channel_opens().len(), 2);

    ctx.backend
        .publish(ChangeNotification::insert("menu_items", json!({"id": "m1"})));
    settle().await;
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_between_failures() {
    let ctx = TestContext::new(fast_config().with_setup_timeout(Duration::from_secs(30)));
    ctx.backend.set_auto_ack(false);

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    assert_eq!(ctx.backend.channel_opens().len(), 1);

    let base = Duration::from_millis(100);
    let mut previous_gap = Duration::ZERO;
    for attempt in 0..3u32 {
        let failed_at = Instant::now();
        ctx.backend.emit_status(ChannelStatus::ChannelError, Some("channel error"));
        settle().await;
        assert_eq!(ctx.manager.state().reconnect_attempts, attempt + 1);
        assert_eq!(ctx.manager.state().phase, ConnectionPhase::Reconnecting);

        let expected = base * 2u32.pow(attempt);
        tokio::time::sleep(expected.mul_f64(1.2) + Duration::from_millis(5)).await;

        let opens = ctx.backend.channel_opens();
        assert_eq!(opens.len(), attempt as usize + 2);
        let gap = opens[opens.len() - 1] - failed_at;
        assert!(gap >= expected, "attempt {attempt}: {gap:?} < {expected:?}");
        assert!(gap <= expected.mul_f64(1.2) + Duration::from_millis(1));
        assert!(gap >= previous_gap);
        previous_gap = gap;
    }

    let state = ctx.manager.state();
    assert_eq!(state.reconnect_attempts, 3);
    assert_eq!(state.last_error.as_deref(), Some("channel error"));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let ctx = TestContext::new(
        fast_config()
            .with_max_reconnect_attempts(3)
            .with_setup_timeout(Duration::from_millis(500)),
    );
    ctx.backend.set_auto_ack(false);

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;

    ctx.backend.emit_status(ChannelStatus::Closed, Some("server closed"));
    settle().await;
    assert_eq!(ctx.manager.state().reconnect_attempts, 1);

    // The next two attempts time out waiting for the acknowledgment.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let state = ctx.manager.state();
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert_eq!(state.reconnect_attempts, 3);
    assert!(state.retries_exhausted);
    assert!(state.last_error.as_deref().unwrap().contains("timed out"));
    assert_eq!(ctx.backend.channel_opens().len(), 3);
    assert_eq!(ctx.backend.live_channels(), 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(ctx.backend.channel_opens().len(), 3);

    // A new subscription starts over.
    ctx.backend.set_auto_ack(true);
    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    let state = ctx.manager.state();
    assert!(state.is_connected());
    assert!(!state.retries_exhausted);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(state.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_triggers_reconnect() {
    let ctx = TestContext::new(fast_config().with_setup_timeout(Duration::from_millis(500)));
    ctx.backend.set_auto_ack(false);

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(501)).await;

    let state = ctx.manager.state();
    assert_eq!(state.phase, ConnectionPhase::Reconnecting);
    assert_eq!(state.reconnect_attempts, 1);
    assert_eq!(ctx.backend.live_channels(), 0);

    ctx.backend.set_auto_ack(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(ctx.manager.state().is_connected());
    assert_eq!(ctx.backend.live_channels(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resource_exhaustion_cooldown() {
    let ctx = TestContext::new(fast_config().with_resource_cooldown(Duration::from_secs(5)));

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    ctx.backend
        .emit_status(ChannelStatus::ChannelError, Some("Too many connections"));
    settle().await;
    assert!(ctx.manager.state().resource_constrained);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(ctx.backend.channel_opens().len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(ctx.backend.channel_opens().len(), 2);
    let state = ctx.manager.state();
    assert!(state.is_connected());
    assert!(!state.resource_constrained);
}

#[tokio::test(start_paused = true)]
async fn test_min_spacing_after_short_lived_success() {
    let ctx = TestContext::new(fast_config().with_min_reconnect_spacing(Duration::from_secs(2)));

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    let connected_at = ctx.manager.state().last_connected_at.unwrap();

    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctx.backend.channel_opens().len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let opens = ctx.backend.channel_opens();
    assert_eq!(opens.len(), 2);
    assert!(opens[1] - connected_at >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_attempts_reset_after_quiet_period() {
    let ctx = TestContext::new(
        fast_config()
            .with_attempt_reset_after(Duration::from_secs(1))
            .with_setup_timeout(Duration::from_secs(30)),
    );
    ctx.backend.set_auto_ack(false);

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;

    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    settle().await;
    assert_eq!(ctx.manager.state().reconnect_attempts, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    settle().await;
    assert_eq!(ctx.manager.state().reconnect_attempts, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    settle().await;
    assert_eq!(ctx.manager.state().reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_offline_then_online() {
    let ctx = TestContext::new(fast_config());

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    ctx.backend.emit_status(ChannelStatus::ChannelError, None);
    settle().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(ctx.manager.state().is_connected());

    ctx.connectivity.set_offline();
    settle().await;
    let state = ctx.manager.state();
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert!(!state.online);
    assert_eq!(ctx.backend.live_channels(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ctx.backend.channel_opens().len(), 2);

    let online_at = Instant::now();
    ctx.connectivity.set_online();
    settle().await;
    let opens = ctx.backend.channel_opens();
    assert_eq!(opens.len(), 3);
    assert!(opens[2] - online_at <= Duration::from_millis(1));

    let state = ctx.manager.state();
    assert!(state.is_connected());
    assert!(state.online);
    assert_eq!(state.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_does_not_block_others() {
    let ctx = TestContext::new(fast_config());
    let calls = Arc::new(AtomicUsize::new(0));

    ctx.manager
        .subscribe(SubscriptionSpec::new("orders", |_| panic!("broken feature")))
        .await
        .unwrap();
    ctx.manager.subscribe(counting("orders", &calls)).await.unwrap();
    settle().await;

    for i in 0..3 {
        ctx.backend
            .publish(ChangeNotification::insert("orders", json!({"id": format!("o{i}")})));
    }
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(ctx.manager.state().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_idle_channel_torn_down_after_grace() {
    let ctx = TestContext::new(fast_config());

    let id = ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    assert!(ctx.manager.unsubscribe(id).await);
    assert!(!ctx.manager.unsubscribe(id).await);

    // Remount within the grace period reuses the channel.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ctx.backend.live_channels(), 1);
    let id = ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ctx.backend.live_channels(), 1);
    assert_eq!(ctx.backend.channel_opens().len(), 1);

    ctx.manager.unsubscribe(id).await;
    tokio::time::sleep(Duration::from_millis(1001)).await;
    let state = ctx.manager.state();
    assert_eq!(ctx.backend.live_channels(), 0);
    assert_eq!(state.phase, ConnectionPhase::Disconnected);
    assert_eq!(state.subscriptions, 0);
    assert_eq!(state.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_above_ceiling() {
    let ctx = TestContext::new(fast_config().with_backpressure(2, Duration::from_millis(100)));

    let start = Instant::now();
    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(ctx.manager.state().subscriptions, 3);
}

#[tokio::test(start_paused = true)]
async fn test_state_watch_reports_transitions() {
    let ctx = TestContext::new(fast_config());
    let mut rx = ctx.manager.watch_state();

    ctx.manager.subscribe(SubscriptionSpec::new("orders", |_| {})).await.unwrap();
    settle().await;
    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().is_connected());

    ctx.backend.emit_status(ChannelStatus::TimedOut, None);
    rx.changed().await.unwrap();
    let state = rx.borrow_and_update().clone();
    assert_eq!(state.phase, ConnectionPhase::Reconnecting);
    assert_eq!(state.last_error.as_deref(), Some("channel status TimedOut"));
}
