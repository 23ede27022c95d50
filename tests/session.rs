mod common;

use common::*;
use serde_json::json;
use slotsync::{
    AvailabilitySession, ClaimState, ConnectionState, SelectError, SlotView, SubscriptionKey,
    SyncConfig, SyncNotification,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

async fn wait_view(rx: &mut watch::Receiver<SlotView>, f: impl FnMut(&SlotView) -> bool) -> SlotView {
    rx.wait_for(f).await.unwrap().clone()
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    rx.wait_for(|s| *s == state).await.unwrap();
}

async fn wait_claim(rx: &mut watch::Receiver<ClaimState>, state: ClaimState) {
    rx.wait_for(|s| *s == state).await.unwrap();
}

/// Subscribe and complete the snapshot handshake; returns the live server end
async fn live_session(
    config: &SyncConfig,
    slots: &[(&str, u32, u32)],
) -> (slotsync::SessionHandle, ServerSide, mpsc::UnboundedReceiver<ServerSide>) {
    let (connector, mut servers) = FakeConnector::new();
    let (handle, _task) = AvailabilitySession::spawn(config, connector);
    handle.subscribe(key()).await.unwrap();

    let mut server = servers.recv().await.unwrap();
    assert_eq!(server.next_frame().await["type"], "subscribe");
    server.send_json(snapshot(1, slots));

    let mut view = handle.watch_view();
    wait_view(&mut view, |v| !v.stale && !v.is_empty()).await;
    (handle, server, servers)
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_moves_session_to_subscribed() {
    let (connector, mut servers) = FakeConnector::new();
    let (handle, _task) = AvailabilitySession::spawn(&test_config("client-a"), connector);
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

    handle.subscribe(key()).await.unwrap();
    let mut server = servers.recv().await.unwrap();

    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["providerId"], "dr-pedro");
    assert_eq!(frame["serviceId"], "cleaning");
    assert_eq!(frame["date"], "2026-10-20");
    assert_eq!(frame["snapshot"], true);
    assert!(handle.view().stale);

    server.send_json(snapshot(1, &[("09:00", 1, 0), ("09:30", 2, 2)]));
    let mut state = handle.watch_connection();
    wait_state(&mut state, ConnectionState::Subscribed).await;

    let view = wait_view(&mut handle.watch_view(), |v| !v.stale).await;
    assert_eq!(view.len(), 2);
    assert!(view.is_available(at(9, 0)));
    assert!(!view.is_available(at(9, 30)));
    assert!(view.last_update.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let (handle, server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 2, 0)]).await;

    server.send_raw("{not json");
    server.send_json(json!({ "type": "slot_teleported", "providerId": "dr-pedro" }));
    server.send_json(json!({ "type": "slot_booked", "providerId": "dr-pedro", "date": "2026-10-20", "timestamp": 2 }));
    server.send_json(slot_event("slot_booked", 3, "09:00"));

    let view = wait_view(&mut handle.watch_view(), |v| {
        v.get(at(9, 0)).is_some_and(|s| s.current_bookings() == 1)
    })
    .await;
    assert!(!view.stale);
    assert_eq!(handle.connection_state(), ConnectionState::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_state_with_fresh_snapshot() {
    let (handle, server, mut servers) =
        live_session(&test_config("client-a"), &[("09:00", 3, 0), ("09:30", 1, 0)]).await;
    let mut view = handle.watch_view();

    server.send_json(slot_event("slot_booked", 2, "09:00"));
    server.send_json(slot_event("slot_booked", 3, "09:00"));
    server.send_json(slot_event("slot_booked", 4, "09:30"));
    wait_view(&mut view, |v| {
        v.get(at(9, 0)).is_some_and(|s| s.current_bookings() == 2)
            && v.get(at(9, 30)).is_some_and(|s| s.current_bookings() == 1)
    })
    .await;

    server.close();
    let mut state = handle.watch_connection();
    wait_state(&mut state, ConnectionState::Reconnecting).await;
    let lost_at = Instant::now();
    assert!(handle.view().stale);

    let mut server = servers.recv().await.unwrap();
    let waited = Instant::now() - lost_at;
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));

    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["snapshot"], true);

    // Old data stays renderable but flagged until the snapshot lands
    let stale = handle.view();
    assert!(stale.stale);
    assert_eq!(stale.get(at(9, 0)).unwrap().current_bookings(), 2);

    server.send_json(snapshot(10, &[("09:00", 3, 1), ("09:30", 1, 0)]));
    let fresh = wait_view(&mut view, |v| !v.stale).await;
    assert_eq!(fresh.get(at(9, 0)).unwrap().current_bookings(), 1);
    assert_eq!(fresh.get(at(9, 30)).unwrap().current_bookings(), 0);

    // Events older than the snapshot no longer apply
    server.send_json(slot_event("slot_released", 3, "09:00"));
    server.send_json(slot_event("slot_booked", 11, "09:30"));
    let latest = wait_view(&mut view, |v| {
        v.get(at(9, 30)).is_some_and(|s| s.current_bookings() == 1)
    })
    .await;
    assert_eq!(latest.get(at(9, 0)).unwrap().current_bookings(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_selection_makes_no_network_call() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0), ("09:30", 1, 0)]).await;

    let update = handle.select(at(9, 0)).await.unwrap();
    assert_eq!(update.state, ClaimState::Pending);

    let claim = server.next_frame().await;
    assert_eq!(claim["type"], "claim_slot");
    assert_eq!(claim["time"], "09:00");
    assert_eq!(claim["clientId"], "client-a");
    assert_eq!(server.next_frame().await["type"], "slot_selected");

    let view = handle.view();
    assert_eq!(view.claimed, Some(at(9, 0)));
    assert!(!view.is_available(at(9, 0)));
    assert_eq!(view.get(at(9, 0)).unwrap().current_bookings(), 0);

    let err = handle.select(at(9, 30)).await.unwrap_err();
    assert!(matches!(err, SelectError::ClaimInProgress(_)));
    assert!(server.try_next_frame(Duration::from_secs(5)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_selection_refused_before_snapshot() {
    let (connector, mut servers) = FakeConnector::new();
    let (handle, _task) = AvailabilitySession::spawn(&test_config("client-a"), connector);

    assert_eq!(handle.select(at(9, 0)).await, Err(SelectError::NotSubscribed));

    handle.subscribe(key()).await.unwrap();
    let mut server = servers.recv().await.unwrap();
    server.next_frame().await;

    assert_eq!(handle.select(at(9, 0)).await, Err(SelectError::StaleData));
    assert!(server.try_next_frame(Duration::from_secs(5)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_two_clients_race_for_last_seat() {
    let slots = [("09:00", 1, 0), ("09:30", 1, 0)];
    let (a, mut server_a, _sa) = live_session(&test_config("client-a"), &slots).await;
    let (b, mut server_b, _sb) = live_session(&test_config("client-b"), &slots).await;

    a.select(at(9, 0)).await.unwrap();
    b.select(at(9, 0)).await.unwrap();
    assert_eq!(server_a.next_frame().await["clientId"], "client-a");
    assert_eq!(server_b.next_frame().await["clientId"], "client-b");
    server_a.next_frame().await;
    server_b.next_frame().await;

    // Server commits A first
    server_a.send_json(claim_result("client-a", "09:00", "confirmed"));
    server_a.send_json(slot_event("slot_booked", 2, "09:00"));
    server_b.send_json(slot_event("slot_booked", 2, "09:00"));
    let mut rejected = claim_result("client-b", "09:00", "rejected");
    rejected["reason"] = json!("slot no longer available");
    server_b.send_json(rejected);

    wait_claim(&mut a.watch_claim(), ClaimState::Confirmed).await;
    wait_claim(&mut b.watch_claim(), ClaimState::Rejected).await;

    let view_b = b.view();
    assert_eq!(view_b.claimed, None);
    assert!(!view_b.is_available(at(9, 0)));
    assert_eq!(view_b.get(at(9, 0)).unwrap().current_bookings(), 1);
    assert_eq!(view_b.available_times(), vec![at(9, 30)]);

    // B's view already agreed with the server, so no resync was needed
    assert!(server_b.try_next_frame(Duration::from_secs(5)).await.is_none());

    assert_eq!(a.view().claimed, Some(at(9, 0)));
    assert_eq!(b.select(at(9, 30)).await.unwrap().state, ClaimState::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_against_stale_view_requests_snapshot() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0)]).await;

    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    server.send_json(claim_result("client-a", "09:00", "rejected"));
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "request_snapshot");
    assert_eq!(frame["serviceId"], "cleaning");
    wait_claim(&mut handle.watch_claim(), ClaimState::Rejected).await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_claim_expires_after_two_minutes() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0)]).await;
    let mut claim = handle.watch_claim();

    let selected_at = Instant::now();
    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    wait_claim(&mut claim, ClaimState::Expired).await;
    let elapsed = Instant::now() - selected_at;
    assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121));

    let view = handle.view();
    assert_eq!(view.claimed, None);
    assert!(view.is_available(at(9, 0)));

    // Expired claims are not resent
    assert!(server.try_next_frame(Duration::from_secs(5)).await.is_none());

    // A late confirmation for the abandoned claim is handed back
    server.send_json(claim_result("client-a", "09:00", "confirmed"));
    let release = server.next_frame().await;
    assert_eq!(release["type"], "release_slot");
    assert_eq!(release["time"], "09:00");
    assert_eq!(handle.claim_state(), ClaimState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_claim_expires_while_reconnect_hangs() {
    let (connector, mut servers) = FakeConnector::hanging_after(1);
    let (handle, task) = AvailabilitySession::spawn(&test_config("client-a"), connector.clone());
    handle.subscribe(key()).await.unwrap();
    let mut server = servers.recv().await.unwrap();
    server.next_frame().await;
    server.send_json(snapshot(1, &[("09:00", 1, 0), ("09:30", 1, 0)]));
    wait_view(&mut handle.watch_view(), |v| !v.stale).await;

    let selected_at = Instant::now();
    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    tokio::time::sleep(Duration::from_secs(115)).await;
    server.close();
    wait_state(&mut handle.watch_connection(), ConnectionState::Connecting).await;

    // Commands are served while the connect is outstanding
    let err = handle.select(at(9, 30)).await.unwrap_err();
    assert!(matches!(err, SelectError::ClaimInProgress(_)));

    wait_claim(&mut handle.watch_claim(), ClaimState::Expired).await;
    let elapsed = Instant::now() - selected_at;
    assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121));
    assert_eq!(handle.connection_state(), ConnectionState::Connecting);
    assert_eq!(connector.attempts().len(), 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_pending_claim_survives_reconnect() {
    let (handle, mut server, mut servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0)]).await;

    handle.select(at(9, 0)).await.unwrap();
    assert_eq!(server.next_frame().await["type"], "claim_slot");
    server.next_frame().await;

    server.close();
    wait_state(&mut handle.watch_connection(), ConnectionState::Reconnecting).await;
    assert_eq!(handle.claim_state(), ClaimState::Pending);

    let mut server = servers.recv().await.unwrap();
    assert_eq!(server.next_frame().await["type"], "subscribe");
    let claim = server.next_frame().await;
    assert_eq!(claim["type"], "claim_slot");
    assert_eq!(claim["time"], "09:00");
    assert_eq!(claim["clientId"], "client-a");
    assert_eq!(handle.claim_state(), ClaimState::Pending);

    server.send_json(snapshot(5, &[("09:00", 1, 0)]));
    server.send_json(claim_result("client-a", "09:00", "confirmed"));
    wait_claim(&mut handle.watch_claim(), ClaimState::Confirmed).await;
    assert_eq!(handle.view().claimed, Some(at(9, 0)));
}

#[tokio::test(start_paused = true)]
async fn test_claim_expired_during_outage_is_not_resent() {
    let mut config = test_config("client-a");
    config.reservation.claim_timeout_ms = 500;
    let (handle, mut server, mut servers) = live_session(&config, &[("09:00", 1, 0)]).await;

    let selected_at = Instant::now();
    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;
    server.close();

    wait_claim(&mut handle.watch_claim(), ClaimState::Expired).await;
    assert!(Instant::now() - selected_at < Duration::from_secs(1));

    let mut server = servers.recv().await.unwrap();
    assert_eq!(server.next_frame().await["type"], "subscribe");
    assert!(server.try_next_frame(Duration::from_secs(5)).await.is_none());
    assert_eq!(handle.claim_state(), ClaimState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_stops_expiry_and_finish_frees_client() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0), ("09:30", 1, 0)]).await;
    let mut claim = handle.watch_claim();

    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;
    server.send_json(claim_result("client-a", "09:00", "confirmed"));
    wait_claim(&mut claim, ClaimState::Confirmed).await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(handle.claim_state(), ClaimState::Confirmed);

    let mut notifications = handle.notifications();
    let finished = handle.finish().await.unwrap().unwrap();
    assert_eq!(finished.time, at(9, 0));
    assert_eq!(handle.claim_state(), ClaimState::None);

    let cleared = loop {
        match notifications.recv().await {
            Ok(SyncNotification::Claim(update)) => break update,
            Ok(_) => {}
            Err(e) => panic!("notification stream ended: {e}"),
        }
    };
    assert_eq!(cleared.state, ClaimState::None);
    assert_eq!(cleared.slot.time, at(9, 0));
    assert_eq!(handle.select(at(9, 30)).await.unwrap().state, ClaimState::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_sends_release() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0)]).await;

    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    handle.cancel().await.unwrap();
    let release = server.next_frame().await;
    assert_eq!(release["type"], "release_slot");
    assert_eq!(release["clientId"], "client-a");
    wait_claim(&mut handle.watch_claim(), ClaimState::Cancelled).await;
    assert!(handle.view().is_available(at(9, 0)));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_offline_and_refresh() {
    let (connector, mut servers) = FakeConnector::failing(6);
    let (handle, _task) = AvailabilitySession::spawn(&test_config("client-a"), connector.clone());
    handle.subscribe(key()).await.unwrap();

    let mut state = handle.watch_connection();
    wait_state(&mut state, ConnectionState::Offline).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 6);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(30)));

    // Offline is terminal until the user asks again
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts().len(), 6);

    handle.refresh().await.unwrap();
    let mut server = servers.recv().await.unwrap();
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["snapshot"], true);
}

#[tokio::test(start_paused = true)]
async fn test_idle_channel_is_dropped_and_reconnected() {
    let mut config = test_config("client-a");
    config.heartbeat.idle_timeout_ms = 45_000;
    config.heartbeat.ping_interval_ms = 15_000;
    let (handle, mut server, mut servers) = live_session(&config, &[("09:00", 1, 0)]).await;
    let quiet_since = Instant::now();

    // Client keeps pinging a server that never answers
    let ping = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let text = server.next_raw().await;
            if text.contains("\"ping\"") {
                return text;
            }
        }
    })
    .await;
    assert!(ping.is_ok());

    let mut next = servers.recv().await.unwrap();
    let elapsed = Instant::now() - quiet_since;
    assert!(elapsed >= Duration::from_secs(46) && elapsed < Duration::from_secs(47));
    assert_eq!(next.next_frame().await["type"], "subscribe");
    assert!(handle.view().stale);
}

#[tokio::test(start_paused = true)]
async fn test_consistency_fault_requests_resync() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 1)]).await;
    let mut view = handle.watch_view();

    server.send_json(slot_event("slot_booked", 2, "09:00"));
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "request_snapshot");

    let faulted = wait_view(&mut view, |v| v.stale).await;
    assert_eq!(faulted.get(at(9, 0)).unwrap().current_bookings(), 1);
    assert_eq!(handle.select(at(9, 0)).await, Err(SelectError::StaleData));

    server.send_json(snapshot(3, &[("09:00", 2, 1)]));
    let fresh = wait_view(&mut view, |v| !v.stale).await;
    assert!(fresh.is_available(at(9, 0)));
}

#[tokio::test(start_paused = true)]
async fn test_subscription_switch_abandons_claim() {
    let (handle, mut server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 1, 0)]).await;

    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    let whitening = SubscriptionKey::new("dr-pedro", "whitening", date());
    handle.subscribe(whitening).await.unwrap();

    assert_eq!(server.next_frame().await["type"], "release_slot");
    let unsubscribe = server.next_frame().await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(unsubscribe["serviceId"], "cleaning");
    let subscribe = server.next_frame().await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["serviceId"], "whitening");

    wait_claim(&mut handle.watch_claim(), ClaimState::Cancelled).await;
    wait_state(&mut handle.watch_connection(), ConnectionState::Connected).await;
    let view = wait_view(&mut handle.watch_view(), |v| v.is_empty()).await;
    assert!(view.stale);
}

#[tokio::test(start_paused = true)]
async fn test_presence_feed_and_update_tap() {
    let (handle, server, _servers) =
        live_session(&test_config("client-a"), &[("09:00", 2, 0)]).await;
    let mut notifications = handle.notifications();

    server.send_json(json!({
        "type": "system_update",
        "providerId": "dr-pedro",
        "date": "2026-10-20",
        "data": { "viewersCount": 3 },
    }));
    server.send_json(slot_event("slot_booked", 2, "09:00"));

    let mut tapped = Vec::new();
    let presence = loop {
        match notifications.recv().await {
            Ok(SyncNotification::Update(event)) => tapped.push(event.kind_name()),
            Ok(SyncNotification::Activity(presence)) if !presence.recent.is_empty() => {
                break presence
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(e) => panic!("notification stream ended: {e}"),
        }
    };

    assert_eq!(tapped, vec!["system_update", "slot_booked"]);
    assert_eq!(presence.viewers, 3);
    assert_eq!(presence.others_viewing, 2);
    assert_eq!(presence.recent[0].describe(), "Slot 09:00 was just booked");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_claim_and_unsubscribes() {
    let (connector, mut servers) = FakeConnector::new();
    let (handle, task) = AvailabilitySession::spawn(&test_config("client-a"), connector);
    handle.subscribe(key()).await.unwrap();
    let mut server = servers.recv().await.unwrap();
    server.next_frame().await;
    server.send_json(snapshot(1, &[("09:00", 1, 0)]));
    wait_view(&mut handle.watch_view(), |v| !v.stale).await;

    handle.select(at(9, 0)).await.unwrap();
    server.next_frame().await;
    server.next_frame().await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(server.next_frame().await["type"], "release_slot");
    assert_eq!(server.next_frame().await["type"], "unsubscribe");
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    assert!(handle.refresh().await.is_err());
}
