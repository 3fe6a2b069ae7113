/// Integration tests: drive the gateway with JSON frames the way a socket
/// would, and check what each connection's outbound queue receives.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use parley_chat::ChatService;
use parley_db::Database;
use parley_gateway::{Dispatcher, Gateway, Session};
use parley_types::events::{ErrorCode, ServerEvent};
use parley_types::models::RelationshipStatus;
use parley_types::permissions::{CHAT_ACCESS, Permissions, TEAM_WRITE};
use parley_types::time;

fn gateway() -> Gateway {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Gateway::new(ChatService::new(db), Dispatcher::new())
}

fn base() -> Permissions {
    Permissions::new([CHAT_ACCESS])
}

async fn connect(gw: &Gateway, user: Uuid) -> (Session, UnboundedReceiver<ServerEvent>) {
    gw.open(user, format!("user-{}", &user.to_string()[..8]), base()).await
}

fn frame(kind: &str, payload: serde_json::Value) -> String {
    json!({ "type": kind, "payload": payload }).to_string()
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn expect_error(event: &ServerEvent, code: ErrorCode) -> &parley_types::events::ErrorPayload {
    match event {
        ServerEvent::Error(payload) => {
            assert_eq!(payload.code, code, "unexpected error {:?}", payload);
            payload
        }
        other => panic!("expected error frame, got {:?}", other),
    }
}

/// Friends with an accepted relationship and their shared dm thread.
fn friends(gw: &Gateway) -> (Uuid, Uuid, Uuid) {
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let chat = gw.chat();
    chat.db().set_relationship(a, b, RelationshipStatus::Accepted).unwrap();
    let thread = chat.ensure_dm_thread(a, b, &base()).unwrap();
    (a, b, thread.id)
}

#[tokio::test]
async fn dm_message_reaches_both_sides_and_outsider_is_forbidden() {
    let gw = gateway();
    let (a, b, thread_id) = friends(&gw);
    let c = Uuid::new_v4();

    let (sa, mut rx_a) = connect(&gw, a).await;
    let (sb, mut rx_b) = connect(&gw, b).await;
    let (sc, mut rx_c) = connect(&gw, c).await;

    gw.handle_text(&sa, &frame("thread.join", json!({ "thread_id": thread_id })))
        .await;
    assert!(matches!(
        drain(&mut rx_a).as_slice(),
        [ServerEvent::ThreadJoined(r)] if r.thread_id == thread_id
    ));

    let temp_id = Uuid::new_v4();
    gw.handle_text(
        &sb,
        &frame(
            "message.send",
            json!({ "thread_id": thread_id, "content": "hi", "temp_id": temp_id }),
        ),
    )
    .await;

    let to_a = drain(&mut rx_a);
    let to_b = drain(&mut rx_b);
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_a, to_b);
    let ServerEvent::MessageNew(new) = &to_a[0] else {
        panic!("expected message.new, got {:?}", to_a[0]);
    };
    assert_eq!(new.temp_id, Some(temp_id));
    assert_eq!(new.message.content, "hi");
    assert_eq!(new.message.sender_id, Some(b));

    // Thread ordering follows the message, and the sender has read their own message.
    let chat = gw.chat();
    let thread = chat.db().get_thread(thread_id).unwrap().unwrap();
    assert_eq!(thread.last_message_at, Some(new.message.created_at));
    let sender = chat.db().get_participant(thread_id, b).unwrap().unwrap();
    assert_eq!(sender.last_read_at, Some(new.message.created_at));

    // Outsider gets an explicit denial and no subscription.
    gw.handle_text(&sc, &frame("thread.join", json!({ "thread_id": thread_id })))
        .await;
    let to_c = drain(&mut rx_c);
    assert_eq!(to_c.len(), 1);
    let err = expect_error(&to_c[0], ErrorCode::Forbidden);
    assert_eq!(err.thread_id, Some(thread_id));
    assert_eq!(
        gw.dispatcher()
            .subscriber_count(parley_gateway::Channel::Thread(thread_id))
            .await,
        1
    );
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_usable() {
    let gw = gateway();
    let (a, _b, thread_id) = friends(&gw);
    let (sa, mut rx) = connect(&gw, a).await;

    gw.handle_text(&sa, &frame("presence.update", json!({}))).await;
    gw.handle_text(&sa, "{not json").await;
    gw.handle_text(&sa, &frame("message.send", json!({ "thread_id": "nope" })))
        .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    expect_error(&events[0], ErrorCode::UnknownEvent);
    expect_error(&events[1], ErrorCode::ValidationError);
    expect_error(&events[2], ErrorCode::ValidationError);

    gw.handle_text(&sa, &frame("thread.join", json!({ "thread_id": thread_id })))
        .await;
    assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::ThreadJoined(_)]));
}

#[tokio::test]
async fn failed_send_echoes_temp_id() {
    let gw = gateway();
    let (a, _b, thread_id) = friends(&gw);
    let (sa, mut rx) = connect(&gw, a).await;

    let temp_id = Uuid::new_v4();
    let missing = Uuid::new_v4();
    gw.handle_text(
        &sa,
        &frame(
            "message.send",
            json!({ "thread_id": missing, "content": "hello?", "temp_id": temp_id }),
        ),
    )
    .await;
    gw.handle_text(
        &sa,
        &frame(
            "message.send",
            json!({ "thread_id": thread_id, "content": "   ", "temp_id": temp_id }),
        ),
    )
    .await;

    let events = drain(&mut rx);
    let not_found = expect_error(&events[0], ErrorCode::ThreadNotFound);
    assert_eq!(not_found.temp_id, Some(temp_id));
    assert_eq!(not_found.thread_id, Some(missing));
    let invalid = expect_error(&events[1], ErrorCode::ValidationError);
    assert_eq!(invalid.temp_id, Some(temp_id));
}

#[tokio::test]
async fn read_update_is_clamped_and_fanned_out() {
    let gw = gateway();
    let (a, b, thread_id) = friends(&gw);
    let (sa, mut rx_a) = connect(&gw, a).await;
    let (_sb, mut rx_b) = connect(&gw, b).await;

    let before = time::now();
    let future = before + Duration::hours(2);
    gw.handle_text(
        &sa,
        &frame(
            "read.update",
            json!({ "thread_id": thread_id, "last_read_at": future }),
        ),
    )
    .await;

    let to_a = drain(&mut rx_a);
    let to_b = drain(&mut rx_b);
    assert_eq!(to_a, to_b);
    let ServerEvent::ReadUpdated(update) = &to_b[0] else {
        panic!("expected read.updated, got {:?}", to_b[0]);
    };
    assert_eq!(update.user_id, a);
    assert!(update.last_read_at >= before);
    assert!(update.last_read_at < future);

    let stored = gw.chat().db().get_participant(thread_id, a).unwrap().unwrap();
    assert_eq!(stored.last_read_at, Some(update.last_read_at));
}

#[tokio::test]
async fn typing_goes_to_participants_only() {
    let gw = gateway();
    let (a, b, thread_id) = friends(&gw);
    let (sa, mut rx_a) = connect(&gw, a).await;
    let (_sb, mut rx_b) = connect(&gw, b).await;
    let (sc, mut rx_c) = connect(&gw, Uuid::new_v4()).await;

    gw.handle_text(&sa, &frame("typing", json!({ "thread_id": thread_id })))
        .await;
    let to_b = drain(&mut rx_b);
    assert!(matches!(
        to_b.as_slice(),
        [ServerEvent::Typing(t)] if t.user_id == a && t.is_typing
    ));
    assert_eq!(drain(&mut rx_a).len(), 1);

    gw.handle_text(
        &sc,
        &frame("typing", json!({ "thread_id": thread_id, "is_typing": false })),
    )
    .await;
    let to_c = drain(&mut rx_c);
    expect_error(&to_c[0], ErrorCode::Forbidden);
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn typing_in_a_blocked_dm_is_forbidden() {
    let gw = gateway();
    let (a, b, thread_id) = friends(&gw);
    gw.chat().db().set_relationship(a, b, RelationshipStatus::Blocked).unwrap();
    let (sa, mut rx_a) = connect(&gw, a).await;
    let (_sb, mut rx_b) = connect(&gw, b).await;

    gw.handle_text(&sa, &frame("typing", json!({ "thread_id": thread_id })))
        .await;
    let to_a = drain(&mut rx_a);
    assert_eq!(expect_error(&to_a[0], ErrorCode::Forbidden).thread_id, Some(thread_id));
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn unjoined_team_member_cannot_type() {
    let gw = gateway();
    let team = Uuid::new_v4();
    let (member, lurker) = (Uuid::new_v4(), Uuid::new_v4());
    let chat = gw.chat();
    chat.db().set_team_member(team, member, "member").unwrap();
    chat.db().set_team_member(team, lurker, "member").unwrap();
    let thread = chat.db().ensure_team_thread(team, "Team chat").unwrap();

    let (sm, mut rx_m) = connect(&gw, member).await;
    gw.handle_text(&sm, &frame("thread.join", json!({ "thread_id": thread.id })))
        .await;
    drain(&mut rx_m);

    let (sl, mut rx_l) = connect(&gw, lurker).await;
    gw.handle_text(&sl, &frame("typing", json!({ "thread_id": thread.id })))
        .await;
    expect_error(&drain(&mut rx_l)[0], ErrorCode::Forbidden);
    assert!(drain(&mut rx_m).is_empty());

    gw.handle_text(&sm, &frame("typing", json!({ "thread_id": thread.id })))
        .await;
    assert!(matches!(
        drain(&mut rx_m).as_slice(),
        [ServerEvent::Typing(t)] if t.user_id == member
    ));
}

#[tokio::test]
async fn every_device_of_a_user_receives_fan_out() {
    let gw = gateway();
    let (a, b, thread_id) = friends(&gw);
    let (_phone, mut phone_rx) = connect(&gw, a).await;
    let (laptop, mut laptop_rx) = connect(&gw, a).await;
    let (sb, _rx_b) = connect(&gw, b).await;

    // Only the laptop has the thread open.
    gw.handle_text(&laptop, &frame("thread.join", json!({ "thread_id": thread_id })))
        .await;
    drain(&mut laptop_rx);

    gw.handle_text(
        &sb,
        &frame("message.send", json!({ "thread_id": thread_id, "content": "ping" })),
    )
    .await;
    assert_eq!(drain(&mut phone_rx).len(), 1);
    assert_eq!(drain(&mut laptop_rx).len(), 1);

    gw.close(&laptop).await;
    assert_eq!(gw.dispatcher().connection_count().await, 2);
}

#[tokio::test]
async fn leave_unsubscribes_and_confirms() {
    let gw = gateway();
    let (a, _b, thread_id) = friends(&gw);
    let (sa, mut rx) = connect(&gw, a).await;

    gw.handle_text(&sa, &frame("thread.join", json!({ "thread_id": thread_id })))
        .await;
    gw.handle_text(&sa, &frame("thread.leave", json!({ "thread_id": thread_id })))
        .await;

    let events = drain(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::ThreadJoined(_), ServerEvent::ThreadLeft(r)] if r.thread_id == thread_id
    ));
    let channel = parley_gateway::Channel::Thread(thread_id);
    assert!(!gw.dispatcher().is_subscribed(sa.conn_id, channel).await);
}

#[tokio::test]
async fn team_members_join_lazily_and_once() {
    let gw = gateway();
    let team = Uuid::new_v4();
    let member = Uuid::new_v4();
    let chat = gw.chat();
    chat.db().set_team_member(team, member, "member").unwrap();
    let thread = chat.db().ensure_team_thread(team, "Team chat").unwrap();

    let (session, mut rx) = gw
        .open(member, "member", Permissions::new([CHAT_ACCESS, TEAM_WRITE]))
        .await;
    for _ in 0..2 {
        gw.handle_text(&session, &frame("thread.join", json!({ "thread_id": thread.id })))
            .await;
    }
    gw.handle_text(
        &session,
        &frame("message.send", json!({ "thread_id": thread.id, "content": "hello team" })),
    )
    .await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    assert!(matches!(events[2], ServerEvent::MessageNew(_)));
    assert_eq!(chat.participant_ids(thread.id).unwrap(), vec![member]);
}
