use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_net::{ClientConfig, FieldId, FieldValue, NetClient};
use tokio::io::duplex;

use super::*;
use crate::test_fixtures::{Capital, Ledger, PASSWORD, SetCounter, templates};

const WAIT: Duration = Duration::from_secs(2);

fn authority(policy: DisconnectPolicy) -> AuthorityManager {
    let (server, events) = NetServer::new(ServerConfig::default());
    AuthorityManager::with_server(server, events, templates(), policy)
}

/// An authority whose frames may not exceed `max_frame_size` bytes.
fn authority_with_frame_limit(max_frame_size: u32, templates: TemplateRegistry) -> AuthorityManager {
    let config = ServerConfig {
        frame: FrameConfig { max_frame_size },
        ..ServerConfig::default()
    };
    let (server, events) = NetServer::new(config);
    AuthorityManager::with_server(server, events, templates, DisconnectPolicy::Despawn)
}

/// Attach a raw client over an in-memory stream and let the authority
/// register it. The client's first message is its full snapshot.
async fn join(auth: &mut AuthorityManager) -> NetClient {
    let (near, far) = duplex(64 * 1024);
    auth.net_server().accept_stream(far).await.unwrap();
    let client = NetClient::over_stream(near, &ClientConfig::default())
        .await
        .unwrap();
    assert!(auth.process_next(WAIT).await, "authority never saw the client");
    client
}

async fn recv(client: &mut NetClient) -> Message {
    match tokio::time::timeout(WAIT, client.next_event()).await {
        Ok(Some(NetEvent::Message(_, message))) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn assert_quiet(client: &mut NetClient) {
    let event = tokio::time::timeout(Duration::from_millis(100), client.next_event()).await;
    assert!(event.is_err(), "unexpected event: {event:?}");
}

async fn wait_disconnected(client: &mut NetClient) -> DisconnectReason {
    loop {
        match tokio::time::timeout(WAIT, client.next_event()).await {
            Ok(Some(NetEvent::Disconnected(_, reason))) => return reason,
            Ok(Some(_)) => continue,
            other => panic!("client was never disconnected: {other:?}"),
        }
    }
}

fn request(object_id: ObjectId, request_id: u16, payload: &impl serde::Serialize) -> Message {
    Message::ClientRequest {
        object_id,
        request_id: RequestId(request_id),
        payload: postcard::to_allocvec(payload).unwrap(),
    }
}

fn set_counter(value: i32) -> SetCounter {
    SetCounter {
        password: PASSWORD.into(),
        value,
    }
}

#[tokio::test]
async fn test_new_client_receives_full_snapshot() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let id = auth.spawn("capital", Owner::Server).unwrap();
    auth.behaviour_mut::<Capital>(id).unwrap().counter.set(12);

    let mut client = join(&mut auth).await;
    let Message::FullSnapshot(records) = recv(&mut client).await else {
        panic!("first message was not a snapshot");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].object_id, id);
    assert_eq!(records[0].template, "capital");
    assert_eq!(records[0].owner, Owner::Server);
    assert_eq!(
        records[0].fields,
        vec![
            FieldValue::Bool(false),
            FieldValue::Str("Hello World".into()),
            FieldValue::Int(12),
        ]
    );
}

#[tokio::test]
async fn test_spawn_reaches_every_client_immediately() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut first = join(&mut auth).await;
    let mut second = join(&mut auth).await;
    assert_eq!(auth.connection_count(), 2);
    assert_eq!(recv(&mut first).await, Message::FullSnapshot(vec![]));
    assert_eq!(recv(&mut second).await, Message::FullSnapshot(vec![]));

    let first_id = first.connection_id();
    let id = auth.spawn("ledger", Owner::Client(first_id)).unwrap();
    for client in [&mut first, &mut second] {
        let Message::Spawn(record) = recv(client).await else {
            panic!("expected a spawn");
        };
        assert_eq!(record.object_id, id);
        assert_eq!(record.owner, Owner::Client(first_id));
    }
}

#[tokio::test]
async fn test_object_ids_are_unique_and_increasing() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let a = auth.spawn("capital", Owner::Server).unwrap();
    let b = auth.spawn("ledger", Owner::Server).unwrap();
    auth.destroy(a);
    let c = auth.spawn("capital", Owner::Server).unwrap();
    assert!(a < b && b < c);
    assert_eq!(auth.objects().ids(), vec![b, c]);
}

#[tokio::test]
async fn test_unknown_template_spawns_nothing() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    recv(&mut client).await;

    let err = auth.spawn("castle", Owner::Server).unwrap_err();
    assert_eq!(err, SpawnError::UnknownTemplate("castle".into()));
    assert!(auth.objects().is_empty());
    assert_quiet(&mut client).await;
}

#[tokio::test]
async fn test_flush_sends_latest_value_once() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    recv(&mut client).await;
    let id = auth.spawn("capital", Owner::Server).unwrap();
    recv(&mut client).await;

    let capital = auth.behaviour_mut::<Capital>(id).unwrap();
    capital.counter.set(1);
    capital.counter.set(2);
    assert_eq!(auth.flush(), 1);

    assert_eq!(
        recv(&mut client).await,
        Message::FieldUpdate(vec![FieldUpdate {
            object_id: id,
            field_id: FieldId(2),
            value: FieldValue::Int(2),
        }])
    );
    assert_eq!(auth.flush(), 0);
    assert_quiet(&mut client).await;
}

#[tokio::test]
async fn test_flush_batches_every_dirty_object_in_one_message() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    recv(&mut client).await;
    let capital = auth.spawn("capital", Owner::Server).unwrap();
    let ledger = auth.spawn("ledger", Owner::Server).unwrap();
    recv(&mut client).await;
    recv(&mut client).await;

    auth.behaviour_mut::<Ledger>(ledger)
        .unwrap()
        .entries
        .set(vec!["wheat".to_string()]);
    auth.behaviour_mut::<Capital>(capital).unwrap().sync_me.set(true);
    assert_eq!(auth.flush(), 2);

    let Message::FieldUpdate(updates) = recv(&mut client).await else {
        panic!("expected a field update");
    };
    let objects: Vec<ObjectId> = updates.iter().map(|u| u.object_id).collect();
    assert_eq!(objects, vec![capital, ledger]);
    assert_eq!(updates[0].value, FieldValue::Bool(true));
    assert_quiet(&mut client).await;
}

#[tokio::test]
async fn test_snapshot_larger_than_one_frame_is_split() {
    const LIMIT: u32 = 4096;
    let mut auth = authority_with_frame_limit(LIMIT, templates());
    let spawned: Vec<ObjectId> = (0..300)
        .map(|_| auth.spawn("capital", Owner::Server).unwrap())
        .collect();

    let mut client = join(&mut auth).await;
    let mut received = Vec::new();
    let mut frames = 0;
    while received.len() < spawned.len() {
        let message = recv(&mut client).await;
        assert!(message.encode().unwrap().len() <= LIMIT as usize);
        let Message::FullSnapshot(records) = message else {
            panic!("expected snapshot frames before anything else");
        };
        assert!(!records.is_empty());
        received.extend(records.into_iter().map(|r| r.object_id));
        frames += 1;
    }
    assert!(frames > 1, "world should not fit one {LIMIT} byte frame");
    assert_eq!(received, spawned);

    assert!(auth.is_connected(client.connection_id()));
    let late = auth.spawn("ledger", Owner::Server).unwrap();
    assert!(matches!(recv(&mut client).await, Message::Spawn(r) if r.object_id == late));
}

#[tokio::test]
async fn test_field_value_over_frame_limit_is_dropped_without_disconnect() {
    const LIMIT: u32 = 4096;
    let mut auth = authority_with_frame_limit(LIMIT, templates());
    let mut first = join(&mut auth).await;
    let mut second = join(&mut auth).await;
    let id = auth.spawn("capital", Owner::Server).unwrap();
    for client in [&mut first, &mut second] {
        recv(client).await;
        recv(client).await;
    }

    let capital = auth.behaviour_mut::<Capital>(id).unwrap();
    capital.sync_me_also.set("x".repeat(LIMIT as usize));
    capital.counter.set(5);
    assert_eq!(auth.flush(), 1);

    let only_counter = Message::FieldUpdate(vec![FieldUpdate {
        object_id: id,
        field_id: FieldId(2),
        value: FieldValue::Int(5),
    }]);
    for client in [&mut first, &mut second] {
        assert_eq!(recv(client).await, only_counter);
    }
    assert_eq!(auth.connection_count(), 2);
    assert_eq!(auth.flush(), 0);

    auth.behaviour_mut::<Capital>(id)
        .unwrap()
        .sync_me_also
        .set("Goodbye World");
    assert_eq!(auth.flush(), 1);
    for client in [&mut first, &mut second] {
        let Message::FieldUpdate(updates) = recv(client).await else {
            panic!("expected a field update");
        };
        assert_eq!(updates[0].value, FieldValue::Str("Goodbye World".into()));
    }
}

#[tokio::test]
async fn test_flush_splits_batches_by_encoded_size() {
    const LIMIT: u32 = 4096;
    let mut auth = authority_with_frame_limit(LIMIT, templates());
    let mut client = join(&mut auth).await;
    recv(&mut client).await;
    let ids: Vec<ObjectId> = (0..4)
        .map(|_| auth.spawn("capital", Owner::Server).unwrap())
        .collect();
    for _ in &ids {
        recv(&mut client).await;
    }

    // Each value fits alone, but no two fit one frame.
    for id in &ids {
        auth.behaviour_mut::<Capital>(*id)
            .unwrap()
            .sync_me_also
            .set("y".repeat(LIMIT as usize / 2));
    }
    assert_eq!(auth.flush(), ids.len());

    let mut seen = Vec::new();
    while seen.len() < ids.len() {
        let message = recv(&mut client).await;
        assert!(message.encode().unwrap().len() <= LIMIT as usize);
        let Message::FieldUpdate(updates) = message else {
            panic!("expected a field update");
        };
        seen.extend(updates.iter().map(|u| u.object_id));
    }
    assert_eq!(seen, ids);
    assert!(auth.is_connected(client.connection_id()));
}

#[tokio::test]
async fn test_spawn_over_frame_limit_is_refused() {
    let templates = TemplateRegistry::builder()
        .register("mural", || {
            let mut capital = Capital::default();
            capital.sync_me_also.set("z".repeat(8192));
            vec![Box::new(capital)]
        })
        .build();
    let mut auth = authority_with_frame_limit(4096, templates);
    let mut client = join(&mut auth).await;
    recv(&mut client).await;

    let err = auth.spawn("mural", Owner::Server).unwrap_err();
    assert!(matches!(err, SpawnError::TooLarge { ref template, max: 4096, .. } if template == "mural"));
    assert!(auth.objects().is_empty());
    assert_quiet(&mut client).await;
    assert!(auth.is_connected(client.connection_id()));
}

#[tokio::test]
async fn test_flush_without_clients_still_clears_dirty() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let id = auth.spawn("capital", Owner::Server).unwrap();
    auth.behaviour_mut::<Capital>(id).unwrap().counter.set(5);
    assert_eq!(auth.flush(), 1);

    let mut client = join(&mut auth).await;
    let Message::FullSnapshot(records) = recv(&mut client).await else {
        panic!("expected a snapshot");
    };
    assert_eq!(records[0].fields[2], FieldValue::Int(5));
    assert_eq!(auth.flush(), 0);
}

#[tokio::test]
async fn test_server_invoke_runs_in_place_without_traffic() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    let id = auth.spawn("capital", Owner::Server).unwrap();
    recv(&mut client).await;
    recv(&mut client).await;

    let conn = client.connection_id();
    let sent_before = auth.connections[&conn].messages_sent();
    let handle = auth.behaviour::<Capital>(id).unwrap().set_counter.unwrap();
    auth.invoke(handle, set_counter(354)).unwrap();

    let capital = auth.behaviour::<Capital>(id).unwrap();
    assert_eq!(*capital.counter.get(), 354);
    assert_eq!(capital.requests_handled, 1);
    assert_eq!(auth.connections[&conn].messages_sent(), sent_before);
    assert_quiet(&mut client).await;
}

#[tokio::test]
async fn test_server_invoke_with_fills_buffer_in_place() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let id = auth.spawn("capital", Owner::Server).unwrap();
    let handle = auth.behaviour::<Capital>(id).unwrap().set_counter.unwrap();

    auth.invoke_with(handle, |req| {
        req.password = PASSWORD.into();
        req.value = 7;
    })
    .unwrap();
    // The buffer keeps its contents between invocations.
    auth.invoke_with(handle, |req| req.value += 1).unwrap();
    assert_eq!(*auth.behaviour::<Capital>(id).unwrap().counter.get(), 8);
}

#[tokio::test]
async fn test_server_cannot_invoke_client_owned_object() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let id = auth.spawn("capital", Owner::Client(ConnectionId(3))).unwrap();
    let handle = auth.behaviour::<Capital>(id).unwrap().set_counter.unwrap();

    let err = auth.invoke(handle, set_counter(354)).unwrap_err();
    assert!(matches!(err, RequestError::NotOwner { owner, .. } if owner == Owner::Client(ConnectionId(3))));
    assert_eq!(auth.behaviour::<Capital>(id).unwrap().requests_handled, 0);
    assert!(!auth.is_mine(id));
}

#[tokio::test]
async fn test_owner_request_runs_handler() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    let id = auth
        .spawn("capital", Owner::Client(client.connection_id()))
        .unwrap();
    recv(&mut client).await;
    recv(&mut client).await;

    client.send(request(id, 0, &set_counter(354))).unwrap();
    assert!(auth.process_next(WAIT).await);
    assert_eq!(*auth.behaviour::<Capital>(id).unwrap().counter.get(), 354);

    auth.flush();
    let Message::FieldUpdate(updates) = recv(&mut client).await else {
        panic!("expected a field update");
    };
    assert_eq!(updates[0].value, FieldValue::Int(354));
}

#[tokio::test]
async fn test_non_owner_request_is_dropped() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let owner = join(&mut auth).await;
    let intruder = join(&mut auth).await;
    let id = auth
        .spawn("capital", Owner::Client(owner.connection_id()))
        .unwrap();

    intruder.send(request(id, 0, &set_counter(354))).unwrap();
    assert!(auth.process_next(WAIT).await);

    let capital = auth.behaviour::<Capital>(id).unwrap();
    assert_eq!(capital.requests_handled, 0);
    assert_eq!(*capital.counter.get(), 0);
    assert!(auth.is_connected(intruder.connection_id()));
}

#[tokio::test]
async fn test_request_for_unknown_object_disconnects() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;

    client.send(request(ObjectId(99), 0, &set_counter(1))).unwrap();
    assert!(auth.process_next(WAIT).await);
    assert!(!auth.is_connected(client.connection_id()));
    wait_disconnected(&mut client).await;
}

#[tokio::test]
async fn test_undecodable_payload_disconnects() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let client = join(&mut auth).await;
    let id = auth
        .spawn("capital", Owner::Client(client.connection_id()))
        .unwrap();

    client
        .send(Message::ClientRequest {
            object_id: id,
            request_id: RequestId(0),
            payload: vec![0xff],
        })
        .unwrap();
    assert!(auth.process_next(WAIT).await);
    assert!(!auth.is_connected(client.connection_id()));
}

#[tokio::test]
async fn test_server_message_from_client_is_violation() {
    let mut auth = authority(DisconnectPolicy::Retain);
    let client = join(&mut auth).await;

    client.send(Message::Destroy(ObjectId(0))).unwrap();
    assert!(auth.process_next(WAIT).await);
    assert_eq!(auth.connection_count(), 0);
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    recv(&mut client).await;
    let id = auth.spawn("capital", Owner::Server).unwrap();
    recv(&mut client).await;

    assert!(auth.destroy(id));
    assert!(!auth.destroy(id));
    assert!(!auth.has_object(id));
    assert_eq!(recv(&mut client).await, Message::Destroy(id));
    assert_quiet(&mut client).await;
}

#[tokio::test]
async fn test_despawn_policy_destroys_departed_clients_objects() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let leaver = join(&mut auth).await;
    let mut watcher = join(&mut auth).await;
    let owned = auth
        .spawn("capital", Owner::Client(leaver.connection_id()))
        .unwrap();
    let kept = auth.spawn("ledger", Owner::Server).unwrap();
    recv(&mut watcher).await;
    recv(&mut watcher).await;
    recv(&mut watcher).await;

    leaver.disconnect();
    assert!(auth.process_next(WAIT).await);
    assert!(!auth.has_object(owned));
    assert!(auth.has_object(kept));
    assert_eq!(recv(&mut watcher).await, Message::Destroy(owned));
}

#[tokio::test]
async fn test_retain_policy_keeps_departed_clients_objects() {
    let mut auth = authority(DisconnectPolicy::Retain);
    let leaver = join(&mut auth).await;
    let conn = leaver.connection_id();
    let owned = auth.spawn("capital", Owner::Client(conn)).unwrap();

    leaver.disconnect();
    assert!(auth.process_next(WAIT).await);
    assert!(!auth.is_connected(conn));
    assert_eq!(auth.object(owned).unwrap().owner(), Owner::Client(conn));
}

#[derive(Clone, Default)]
struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ServerListener for Journal {
    fn on_client_connected(&mut self, server: &mut AuthorityManager, connection: ConnectionId) {
        self.entries.lock().unwrap().push(format!("joined {}", connection.0));
        server.spawn("capital", Owner::Client(connection)).unwrap();
    }

    fn on_client_disconnected(
        &mut self,
        server: &mut AuthorityManager,
        connection: ConnectionId,
        reason: &DisconnectReason,
    ) {
        self.entries
            .lock()
            .unwrap()
            .push(format!("left {} ({reason}) with {} objects", connection.0, server.objects().len()));
    }
}

#[tokio::test]
async fn test_listener_can_spawn_for_new_client() {
    let journal = Journal::default();
    let mut auth = authority(DisconnectPolicy::Despawn);
    auth.set_listener(journal.clone());

    let mut client = join(&mut auth).await;
    let conn = client.connection_id();
    assert_eq!(recv(&mut client).await, Message::FullSnapshot(vec![]));
    let Message::Spawn(record) = recv(&mut client).await else {
        panic!("listener spawn never arrived");
    };
    assert_eq!(record.owner, Owner::Client(conn));

    client.disconnect();
    assert!(auth.process_next(WAIT).await);
    let entries = journal.entries.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            format!("joined {}", conn.0),
            format!("left {} (peer closed the connection) with 0 objects", conn.0),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let mut auth = authority(DisconnectPolicy::Despawn);
    let mut client = join(&mut auth).await;
    auth.spawn("capital", Owner::Server).unwrap();

    auth.shutdown();
    assert_eq!(auth.connection_count(), 0);
    assert_eq!(auth.objects().len(), 1);
    assert!(auth.net_server().is_shut_down());
    wait_disconnected(&mut client).await;
}
