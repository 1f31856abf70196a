use crate::codec::BincodeCodec;
use crate::entry::Entry;
use crate::error::TableError;
use crate::listener::{TableListener, ValueChange};
use crate::node::{ConnectionListener, Node, RemoteInfo};
use crate::store::EntryStore;
use crate::transport::{TransactionKind, TransactionReceiver, TransactionSink};
use crate::types::{EntryId, EntrySnapshot, EntryType, Role, SequenceNumber, Value};
use crate::write_manager::WriteManagerConfig;
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Assignment(EntrySnapshot),
    Update(EntrySnapshot, SequenceNumber),
    Flush,
    KeepAlive,
}

/// Records everything the write manager hands to the transport. With a peer
/// attached it also delivers assignments and updates to that node.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<Sent>>,
    peer: Mutex<Option<Weak<Node>>>,
}

impl RecordingSink {
    fn connect(&self, peer: &Arc<Node>) {
        *self.peer.lock() = Some(Arc::downgrade(peer));
    }

    fn peer(&self) -> Option<Arc<Node>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn transactions(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| matches!(sent, Sent::Assignment(_) | Sent::Update(..)))
            .cloned()
            .collect()
    }

    fn assignments(&self) -> Vec<EntrySnapshot> {
        self.sent
            .lock()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Assignment(entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    fn updates(&self) -> Vec<(EntrySnapshot, SequenceNumber)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|sent| match sent {
                Sent::Update(entry, seq) => Some((entry.clone(), *seq)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, wanted: &Sent) -> usize {
        self.sent.lock().iter().filter(|sent| *sent == wanted).count()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl TransactionSink for RecordingSink {
    fn send_assignment(&self, entry: &EntrySnapshot) -> Result<()> {
        self.sent.lock().push(Sent::Assignment(entry.clone()));
        if let Some(peer) = self.peer() {
            let incoming = Entry::new(entry.name.clone(), entry.entry_type, entry.value.clone())
                .with_id(entry.id)
                .with_sequence(entry.sequence);
            peer.offer_incoming_assignment(incoming)?;
        }
        Ok(())
    }

    fn send_update(&self, entry: &EntrySnapshot, sequence: SequenceNumber) -> Result<()> {
        self.sent.lock().push(Sent::Update(entry.clone(), sequence));
        if let Some(peer) = self.peer() {
            peer.offer_incoming_update(entry.id, sequence, entry.value.clone());
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.sent.lock().push(Sent::Flush);
        Ok(())
    }

    fn send_keep_alive(&self) -> Result<()> {
        self.sent.lock().push(Sent::KeepAlive);
        Ok(())
    }
}

#[derive(Default)]
struct ChangeLog {
    events: Mutex<Vec<(String, String, Value, bool)>>,
}

impl ChangeLog {
    fn keys(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.1.clone()).collect()
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }
}

impl TableListener for ChangeLog {
    fn value_changed(&self, change: &ValueChange<'_>) {
        self.events.lock().push((
            change.source.to_string(),
            change.key.to_string(),
            change.value.clone(),
            change.is_new,
        ));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> WriteManagerConfig {
    WriteManagerConfig::default().with_keep_alive_delay(Duration::from_secs(3600))
}

fn node(role: Role) -> (Arc<Node>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(role, sink.clone(), quiet_config());
    (node, sink)
}

/// Client and server joined by recording sinks that deliver to each other.
fn linked_pair() -> (Arc<Node>, Arc<RecordingSink>, Arc<Node>, Arc<RecordingSink>) {
    let (client, client_sink) = node(Role::Client);
    let (server, server_sink) = node(Role::Server);
    client_sink.connect(&server);
    server_sink.connect(&client);
    (client, client_sink, server, server_sink)
}

fn remote(name: &str) -> RemoteInfo {
    RemoteInfo {
        remote_id: name.to_string(),
        remote_ip: "10.0.0.2".to_string(),
        remote_port: 1735,
        protocol_version: 0x0200,
    }
}

#[test]
fn test_sequence_wraparound() {
    let s = SequenceNumber;
    assert!(s(3).is_newer_than(s(65530)));
    assert!(!s(65530).is_newer_than(s(3)));
    assert!(s(1).is_newer_than(s(0)));
    assert!(!s(0).is_newer_than(s(1)));
    assert!(!s(7).is_newer_than(s(7)));

    // Exactly half the space apart is ambiguous and rejected both ways
    assert!(!s(32768).is_newer_than(s(0)));
    assert!(!s(0).is_newer_than(s(32768)));
    assert!(s(32767).is_newer_than(s(0)));

    // Behavior does not depend on absolute magnitude
    for base in [0u16, 1000, 40000, 65535] {
        assert!(s(base.wrapping_add(100)).is_newer_than(s(base)));
        assert!(!s(base.wrapping_sub(100)).is_newer_than(s(base)));
    }
    assert_eq!(s(65535).next(), s(0));
}

#[test]
fn test_idempotent_name_reuse() {
    let (node, sink) = node(Role::Client);
    node.put_double("speed", 1.0).unwrap();
    node.put_double("speed", 1.0).unwrap();
    node.write_manager().flush_now();
    node.put_double("speed", 1.0).unwrap();
    node.write_manager().flush_now();

    let entry = node.store().get_entry("speed").unwrap();
    assert_eq!(entry.sequence, SequenceNumber(0));
    assert_eq!(sink.transactions().len(), 1);
    assert!(sink.updates().is_empty());
}

#[test]
fn test_array_values_compare_element_wise() {
    let (node, sink) = node(Role::Client);
    node.put_value("gains", Value::DoubleArray(vec![0.1, 0.2, f64::NAN]))
        .unwrap();
    node.write_manager().flush_now();
    node.put_value("gains", Value::DoubleArray(vec![0.1, 0.2, f64::NAN]))
        .unwrap();
    node.put_value("gains", Value::DoubleArray(vec![0.1, 0.2, 0.3]))
        .unwrap();
    node.write_manager().flush_now();

    let entry = node.store().get_entry("gains").unwrap();
    assert_eq!(entry.sequence, SequenceNumber(1));
    assert_eq!(sink.updates().len(), 1);
}

#[test]
fn test_type_immutability() {
    let (node, _sink) = node(Role::Client);
    node.put_double("speed", 1.0).unwrap();

    let err = node.put_string("speed", "fast").unwrap_err();
    assert_eq!(
        err,
        TableError::TypeMismatch {
            name: "speed".to_string(),
            existing: EntryType::Double,
            requested: EntryType::String,
        }
    );

    let entry = node.store().get_entry("speed").unwrap();
    assert_eq!(entry.entry_type, EntryType::Double);
    assert_eq!(entry.value, Value::Double(1.0));
    assert_eq!(entry.sequence, SequenceNumber(0));
}

#[test]
fn test_value_must_match_declared_type() {
    let (node, _sink) = node(Role::Client);
    let err = node
        .store()
        .put_outgoing("speed", EntryType::Boolean, Value::Double(1.0))
        .unwrap_err();
    assert!(matches!(err, TableError::TypeMismatch { .. }));
    assert!(node.store().is_empty());
}

#[test]
fn test_missing_name_rejected() {
    let (node, sink) = node(Role::Client);
    assert_eq!(
        node.put_boolean("", true).unwrap_err(),
        TableError::MissingArgument("name")
    );
    assert!(node.store().is_empty());
    assert_eq!(node.write_manager().queued(), 0);
    node.write_manager().flush_now();
    assert!(sink.transactions().is_empty());
}

#[test]
fn test_at_most_one_dirty_transmission() {
    let (node, sink) = node(Role::Client);
    node.put_double("speed", 0.0).unwrap();
    node.write_manager().flush_now();
    sink.clear();

    for i in 1..=10 {
        node.put_double("speed", i as f64).unwrap();
    }
    assert_eq!(node.write_manager().queued(), 1);
    node.write_manager().flush_now();

    let updates = sink.updates();
    assert_eq!(updates.len(), 1);
    let (entry, seq) = &updates[0];
    assert_eq!(entry.value, Value::Double(10.0));
    assert_eq!(*seq, SequenceNumber(10));
    assert!(sink.assignments().is_empty());

    let handle = node.store().lookup("speed").unwrap();
    assert!(!node.store().is_dirty(handle));
}

#[test]
fn test_update_before_assignment_flush_folds_into_assignment() {
    let (node, sink) = node(Role::Client);
    node.put_double("speed", 1.0).unwrap();
    node.put_double("speed", 2.0).unwrap();
    node.write_manager().flush_now();

    let sent = sink.transactions();
    assert_eq!(sent.len(), 1);
    let Sent::Assignment(entry) = &sent[0] else {
        panic!("expected an assignment, got {sent:?}");
    };
    assert_eq!(entry.value, Value::Double(2.0));
    assert_eq!(entry.sequence, SequenceNumber(1));
}

#[test]
fn test_listener_replay_on_attach() {
    let (node, _sink) = node(Role::Client);
    for key in ["/a", "/b", "/c/d"] {
        node.put_boolean(key, true).unwrap();
    }

    let log = Arc::new(ChangeLog::default());
    node.add_listener(log.clone(), true);
    {
        let events = log.events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.3));
    }

    node.put_boolean("/a", false).unwrap();
    node.put_boolean("/e", false).unwrap();
    let events = log.events.lock();
    assert_eq!(events.len(), 5);
    assert_eq!(events[3].1, "/a");
    assert!(!events[3].3);
    assert_eq!(events[4].1, "/e");
    assert!(events[4].3);
}

#[test]
fn test_notify_entries_replays_every_entry() {
    let (node, _sink) = node(Role::Server);
    node.put_double("/x", 1.0).unwrap();
    node.put_double("/y", 2.0).unwrap();

    let log = ChangeLog::default();
    node.store().notify_entries(&log);
    assert_eq!(log.keys(), vec!["/x".to_string(), "/y".to_string()]);
}

#[test]
fn test_listener_removal() {
    let (node, _sink) = node(Role::Client);
    let log = Arc::new(ChangeLog::default());
    let handle = node.add_listener(log.clone(), false);
    node.put_boolean("/a", true).unwrap();
    assert!(node.remove_listener(handle));
    assert!(!node.remove_listener(handle));
    node.put_boolean("/a", false).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn test_overflow_forces_drain() {
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(
        Role::Client,
        sink.clone(),
        quiet_config().with_queue_capacity(2),
    );

    node.put_double("/a", 1.0).unwrap();
    assert_eq!(node.write_manager().queued(), 1);
    node.put_double("/b", 1.0).unwrap();
    // Reaching capacity drained on this thread
    assert_eq!(node.write_manager().queued(), 0);
    assert_eq!(sink.assignments().len(), 2);

    node.put_double("/c", 1.0).unwrap();
    assert!(node.write_manager().queued() <= 2);
    node.write_manager().flush_now();

    let names: Vec<_> = sink.assignments().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["/a", "/b", "/c"]);
}

#[test]
fn test_end_to_end_scenario() {
    init_tracing();
    let (client, client_sink, server, server_sink) = linked_pair();

    client.put_double("speed", 1.0).unwrap();
    assert_eq!(client.write_manager().flush_now(), 1);
    let assignments = client_sink.assignments();
    assert_eq!(assignments.len(), 1);
    assert!(assignments[0].id.is_unknown());
    assert_eq!(assignments[0].sequence, SequenceNumber(0));
    assert_eq!(assignments[0].value, Value::Double(1.0));

    // The server assigned an id and relays the assignment back
    let on_server = server.store().get_entry("speed").unwrap();
    assert_eq!(on_server.id, EntryId(0));
    assert_eq!(server.write_manager().flush_now(), 1);
    assert_eq!(server_sink.assignments()[0].id, EntryId(0));
    assert_eq!(
        client.store().get_entry("speed").unwrap().id,
        EntryId(0)
    );

    client.put_double("speed", 2.0).unwrap();
    assert_eq!(client.write_manager().flush_now(), 1);
    let updates = client_sink.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0.id, EntryId(0));
    assert_eq!(updates[0].1, SequenceNumber(1));
    assert_eq!(updates[0].0.value, Value::Double(2.0));
    assert_eq!(server.get_double("speed").unwrap(), 2.0);

    // No echo of the update back to the client
    assert_eq!(server.write_manager().queued(), 0);

    let before = client_sink.transactions().len();
    client.put_double("speed", 2.0).unwrap();
    assert_eq!(client.write_manager().flush_now(), 0);
    assert_eq!(client_sink.transactions().len(), before);
}

#[test]
fn test_server_updates_reach_client() {
    let (client, _client_sink, server, _server_sink) = linked_pair();
    server.put_boolean("/enabled", false).unwrap();
    server.write_manager().flush_now();
    assert!(!client.get_boolean("/enabled").unwrap());
    assert_eq!(
        client.store().get_entry("/enabled").unwrap().id,
        EntryId(0)
    );

    let log = Arc::new(ChangeLog::default());
    client.add_key_listener("", "enabled", log.clone(), false);
    server.put_boolean("/enabled", true).unwrap();
    server.write_manager().flush_now();

    assert!(client.get_boolean("/enabled").unwrap());
    assert_eq!(log.keys(), vec!["enabled".to_string()]);
    // Remote changes are not queued for sending back
    assert_eq!(client.write_manager().queued(), 0);
}

#[test]
fn test_stale_update_rejected() {
    let (client, _sink) = node(Role::Client);
    let incoming = Entry::new("/pos", EntryType::Double, Value::Double(1.0))
        .with_id(EntryId(3))
        .with_sequence(SequenceNumber(65530));
    assert!(client.offer_incoming_assignment(incoming).unwrap());

    assert!(client.offer_incoming_update(EntryId(3), SequenceNumber(3), Value::Double(2.0)));
    assert!(!client.offer_incoming_update(
        EntryId(3),
        SequenceNumber(65530),
        Value::Double(0.5)
    ));
    assert!(!client.offer_incoming_update(EntryId(3), SequenceNumber(3), Value::Double(0.5)));

    let entry = client.store().get_entry_by_id(EntryId(3)).unwrap();
    assert_eq!(entry.value, Value::Double(2.0));
    assert_eq!(entry.sequence, SequenceNumber(3));

    // Unknown id and wrong type are ignored
    assert!(!client.offer_incoming_update(EntryId(9), SequenceNumber(4), Value::Double(1.0)));
    assert!(!client.offer_incoming_update(EntryId(3), SequenceNumber(4), Value::Boolean(true)));
}

#[test]
fn test_client_id_conflict_is_protocol_violation() {
    let (client, _sink) = node(Role::Client);
    let first = Entry::new("/a", EntryType::Boolean, Value::Boolean(true)).with_id(EntryId(1));
    client.offer_incoming_assignment(first).unwrap();

    let renamed = Entry::new("/a", EntryType::Boolean, Value::Boolean(true)).with_id(EntryId(2));
    let err = client.offer_incoming_assignment(renamed).unwrap_err();
    assert!(err.is_protocol_violation());

    let reused = Entry::new("/b", EntryType::Boolean, Value::Boolean(true)).with_id(EntryId(1));
    let err = client.offer_incoming_assignment(reused).unwrap_err();
    assert!(err.is_protocol_violation());

    assert_eq!(client.store().get_entry("/a").unwrap().id, EntryId(1));
    assert!(client.store().get_entry("/b").is_none());
}

#[test]
fn test_client_ignores_id_requests() {
    let (client, _sink) = node(Role::Client);
    let request = Entry::new("/a", EntryType::Boolean, Value::Boolean(true));
    assert!(!client.offer_incoming_assignment(request).unwrap());
    assert!(client.store().is_empty());
}

#[test]
fn test_server_ignores_duplicate_id_request() {
    let (server, _sink) = node(Role::Server);
    server.put_double("/speed", 1.0).unwrap();

    let request = Entry::new("/speed", EntryType::Double, Value::Double(5.0));
    assert!(!server.offer_incoming_assignment(request).unwrap());
    assert_eq!(server.get_double("/speed").unwrap(), 1.0);

    let unknown = Entry::new("/other", EntryType::Double, Value::Double(5.0)).with_id(EntryId(7));
    assert!(!server.offer_incoming_assignment(unknown).unwrap());
    assert!(!server.contains_key("/other"));
}

#[test]
fn test_server_assigns_dense_ids() {
    let (server, _sink) = node(Role::Server);
    server.put_double("/a", 1.0).unwrap();
    let request = Entry::new("/b", EntryType::Double, Value::Double(1.0));
    assert!(server.offer_incoming_assignment(request).unwrap());
    server.put_double("/c", 1.0).unwrap();

    for (name, id) in [("/a", 0), ("/b", 1), ("/c", 2)] {
        let entry = server.store().get_entry_by_id(EntryId(id)).unwrap();
        assert_eq!(entry.name, name);
    }
    // The remotely created entry is relayed back, local ones are queued as usual
    assert_eq!(server.write_manager().queued(), 3);
}

#[test]
fn test_reconnect_resends_unassigned() {
    init_tracing();
    let (client, client_sink, server, _server_sink) = linked_pair();
    client.put_double("/a", 1.0).unwrap();
    client.write_manager().flush_now();
    server.write_manager().flush_now();
    assert_eq!(client.store().get_entry("/a").unwrap().id, EntryId(0));

    client.connection_established(remote("server"));
    assert!(client.store().get_entry("/a").unwrap().id.is_unknown());
    assert!(client.store().get_entry_by_id(EntryId(0)).is_none());
    assert_eq!(client.store().unassigned_entries().len(), 1);

    client_sink.clear();
    assert_eq!(client.resend_unassigned(), 1);
    client.write_manager().flush_now();
    assert_eq!(client_sink.assignments().len(), 1);
}

#[test]
fn test_server_echo_shares_dirty_slot_with_local_write() {
    let (server, sink) = node(Role::Server);
    let request = Entry::new("x", EntryType::Double, Value::Double(1.0));
    assert!(server.offer_incoming_assignment(request).unwrap());
    server.put_double("x", 5.0).unwrap();
    assert_eq!(server.write_manager().queued(), 1);

    assert_eq!(server.write_manager().flush_now(), 1);
    let sent = sink.transactions();
    assert_eq!(sent.len(), 1);
    let Sent::Assignment(entry) = &sent[0] else {
        panic!("expected an assignment, got {sent:?}");
    };
    assert_eq!(entry.id, EntryId(0));
    assert_eq!(entry.value, Value::Double(5.0));
    assert_eq!(entry.sequence, SequenceNumber(1));
}

#[test]
fn test_server_does_not_echo_known_entry() {
    let (server, sink) = node(Role::Server);
    server.put_double("/a", 1.0).unwrap();
    server.write_manager().flush_now();
    sink.clear();

    let incoming = Entry::new("/a", EntryType::Double, Value::Double(2.0))
        .with_id(EntryId(0))
        .with_sequence(SequenceNumber(1));
    assert!(server.offer_incoming_assignment(incoming).unwrap());
    assert_eq!(server.get_double("/a").unwrap(), 2.0);
    assert_eq!(server.write_manager().queued(), 0);
    server.write_manager().flush_now();
    assert!(sink.transactions().is_empty());
}

#[derive(Default)]
struct Forwarded {
    kinds: Mutex<Vec<(TransactionKind, String)>>,
}

impl TransactionReceiver for Forwarded {
    fn offer_assignment(&self, entry: &EntrySnapshot) {
        self.kinds
            .lock()
            .push((TransactionKind::Assignment, entry.name.clone()));
    }

    fn offer_update(&self, entry: &EntrySnapshot) {
        self.kinds.lock().push((TransactionKind::Update, entry.name.clone()));
    }
}

#[test]
fn test_incoming_receiver_sees_accepted_remote_changes() {
    let store = EntryStore::new(Role::Client);
    let forwarded = Arc::new(Forwarded::default());
    store.set_incoming_receiver(forwarded.clone());

    let incoming = Entry::new("/a", EntryType::Double, Value::Double(1.0)).with_id(EntryId(0));
    assert!(store.offer_incoming_assignment(incoming).unwrap());
    assert!(store.offer_incoming_update(EntryId(0), SequenceNumber(1), Value::Double(2.0)));
    assert!(!store.offer_incoming_update(EntryId(0), SequenceNumber(1), Value::Double(3.0)));
    store
        .put_outgoing("/b", EntryType::Boolean, Value::Boolean(true))
        .unwrap();

    assert_eq!(
        *forwarded.kinds.lock(),
        vec![
            (TransactionKind::Assignment, "/a".to_string()),
            (TransactionKind::Update, "/a".to_string()),
        ]
    );
}

#[test]
fn test_reserved_type_ids_rejected() {
    let (node, _sink) = node(Role::Client);
    let value = Value::Complex {
        type_id: 0x01,
        data: vec![1, 2, 3],
    };
    assert_eq!(
        node.put_value("/x", value.clone()).unwrap_err(),
        TableError::ReservedTypeId(0x01)
    );
    assert!(node.store().is_empty());

    let incoming = Entry::new("/x", EntryType::Complex(0x01), value).with_id(EntryId(0));
    assert!(!node.offer_incoming_assignment(incoming).unwrap());
    assert!(node.store().is_empty());
}

/// Writes `/b` to its own node while `/a` is being sent.
#[derive(Default)]
struct WritingSink {
    node: Mutex<Option<Weak<Node>>>,
    sent: Mutex<Vec<String>>,
}

impl TransactionSink for WritingSink {
    fn send_assignment(&self, entry: &EntrySnapshot) -> Result<()> {
        self.sent.lock().push(entry.name.clone());
        let node = self.node.lock().as_ref().and_then(Weak::upgrade);
        if let (Some(node), "/a") = (node, entry.name.as_str()) {
            node.put_double("/b", 1.0)?;
        }
        Ok(())
    }

    fn send_update(&self, _entry: &EntrySnapshot, _sequence: SequenceNumber) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn send_keep_alive(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_overflow_during_own_flush_waits_for_next_tick() {
    let sink = Arc::new(WritingSink::default());
    let node = Node::new(
        Role::Client,
        sink.clone(),
        quiet_config().with_queue_capacity(1),
    );
    *sink.node.lock() = Some(Arc::downgrade(&node));

    // Capacity 1 drains on every write, including the one made by the sink
    node.put_double("/a", 1.0).unwrap();
    assert_eq!(*sink.sent.lock(), vec!["/a".to_string()]);
    assert_eq!(node.write_manager().queued(), 1);

    node.write_manager().flush_now();
    assert_eq!(*sink.sent.lock(), vec!["/a".to_string(), "/b".to_string()]);
}

#[test]
fn test_replay_assignments() {
    let (server, _sink) = node(Role::Server);
    server.put_double("/a", 1.0).unwrap();
    server.put_string("/b", "x").unwrap();

    let fresh = RecordingSink::default();
    server.replay_assignments(&fresh).unwrap();
    let names: Vec<_> = fresh.assignments().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["/a", "/b"]);
    assert_eq!(fresh.count(&Sent::Flush), 1);
}

#[test]
fn test_typed_getters() {
    let (node, _sink) = node(Role::Client);
    assert_eq!(
        node.get_double("/missing").unwrap_err(),
        TableError::KeyNotDefined("/missing".to_string())
    );

    node.put_double("/speed", 3.5).unwrap();
    node.put_string("/mode", "auto").unwrap();
    assert_eq!(node.get_double("/speed").unwrap(), 3.5);
    assert_eq!(node.get_string("/mode").unwrap(), "auto");
    assert!(matches!(
        node.get_boolean("/speed").unwrap_err(),
        TableError::TypeMismatch {
            existing: EntryType::Double,
            requested: EntryType::Boolean,
            ..
        }
    ));
    assert!(node.contains_key("/speed"));
    assert_eq!(node.keys(), vec!["/mode".to_string(), "/speed".to_string()]);
}

#[test]
fn test_complex_values() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pose {
        x: f64,
        y: f64,
    }

    let (node, sink) = node(Role::Client);
    let codec = BincodeCodec::<Pose>::new(0x20).unwrap();
    let pose = Pose { x: 1.0, y: 2.0 };
    node.put_complex("/pose", &codec, &pose).unwrap();
    node.put_complex("/pose", &codec, &pose).unwrap();
    node.write_manager().flush_now();

    assert_eq!(node.get_complex("/pose", &codec, None).unwrap(), pose);
    assert_eq!(sink.transactions().len(), 1);
    assert_eq!(
        node.store().get_entry("/pose").unwrap().entry_type,
        EntryType::Complex(0x20)
    );

    let other = BincodeCodec::<Pose>::new(0x21).unwrap();
    assert!(matches!(
        node.put_complex("/pose", &other, &pose).unwrap_err(),
        TableError::TypeMismatch { .. }
    ));
}

#[test]
fn test_table_and_sub_table_listeners() {
    let (node, _sink) = node(Role::Client);
    node.put_double("/Drive/Left/speed", 1.0).unwrap();

    let table = Arc::new(ChangeLog::default());
    let sub_tables = Arc::new(ChangeLog::default());
    node.add_table_listener("/Drive", table.clone(), true);
    node.add_sub_table_listener("/Drive", sub_tables.clone());

    node.put_double("/Drive/speed", 1.0).unwrap();
    node.put_double("/Drive/Left/current", 1.0).unwrap();
    node.put_double("/Drive/Right/speed", 1.0).unwrap();
    node.put_double("/Arm/angle", 1.0).unwrap();

    assert_eq!(table.keys(), vec!["speed".to_string()]);
    assert_eq!(table.events.lock()[0].0, "/Drive");
    assert_eq!(sub_tables.keys(), vec!["Left".to_string(), "Right".to_string()]);
}

#[derive(Default)]
struct ConnectionLog {
    events: Mutex<Vec<String>>,
}

impl ConnectionListener for ConnectionLog {
    fn connected(&self, remote: &RemoteInfo) {
        self.events.lock().push(format!("connected {}", remote.remote_id));
    }

    fn disconnected(&self, remote: Option<&RemoteInfo>) {
        let name = remote.map_or("-", |remote| remote.remote_id.as_str());
        self.events.lock().push(format!("disconnected {name}"));
    }
}

#[test]
fn test_connection_listeners() {
    let (node, _sink) = node(Role::Client);
    let early = Arc::new(ConnectionLog::default());
    node.add_connection_listener(early.clone(), true);
    assert!(!node.is_connected());

    node.connection_established(remote("server"));
    assert!(node.is_connected());
    assert_eq!(node.remote().unwrap().remote_port, 1735);

    let late = Arc::new(ConnectionLog::default());
    node.add_connection_listener(late.clone(), true);
    let silent = Arc::new(ConnectionLog::default());
    node.add_connection_listener(silent.clone(), false);

    node.connection_lost();
    node.connection_lost();
    assert!(!node.is_connected());

    assert_eq!(
        *early.events.lock(),
        vec!["disconnected -", "connected server", "disconnected server"]
    );
    assert_eq!(
        *late.events.lock(),
        vec!["connected server", "disconnected server"]
    );
    assert_eq!(*silent.events.lock(), vec!["disconnected server"]);
}

#[test]
fn test_keep_alive_when_idle() {
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(
        Role::Client,
        sink.clone(),
        WriteManagerConfig::default().with_keep_alive_delay(Duration::from_millis(50)),
    );

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(node.write_manager().flush_now(), 0);
    assert_eq!(sink.count(&Sent::KeepAlive), 1);

    // Traffic resets the idle timer
    node.put_boolean("/a", true).unwrap();
    assert_eq!(node.write_manager().flush_now(), 1);
    assert_eq!(node.write_manager().flush_now(), 0);
    assert_eq!(sink.count(&Sent::KeepAlive), 1);
}

#[test]
fn test_background_flush_thread() {
    init_tracing();
    let sink = Arc::new(RecordingSink::default());
    let node = Node::new(
        Role::Client,
        sink.clone(),
        quiet_config().with_flush_interval(Duration::from_millis(5)),
    );
    node.start().unwrap();
    node.start().unwrap();
    assert!(node.write_manager().is_running());

    node.put_double("/a", 1.0).unwrap();
    let mut waited = Duration::ZERO;
    while sink.assignments().is_empty() && waited < Duration::from_secs(2) {
        std::thread::sleep(Duration::from_millis(5));
        waited += Duration::from_millis(5);
    }
    assert_eq!(sink.assignments().len(), 1);

    node.stop();
    assert!(!node.write_manager().is_running());
    node.put_double("/a", 2.0).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(sink.updates().is_empty());
    assert_eq!(node.write_manager().queued(), 1);
}

#[test]
fn test_concurrent_writers() {
    init_tracing();
    let (client, client_sink, server, _server_sink) = linked_pair();
    for writer in 0..4 {
        client.put_double(&format!("/w{writer}/value"), -1.0).unwrap();
    }
    client.write_manager().flush_now();
    server.write_manager().flush_now();
    client_sink.clear();

    client.start().unwrap();
    server.start().unwrap();
    std::thread::scope(|scope| {
        for writer in 0..4 {
            let client = client.clone();
            scope.spawn(move || {
                let key = format!("/w{writer}/value");
                for i in 0..200 {
                    client.put_double(&key, i as f64).unwrap();
                }
            });
        }
    });
    client.stop();
    server.stop();
    client.write_manager().flush_now();

    for writer in 0..4 {
        let key = format!("/w{writer}/value");
        assert_eq!(client.get_double(&key).unwrap(), 199.0);
        assert_eq!(server.get_double(&key).unwrap(), 199.0);
        assert_eq!(
            server.store().get_entry(&key).unwrap().sequence,
            SequenceNumber(200)
        );
    }
    assert!(client_sink.assignments().is_empty());
    assert!(client_sink.updates().len() <= 800);
}

#[tokio::test]
async fn test_watchers() {
    let (node, _sink) = node(Role::Client);
    let mut exact = node.watch("/a");
    let mut prefix = node.watch_prefix("/Drive/");

    node.put_boolean("/a", true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), exact.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(!prefix.has_changed().unwrap());

    node.put_double("/Drive/speed", 1.0).unwrap();
    tokio::time::timeout(Duration::from_secs(1), prefix.changed())
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_default_instance() {
    let (node, _sink) = node(Role::Server);
    Node::install_default(node.clone()).ok().unwrap();
    let default = Node::default_instance().unwrap();
    assert!(Arc::ptr_eq(&default, &node));
    assert!(Node::install_default(node).is_err());
}
