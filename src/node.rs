use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

use crate::codec::ComplexCodec;
use crate::entry::Entry;
use crate::error::{Result, TableError};
use crate::listener::{
    KeyListenerAdapter, ListenerHandle, SubTableListenerAdapter, TableListener,
    TableListenerAdapter,
};
use crate::store::EntryStore;
use crate::transport::TransactionSink;
use crate::types::{EntryId, EntryType, Role, SequenceNumber, Value};
use crate::write_manager::{WriteManager, WriteManagerConfig};

static DEFAULT_NODE: OnceLock<Arc<Node>> = OnceLock::new();

/// Peer on the other end of the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub protocol_version: u16,
}

/// Connectivity callbacks. Invoked with the node's connection state locked,
/// so implementations must not query or change it.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, remote: &RemoteInfo);

    /// `remote` is `None` when reporting the initial state of a node that
    /// has never been connected.
    fn disconnected(&self, remote: Option<&RemoteInfo>);
}

#[derive(Default)]
struct ConnectionState {
    remote: Option<RemoteInfo>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

/// The local participant: one entry store, its write manager and the
/// connection bookkeeping.
pub struct Node {
    role: Role,
    store: Arc<EntryStore>,
    write_manager: Arc<WriteManager>,
    connection: Mutex<ConnectionState>,
}

impl Node {
    pub fn new(
        role: Role,
        transport: Arc<dyn TransactionSink>,
        config: WriteManagerConfig,
    ) -> Arc<Self> {
        let store = Arc::new(EntryStore::new(role));
        let write_manager = Arc::new(WriteManager::new(&store, transport, config));
        store.set_outgoing_receiver(write_manager.clone());

        Arc::new(Self {
            role,
            store,
            write_manager,
            connection: Mutex::new(ConnectionState::default()),
        })
    }

    /// Makes `node` the process-wide default. Fails if one is installed.
    pub fn install_default(node: Arc<Node>) -> std::result::Result<(), Arc<Node>> {
        DEFAULT_NODE.set(node)
    }

    pub fn default_instance() -> Option<Arc<Node>> {
        DEFAULT_NODE.get().cloned()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn write_manager(&self) -> &Arc<WriteManager> {
        &self.write_manager
    }

    pub fn start(&self) -> anyhow::Result<()> {
        self.write_manager.start()
    }

    pub fn stop(&self) {
        self.write_manager.stop();
    }

    pub fn put_value(&self, name: &str, value: Value) -> Result<()> {
        self.store.put_outgoing(name, value.entry_type(), value)?;
        Ok(())
    }

    pub fn put_boolean(&self, name: &str, value: bool) -> Result<()> {
        self.put_value(name, Value::Boolean(value))
    }

    pub fn put_double(&self, name: &str, value: f64) -> Result<()> {
        self.put_value(name, Value::Double(value))
    }

    pub fn put_string(&self, name: &str, value: impl Into<String>) -> Result<()> {
        self.put_value(name, Value::String(value.into()))
    }

    pub fn put_complex<C: ComplexCodec>(
        &self,
        name: &str,
        codec: &C,
        value: &C::Internal,
    ) -> Result<()> {
        let value = codec.to_value(name, value)?;
        self.store.put_outgoing(name, codec.entry_type(), value)?;
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> Result<Value> {
        self.store
            .get_entry(name)
            .map(|entry| entry.value)
            .ok_or_else(|| TableError::KeyNotDefined(name.to_string()))
    }

    fn get_typed<T>(
        &self,
        name: &str,
        requested: EntryType,
        extract: impl FnOnce(Value) -> Option<T>,
    ) -> Result<T> {
        let value = self.get_value(name)?;
        let existing = value.entry_type();
        extract(value).ok_or_else(|| TableError::TypeMismatch {
            name: name.to_string(),
            existing,
            requested,
        })
    }

    pub fn get_boolean(&self, name: &str) -> Result<bool> {
        self.get_typed(name, EntryType::Boolean, |value| value.as_bool())
    }

    pub fn get_double(&self, name: &str) -> Result<f64> {
        self.get_typed(name, EntryType::Double, |value| value.as_f64())
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        self.get_typed(name, EntryType::String, |value| match value {
            Value::String(value) => Some(value),
            _ => None,
        })
    }

    pub fn get_complex<C: ComplexCodec>(
        &self,
        name: &str,
        codec: &C,
        previous: Option<C::Internal>,
    ) -> Result<C::Internal> {
        let value = self.get_value(name)?;
        codec.from_value(name, &value, previous)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.store.lookup(name).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Feeds a decoded remote assignment into the store.
    ///
    /// An error here is a protocol violation; the caller should drop the
    /// connection it came from.
    pub fn offer_incoming_assignment(&self, entry: Entry) -> Result<bool> {
        let result = self.store.offer_incoming_assignment(entry);
        if let Err(err) = &result {
            error!("Protocol violation on incoming assignment: {err}");
        }
        result
    }

    pub fn offer_incoming_update(
        &self,
        id: EntryId,
        sequence: SequenceNumber,
        value: Value,
    ) -> bool {
        self.store.offer_incoming_update(id, sequence, value)
    }

    /// Listens to every entry under its absolute key.
    pub fn add_listener(
        &self,
        listener: Arc<dyn TableListener>,
        immediate_notify: bool,
    ) -> ListenerHandle {
        self.store.add_listener(listener, immediate_notify)
    }

    /// Listens to the direct children of the table at `path`.
    pub fn add_table_listener(
        &self,
        path: &str,
        listener: Arc<dyn TableListener>,
        immediate_notify: bool,
    ) -> ListenerHandle {
        let adapter = TableListenerAdapter::new(path, listener);
        self.store.add_listener(Arc::new(adapter), immediate_notify)
    }

    /// Listens to one key of the table at `path`.
    pub fn add_key_listener(
        &self,
        path: &str,
        key: &str,
        listener: Arc<dyn TableListener>,
        immediate_notify: bool,
    ) -> ListenerHandle {
        let adapter = KeyListenerAdapter::new(path, key, listener);
        self.store.add_listener(Arc::new(adapter), immediate_notify)
    }

    /// Reports each sub-table of the table at `path` once, including the
    /// ones that already exist.
    pub fn add_sub_table_listener(
        &self,
        path: &str,
        listener: Arc<dyn TableListener>,
    ) -> ListenerHandle {
        let adapter = SubTableListenerAdapter::new(path, listener);
        self.store.add_listener(Arc::new(adapter), true)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.store.remove_listener(handle)
    }

    /// Notify on any change to `key`.
    pub fn watch(&self, key: &str) -> watch::Receiver<()> {
        self.store.watch(key)
    }

    /// Notify on any change to keys under `prefix`.
    pub fn watch_prefix(&self, prefix: &str) -> watch::Receiver<()> {
        self.store.watch_prefix(prefix)
    }

    /// Registers a connection listener. With `immediate_notify` it is told
    /// the current state right away.
    pub fn add_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
        immediate_notify: bool,
    ) {
        let mut connection = self.connection.lock();
        if immediate_notify {
            match &connection.remote {
                Some(remote) => listener.connected(remote),
                None => listener.disconnected(None),
            }
        }
        connection.listeners.push(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().remote.is_some()
    }

    pub fn remote(&self) -> Option<RemoteInfo> {
        self.connection.lock().remote.clone()
    }

    /// Called by the transport once a link is up. A client forgets the ids of
    /// the previous connection; the server will announce new ones.
    pub fn connection_established(&self, remote: RemoteInfo) {
        if self.role == Role::Client {
            self.store.clear_ids();
        }
        info!(
            remote = %remote.remote_id,
            ip = %remote.remote_ip,
            port = remote.remote_port,
            "Connected"
        );
        let mut connection = self.connection.lock();
        for listener in &connection.listeners {
            listener.connected(&remote);
        }
        connection.remote = Some(remote);
    }

    pub fn connection_lost(&self) {
        let mut connection = self.connection.lock();
        let Some(remote) = connection.remote.take() else {
            return;
        };
        info!(remote = %remote.remote_id, "Disconnected");
        for listener in &connection.listeners {
            listener.disconnected(Some(&remote));
        }
    }

    /// Queues an assignment for every entry the server has not assigned an
    /// id to yet. Returns how many were queued.
    pub fn resend_unassigned(&self) -> usize {
        self.store.requeue_unassigned()
    }

    /// Sends every entry as an assignment straight to `sink`, e.g. to bring a
    /// newly attached peer up to date.
    pub fn replay_assignments(&self, sink: &dyn TransactionSink) -> anyhow::Result<()> {
        for entry in self.store.entries() {
            sink.send_assignment(&entry)?;
        }
        sink.flush()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.write_manager.stop();
    }
}
