use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::dirtier::{PendingTransaction, TransactionDirtier};
use crate::entry::Entry;
use crate::error::{Result, TableError};
use crate::listener::{ListenerHandle, TableListener, ValueChange};
use crate::transport::{TransactionKind, TransactionReceiver};
use crate::types::{EntryHandle, EntryId, EntrySnapshot, EntryType, Role, SequenceNumber, Value};

enum WatchPattern {
    Exact(String),
    Prefix(String),
}

struct Watcher {
    pattern: WatchPattern,
    sender: watch::Sender<()>,
}

struct Registered {
    handle: ListenerHandle,
    listener: Arc<dyn TableListener>,
}

/// Everything guarded by the store lock
struct StoreState {
    role: Role,

    /// Entry slots, indexed by `EntryHandle`. Both indices below point here,
    /// so there is exactly one `Entry` per name.
    entries: Vec<Entry>,
    by_name: BTreeMap<String, EntryHandle>,
    /// Dense id -> slot map for the current connection
    by_id: Vec<Option<EntryHandle>>,
    next_id: u16,

    listeners: Vec<Registered>,
    next_listener: u64,
    watchers: Vec<Watcher>,

    outgoing: Option<TransactionDirtier>,
    incoming: Option<Arc<dyn TransactionReceiver>>,
}

fn notify_watchers(watchers: &mut Vec<Watcher>, key: &str) {
    watchers.retain(|watcher| {
        let matches = match &watcher.pattern {
            WatchPattern::Exact(watch_key) => watch_key == key,
            WatchPattern::Prefix(prefix) => key.starts_with(prefix),
        };

        if matches {
            watcher.sender.send(()).is_ok()
        } else {
            true
        }
    });
}

impl StoreState {
    fn lookup(&self, name: &str) -> Option<EntryHandle> {
        self.by_name.get(name).copied()
    }

    fn by_id(&self, id: EntryId) -> Option<EntryHandle> {
        if id.is_unknown() {
            return None;
        }
        self.by_id.get(id.index()).copied().flatten()
    }

    fn bind_id(&mut self, id: EntryId, handle: EntryHandle) {
        let index = id.index();
        if self.by_id.len() <= index {
            self.by_id.resize(index + 1, None);
        }
        self.by_id[index] = Some(handle);
    }

    fn allocate_id(&mut self) -> Option<EntryId> {
        let id = EntryId(self.next_id);
        if id.is_unknown() {
            warn!("Entry id space exhausted, leaving entry unassigned");
            return None;
        }
        self.next_id += 1;
        Some(id)
    }

    fn insert(&mut self, entry: Entry) -> EntryHandle {
        let handle = EntryHandle(self.entries.len());
        let id = entry.id();
        self.by_name.insert(entry.name().to_string(), handle);
        self.entries.push(entry);
        if !id.is_unknown() {
            self.bind_id(id, handle);
        }
        handle
    }

    /// Fires listeners and watchers for one entry.
    fn fire(&mut self, handle: EntryHandle) {
        let is_new = self.entries[handle.0].take_is_new();
        let entry = &self.entries[handle.0];
        let change = ValueChange {
            source: "",
            key: entry.name(),
            value: entry.value(),
            is_new,
        };
        for registered in &self.listeners {
            registered.listener.value_changed(&change);
        }
        notify_watchers(&mut self.watchers, entry.name());
    }

    fn outgoing(&mut self, kind: TransactionKind, handle: EntryHandle) -> Option<PendingTransaction> {
        let dirtier = self.outgoing.as_ref()?;
        dirtier.offer(kind, handle, &mut self.entries[handle.0])
    }

    fn incoming(&self, kind: TransactionKind, handle: EntryHandle) -> Option<PendingTransaction> {
        let target = self.incoming.clone()?;
        let snapshot = self.entries[handle.0].snapshot(handle);
        Some(PendingTransaction::new(target, kind, snapshot))
    }

    fn update_local(
        &mut self,
        handle: EntryHandle,
        entry_type: EntryType,
        value: Value,
    ) -> Result<Option<PendingTransaction>> {
        let entry = &mut self.entries[handle.0];
        if entry.entry_type() != entry_type {
            return Err(TableError::TypeMismatch {
                name: entry.name().to_string(),
                existing: entry.entry_type(),
                requested: entry_type,
            });
        }
        if *entry.value() == value {
            trace!(name = entry.name(), "Value unchanged, skipping put");
            return Ok(None);
        }
        let sequence = entry.sequence().next();
        entry.force_put(sequence, value, None);
        debug!(name = entry.name(), %sequence, "Updated local entry");
        self.fire(handle);
        Ok(self.outgoing(TransactionKind::Update, handle))
    }

    /// Returns the handle of the applied entry and whether it was created.
    fn server_assignment(&mut self, incoming: Entry) -> Result<Option<(EntryHandle, bool)>> {
        let Some(handle) = self.lookup(incoming.name()) else {
            if !incoming.id().is_unknown() {
                debug!(
                    name = incoming.name(),
                    id = %incoming.id(),
                    "Server received assignment to unknown entry, ignoring"
                );
                return Ok(None);
            }
            let mut entry = incoming;
            if let Some(id) = self.allocate_id() {
                entry.assign_id(id)?;
            }
            debug!(name = entry.name(), id = %entry.id(), "Created remote entry");
            let handle = self.insert(entry);
            self.fire(handle);
            return Ok(Some((handle, true)));
        };

        let existing = &mut self.entries[handle.0];
        if incoming.id().is_unknown() || incoming.id() != existing.id() {
            debug!(
                name = existing.name(),
                "Entry already assigned, ignoring assignment request"
            );
            return Ok(None);
        }
        if incoming.entry_type() != existing.entry_type() {
            debug!(
                name = existing.name(),
                existing = %existing.entry_type(),
                received = %incoming.entry_type(),
                "Ignoring assignment with mismatched type"
            );
            return Ok(None);
        }
        if !existing.try_update(incoming.sequence(), incoming.value().clone()) {
            trace!(name = existing.name(), seq = %incoming.sequence(), "Stale assignment");
            return Ok(None);
        }
        self.fire(handle);
        Ok(Some((handle, false)))
    }

    fn client_assignment(&mut self, incoming: Entry) -> Result<Option<(EntryHandle, bool)>> {
        let id = incoming.id();
        if id.is_unknown() {
            debug!(
                name = incoming.name(),
                "Client received an id request, ignoring"
            );
            return Ok(None);
        }
        if let Some(bound) = self.by_id(id) {
            let bound = &self.entries[bound.0];
            if bound.name() != incoming.name() {
                return Err(TableError::IdAlreadyAssigned {
                    name: incoming.name().to_string(),
                    existing: bound.id(),
                    requested: id,
                });
            }
        }

        let Some(handle) = self.lookup(incoming.name()) else {
            debug!(name = incoming.name(), %id, "Created remote entry");
            let handle = self.insert(incoming);
            self.fire(handle);
            return Ok(Some((handle, true)));
        };

        let existing = &mut self.entries[handle.0];
        let rebind = existing.id() != id;
        if rebind {
            existing.assign_id(id)?;
        }
        let changed = existing.entry_type() != incoming.entry_type()
            || *existing.value() != *incoming.value();
        existing.force_put(
            incoming.sequence(),
            incoming.value().clone(),
            Some(incoming.entry_type()),
        );
        if rebind {
            self.bind_id(id, handle);
        }
        if changed {
            self.fire(handle);
        }
        Ok(Some((handle, false)))
    }
}

fn deliver(pending: impl IntoIterator<Item = PendingTransaction>) {
    for transaction in pending {
        transaction.deliver();
    }
}

/// Authoritative record of every entry one participant knows about.
///
/// All mutation is serialized by one lock. Listeners run with that lock held;
/// transaction receivers run after it is released.
pub struct EntryStore {
    state: Mutex<StoreState>,
}

impl EntryStore {
    pub fn new(role: Role) -> Self {
        Self {
            state: Mutex::new(StoreState {
                role,
                entries: Vec::new(),
                by_name: BTreeMap::new(),
                by_id: Vec::new(),
                next_id: 0,
                listeners: Vec::new(),
                next_listener: 0,
                watchers: Vec::new(),
                outgoing: None,
                incoming: None,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Receiver for locally originated changes, wrapped in a dirtier.
    pub fn set_outgoing_receiver(&self, receiver: Arc<dyn TransactionReceiver>) {
        self.state.lock().outgoing = Some(TransactionDirtier::new(receiver));
    }

    /// Receiver for accepted remote changes, e.g. to fan them out to other
    /// peers. Not needed on a point-to-point link.
    pub fn set_incoming_receiver(&self, receiver: Arc<dyn TransactionReceiver>) {
        self.state.lock().incoming = Some(receiver);
    }

    pub fn lookup(&self, name: &str) -> Option<EntryHandle> {
        self.state.lock().lookup(name)
    }

    pub fn get_entry(&self, name: &str) -> Option<EntrySnapshot> {
        let state = self.state.lock();
        let handle = state.lookup(name)?;
        Some(state.entries[handle.0].snapshot(handle))
    }

    pub fn get_entry_by_id(&self, id: EntryId) -> Option<EntrySnapshot> {
        let state = self.state.lock();
        let handle = state.by_id(id)?;
        Some(state.entries[handle.0].snapshot(handle))
    }

    pub fn snapshot(&self, handle: EntryHandle) -> Option<EntrySnapshot> {
        self.state
            .lock()
            .entries
            .get(handle.0)
            .map(|entry| entry.snapshot(handle))
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let state = self.state.lock();
        state
            .by_name
            .values()
            .map(|&handle| state.entries[handle.0].snapshot(handle))
            .collect()
    }

    /// Entries whose name starts with `prefix`, in name order.
    pub fn get_by_prefix(&self, prefix: &str) -> Vec<EntrySnapshot> {
        let state = self.state.lock();
        state
            .by_name
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, &handle)| state.entries[handle.0].snapshot(handle))
            .collect()
    }

    /// Creates or updates an entry from a local write.
    pub fn put_outgoing(
        &self,
        name: &str,
        entry_type: EntryType,
        value: Value,
    ) -> Result<EntryHandle> {
        if name.is_empty() {
            return Err(TableError::MissingArgument("name"));
        }
        if !entry_type.is_valid() {
            return Err(TableError::ReservedTypeId(entry_type.id()));
        }
        if value.entry_type() != entry_type {
            return Err(TableError::TypeMismatch {
                name: name.to_string(),
                existing: entry_type,
                requested: value.entry_type(),
            });
        }

        let mut state = self.state.lock();
        let (handle, pending) = match state.lookup(name) {
            Some(handle) => (handle, state.update_local(handle, entry_type, value)?),
            None => {
                let mut entry = Entry::new(name, entry_type, value);
                if state.role == Role::Server {
                    if let Some(id) = state.allocate_id() {
                        entry.assign_id(id)?;
                    }
                }
                debug!(name, id = %entry.id(), "Created local entry");
                let handle = state.insert(entry);
                state.fire(handle);
                (handle, state.outgoing(TransactionKind::Assignment, handle))
            }
        };
        drop(state);

        deliver(pending);
        Ok(handle)
    }

    /// Updates an entry already resolved to a handle.
    pub fn put_outgoing_entry(&self, handle: EntryHandle, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        if handle.0 >= state.entries.len() {
            return Err(TableError::MissingArgument("entry"));
        }
        let entry_type = value.entry_type();
        let pending = state.update_local(handle, entry_type, value)?;
        drop(state);

        deliver(pending);
        Ok(())
    }

    /// Applies an assignment received from the remote side.
    ///
    /// A server queues entries it creates here for sending back, so the
    /// creator learns the id. Returns whether the store changed. Errors are
    /// protocol violations.
    pub fn offer_incoming_assignment(&self, entry: Entry) -> Result<bool> {
        if !entry.entry_type().is_valid() {
            debug!(
                name = entry.name(),
                entry_type = %entry.entry_type(),
                "Ignoring assignment with reserved type id"
            );
            return Ok(false);
        }

        let mut state = self.state.lock();
        let applied = match state.role {
            Role::Server => state.server_assignment(entry)?,
            Role::Client => state.client_assignment(entry)?,
        };
        let Some((handle, created)) = applied else {
            return Ok(false);
        };
        let mut pending: Vec<PendingTransaction> =
            state.incoming(TransactionKind::Assignment, handle).into_iter().collect();
        if created && state.role == Role::Server {
            pending.extend(state.outgoing(TransactionKind::Assignment, handle));
        }
        drop(state);

        deliver(pending);
        Ok(true)
    }

    /// Applies a value update received from the remote side, if its sequence
    /// number is newer than the local one.
    pub fn offer_incoming_update(
        &self,
        id: EntryId,
        sequence: SequenceNumber,
        value: Value,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.by_id(id) else {
            debug!(%id, "Received update to unknown entry, ignoring");
            return false;
        };

        let entry = &mut state.entries[handle.0];
        if entry.entry_type() != value.entry_type() {
            debug!(
                name = entry.name(),
                existing = %entry.entry_type(),
                received = %value.entry_type(),
                "Ignoring update with mismatched type"
            );
            return false;
        }
        if !entry.try_update(sequence, value) {
            trace!(
                name = entry.name(),
                current = %entry.sequence(),
                received = %sequence,
                "Rejected stale update"
            );
            return false;
        }
        state.fire(handle);
        let pending = state.incoming(TransactionKind::Update, handle);
        drop(state);

        deliver(pending);
        true
    }

    /// Replays every entry to `listener` as a new value.
    pub fn notify_entries(&self, listener: &dyn TableListener) {
        let state = self.state.lock();
        replay(&state, listener);
    }

    /// Registers a listener. With `immediate_notify` it first sees every
    /// existing entry, before any live event.
    pub fn add_listener(
        &self,
        listener: Arc<dyn TableListener>,
        immediate_notify: bool,
    ) -> ListenerHandle {
        let mut state = self.state.lock();
        if immediate_notify {
            replay(&state, listener.as_ref());
        }
        let handle = ListenerHandle(state.next_listener);
        state.next_listener += 1;
        state.listeners.push(Registered { handle, listener });
        handle
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|registered| registered.handle != handle);
        state.listeners.len() != before
    }

    /// Forgets all ids; they belong to one connection, not to the names.
    pub fn clear_ids(&self) {
        let mut state = self.state.lock();
        for entry in &mut state.entries {
            entry.clear_id();
        }
        state.by_id.clear();
        if state.role == Role::Server {
            state.next_id = 0;
        }
        info!(entries = state.entries.len(), "Cleared entry ids");
    }

    pub fn unassigned_entries(&self) -> Vec<EntryHandle> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.id().is_unknown())
            .map(|(index, _)| EntryHandle(index))
            .collect()
    }

    /// Queues an assignment for every entry without an id.
    pub fn requeue_unassigned(&self) -> usize {
        let mut state = self.state.lock();
        let unassigned: Vec<EntryHandle> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.id().is_unknown())
            .map(|(index, _)| EntryHandle(index))
            .collect();
        let pending: Vec<PendingTransaction> = unassigned
            .into_iter()
            .filter_map(|handle| state.outgoing(TransactionKind::Assignment, handle))
            .collect();
        drop(state);

        let count = pending.len();
        deliver(pending);
        count
    }

    /// Clears the dirty flag and returns the current contents for sending.
    pub fn mark_clean(&self, handle: EntryHandle) -> Option<EntrySnapshot> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(handle.0)?;
        entry.mark_clean();
        Some(entry.snapshot(handle))
    }

    pub fn is_dirty(&self, handle: EntryHandle) -> bool {
        self.state
            .lock()
            .entries
            .get(handle.0)
            .is_some_and(Entry::is_dirty)
    }

    /// Watch a specific key for changes. Receiver notifies on any change to the key.
    pub fn watch(&self, key: &str) -> watch::Receiver<()> {
        let (sender, receiver) = watch::channel(());
        self.state.lock().watchers.push(Watcher {
            pattern: WatchPattern::Exact(key.to_string()),
            sender,
        });
        receiver
    }

    /// Watch keys sharing a prefix. Receiver notifies on any change to matching keys.
    pub fn watch_prefix(&self, prefix: &str) -> watch::Receiver<()> {
        let (sender, receiver) = watch::channel(());
        self.state.lock().watchers.push(Watcher {
            pattern: WatchPattern::Prefix(prefix.to_string()),
            sender,
        });
        receiver
    }
}

fn replay(state: &StoreState, listener: &dyn TableListener) {
    for &handle in state.by_name.values() {
        let entry = &state.entries[handle.0];
        listener.value_changed(&ValueChange {
            source: "",
            key: entry.name(),
            value: entry.value(),
            is_new: true,
        });
    }
}
