//! Value-change listeners and the adapters that narrow the store-wide feed.
//!
//! The store reports every change under its absolute key. The adapters here
//! filter that feed down to one key, the direct children of a table, or the
//! discovery of sub-tables, and rewrite keys so the event looks like it came
//! from the narrower table.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::Value;

/// Separator between table path components.
pub const PATH_SEPARATOR: char = '/';

/// One change notification.
#[derive(Debug, Clone, Copy)]
pub struct ValueChange<'a> {
    /// Path of the table the event appears to come from. Empty for the root.
    pub source: &'a str,
    pub key: &'a str,
    pub value: &'a Value,
    pub is_new: bool,
}

/// Receives value changes.
///
/// Called while the store lock is held: implementations must not call back
/// into the store or the node that owns it.
pub trait TableListener: Send + Sync {
    fn value_changed(&self, change: &ValueChange<'_>);
}

impl<F> TableListener for F
where
    F: Fn(&ValueChange<'_>) + Send + Sync,
{
    fn value_changed(&self, change: &ValueChange<'_>) {
        self(change)
    }
}

/// Registration token returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub(crate) u64);

fn table_prefix(path: &str) -> String {
    let mut prefix = path.trim_end_matches(PATH_SEPARATOR).to_string();
    prefix.push(PATH_SEPARATOR);
    prefix
}

/// Passes through changes to exactly one key.
pub struct KeyListenerAdapter {
    absolute_key: String,
    relative_key: String,
    source: String,
    target: Arc<dyn TableListener>,
}

impl KeyListenerAdapter {
    pub fn new(source: &str, relative_key: &str, target: Arc<dyn TableListener>) -> Self {
        Self {
            absolute_key: format!("{}{}", table_prefix(source), relative_key),
            relative_key: relative_key.to_string(),
            source: source.to_string(),
            target,
        }
    }

    pub fn key(&self) -> &str {
        &self.absolute_key
    }
}

impl TableListener for KeyListenerAdapter {
    fn value_changed(&self, change: &ValueChange<'_>) {
        if change.key != self.absolute_key {
            return;
        }
        self.target.value_changed(&ValueChange {
            source: &self.source,
            key: &self.relative_key,
            value: change.value,
            is_new: change.is_new,
        });
    }
}

/// Passes through changes to direct children of one table.
pub struct TableListenerAdapter {
    prefix: String,
    source: String,
    target: Arc<dyn TableListener>,
}

impl TableListenerAdapter {
    pub fn new(source: &str, target: Arc<dyn TableListener>) -> Self {
        Self {
            prefix: table_prefix(source),
            source: source.to_string(),
            target,
        }
    }
}

impl TableListener for TableListenerAdapter {
    fn value_changed(&self, change: &ValueChange<'_>) {
        let Some(relative_key) = change.key.strip_prefix(self.prefix.as_str()) else {
            return;
        };
        if relative_key.contains(PATH_SEPARATOR) {
            return;
        }
        self.target.value_changed(&ValueChange {
            source: &self.source,
            key: relative_key,
            value: change.value,
            is_new: change.is_new,
        });
    }
}

/// Reports each immediate sub-table of one table the first time any key
/// beneath it shows up.
///
/// The forwarded key is the sub-table name; the value is the one of the
/// entry that revealed it.
pub struct SubTableListenerAdapter {
    prefix: String,
    source: String,
    target: Arc<dyn TableListener>,
    notified: Mutex<HashSet<String>>,
}

impl SubTableListenerAdapter {
    pub fn new(source: &str, target: Arc<dyn TableListener>) -> Self {
        Self {
            prefix: table_prefix(source),
            source: source.to_string(),
            target,
            notified: Mutex::new(HashSet::new()),
        }
    }
}

impl TableListener for SubTableListenerAdapter {
    fn value_changed(&self, change: &ValueChange<'_>) {
        let Some(relative_key) = change.key.strip_prefix(self.prefix.as_str()) else {
            return;
        };
        let Some((sub_table, _)) = relative_key.split_once(PATH_SEPARATOR) else {
            return;
        };
        if !self.notified.lock().insert(sub_table.to_string()) {
            return;
        }
        self.target.value_changed(&ValueChange {
            source: &self.source,
            key: sub_table,
            value: change.value,
            is_new: change.is_new,
        });
    }
}
