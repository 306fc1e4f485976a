//! Per-hook callback tables ordered by `(priority, sequence)`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::callback::HookCallback;

/// Priority used when a caller has no preference.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Handle returned by registration, used to remove or look up a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// One entry in a hook's callback list. Never mutated after insertion.
#[derive(Clone)]
pub struct Registration {
    id: CallbackId,
    priority: i32,
    owner: Option<String>,
    callback: Arc<dyn HookCallback>,
}

impl Registration {
    /// The handle returned when this callback was added.
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Lower runs earlier.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration order, used as the tie-break within a priority.
    pub fn sequence(&self) -> u64 {
        self.id.0
    }

    /// Owning plugin slug; `None` for host code.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub(crate) fn callback(&self) -> &Arc<dyn HookCallback> {
        &self.callback
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Callback lists for every hook of one kind (actions or filters).
///
/// Sequence numbers are handed out by the manager, are unique across
/// actions and filters, and double as [`CallbackId`]s, so ordering by
/// `(priority, sequence)` is first-registered, first-run within a priority.
#[derive(Default)]
pub(crate) struct HookTable {
    hooks: HashMap<String, BTreeMap<(i32, u64), Registration>>,
}

impl HookTable {
    pub(crate) fn insert(
        &mut self,
        hook: &str,
        sequence: u64,
        priority: i32,
        owner: Option<String>,
        callback: Arc<dyn HookCallback>,
    ) -> CallbackId {
        let id = CallbackId(sequence);
        self.hooks.entry(hook.to_string()).or_default().insert(
            (priority, id.0),
            Registration {
                id,
                priority,
                owner,
                callback,
            },
        );
        id
    }

    /// Remove `id` from `hook`. When `priority` is given it must match.
    pub(crate) fn remove(&mut self, hook: &str, id: CallbackId, priority: Option<i32>) -> bool {
        let Some(list) = self.hooks.get_mut(hook) else {
            return false;
        };
        let Some(slot) = list
            .iter()
            .find(|(_, reg)| reg.id == id)
            .map(|(slot, _)| *slot)
        else {
            return false;
        };
        if priority.is_some_and(|p| p != slot.0) {
            return false;
        }
        list.remove(&slot);
        if list.is_empty() {
            self.hooks.remove(hook);
        }
        true
    }

    /// Remove every callback on `hook`, or only those at `priority`.
    pub(crate) fn remove_all(&mut self, hook: &str, priority: Option<i32>) -> usize {
        let Some(list) = self.hooks.get_mut(hook) else {
            return 0;
        };
        let before = list.len();
        match priority {
            Some(p) => list.retain(|(priority, _), _| *priority != p),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.hooks.remove(hook);
        }
        removed
    }

    pub(crate) fn contains(&self, hook: &str) -> bool {
        self.hooks.get(hook).is_some_and(|list| !list.is_empty())
    }

    pub(crate) fn priority_of(&self, hook: &str, id: CallbackId) -> Option<i32> {
        self.hooks
            .get(hook)?
            .values()
            .find(|reg| reg.id == id)
            .map(|reg| reg.priority)
    }

    /// Ordered copy of `hook`'s callbacks, taken before dispatch starts.
    pub(crate) fn snapshot(&self, hook: &str) -> Vec<Registration> {
        self.hooks
            .get(hook)
            .map(|list| list.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_fn;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

    fn noop() -> Arc<dyn HookCallback> {
        callback_fn(|_| Ok(Value::Null))
    }

    fn add(table: &mut HookTable, hook: &str, priority: i32) -> CallbackId {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        table.insert(hook, sequence, priority, None, noop())
    }

    fn order(table: &HookTable, hook: &str) -> Vec<CallbackId> {
        table.snapshot(hook).iter().map(Registration::id).collect()
    }

    #[test]
    fn orders_by_priority_then_sequence() {
        let mut table = HookTable::default();
        let a = add(&mut table, "x", 10);
        let b = add(&mut table, "x", 5);
        let c = add(&mut table, "x", 10);
        let d = add(&mut table, "x", -1);
        assert_eq!(order(&table, "x"), vec![d, b, a, c]);
    }

    #[test]
    fn remove_requires_matching_priority() {
        let mut table = HookTable::default();
        let id = add(&mut table, "x", 10);
        assert!(!table.remove("x", id, Some(5)));
        assert!(!table.remove("y", id, None));
        assert!(table.remove("x", id, Some(10)));
        assert!(!table.remove("x", id, None));
        assert!(!table.contains("x"));
    }

    #[test]
    fn remove_all_by_priority() {
        let mut table = HookTable::default();
        add(&mut table, "x", 10);
        let keep = add(&mut table, "x", 20);
        add(&mut table, "x", 10);
        assert_eq!(table.remove_all("x", Some(10)), 2);
        assert_eq!(order(&table, "x"), vec![keep]);
        assert_eq!(table.remove_all("x", Some(10)), 0);
        assert_eq!(table.remove_all("x", None), 1);
        assert_eq!(table.remove_all("missing", None), 0);
    }

    #[test]
    fn priority_lookup() {
        let mut table = HookTable::default();
        let id = table.insert("x", 0, 42, Some("acme".into()), noop());
        assert_eq!(table.priority_of("x", id), Some(42));
        assert_eq!(table.priority_of("y", id), None);
        assert_eq!(table.snapshot("x")[0].owner(), Some("acme"));
    }

    #[test]
    fn ids_are_unique_across_hooks() {
        let mut table = HookTable::default();
        let a = add(&mut table, "x", 10);
        let b = add(&mut table, "y", 10);
        assert_ne!(a, b);
        assert!(!table.remove("x", b, None));
        assert_eq!(table.hook_names(), vec!["x".to_string(), "y".to_string()]);
    }
}
