//! Per-conversation message listeners.

use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{ConversationId, Frame};

/// Callback invoked with every inbound frame of a conversation.
///
/// Identity is the `Arc` allocation: keep a clone to remove the listener later.
pub type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Ordered listener lists keyed by conversation. Insertion order is invocation order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: DashMap<ConversationId, Vec<Listener>>,
}

impl ListenerRegistry {
    pub(crate) fn add(&self, id: ConversationId, listener: Listener) {
        self.entries.entry(id).or_default().push(listener);
    }

    /// Removes every registration of `listener` for `id`; other ids are untouched.
    pub(crate) fn remove(&self, id: ConversationId, listener: &Listener) {
        let emptied = match self.entries.get_mut(&id) {
            Some(mut listeners) => {
                listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
                listeners.is_empty()
            }
            None => false,
        };
        if emptied {
            self.entries.remove_if(&id, |_, listeners| listeners.is_empty());
        }
    }

    pub(crate) fn remove_all(&self, id: ConversationId) {
        self.entries.remove(&id);
    }

    /// Drops the listeners of every conversation except `id`.
    pub(crate) fn retain_only(&self, id: ConversationId) {
        self.entries.retain(|key, _| *key == id);
    }

    /// Listeners of `id` at this instant. Callbacks run on the snapshot, outside any lock,
    /// so they may add or remove listeners themselves.
    pub(crate) fn snapshot(&self, id: ConversationId) -> Vec<Listener> {
        self.entries
            .get(&id)
            .map(|listeners| listeners.clone())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, id: ConversationId) -> usize {
        self.entries.get(&id).map_or(0, |listeners| listeners.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |frame: &Frame| {
            log.lock()
                .unwrap()
                .push(format!("{label}:{}", frame.as_text().unwrap()));
        })
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let registry = ListenerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = ConversationId(1);

        registry.add(id, recorder(&log, "a"));
        registry.add(id, recorder(&log, "b"));
        registry.add(id, recorder(&log, "c"));

        let frame = Frame::from("1");
        for listener in registry.snapshot(id) {
            listener(&frame);
        }

        assert_eq!(*log.lock().unwrap(), ["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn remove_matches_by_identity() {
        let registry = ListenerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = ConversationId(1);
        let kept = recorder(&log, "kept");
        let dropped = recorder(&log, "dropped");

        registry.add(id, Arc::clone(&kept));
        registry.add(id, Arc::clone(&dropped));
        registry.add(ConversationId(2), Arc::clone(&dropped));
        registry.remove(id, &dropped);

        assert_eq!(registry.count(id), 1);
        assert_eq!(registry.count(ConversationId(2)), 1);
        assert!(Arc::ptr_eq(&registry.snapshot(id)[0], &kept));

        registry.remove(id, &kept);
        assert_eq!(registry.count(id), 0);
    }

    #[test]
    fn retain_only_evicts_other_conversations() {
        let registry = ListenerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add(ConversationId(1), recorder(&log, "one"));
        registry.add(ConversationId(2), recorder(&log, "two"));
        registry.retain_only(ConversationId(2));

        assert_eq!(registry.count(ConversationId(1)), 0);
        assert_eq!(registry.count(ConversationId(2)), 1);

        registry.remove_all(ConversationId(2));
        assert_eq!(registry.count(ConversationId(2)), 0);
    }
}
