use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handler invoked with the name of the member about to change or just changed.
pub type MemberHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pre-/post-change notification hooks an entity may expose.
///
/// Handlers run on the thread raising the notification, outside the handler
/// list lock, so a handler may subscribe or unsubscribe without deadlocking.
pub struct ChangeNotifier {
    supports_changing: bool,
    supports_changed: bool,
    changing: RwLock<Vec<(SubscriptionId, MemberHandler)>>,
    changed: RwLock<Vec<(SubscriptionId, MemberHandler)>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("supports_changing", &self.supports_changing)
            .field("supports_changed", &self.supports_changed)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ChangeNotifier {
    /// Raises both changing and changed notifications.
    pub fn new() -> Self {
        Self::with_support(true, true)
    }

    /// Raises only post-change notifications.
    pub fn changed_only() -> Self {
        Self::with_support(false, true)
    }

    pub fn with_support(supports_changing: bool, supports_changed: bool) -> Self {
        Self {
            supports_changing,
            supports_changed,
            changing: RwLock::new(Vec::new()),
            changed: RwLock::new(Vec::new()),
        }
    }

    pub fn supports_changing(&self) -> bool {
        self.supports_changing
    }

    pub fn supports_changed(&self) -> bool {
        self.supports_changed
    }

    /// Returns `None` when this notifier never raises pre-change notifications.
    pub fn subscribe_changing(&self, handler: MemberHandler) -> Option<SubscriptionId> {
        if !self.supports_changing {
            return None;
        }
        let id = SubscriptionId::next();
        self.changing
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, handler));
        Some(id)
    }

    /// Returns `None` when this notifier never raises post-change notifications.
    pub fn subscribe_changed(&self, handler: MemberHandler) -> Option<SubscriptionId> {
        if !self.supports_changed {
            return None;
        }
        let id = SubscriptionId::next();
        self.changed
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, handler));
        Some(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for list in [&self.changing, &self.changed] {
            let mut handlers = list.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = handlers.len();
            handlers.retain(|(existing, _)| *existing != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    pub fn notify_changing(&self, member: &str) {
        Self::dispatch(&self.changing, member);
    }

    pub fn notify_changed(&self, member: &str) {
        Self::dispatch(&self.changed, member);
    }

    pub fn subscriber_count(&self) -> usize {
        let count = |list: &RwLock<Vec<(SubscriptionId, MemberHandler)>>| {
            list.read()
                .map(|handlers| handlers.len())
                .unwrap_or_else(|poisoned| poisoned.into_inner().len())
        };
        count(&self.changing) + count(&self.changed)
    }

    fn dispatch(list: &RwLock<Vec<(SubscriptionId, MemberHandler)>>, member: &str) {
        let handlers: Vec<MemberHandler> = list
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_notify_unsubscribe() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = notifier
            .subscribe_changed(Arc::new(move |member| {
                sink.lock().unwrap().push(member.to_string())
            }))
            .unwrap();

        notifier.notify_changed("name");
        assert!(notifier.unsubscribe(id));
        notifier.notify_changed("email");
        assert!(!notifier.unsubscribe(id));

        assert_eq!(*seen.lock().unwrap(), vec!["name".to_string()]);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_changed_only_refuses_changing_handlers() {
        let notifier = ChangeNotifier::changed_only();
        assert!(notifier.subscribe_changing(Arc::new(|_| {})).is_none());
        assert!(notifier.subscribe_changed(Arc::new(|_| {})).is_some());
        assert_eq!(notifier.subscriber_count(), 1);
    }
}
