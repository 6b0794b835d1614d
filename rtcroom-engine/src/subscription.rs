//! Which remote streams the local user wants to receive
//!
//! Without an override every available stream is wanted (when auto
//! subscription is on). Explicit subscribe/unsubscribe calls are
//! idempotent overrides per `(user, stream type)` that last until the user
//! leaves or the override is flipped back.

use dashmap::DashMap;

use crate::types::{StreamType, UserId};

pub struct SubscriptionRegistry {
    auto_subscribe: bool,
    overrides: DashMap<(UserId, StreamType), bool>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(auto_subscribe: bool) -> Self {
        Self {
            auto_subscribe,
            overrides: DashMap::new(),
        }
    }

    #[must_use]
    pub fn wants(&self, user_id: &UserId, stream_type: StreamType) -> bool {
        self.overrides
            .get(&(user_id.clone(), stream_type))
            .map_or(self.auto_subscribe, |v| *v)
    }

    /// Returns true when the decision for this stream changed
    pub fn subscribe(&self, user_id: &UserId, stream_type: StreamType) -> bool {
        self.set(user_id, stream_type, true)
    }

    /// Returns true when the decision for this stream changed
    pub fn unsubscribe(&self, user_id: &UserId, stream_type: StreamType) -> bool {
        self.set(user_id, stream_type, false)
    }

    fn set(&self, user_id: &UserId, stream_type: StreamType, wanted: bool) -> bool {
        let before = self.wants(user_id, stream_type);
        self.overrides.insert((user_id.clone(), stream_type), wanted);
        before != wanted
    }

    /// Drop every override of a user that left the room
    pub fn forget_user(&self, user_id: &UserId) {
        self.overrides.retain(|(u, _), _| u != user_id);
    }

    pub fn clear(&self) {
        self.overrides.clear();
    }

    #[must_use]
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let registry = SubscriptionRegistry::new(true);
        assert!(registry.wants(&UserId::from("a"), StreamType::Audio));

        let manual = SubscriptionRegistry::new(false);
        assert!(!manual.wants(&UserId::from("a"), StreamType::Audio));
    }

    #[test]
    fn test_overrides_are_idempotent() {
        let registry = SubscriptionRegistry::new(true);
        let user = UserId::from("a");

        assert!(registry.unsubscribe(&user, StreamType::Audio));
        assert!(!registry.unsubscribe(&user, StreamType::Audio));
        assert!(!registry.wants(&user, StreamType::Audio));
        // other stream types keep the default
        assert!(registry.wants(&user, StreamType::VideoHigh));

        assert!(registry.subscribe(&user, StreamType::Audio));
        assert!(!registry.subscribe(&user, StreamType::Audio));
        assert!(registry.wants(&user, StreamType::Audio));
    }

    #[test]
    fn test_overrides_end_when_user_leaves() {
        let registry = SubscriptionRegistry::new(true);
        let a = UserId::from("a");
        let b = UserId::from("b");
        registry.unsubscribe(&a, StreamType::Audio);
        registry.unsubscribe(&b, StreamType::Audio);

        registry.forget_user(&a);
        assert!(registry.wants(&a, StreamType::Audio));
        assert!(!registry.wants(&b, StreamType::Audio));
        assert_eq!(registry.override_count(), 1);
    }
}
