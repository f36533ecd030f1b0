//! Session registry
//!
//! Maps a dialog key (Call-ID) to the session that owns it, plus one unkeyed
//! receiver that picks up inbound calls nobody owns yet.

use crate::domain::shared::value_objects::CallId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct SessionRegistry<T> {
    sessions: HashMap<CallId, Arc<T>>,
    receiver: Option<Arc<T>>,
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            receiver: None,
        }
    }

    /// Bind `key` to `session`, replacing any previous owner
    pub fn insert(&mut self, key: CallId, session: Arc<T>) {
        debug!("Registry: bind {}", key);
        self.sessions.insert(key, session);
    }

    /// Unbind `key`, but only if it still maps to `session`
    pub fn remove(&mut self, key: &CallId, session: &Arc<T>) -> bool {
        match self.sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                debug!("Registry: unbind {}", key);
                self.sessions.remove(key);
                true
            }
            Some(_) => {
                debug!("Registry: {} now owned by another session; kept", key);
                false
            }
            None => false,
        }
    }

    pub fn get(&self, key: &CallId) -> Option<Arc<T>> {
        self.sessions.get(key).cloned()
    }

    /// Owner of `key`, else the receiver
    pub fn resolve(&self, key: &CallId) -> Option<Arc<T>> {
        self.get(key).or_else(|| self.receiver.clone())
    }

    pub fn contains(&self, key: &CallId) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn set_receiver(&mut self, receiver: Arc<T>) {
        self.receiver = Some(receiver);
    }

    pub fn clear_receiver(&mut self) -> Option<Arc<T>> {
        self.receiver.take()
    }

    pub fn receiver(&self) -> Option<&Arc<T>> {
        self.receiver.as_ref()
    }

    /// Keyed sessions, each listed once
    pub fn sessions(&self) -> Vec<Arc<T>> {
        let mut unique: Vec<Arc<T>> = Vec::new();
        for session in self.sessions.values() {
            if !unique.iter().any(|s| Arc::ptr_eq(s, session)) {
                unique.push(session.clone());
            }
        }
        unique
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every key and the receiver
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.receiver = None;
    }
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_receiver() {
        let mut registry = SessionRegistry::new();
        let call = Arc::new("call");
        let receiver = Arc::new("receiver");

        assert!(registry.resolve(&CallId::from("a")).is_none());

        registry.set_receiver(receiver.clone());
        registry.insert(CallId::from("a"), call.clone());

        assert!(Arc::ptr_eq(&registry.resolve(&CallId::from("a")).unwrap(), &call));
        assert!(Arc::ptr_eq(&registry.resolve(&CallId::from("b")).unwrap(), &receiver));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_only_by_owner() {
        let mut registry = SessionRegistry::new();
        let first = Arc::new(1);
        let second = Arc::new(2);

        registry.insert(CallId::from("a"), first.clone());
        registry.insert(CallId::from("a"), second.clone());

        assert!(!registry.remove(&CallId::from("a"), &first));
        assert!(registry.contains(&CallId::from("a")));
        assert!(registry.remove(&CallId::from("a"), &second));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sessions_deduplicates() {
        let mut registry = SessionRegistry::new();
        let session = Arc::new(1);
        registry.insert(CallId::from("a"), session.clone());
        registry.insert(CallId::from("b"), session.clone());
        registry.set_receiver(Arc::new(2));

        assert_eq!(registry.sessions().len(), 1);
        registry.clear();
        assert!(registry.receiver().is_none());
        assert!(registry.is_empty());
    }
}
