//! Transport selection policy.

use std::cmp::Ordering;
use std::sync::Arc;

use super::{Transport, TransportFactory};
use crate::protocol::{ContentPad, TransportState};

/// Per-content policy that hands out, replaces and ranks transports.
///
/// A selector owns its candidate pool. Transports handed out are owned by the
/// caller; transports given back through [`backup_transport`] are owned by
/// the selector until handed out again.
///
/// [`backup_transport`]: TransportSelector::backup_transport
pub trait TransportSelector: Send {
    /// Next transport in preference order.
    fn next_transport(&mut self) -> Option<Box<dyn Transport>>;

    /// A transport of the same namespace as `namespace`, if still available.
    fn alike_transport(&mut self, namespace: &str) -> Option<Box<dyn Transport>>;

    /// Validate `new` as a replacement for `old` and consume it from the pool.
    fn replace(&mut self, old: Option<&dyn Transport>, new: &dyn Transport) -> bool;

    /// Check if `new` would be accepted as a replacement for `old`
    fn can_replace(&self, old: Option<&dyn Transport>, new: &dyn Transport) -> bool;

    /// Return an unused transport to the pool for later reuse.
    fn backup_transport(&mut self, transport: Box<dyn Transport>);

    /// Check if the pool still has candidates
    fn has_more_transports(&self) -> bool;

    /// Check if a namespace is still available
    fn has_transport(&self, namespace: &str) -> bool;

    /// Preference ordering. `Greater` means `a` is preferred over `b`.
    fn compare(&self, a: &dyn Transport, b: &dyn Transport) -> Ordering;
}

/// Default selector: fixed namespace preference order plus a backup pool.
pub struct PreferenceSelector {
    pad: ContentPad,
    /// All known factories, most preferred first
    factories: Vec<Arc<dyn TransportFactory>>,
    /// Namespaces not yet consumed, most preferred first
    available: Vec<String>,
    /// Transports handed back for reuse
    backups: Vec<Box<dyn Transport>>,
}

impl PreferenceSelector {
    /// Create a selector over the given factories (most preferred first)
    pub fn new(pad: ContentPad, factories: Vec<Arc<dyn TransportFactory>>) -> Self {
        let available = factories.iter().map(|f| f.namespace().to_string()).collect();
        Self {
            pad,
            factories,
            available,
            backups: Vec::new(),
        }
    }

    fn rank(&self, namespace: &str) -> usize {
        self.factories
            .iter()
            .position(|f| f.namespace() == namespace)
            .unwrap_or(usize::MAX)
    }

    /// Namespaces still available, most preferred first
    pub fn available(&self) -> &[String] {
        &self.available
    }

    fn make(&mut self, namespace: &str) -> Option<Box<dyn Transport>> {
        if let Some(pos) = self.backups.iter().position(|t| t.namespace() == namespace) {
            return Some(self.backups.remove(pos));
        }
        let factory = self.factories.iter().find(|f| f.namespace() == namespace)?;
        match factory.new_transport(self.pad.clone(), self.pad.role(), None) {
            Ok(transport) => Some(transport),
            Err(reason) => {
                tracing::debug!(
                    sid = self.pad.sid(),
                    content = %self.pad.key(),
                    namespace,
                    %reason,
                    "transport factory refused"
                );
                None
            },
        }
    }
}

impl TransportSelector for PreferenceSelector {
    fn next_transport(&mut self) -> Option<Box<dyn Transport>> {
        while let Some(namespace) = self.available.first().cloned() {
            if let Some(transport) = self.make(&namespace) {
                return Some(transport);
            }
            self.available.remove(0);
        }
        None
    }

    fn alike_transport(&mut self, namespace: &str) -> Option<Box<dyn Transport>> {
        if !self.has_transport(namespace) {
            return None;
        }
        let transport = self.make(namespace);
        if transport.is_none() {
            self.available.retain(|ns| ns != namespace);
        }
        transport
    }

    fn replace(&mut self, old: Option<&dyn Transport>, new: &dyn Transport) -> bool {
        if !self.can_replace(old, new) {
            return false;
        }
        self.available.retain(|ns| ns != new.namespace());
        true
    }

    fn can_replace(&self, old: Option<&dyn Transport>, new: &dyn Transport) -> bool {
        if self.has_transport(new.namespace()) {
            return true;
        }
        old.is_some_and(|old| self.compare(old, new) == Ordering::Equal)
    }

    fn backup_transport(&mut self, transport: Box<dyn Transport>) {
        if transport.state() == TransportState::Finished {
            return;
        }
        let namespace = transport.namespace().to_string();
        if !self.has_transport(&namespace) {
            let rank = self.rank(&namespace);
            let pos = self
                .available
                .iter()
                .position(|ns| self.rank(ns) > rank)
                .unwrap_or(self.available.len());
            self.available.insert(pos, namespace.clone());
        }
        self.backups.retain(|t| t.namespace() != namespace);
        self.backups.push(transport);
    }

    fn has_more_transports(&self) -> bool {
        !self.available.is_empty()
    }

    fn has_transport(&self, namespace: &str) -> bool {
        self.available.iter().any(|ns| ns == namespace)
    }

    fn compare(&self, a: &dyn Transport, b: &dyn Transport) -> Ordering {
        // lower rank is more preferred
        self.rank(b.namespace()).cmp(&self.rank(a.namespace()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentKey, Origin, Reason, TransportElement};
    use crate::transport::Connection;
    use tokio::sync::mpsc;

    struct Stub {
        ns: String,
        state: TransportState,
    }

    impl Transport for Stub {
        fn namespace(&self) -> &str {
            &self.ns
        }
        fn creator(&self) -> Origin {
            Origin::Initiator
        }
        fn state(&self) -> TransportState {
            self.state
        }
        fn last_reason(&self) -> Option<&Reason> {
            None
        }
        fn prepare(&mut self) {
            self.state = TransportState::Pending;
        }
        fn start(&mut self) {}
        fn check_update(&self, _element: &TransportElement) -> bool {
            true
        }
        fn update(&mut self, _element: &TransportElement) -> bool {
            true
        }
        fn has_updates(&self) -> bool {
            false
        }
        fn take_outgoing_update(&mut self) -> Option<TransportElement> {
            None
        }
        fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
            None
        }
        fn stop(&mut self, _reason: Option<Reason>) {
            self.state = TransportState::Finished;
        }
    }

    struct StubFactory(&'static str);

    impl TransportFactory for StubFactory {
        fn namespace(&self) -> &str {
            self.0
        }
        fn new_transport(
            &self,
            _pad: ContentPad,
            _creator: Origin,
            _offer: Option<&TransportElement>,
        ) -> Result<Box<dyn Transport>, Reason> {
            Ok(Box::new(Stub {
                ns: self.0.to_string(),
                state: TransportState::Created,
            }))
        }
    }

    fn selector(namespaces: &[&'static str]) -> PreferenceSelector {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pad = ContentPad::new("sid", Origin::Initiator, ContentKey::new("c", Origin::Initiator), tx);
        let factories = namespaces
            .iter()
            .map(|ns| Arc::new(StubFactory(ns)) as Arc<dyn TransportFactory>)
            .collect();
        PreferenceSelector::new(pad, factories)
    }

    #[test]
    fn test_next_follows_preference_and_is_consumed_by_replace() {
        let mut sel = selector(&["s5b", "ibb"]);
        let first = sel.next_transport().unwrap();
        assert_eq!(first.namespace(), "s5b");
        assert!(sel.replace(None, first.as_ref()));

        let second = sel.next_transport().unwrap();
        assert_eq!(second.namespace(), "ibb");
        assert!(sel.replace(Some(first.as_ref()), second.as_ref()));
        assert!(!sel.has_more_transports());
        assert!(sel.next_transport().is_none());
    }

    #[test]
    fn test_replace_refuses_consumed_namespace() {
        let mut sel = selector(&["s5b", "ibb"]);
        let s5b = sel.next_transport().unwrap();
        assert!(sel.replace(None, s5b.as_ref()));
        let ibb = sel.alike_transport("ibb").unwrap();
        assert!(sel.replace(Some(s5b.as_ref()), ibb.as_ref()));

        // s5b was consumed and is not equal in rank to ibb
        let again = Stub {
            ns: "s5b".into(),
            state: TransportState::Created,
        };
        assert!(!sel.can_replace(Some(ibb.as_ref()), &again));
        // same namespace always counts as an equal replacement
        let same = Stub {
            ns: "ibb".into(),
            state: TransportState::Created,
        };
        assert!(sel.can_replace(Some(ibb.as_ref()), &same));
    }

    #[test]
    fn test_backup_is_reused() {
        let mut sel = selector(&["s5b", "ibb"]);
        let mut s5b = sel.next_transport().unwrap();
        assert!(sel.replace(None, s5b.as_ref()));
        s5b.prepare();
        sel.backup_transport(s5b);

        assert!(sel.has_transport("s5b"));
        let again = sel.next_transport().unwrap();
        assert_eq!(again.namespace(), "s5b");
        assert_eq!(again.state(), TransportState::Pending);
    }

    #[test]
    fn test_finished_transport_is_not_backed_up() {
        let mut sel = selector(&["s5b"]);
        let mut s5b = sel.next_transport().unwrap();
        assert!(sel.replace(None, s5b.as_ref()));
        s5b.stop(None);
        sel.backup_transport(s5b);
        assert!(!sel.has_more_transports());
    }

    #[test]
    fn test_compare() {
        let sel = selector(&["s5b", "ibb"]);
        let s5b = Stub {
            ns: "s5b".into(),
            state: TransportState::Created,
        };
        let ibb = Stub {
            ns: "ibb".into(),
            state: TransportState::Created,
        };
        assert_eq!(sel.compare(&s5b, &ibb), Ordering::Greater);
        assert_eq!(sel.compare(&ibb, &s5b), Ordering::Less);
        assert_eq!(sel.compare(&ibb, &ibb), Ordering::Equal);
    }
}
