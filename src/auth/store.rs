// Copy-on-write credential store. Readers take an immutable snapshot;
// the reconciler builds a new map and publishes it with a pointer swap.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::Auth;

/// Incremental change to the credential set, keyed by credential id.
#[derive(Debug, Clone)]
pub enum AuthUpdate {
    Add(String, Arc<Auth>),
    Modify(String, Arc<Auth>),
    Delete(String),
}

impl AuthUpdate {
    pub fn id(&self) -> &str {
        match self {
            AuthUpdate::Add(id, _) | AuthUpdate::Modify(id, _) | AuthUpdate::Delete(id) => id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            AuthUpdate::Add(..) => "add",
            AuthUpdate::Modify(..) => "modify",
            AuthUpdate::Delete(..) => "delete",
        }
    }
}

#[derive(Default)]
pub struct AuthStore {
    inner: RwLock<Arc<HashMap<String, Arc<Auth>>>>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<Auth>>> {
        self.inner.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Auth>> {
        self.inner.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Applies a batch of updates atomically. Re-applying a diff that has
    /// already been applied is a no-op for Delete and replaces identical
    /// records for Add/Modify.
    pub fn apply(&self, updates: &[AuthUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut guard = self.inner.write();
        let mut next: HashMap<String, Arc<Auth>> = guard.as_ref().clone();
        for update in updates {
            match update {
                AuthUpdate::Add(id, auth) | AuthUpdate::Modify(id, auth) => {
                    next.insert(id.clone(), auth.clone());
                }
                AuthUpdate::Delete(id) => {
                    next.remove(id);
                }
            }
        }
        *guard = Arc::new(next);
    }

    /// Diffs the current snapshot against a freshly synthesized credential
    /// set. Events are coalesced (at most one per id) and emitted in
    /// deterministic id order. Equality ignores timestamps, runtime and
    /// dispatch state.
    pub fn diff(&self, next: &[Arc<Auth>]) -> Vec<AuthUpdate> {
        let current = self.snapshot();
        let mut next_by_id: HashMap<&str, &Arc<Auth>> = HashMap::with_capacity(next.len());
        for auth in next {
            // Last entry wins if synthesis ever produced a duplicate id;
            // the id generator salts duplicates so this should not happen.
            next_by_id.insert(auth.id.as_str(), auth);
        }

        let mut updates = Vec::new();
        for (id, auth) in next_by_id.iter() {
            match current.get(*id) {
                None => updates.push(AuthUpdate::Add(id.to_string(), (*auth).clone())),
                Some(existing) if !existing.same_source(auth) => {
                    updates.push(AuthUpdate::Modify(id.to_string(), (*auth).clone()));
                }
                Some(_) => {}
            }
        }
        for id in current.keys() {
            if !next_by_id.contains_key(id.as_str()) {
                updates.push(AuthUpdate::Delete(id.clone()));
            }
        }
        updates.sort_by(|a, b| a.id().cmp(b.id()));
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn auth(id: &str) -> Arc<Auth> {
        Arc::new(Auth::new(id.into(), "claude".into(), id.into()))
    }

    #[test]
    fn diff_reports_add_modify_delete() {
        let store = AuthStore::new();
        let first = vec![auth("a"), auth("b")];
        let updates = store.diff(&first);
        assert_eq!(updates.len(), 2);
        store.apply(&updates);

        let mut b2 = Auth::new("b".into(), "claude".into(), "b".into());
        b2.attributes.insert("api_key".into(), "sk-new".into());
        let second = vec![auth("a"), Arc::new(b2), auth("c")];
        let updates = store.diff(&second);
        let actions: Vec<_> = updates.iter().map(|u| (u.action(), u.id().to_string())).collect();
        assert_eq!(
            actions,
            vec![("modify", "b".to_string()), ("add", "c".to_string())]
        );
    }

    #[test]
    fn diff_is_sound() {
        // Applying the emitted diff to the previous snapshot yields the new set.
        let store = AuthStore::new();
        store.apply(&store.diff(&[auth("a"), auth("b")]));
        let next = vec![auth("b"), auth("c")];
        let updates = store.diff(&next);
        store.apply(&updates);
        let snapshot = store.snapshot();
        let mut ids: Vec<_> = snapshot.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn reapplying_same_diff_is_noop() {
        let store = AuthStore::new();
        let next = vec![auth("a")];
        let updates = store.diff(&next);
        store.apply(&updates);
        store.apply(&updates);
        assert_eq!(store.len(), 1);
        // A second diff against the same target emits nothing.
        assert!(store.diff(&next).is_empty());
    }

    #[test]
    fn identical_source_produces_no_event() {
        let store = AuthStore::new();
        store.apply(&store.diff(&[auth("a")]));
        // A freshly synthesized record with newer timestamps but the same
        // source must not produce a Modify.
        let fresh = auth("a");
        assert!(store.diff(&[fresh]).is_empty());
    }
}
