use std::sync::Arc;

use super::Resolver;

/// Observer signature: `(resolver, subject, attribute, value)`.
pub type HookFn = dyn Fn(&Resolver, &str, &str, &str) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Add,
    Set,
}

struct Hook {
    id: HookId,
    kind: HookKind,
    // Only fire for this attribute
    filter: Option<String>,
    callback: Arc<HookFn>,
}

#[derive(Default)]
pub struct Hooks {
    next: u64,
    hooks: Vec<Hook>,
}

impl Hooks {
    pub fn register(&mut self, kind: HookKind, filter: Option<&str>, callback: Arc<HookFn>) -> HookId {
        self.next += 1;
        let id = HookId(self.next);
        self.hooks.push(Hook {
            id,
            kind,
            filter: filter.map(str::to_string),
            callback,
        });
        id
    }

    pub fn remove(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.id != id);
        before != self.hooks.len()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// Callbacks to run, cloned out so they run without the registry lock.
    pub fn matching(&self, kind: HookKind, attribute: &str) -> Vec<Arc<HookFn>> {
        self.hooks
            .iter()
            .filter(|h| h.kind == kind)
            .filter(|h| h.filter.as_deref().map_or(true, |f| f == attribute))
            .map(|h| h.callback.clone())
            .collect()
    }
}

#[cfg(test)]
mod test_hooks {
    use super::*;

    fn noop() -> Arc<HookFn> {
        Arc::new(|_, _, _, _| {})
    }

    #[test]
    fn filter_and_kind() {
        let mut hooks = Hooks::default();
        hooks.register(HookKind::Set, Some("aff4:size"), noop());
        hooks.register(HookKind::Set, None, noop());
        hooks.register(HookKind::Add, None, noop());

        assert_eq!(hooks.matching(HookKind::Set, "aff4:size").len(), 2);
        assert_eq!(hooks.matching(HookKind::Set, "aff4:type").len(), 1);
        assert_eq!(hooks.matching(HookKind::Add, "aff4:size").len(), 1);
    }

    #[test]
    fn remove_by_id() {
        let mut hooks = Hooks::default();
        let a = hooks.register(HookKind::Set, None, noop());
        let b = hooks.register(HookKind::Set, None, noop());
        assert_ne!(a, b);

        assert!(hooks.remove(a));
        assert!(!hooks.remove(a));
        assert_eq!(hooks.matching(HookKind::Set, "x").len(), 1);

        hooks.clear();
        assert!(hooks.matching(HookKind::Set, "x").is_empty());
    }
}
