//! Bounded per-scope hierarchy cache
//!
//! Resolution runs on the caller's thread inside the host's class-loading
//! critical section, so the cache uses per-key sharded locking (never one
//! global lock), drops every internal guard before calling back into the
//! host, and short-circuits same-thread re-entry on a key instead of
//! self-deadlocking.

use crate::hierarchy::{compute_mixins, AnalyzedHierarchy};
use crate::host::{Host, HostError, ScopeId};
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use weft_advice::RuleSet;
use weft_bytecode::TypeDescriptor;

/// Cache sizing policy
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry-count bound enforced by the periodic sweep
    pub max_entries: usize,
    /// Entries idle longer than this are dropped by the sweep
    pub idle_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

struct CacheEntry {
    hierarchy: Arc<AnalyzedHierarchy>,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(hierarchy: Arc<AnalyzedHierarchy>, now: u64) -> Self {
        Self {
            hierarchy,
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.store(now, Ordering::Relaxed);
    }
}

thread_local! {
    /// (scope, name) keys being resolved on this thread, outermost first
    static RESOLVE_STACK: RefCell<Vec<(ScopeId, String)>> = const { RefCell::new(Vec::new()) };
}

/// Cache of analyzed hierarchies keyed by (scope, name)
pub struct TypeHierarchyCache {
    entries: DashMap<(ScopeId, String), CacheEntry>,
    epoch: Instant,
    config: CacheConfig,
}

impl TypeHierarchyCache {
    /// Create a cache with the given sizing policy
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            epoch: Instant::now(),
            config,
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the hierarchy of a type, computing and caching on miss
    ///
    /// A cached entry whose mix-in set was computed against an older rule
    /// set is refreshed in place; the structural walk is not repeated.
    /// Same-thread re-entry on a key (the host notifying a nested load
    /// during resolution) returns an uncached minimal view instead of
    /// recursing.
    pub fn resolve(
        &self,
        host: &dyn Host,
        scope: ScopeId,
        descriptor: Arc<TypeDescriptor>,
        rules: &RuleSet,
    ) -> Arc<AnalyzedHierarchy> {
        let key = (scope, descriptor.name.clone());
        let now = self.now();

        let cached = self.entries.get(&key).map(|entry| {
            entry.touch(now);
            entry.hierarchy.clone()
        });
        if let Some(hierarchy) = cached {
            if hierarchy.rule_version == rules.version() {
                return hierarchy;
            }
            let refreshed = Arc::new(AnalyzedHierarchy {
                descriptor: hierarchy.descriptor.clone(),
                ancestors: hierarchy.ancestors.clone(),
                member_names: hierarchy.member_names.clone(),
                unresolved: hierarchy.unresolved.clone(),
                mixins: compute_mixins(&hierarchy.descriptor, &hierarchy.member_names, rules),
                rule_version: rules.version(),
            });
            self.entries
                .insert(key, CacheEntry::new(refreshed.clone(), now));
            return refreshed;
        }

        let reentrant = RESOLVE_STACK.with(|stack| stack.borrow().contains(&key));
        if reentrant {
            debug!(%scope, name = %descriptor.name, "re-entrant resolution short-circuited");
            return Arc::new(self.minimal_view(descriptor, rules));
        }

        RESOLVE_STACK.with(|stack| stack.borrow_mut().push(key.clone()));
        let resolved = self.resolve_uncached(host, scope, descriptor, rules);
        RESOLVE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });

        let resolved = Arc::new(resolved);
        self.entries
            .insert(key, CacheEntry::new(resolved.clone(), now));
        resolved
    }

    /// Declared-names-only view used for re-entrant short-circuits
    fn minimal_view(&self, descriptor: Arc<TypeDescriptor>, rules: &RuleSet) -> AnalyzedHierarchy {
        let mut member_names = FxHashSet::default();
        let mut unresolved = Vec::new();
        for name in declared_supertypes(&descriptor) {
            member_names.insert(name.clone());
            unresolved.push(name);
        }
        let mixins = compute_mixins(&descriptor, &member_names, rules);
        AnalyzedHierarchy {
            descriptor,
            ancestors: Vec::new(),
            member_names,
            unresolved,
            mixins,
            rule_version: rules.version(),
        }
    }

    fn resolve_uncached(
        &self,
        host: &dyn Host,
        scope: ScopeId,
        descriptor: Arc<TypeDescriptor>,
        rules: &RuleSet,
    ) -> AnalyzedHierarchy {
        let now = self.now();
        let mut visited: FxHashSet<String> = FxHashSet::default();
        visited.insert(descriptor.name.clone());

        let mut member_names: FxHashSet<String> = FxHashSet::default();
        let mut ancestor_names: FxHashSet<String> = FxHashSet::default();
        let mut ancestors: Vec<Arc<TypeDescriptor>> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();
        let mut worklist: VecDeque<String> = declared_supertypes(&descriptor).collect();

        while let Some(name) = worklist.pop_front() {
            // A name already on the path is a cycle in malformed input;
            // the hierarchy is truncated at the first repetition.
            if !visited.insert(name.clone()) {
                continue;
            }
            member_names.insert(name.clone());

            let cached = self.entries.get(&(scope, name.clone())).map(|entry| {
                entry.touch(now);
                entry.hierarchy.clone()
            });
            if let Some(sub) = cached {
                if ancestor_names.insert(sub.descriptor.name.clone()) {
                    ancestors.push(sub.descriptor.clone());
                }
                for ancestor in &sub.ancestors {
                    if ancestor_names.insert(ancestor.name.clone()) {
                        ancestors.push(ancestor.clone());
                    }
                }
                for member in &sub.member_names {
                    visited.insert(member.clone());
                    member_names.insert(member.clone());
                }
                for missing in &sub.unresolved {
                    if !unresolved.contains(missing) {
                        unresolved.push(missing.clone());
                    }
                }
                continue;
            }

            // No internal guard is held here; the host may block on its
            // own loader locks.
            match host.get_structure(scope, &name) {
                Ok(ancestor) => {
                    worklist.extend(declared_supertypes(&ancestor));
                    if ancestor_names.insert(ancestor.name.clone()) {
                        ancestors.push(ancestor);
                    }
                }
                Err(HostError::NotFound(_)) => {
                    debug!(%scope, ancestor = %name, "unresolvable ancestor, matching degraded for this branch");
                    unresolved.push(name);
                }
                Err(err) => {
                    warn!(%scope, ancestor = %name, %err, "structural query failed, matching degraded for this branch");
                    unresolved.push(name);
                }
            }
        }

        let mixins = compute_mixins(&descriptor, &member_names, rules);
        AnalyzedHierarchy {
            descriptor,
            ancestors,
            member_names,
            unresolved,
            mixins,
            rule_version: rules.version(),
        }
    }

    /// Drop the entry for a redefined type and every entry in the scope
    /// whose hierarchy contains it
    pub fn invalidate(&self, scope: ScopeId, name: &str) {
        self.entries.retain(|(entry_scope, entry_name), entry| {
            if *entry_scope != scope {
                return true;
            }
            entry_name != name && !entry.hierarchy.member_names.contains(name)
        });
    }

    /// Drop every entry belonging to a closed scope
    pub fn invalidate_scope(&self, scope: ScopeId) {
        self.entries.retain(|(entry_scope, _), _| *entry_scope != scope);
    }

    /// Enforce the sizing policy: drop idle entries, then evict the
    /// oldest entries beyond the capacity bound
    pub fn sweep(&self) {
        let now = self.now();
        let ttl = self.config.idle_ttl.as_millis() as u64;
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) <= ttl);

        let excess = self.entries.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<((ScopeId, String), u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_access.load(Ordering::Relaxed)))
            .collect();
        by_age.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}

fn declared_supertypes(descriptor: &TypeDescriptor) -> impl Iterator<Item = String> + '_ {
    descriptor
        .superclass
        .iter()
        .cloned()
        .chain(descriptor.interfaces.iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RedefineRejected;
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;

    /// Descriptor-table host for cache unit tests
    struct TableHost {
        types: Mutex<FxHashMap<String, Arc<TypeDescriptor>>>,
    }

    impl TableHost {
        fn new(descriptors: impl IntoIterator<Item = TypeDescriptor>) -> Self {
            let types = descriptors
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(d)))
                .collect();
            Self {
                types: Mutex::new(types),
            }
        }
    }

    impl Host for TableHost {
        fn get_structure(
            &self,
            _scope: ScopeId,
            name: &str,
        ) -> Result<Arc<TypeDescriptor>, HostError> {
            self.types
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| HostError::NotFound(name.to_string()))
        }

        fn get_raw_representation(
            &self,
            _scope: ScopeId,
            name: &str,
        ) -> Result<Vec<u8>, HostError> {
            Err(HostError::NotFound(name.to_string()))
        }

        fn redefine(
            &self,
            _scope: ScopeId,
            _name: &str,
            _bytes: Vec<u8>,
        ) -> Result<(), RedefineRejected> {
            Ok(())
        }
    }

    fn descriptor(name: &str, superclass: Option<&str>, interfaces: &[&str]) -> TypeDescriptor {
        let mut descriptor = TypeDescriptor::named(name);
        descriptor.superclass = superclass.map(str::to_string);
        descriptor.interfaces = interfaces.iter().map(|i| i.to_string()).collect();
        descriptor
    }

    const SCOPE: ScopeId = ScopeId(1);

    #[test]
    fn test_resolve_transitive_hierarchy() {
        let host = TableHost::new([
            descriptor("Base", Some("Root"), &["Comparable"]),
            descriptor("Root", None, &[]),
            descriptor("Comparable", None, &[]),
        ]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        let derived = Arc::new(descriptor("Derived", Some("Base"), &[]));
        let hierarchy = cache.resolve(&host, SCOPE, derived, &rules);

        assert!(hierarchy.has_member("Base"));
        assert!(hierarchy.has_member("Root"));
        assert!(hierarchy.has_member("Comparable"));
        assert!(!hierarchy.has_member("Other"));
        assert!(hierarchy.unresolved.is_empty());
        assert_eq!(hierarchy.ancestors.len(), 3);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let host = TableHost::new([descriptor("Base", None, &[])]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        let derived = Arc::new(descriptor("Derived", Some("Base"), &[]));
        let first = cache.resolve(&host, SCOPE, derived.clone(), &rules);
        let second = cache.resolve(&host, SCOPE, derived, &rules);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_ancestor_degrades_branch_only() {
        let host = TableHost::new([descriptor("Left", Some("LeftBase"), &[]), descriptor("LeftBase", None, &[])]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        let derived = Arc::new(descriptor("Derived", Some("Missing"), &["Left"]));
        let hierarchy = cache.resolve(&host, SCOPE, derived, &rules);

        // The declared name is still a member; its own supertypes are not.
        assert!(hierarchy.has_member("Missing"));
        assert_eq!(hierarchy.unresolved, ["Missing"]);
        // The sibling branch resolved fully.
        assert!(hierarchy.has_member("Left"));
        assert!(hierarchy.has_member("LeftBase"));
    }

    #[test]
    fn test_cyclic_hierarchy_truncates() {
        let host = TableHost::new([
            descriptor("A", Some("B"), &[]),
            descriptor("B", Some("A"), &[]),
        ]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        let root = Arc::new(descriptor("Cyclic", Some("A"), &[]));
        let hierarchy = cache.resolve(&host, SCOPE, root, &rules);

        assert!(hierarchy.has_member("A"));
        assert!(hierarchy.has_member("B"));
        assert_eq!(hierarchy.ancestors.len(), 2);
    }

    #[test]
    fn test_self_referential_type_resolves() {
        let host = TableHost::new([]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        let ouroboros = Arc::new(descriptor("Ouroboros", Some("Ouroboros"), &[]));
        let hierarchy = cache.resolve(&host, SCOPE, ouroboros, &rules);
        assert!(hierarchy.ancestors.is_empty());
        assert!(hierarchy.unresolved.is_empty());
    }

    #[test]
    fn test_invalidate_drops_dependents() {
        let host = TableHost::new([descriptor("Base", None, &[])]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());
        let rules = RuleSet::empty();

        cache.resolve(
            &host,
            SCOPE,
            Arc::new(descriptor("Derived", Some("Base"), &[])),
            &rules,
        );
        cache.resolve(&host, SCOPE, Arc::new(descriptor("Other", None, &[])), &rules);
        assert_eq!(cache.len(), 2);

        cache.invalidate(SCOPE, "Base");
        assert_eq!(cache.len(), 1);

        cache.invalidate_scope(SCOPE);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_enforces_capacity() {
        let host = TableHost::new([]);
        let cache = TypeHierarchyCache::new(CacheConfig {
            max_entries: 2,
            idle_ttl: Duration::from_secs(300),
        });
        let rules = RuleSet::empty();

        for name in ["A", "B", "C", "D"] {
            cache.resolve(&host, SCOPE, Arc::new(descriptor(name, None, &[])), &rules);
        }
        assert_eq!(cache.len(), 4);
        cache.sweep();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_mixin_set_refreshes_on_rule_change() {
        use weft_advice::{RuleDecl, RuleSetBuilder};

        let host = TableHost::new([descriptor("Base", None, &[])]);
        let cache = TypeHierarchyCache::new(CacheConfig::default());

        let derived = Arc::new(descriptor("Derived", Some("Base"), &[]));
        let v1 = RuleSet::empty();
        let first = cache.resolve(&host, SCOPE, derived.clone(), &v1);
        assert!(first.mixins.is_empty());

        let mut builder = RuleSetBuilder::new();
        builder.push(
            RuleDecl::new("trace", "run", "ctx")
                .subtype_of("Base")
                .mixin("weft/Traced", "$trace"),
        );
        let v2 = builder.build(1).unwrap();

        let second = cache.resolve(&host, SCOPE, derived, &v2);
        assert_eq!(second.mixins, ["weft/Traced"]);
        // Structure was reused, not re-walked.
        assert_eq!(second.ancestors.len(), first.ancestors.len());
    }
}
