//! Work closure
//!
//! Every compiled artifact may reference further artifacts (methods, vtables,
//! static field blocks, ...). References are requested here; each kind keeps a
//! permanent "done or pending" set and a LIFO of pending items, so any item is
//! handed out at most once per requestor no matter how often it is requested.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::metadata::{FieldSpec, MethodSpec, ModuleId, TypeSpec};

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct QueueState<T> {
    seen: FxHashSet<T>,
    pending: Vec<T>,
}

/// Deduplicating pending-work stack for one kind of item
pub struct IndividualRequestor<T> {
    state: Mutex<QueueState<T>>,
    filter: Option<Filter<T>>,
}

impl<T: Eq + Hash + Clone> IndividualRequestor<T> {
    /// Queue accepting every item
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                seen: FxHashSet::default(),
                pending: Vec::new(),
            }),
            filter: None,
        }
    }

    /// Queue accepting only items for which `filter` returns true
    pub fn with_filter(filter: Filter<T>) -> Self {
        Self {
            filter: Some(filter),
            ..Self::new()
        }
    }

    /// Request an item. Returns true if it was newly queued; duplicates and
    /// filtered items are ignored.
    pub fn request(&self, item: T) -> bool {
        if let Some(filter) = &self.filter {
            if !filter(&item) {
                return false;
            }
        }
        let mut state = self.state.lock();
        if state.seen.contains(&item) {
            return false;
        }
        state.seen.insert(item.clone());
        state.pending.push(item);
        true
    }

    /// Take the most recently requested pending item
    pub fn get_next(&self) -> Option<T> {
        self.state.lock().pending.pop()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Number of distinct items ever accepted
    pub fn seen_count(&self) -> usize {
        self.state.lock().seen.len()
    }

    /// Whether an item has been accepted at some point
    pub fn has_seen(&self, item: &T) -> bool {
        self.state.lock().seen.contains(item)
    }
}

impl<T: Eq + Hash + Clone> Default for IndividualRequestor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work handed out by a [`Requestor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Compile a method body
    Method(MethodSpec),
    /// Emit a method info record
    MethodInfo(MethodSpec),
    /// Emit a field info record
    FieldInfo(FieldSpec),
    /// Emit a vtable and type info
    VTable(TypeSpec),
    /// Emit a static field block
    StaticFields(TypeSpec),
    /// Emit module info
    Module(ModuleId),
    /// Emit assembly info
    Assembly(ModuleId),
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Method(ms) => write!(f, "method {}", ms),
            WorkItem::MethodInfo(ms) => write!(f, "method info {}", ms),
            WorkItem::FieldInfo(fs) => write!(f, "field info {}", fs),
            WorkItem::VTable(ts) => write!(f, "vtable {}", ts),
            WorkItem::StaticFields(ts) => write!(f, "static fields {}", ts),
            WorkItem::Module(m) => write!(f, "module info {}", m),
            WorkItem::Assembly(m) => write!(f, "assembly info {}", m),
        }
    }
}

/// Per-kind work queues for a whole-program build
pub trait Requestor: Send + Sync {
    fn methods(&self) -> &IndividualRequestor<MethodSpec>;
    fn method_infos(&self) -> &IndividualRequestor<MethodSpec>;
    fn field_infos(&self) -> &IndividualRequestor<FieldSpec>;
    fn vtables(&self) -> &IndividualRequestor<TypeSpec>;
    fn static_fields(&self) -> &IndividualRequestor<TypeSpec>;
    fn modules(&self) -> &IndividualRequestor<ModuleId>;
    fn assemblies(&self) -> &IndividualRequestor<ModuleId>;

    /// Take one pending item of any kind, methods first
    fn next_item(&self) -> Option<WorkItem> {
        if let Some(ms) = self.methods().get_next() {
            return Some(WorkItem::Method(ms));
        }
        if let Some(ts) = self.vtables().get_next() {
            return Some(WorkItem::VTable(ts));
        }
        if let Some(ts) = self.static_fields().get_next() {
            return Some(WorkItem::StaticFields(ts));
        }
        if let Some(ms) = self.method_infos().get_next() {
            return Some(WorkItem::MethodInfo(ms));
        }
        if let Some(fs) = self.field_infos().get_next() {
            return Some(WorkItem::FieldInfo(fs));
        }
        if let Some(m) = self.modules().get_next() {
            return Some(WorkItem::Module(m));
        }
        self.assemblies().get_next().map(WorkItem::Assembly)
    }

    /// Whether every kind is drained
    fn is_empty(&self) -> bool {
        self.methods().is_empty()
            && self.vtables().is_empty()
            && self.static_fields().is_empty()
            && self.method_infos().is_empty()
            && self.field_infos().is_empty()
            && self.modules().is_empty()
            && self.assemblies().is_empty()
    }
}

/// The standard requestor, optionally restricted to the artifacts of one module
pub struct CachingRequestor {
    methods: IndividualRequestor<MethodSpec>,
    method_infos: IndividualRequestor<MethodSpec>,
    field_infos: IndividualRequestor<FieldSpec>,
    vtables: IndividualRequestor<TypeSpec>,
    static_fields: IndividualRequestor<TypeSpec>,
    modules: IndividualRequestor<ModuleId>,
    assemblies: IndividualRequestor<ModuleId>,
}

impl Default for CachingRequestor {
    fn default() -> Self {
        Self::new()
    }
}

impl CachingRequestor {
    /// Requestor accepting items from every module
    pub fn new() -> Self {
        Self {
            methods: IndividualRequestor::new(),
            method_infos: IndividualRequestor::new(),
            field_infos: IndividualRequestor::new(),
            vtables: IndividualRequestor::new(),
            static_fields: IndividualRequestor::new(),
            modules: IndividualRequestor::new(),
            assemblies: IndividualRequestor::new(),
        }
    }

    /// Requestor dropping items that do not belong to `module`. Primitive types
    /// belong to `corlib`.
    pub fn with_module_filter(module: ModuleId, corlib: ModuleId) -> Self {
        let type_in = move |ts: &TypeSpec| ts.module().unwrap_or(corlib) == module;
        let method_in = move |ms: &MethodSpec| ms.module().unwrap_or(corlib) == module;
        Self {
            methods: IndividualRequestor::with_filter(Arc::new(method_in)),
            method_infos: IndividualRequestor::with_filter(Arc::new(method_in)),
            field_infos: IndividualRequestor::with_filter(Arc::new(move |fs: &FieldSpec| {
                fs.module == module
            })),
            vtables: IndividualRequestor::with_filter(Arc::new(type_in)),
            static_fields: IndividualRequestor::with_filter(Arc::new(type_in)),
            modules: IndividualRequestor::with_filter(Arc::new(move |m: &ModuleId| *m == module)),
            assemblies: IndividualRequestor::with_filter(Arc::new(move |m: &ModuleId| {
                *m == module
            })),
        }
    }
}

impl Requestor for CachingRequestor {
    fn methods(&self) -> &IndividualRequestor<MethodSpec> {
        &self.methods
    }

    fn method_infos(&self) -> &IndividualRequestor<MethodSpec> {
        &self.method_infos
    }

    fn field_infos(&self) -> &IndividualRequestor<FieldSpec> {
        &self.field_infos
    }

    fn vtables(&self) -> &IndividualRequestor<TypeSpec> {
        &self.vtables
    }

    fn static_fields(&self) -> &IndividualRequestor<TypeSpec> {
        &self.static_fields
    }

    fn modules(&self) -> &IndividualRequestor<ModuleId> {
        &self.modules
    }

    fn assemblies(&self) -> &IndividualRequestor<ModuleId> {
        &self.assemblies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ElementType;

    #[test]
    fn test_request_is_deduplicated_before_processing() {
        let q = IndividualRequestor::new();
        assert!(q.request(1u32));
        assert!(!q.request(1));
        assert_eq!(q.get_next(), Some(1));
        // done membership is permanent
        assert!(!q.request(1));
        assert_eq!(q.get_next(), None);
        assert!(q.is_empty());
        assert_eq!(q.seen_count(), 1);
    }

    #[test]
    fn test_pending_order_is_lifo() {
        let q = IndividualRequestor::new();
        q.request("a");
        q.request("b");
        q.request("c");
        assert_eq!(q.get_next(), Some("c"));
        assert_eq!(q.get_next(), Some("b"));
        q.request("d");
        assert_eq!(q.get_next(), Some("d"));
        assert_eq!(q.get_next(), Some("a"));
    }

    #[test]
    fn test_module_filter_drops_foreign_items() {
        let corlib = ModuleId::new(0);
        let app = ModuleId::new(1);
        let r = CachingRequestor::with_module_filter(app, corlib);
        assert!(r.vtables().request(TypeSpec::def(app, 1)));
        assert!(!r.vtables().request(TypeSpec::def(corlib, 1)));
        assert!(!r.vtables().request(TypeSpec::Primitive(ElementType::I4)));
        assert!(!r.modules().request(corlib));
        assert!(r.modules().request(app));

        let own = MethodSpec::def(TypeSpec::def(app, 1), app, 1);
        let foreign = MethodSpec::def(TypeSpec::def(corlib, 1), corlib, 3);
        assert!(r.methods().request(own));
        assert!(!r.methods().request(foreign));
    }

    #[test]
    fn test_corlib_filter_accepts_primitives() {
        let corlib = ModuleId::new(0);
        let r = CachingRequestor::with_module_filter(corlib, corlib);
        assert!(r.vtables().request(TypeSpec::Primitive(ElementType::I4).sz_array()));
    }

    #[test]
    fn test_next_item_drains_all_kinds() {
        let r = CachingRequestor::new();
        let m = ModuleId::new(1);
        r.methods().request(MethodSpec::def(TypeSpec::def(m, 1), m, 1));
        r.vtables().request(TypeSpec::def(m, 1));
        r.static_fields().request(TypeSpec::def(m, 1));
        r.modules().request(m);
        r.assemblies().request(m);

        let mut items = Vec::new();
        while let Some(item) = r.next_item() {
            items.push(item);
        }
        assert_eq!(items.len(), 5);
        assert!(matches!(items[0], WorkItem::Method(_)));
        assert!(matches!(items[4], WorkItem::Assembly(_)));
        assert!(r.is_empty());
    }

    #[test]
    fn test_concurrent_requests_accept_once() {
        let q = Arc::new(IndividualRequestor::new());
        let accepted = std::sync::atomic::AtomicUsize::new(0);
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for i in 0..100u32 {
                        if q.request(i) {
                            accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(accepted.into_inner(), 100);
        assert_eq!(q.seen_count(), 100);
    }
}
