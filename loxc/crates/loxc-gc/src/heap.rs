//! The GC-managed heap (spec.md §4.7): an arena of objects, a weak string
//! intern table, and a stop-the-world tricolor mark-sweep collector.
//!
//! Every allocation is made through [`Heap`]'s `alloc_*`/`copy_string`/
//! `take_string` methods, which first give [`Heap::maybe_collect`] a chance
//! to run. Because the arena lives in `loxc-gc` but the live root set is
//! split across the VM's stack/frames/globals (`loxc-runtime`) and, during
//! compilation, the compiler's own function chain (`loxc-compiler`),
//! neither crate can hand `Heap` a closure back into itself without a
//! circular dependency. [`Roots`] is the fix: whoever is driving an
//! allocation assembles a `Roots` borrowing whatever it currently considers
//! live and passes it in by value.

use crate::intern::{InternSlot, InternTable};
use crate::object::{
    BoundMethod, Class, Closure, GcRef, Instance, LoxFunction, LoxString, NativeFn, NativeFnPtr,
    ObjKind, Slot, Upvalue, UpvalueState, FREE_LIST_END,
};
use crate::table::Table;
use crate::value::{format_number, Value};

/// Heap growth threshold multiplier applied after every collection
/// (spec.md §4.7: `next_gc = bytes_allocated * 2` once a cycle completes).
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Starting collection threshold, chosen so short-lived scripts and REPL
/// sessions never trigger a cycle at all.
const DEFAULT_NEXT_GC: usize = 1024 * 1024;

/// FNV-1a-32, per spec.md §4.5.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Every GC root, gathered from wherever the caller considers live right
/// now. Borrowed only for the duration of a single `collect`/`maybe_collect`
/// call.
#[derive(Default)]
pub struct Roots<'a> {
    /// The VM value stack.
    pub stack: &'a [Value],
    /// The closure of every active call frame (the function itself, plus
    /// whatever the frame's upvalues close over, is reached by tracing from
    /// here rather than being listed separately).
    pub frame_closures: &'a [GcRef],
    /// Upvalues still open (pointing at a live stack slot rather than a
    /// closed `Value`); tracked separately from closures because an upvalue
    /// can outlive the frame that created it only once it's closed, but
    /// while *open* it's reachable only via this list.
    pub open_upvalues: &'a [GcRef],
    /// Global variable table.
    pub globals: &'a Table,
    /// Anything else that must survive but doesn't fit the categories
    /// above: the interned `"init"` string, a compiler's in-progress
    /// function chain while compiling, etc.
    pub extra: &'a [GcRef],
}

/// Tunables that change collector *behavior* without changing its
/// semantics: `stress` collects on every allocation (for shaking out
/// rooting bugs), `log` emits phase-by-phase tracing events (spec.md §4.7's
/// `--gc-log`/`DEBUG_LOG_GC` hook, realized as `tracing::debug!` rather than
/// stderr prints so it composes with the rest of the driver's logging).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcConfig {
    pub stress: bool,
    pub log: bool,
}

/// Point-in-time counters, surfaced by `loxt --gc-log` and useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub object_count: usize,
    pub collections_run: usize,
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list_head: u32,
    object_count: usize,
    bytes_allocated: usize,
    next_gc: usize,
    intern: InternTable,
    gray: Vec<GcRef>,
    config: GcConfig,
    collections_run: usize,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_list_head: FREE_LIST_END,
            object_count: 0,
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
            intern: InternTable::new(),
            gray: Vec::new(),
            config,
            collections_run: 0,
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            object_count: self.object_count,
            collections_run: self.collections_run,
        }
    }

    pub fn kind(&self, r: GcRef) -> &ObjKind {
        match &self.slots[r.0 as usize] {
            Slot::Used { kind, .. } => kind,
            Slot::Free(_) => panic!("dangling GcRef: slot {} already freed", r.0),
        }
    }

    pub fn kind_mut(&mut self, r: GcRef) -> &mut ObjKind {
        match &mut self.slots[r.0 as usize] {
            Slot::Used { kind, .. } => kind,
            Slot::Free(_) => panic!("dangling GcRef: slot {} already freed", r.0),
        }
    }

    pub fn is_marked(&self, r: GcRef) -> bool {
        matches!(self.slots[r.0 as usize], Slot::Used { marked: true, .. })
    }

    /// The cached hash of an interned string, for callers (the VM, the
    /// compiler) that hold a `GcRef` key and need it to drive a [`Table`]
    /// lookup. Panics if `r` isn't a string — every `Table` key always is.
    pub fn string_hash(&self, r: GcRef) -> u32 {
        match self.kind(r) {
            ObjKind::String(s) => s.hash,
            other => panic!("string_hash called on a {}", other.type_name()),
        }
    }

    /// Renders a value the way `print` (spec.md §4.3) and the disassembler
    /// (spec.md §4.3's expansion) show it. The single place this workspace
    /// turns a `Value` into display text, so `print`'s output and
    /// `--trace`/`--print-code`'s constant dumps never drift apart.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: GcRef) -> String {
        match self.kind(r) {
            ObjKind::String(s) => s.as_str().into_owned(),
            ObjKind::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.format_object(n)),
                None => "<script>".to_string(),
            },
            ObjKind::Native(_) => "<native fn>".to_string(),
            ObjKind::Closure(c) => self.format_object(c.function),
            ObjKind::Upvalue(_) => "upvalue".to_string(),
            ObjKind::Class(c) => self.format_object(c.name),
            ObjKind::Instance(i) => format!("{} instance", self.format_object(i.class)),
            ObjKind::BoundMethod(b) => self.format_object(b.method),
        }
    }

    // -- interning --------------------------------------------------------

    fn find_interned(&self, bytes: &[u8], hash: u32) -> Option<GcRef> {
        if self.intern.entries.is_empty() {
            return None;
        }
        let mask = self.intern.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.intern.entries[idx] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied { hash: h, key } if h == hash => {
                    if let ObjKind::String(s) = self.kind(key) {
                        if s.bytes.as_ref() == bytes {
                            return Some(key);
                        }
                    }
                }
                InternSlot::Occupied { .. } => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn intern_insert(&mut self, bytes: &[u8], hash: u32, key: GcRef) {
        if self.intern.should_grow() {
            self.intern.grow();
        }
        let mask = self.intern.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.intern.entries[idx] {
                InternSlot::Empty | InternSlot::Tombstone => break,
                InternSlot::Occupied { hash: h, key: k } if h == hash => {
                    if let ObjKind::String(s) = self.kind(k) {
                        if s.bytes.as_ref() == bytes {
                            return; // already interned, nothing to do
                        }
                    }
                    idx = (idx + 1) & mask;
                }
                InternSlot::Occupied { .. } => idx = (idx + 1) & mask,
            }
        }
        self.intern.insert(idx, hash, key);
    }

    /// Interns `s`, copying its bytes. Use when the caller doesn't already
    /// own a buffer it can hand off (e.g. a lexeme borrowed from source
    /// text).
    pub fn copy_string(&mut self, s: &str, roots: &Roots) -> GcRef {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.find_interned(s.as_bytes(), hash) {
            return existing;
        }
        self.take_string(s.to_owned(), roots)
    }

    /// Interns `s`, taking ownership of its buffer. Use when the caller
    /// already has a freshly-built `String` (e.g. string concatenation)
    /// that it would otherwise just drop.
    pub fn take_string(&mut self, s: String, roots: &Roots) -> GcRef {
        let bytes = s.into_bytes();
        let hash = fnv1a_hash(&bytes);
        if let Some(existing) = self.find_interned(&bytes, hash) {
            return existing;
        }
        let obj = self.allocate(
            ObjKind::String(LoxString {
                bytes: bytes.clone().into_boxed_slice(),
                hash,
            }),
            roots,
        );
        self.intern_insert(&bytes, hash, obj);
        obj
    }

    // -- allocation ---------------------------------------------------------

    pub fn alloc_function(&mut self, function: LoxFunction, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Function(function), roots)
    }

    pub fn alloc_native(&mut self, name: GcRef, function: NativeFnPtr, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Native(NativeFn { name, function }), roots)
    }

    pub fn alloc_closure(&mut self, function: GcRef, upvalues: Vec<GcRef>, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Closure(Closure { function, upvalues }), roots)
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Upvalue(Upvalue { state }), roots)
    }

    pub fn alloc_class(&mut self, name: GcRef, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Class(Class::new(name)), roots)
    }

    pub fn alloc_instance(&mut self, class: GcRef, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::Instance(Instance::new(class)), roots)
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: GcRef, roots: &Roots) -> GcRef {
        self.allocate(ObjKind::BoundMethod(BoundMethod { receiver, method }), roots)
    }

    fn allocate(&mut self, kind: ObjKind, roots: &Roots) -> GcRef {
        self.maybe_collect(roots);

        let size = kind.estimated_size();
        self.bytes_allocated += size;
        self.object_count += 1;

        let slot = Slot::Used { marked: false, kind };
        if self.free_list_head != FREE_LIST_END {
            let idx = self.free_list_head;
            self.free_list_head = match self.slots[idx as usize] {
                Slot::Free(next) => next,
                Slot::Used { .. } => unreachable!("free list pointed at a live slot"),
            };
            self.slots[idx as usize] = slot;
            GcRef(idx)
        } else {
            self.slots.push(slot);
            GcRef(self.slots.len() as u32 - 1)
        }
    }

    // -- collection -----------------------------------------------------

    pub fn maybe_collect(&mut self, roots: &Roots) {
        if self.config.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
    }

    pub fn collect(&mut self, roots: &Roots) {
        if self.config.log {
            tracing::debug!(bytes_allocated = self.bytes_allocated, "-- gc begin");
        }

        self.mark_roots(roots);
        self.trace_references();
        self.remove_weak_interned();
        let freed = self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        self.collections_run += 1;

        if self.config.log {
            tracing::debug!(
                freed,
                bytes_allocated = self.bytes_allocated,
                next_gc = self.next_gc,
                "-- gc end"
            );
        }
    }

    fn mark_roots(&mut self, roots: &Roots) {
        for &v in roots.stack {
            self.mark_value(v);
        }
        for &c in roots.frame_closures {
            self.mark_object(c);
        }
        for &u in roots.open_upvalues {
            self.mark_object(u);
        }
        self.mark_table(roots.globals);
        for &e in roots.extra {
            self.mark_object(e);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: GcRef) {
        if let Slot::Used { marked, .. } = &mut self.slots[r.0 as usize] {
            if !*marked {
                *marked = true;
                self.gray.push(r);
            }
        }
    }

    fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Marks every object directly reachable from `r`. Children are
    /// collected into scratch buffers first so the borrow of `self.slots[r]`
    /// ends before we recurse into `mark_object`/`mark_table`, which also
    /// need `&mut self`.
    fn blacken(&mut self, r: GcRef) {
        match self.kind(r) {
            ObjKind::String(_) | ObjKind::Native(_) => {}
            ObjKind::Function(f) => {
                let name = f.name;
                let constants: Vec<Value> = f.chunk.constants.clone();
                if let Some(name) = name {
                    self.mark_object(name);
                }
                for c in constants {
                    self.mark_value(c);
                }
            }
            ObjKind::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                self.mark_object(function);
                for u in upvalues {
                    self.mark_object(u);
                }
            }
            ObjKind::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    self.mark_value(v);
                }
            }
            ObjKind::Class(c) => {
                let name = c.name;
                self.mark_object(name);
                self.mark_table_owned_copy(r, |h| match h.kind(r) {
                    ObjKind::Class(c) => c.methods.iter().collect(),
                    _ => unreachable!(),
                });
            }
            ObjKind::Instance(i) => {
                let class = i.class;
                self.mark_object(class);
                self.mark_table_owned_copy(r, |h| match h.kind(r) {
                    ObjKind::Instance(i) => i.fields.iter().collect(),
                    _ => unreachable!(),
                });
            }
            ObjKind::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.mark_value(receiver);
                self.mark_object(method);
            }
        }
    }

    /// Helper for the two table-bearing object kinds: snapshots a table's
    /// entries via `extract`, then marks each pair. Kept separate from
    /// `blacken`'s main match so the borrow of `self.kind(r)` inside
    /// `extract` doesn't overlap the subsequent `&mut self` marking calls.
    fn mark_table_owned_copy(
        &mut self,
        _r: GcRef,
        extract: impl Fn(&Heap) -> Vec<(GcRef, Value)>,
    ) {
        let entries = extract(self);
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Weak removal (spec.md §4.7 phase 3, §4.5): any intern entry whose
    /// string didn't get marked by some *other* root is evicted now, before
    /// sweep frees it, so the table never holds a dangling reference.
    fn remove_weak_interned(&mut self) {
        let slots = &self.slots;
        self.intern
            .remove_unmarked(|key| matches!(slots[key.0 as usize], Slot::Used { marked: true, .. }));
    }

    /// Frees every unmarked slot and clears the mark bit on survivors.
    /// Returns the number of objects freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Slot::Used { marked: true, .. } => {
                    if let Slot::Used { marked, .. } = &mut self.slots[idx] {
                        *marked = false;
                    }
                }
                Slot::Used { marked: false, .. } => {
                    let size = match &self.slots[idx] {
                        Slot::Used { kind, .. } => kind.estimated_size(),
                        Slot::Free(_) => unreachable!(),
                    };
                    self.bytes_allocated -= size;
                    self.object_count -= 1;
                    self.slots[idx] = Slot::Free(self.free_list_head);
                    self.free_list_head = idx as u32;
                    freed += 1;
                }
                Slot::Free(_) => {}
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_roots() -> Roots<'static> {
        Roots::default()
    }

    #[test]
    fn interning_the_same_bytes_twice_returns_the_same_ref() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.copy_string("hello", &empty_roots());
        let b = heap.copy_string("hello", &empty_roots());
        assert_eq!(a, b);
    }

    #[test]
    fn different_strings_intern_to_different_refs() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.copy_string("hello", &empty_roots());
        let b = heap.copy_string("world", &empty_roots());
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_string_is_collected_and_its_intern_entry_freed() {
        let mut heap = Heap::new(GcConfig::default());
        let r = heap.copy_string("transient", &empty_roots());
        assert!(heap.is_marked(r) == false);

        heap.collect(&empty_roots());
        assert_eq!(heap.stats().object_count, 0);

        // Re-interning after collection must allocate a fresh object rather
        // than resolve to the freed slot's stale entry.
        let r2 = heap.copy_string("transient", &empty_roots());
        assert_eq!(heap.stats().object_count, 1);
        let _ = r2;
    }

    #[test]
    fn rooted_string_survives_collection() {
        let mut heap = Heap::new(GcConfig::default());
        let r = heap.copy_string("kept", &empty_roots());
        let stack = [Value::Obj(r)];
        let roots = Roots {
            stack: &stack,
            ..Roots::default()
        };
        heap.collect(&roots);
        assert_eq!(heap.stats().object_count, 1);
        assert!(matches!(heap.kind(r), ObjKind::String(s) if &*s.as_str() == "kept"));
    }

    #[test]
    fn format_value_renders_strings_without_quotes_and_numbers_bare() {
        let mut heap = Heap::new(GcConfig::default());
        let s = heap.copy_string("hi", &empty_roots());
        assert_eq!(heap.format_value(Value::Obj(s)), "hi");
        assert_eq!(heap.format_value(Value::Number(3.0)), "3");
        assert_eq!(heap.format_value(Value::Nil), "nil");
        assert_eq!(heap.format_value(Value::Bool(true)), "true");
    }

    #[test]
    fn unrooted_cyclic_instances_are_both_collected() {
        let mut heap = Heap::new(GcConfig::default());
        let name = heap.copy_string("Node", &empty_roots());
        let class = heap.alloc_class(name, &empty_roots());
        let a = heap.alloc_instance(class, &empty_roots());
        let b = heap.alloc_instance(class, &empty_roots());
        let field = heap.copy_string("next", &empty_roots());
        let hash = heap.string_hash(field);
        if let ObjKind::Instance(inst) = heap.kind_mut(a) {
            inst.fields.set(field, hash, Value::Obj(b));
        }
        if let ObjKind::Instance(inst) = heap.kind_mut(b) {
            inst.fields.set(field, hash, Value::Obj(a));
        }

        // Neither instance is reachable from any root even though they
        // reference each other: a tracing collector must not mistake the
        // cycle for liveness the way naive reference counting would.
        heap.collect(&empty_roots());
        assert_eq!(heap.stats().object_count, 0);
    }

    #[test]
    fn rooting_one_instance_in_a_cycle_keeps_both_alive() {
        let mut heap = Heap::new(GcConfig::default());
        let name = heap.copy_string("Node", &empty_roots());
        let class = heap.alloc_class(name, &empty_roots());
        let a = heap.alloc_instance(class, &empty_roots());
        let b = heap.alloc_instance(class, &empty_roots());
        let field = heap.copy_string("next", &empty_roots());
        let hash = heap.string_hash(field);
        if let ObjKind::Instance(inst) = heap.kind_mut(a) {
            inst.fields.set(field, hash, Value::Obj(b));
        }
        if let ObjKind::Instance(inst) = heap.kind_mut(b) {
            inst.fields.set(field, hash, Value::Obj(a));
        }

        let stack = [Value::Obj(a)];
        let roots = Roots {
            stack: &stack,
            ..Roots::default()
        };
        heap.collect(&roots);

        // Reaching `a` on the stack must transitively mark `b` through the
        // cyclic field reference, and `a` back through `b`'s.
        assert!(matches!(heap.kind(a), ObjKind::Instance(_)));
        assert!(matches!(heap.kind(b), ObjKind::Instance(_)));
    }

    #[test]
    fn gc_stress_collects_on_every_allocation() {
        let mut heap = Heap::new(GcConfig {
            stress: true,
            log: false,
        });
        let r1 = heap.copy_string("a", &empty_roots());
        let _ = r1; // immediately collectible, no root holds it
        let r2 = heap.copy_string("b", &empty_roots());
        // the first string is gone; only the second remains live
        assert_eq!(heap.stats().object_count, 1);
        let _ = r2;
    }
}
