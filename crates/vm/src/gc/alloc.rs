use fnv::FnvHashSet;
use slotmap::{HopSlotMap, SlotMap};

use super::{GcColor, GcHeader, ObjRef, Trace, Tracer};
use crate::config::GcConfig;
use crate::object::RObject;
use crate::value::Value;
use crate::vm::frame::{Context, ContextId};

slotmap::new_key_type! {pub struct RootSetHandle;}

pub(crate) struct GcBox {
    pub header: GcHeader,
    pub obj: RObject,
}

/// A host-held root. The referenced value stays alive until the handle is
/// passed back to [`Heap::unpin`].
#[derive(Debug)]
pub struct Persistent {
    handle: Option<RootSetHandle>,
    value: Value,
}

impl Persistent {
    pub fn value(&self) -> Value {
        self.value
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub live_objects: usize,
    /// Objects reclaimed over the lifetime of the heap
    pub freed_objects: usize,
    pub bytes_allocated: usize,
    pub threshold: usize,
}

pub struct Heap {
    objects: SlotMap<ObjRef, GcBox>,

    /// Estimated size of all objects allocated since the last sweep plus the
    /// ones that survived it.
    bytes_allocated: usize,

    /// Collection is due once `bytes_allocated` reaches this value. It is
    /// recalculated as `growth_factor * live bytes` after each collection.
    threshold: usize,

    config: GcConfig,

    persistent_handles: HopSlotMap<RootSetHandle, ObjRef>,

    /// Objects allocated by the native code currently running. They are roots
    /// until the arena is restored to an earlier mark.
    arena: Vec<ObjRef>,

    stats: GcStats,
}

impl Heap {
    pub fn new(config: GcConfig) -> Heap {
        Heap {
            objects: SlotMap::with_key(),
            bytes_allocated: 0,
            threshold: config.initial_threshold,
            config,
            persistent_handles: HopSlotMap::with_key(),
            arena: vec![],
            stats: GcStats::default(),
        }
    }

    pub(crate) fn alloc(&mut self, obj: RObject) -> ObjRef {
        self.bytes_allocated += obj.heap_size();
        let r = self.objects.insert(GcBox {
            header: GcHeader::new(),
            obj,
        });
        self.arena.push(r);
        r
    }

    /// Resolve a handle. **Panics if the object was reclaimed**, which means a
    /// value escaped the root set.
    pub fn get(&self, r: ObjRef) -> &RObject {
        match self.objects.get(r) {
            Some(b) => &b.obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut RObject {
        match self.objects.get_mut(r) {
            Some(b) => &mut b.obj,
            None => panic!("dangling object handle {:?}", r),
        }
    }

    pub fn try_get(&self, r: ObjRef) -> Option<&RObject> {
        self.objects.get(r).map(|b| &b.obj)
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.objects.contains_key(r)
    }

    /// Account for memory an object acquired after allocation.
    pub(crate) fn grew(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            live_objects: self.objects.len(),
            bytes_allocated: self.bytes_allocated,
            threshold: self.threshold,
            ..self.stats
        }
    }

    pub fn arena_save(&self) -> usize {
        self.arena.len()
    }

    pub fn arena_restore(&mut self, mark: usize) {
        self.arena.truncate(mark);
    }

    /// Keep `v` alive in the arena of the running native code.
    pub(crate) fn protect(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.arena.push(r);
        }
    }

    pub fn pin(&mut self, value: Value) -> Persistent {
        let handle = value.as_object().map(|r| self.persistent_handles.insert(r));
        Persistent { handle, value }
    }

    pub fn unpin(&mut self, p: Persistent) {
        if let Some(h) = p.handle {
            self.persistent_handles.remove(h);
        }
    }

    /// Push the roots owned by the heap itself.
    pub(crate) fn trace_roots(&self, tracer: &mut Tracer) {
        for (_, &r) in self.persistent_handles.iter() {
            tracer.mark(r);
        }
        for &r in &self.arena {
            tracer.mark(r);
        }
    }

    /// Mark everything reachable from the tracer's worklist. Reached fiber
    /// contexts are scanned once each.
    pub(crate) fn mark(&mut self, tracer: &mut Tracer, contexts: &SlotMap<ContextId, Context>) {
        let mut scanned = FnvHashSet::default();
        loop {
            while let Some(r) = tracer.objects.pop() {
                let b = match self.objects.get_mut(r) {
                    Some(b) => b,
                    None => continue,
                };
                if b.header.color() != GcColor::White {
                    continue;
                }
                b.header.set_color(GcColor::Gray);
                b.obj.trace(tracer);
                b.header.set_color(GcColor::Black);
            }
            match tracer.contexts.pop() {
                Some(id) => {
                    if scanned.insert(id) {
                        if let Some(ctx) = contexts.get(id) {
                            ctx.trace(tracer);
                        }
                    }
                }
                None => break,
            }
        }
    }

    /// Reclaim every object left white, returning them so the caller can run
    /// release callbacks. Survivors are whitened for the next cycle.
    pub(crate) fn sweep(&mut self) -> Vec<RObject> {
        let dead: Vec<ObjRef> = self
            .objects
            .iter()
            .filter(|(_, b)| b.header.color() == GcColor::White)
            .map(|(k, _)| k)
            .collect();
        let freed: Vec<RObject> = dead
            .into_iter()
            .filter_map(|k| self.objects.remove(k))
            .map(|b| b.obj)
            .collect();

        let mut live_bytes = 0;
        for (_, b) in self.objects.iter_mut() {
            debug_assert_eq!(b.header.color(), GcColor::Black);
            b.header.survive();
            live_bytes += b.obj.heap_size();
        }
        self.bytes_allocated = live_bytes;
        self.threshold = self
            .config
            .initial_threshold
            .max((live_bytes as f64 * self.config.growth_factor) as usize);
        self.stats.collections += 1;
        self.stats.freed_objects += freed.len();
        tracing::debug!(
            freed = freed.len(),
            live = self.objects.len(),
            threshold = self.threshold,
            "gc cycle finished"
        );
        freed
    }

    /// Every object still allocated, for teardown.
    pub(crate) fn drain(&mut self) -> Vec<RObject> {
        self.arena.clear();
        self.persistent_handles.clear();
        self.objects.drain().map(|(_, b)| b.obj).collect()
    }

    pub(crate) fn age_of(&self, r: ObjRef) -> Option<u8> {
        self.objects.get(r).map(|b| b.header.age())
    }
}
