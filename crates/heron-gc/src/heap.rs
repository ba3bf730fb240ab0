//! Heap context, configuration, and the allocation façade.
//!
//! All collector state lives in a single `Heap` value threaded through
//! allocation sites: the page table, the per-(class, generation) lists, the
//! occupancy counters and adaptive limits, the root set, and the finalizer
//! registry. A collection may happen inside any allocation entry point;
//! between allocations the mutator sees a static heap.

use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::error::{HeapError, HeapResult};
use crate::list::{NUM_PEGS, class_pegs, new_peg};
use crate::node::{
    CLASS_CELLS, FLAG_DEBUG, FLAG_MISSING, FLAG_OBJECT, FLAG_TRACE, GP_DDVAL, GP_PROMISE_SEEN,
    LARGE_CLASS, Link, Links, NUM_GENERATIONS, NUM_NODE_CLASSES, NUM_NODE_TYPES,
    NUM_OLD_GENERATIONS, Node, NodeData, NodeRef, NodeType,
};
use crate::page::{Page, class_cells};

/// Native finalizer: runs against the heap with the dying object.
pub type NativeFinalizer = Box<dyn FnMut(&mut Heap, NodeRef)>;

/// Host evaluator hook: receives a constructed call to evaluate in the
/// global environment, in a fresh top-level context.
pub type EvalHook = Box<dyn FnMut(&mut Heap, NodeRef)>;

/// Host root enumerator: yields every live reference held outside the heap
/// (symbol table, context chain, display lists, ...).
pub type RootHook = Box<dyn FnMut(&mut dyn FnMut(NodeRef))>;

/// Heap configuration.
///
/// Limits are counted in nodes and in 8-byte vector cells. The adaptive
/// sizing fractions follow the controller of the collector: grow when
/// post-collection occupancy exceeds the grow fraction, shrink below the
/// shrink fraction, never below the initial limits.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Initial node limit (default: 350 000)
    pub node_limit: usize,
    /// Initial vector-cell limit (default: 8M cells, 64 MB)
    pub cell_limit: usize,
    /// Hard ceiling for the node limit
    pub max_node_limit: usize,
    /// Hard ceiling for the cell limit
    pub max_cell_limit: usize,
    /// Capacity of the protect stack (overflow is fatal)
    pub protect_capacity: usize,
    /// Grow the node limit above this occupancy (default: 0.70)
    pub node_grow_frac: f64,
    /// Shrink the node limit below this occupancy (default: 0.30)
    pub node_shrink_frac: f64,
    /// Grow the cell limit above this occupancy (default: 0.70)
    pub cell_grow_frac: f64,
    /// Shrink the cell limit below this occupancy (default: 0.30)
    pub cell_shrink_frac: f64,
    /// Minimum node-limit growth step (default: 40 000)
    pub node_grow_incr_min: usize,
    /// Fractional node-limit growth step (default: 0.2)
    pub node_grow_incr_frac: f64,
    /// Minimum node-limit shrink step (default: 0)
    pub node_shrink_incr_min: usize,
    /// Fractional node-limit shrink step (default: 0.2)
    pub node_shrink_incr_frac: f64,
    /// Minimum cell-limit growth step (default: 80 000)
    pub cell_grow_incr_min: usize,
    /// Fractional cell-limit growth step (default: 0.2)
    pub cell_grow_incr_frac: f64,
    /// Minimum cell-limit shrink step (default: 0)
    pub cell_shrink_incr_min: usize,
    /// Fractional cell-limit shrink step (default: 0.2)
    pub cell_shrink_incr_frac: f64,
    /// Fraction of the heap that must come free per collection before the
    /// level escalates (default: 0.08)
    pub min_free_frac: f64,
    /// Keep this fraction of slots beyond the tenured population when
    /// releasing pages (default: 0.5)
    pub max_keep_frac: f64,
    /// Release surplus pages every this many level>=1 collections
    /// (default: 1)
    pub page_release_freq: u32,
    /// Collections of generation g before generation g+1 is collected
    /// (defaults: 20 and 5)
    pub level_freq: [u32; NUM_OLD_GENERATIONS],
    /// Report each collection (runtime-toggleable via `gc_info`)
    pub gc_reporting: bool,
    /// Collect before every allocation (runtime-toggleable via
    /// `gc_torture`)
    pub gc_torture: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            node_limit: 350_000,
            cell_limit: 8 * 1024 * 1024,
            max_node_limit: usize::MAX,
            max_cell_limit: usize::MAX,
            protect_capacity: 50_000,
            node_grow_frac: 0.70,
            node_shrink_frac: 0.30,
            cell_grow_frac: 0.70,
            cell_shrink_frac: 0.30,
            node_grow_incr_min: 40_000,
            node_grow_incr_frac: 0.2,
            node_shrink_incr_min: 0,
            node_shrink_incr_frac: 0.2,
            cell_grow_incr_min: 80_000,
            cell_grow_incr_frac: 0.2,
            cell_shrink_incr_min: 0,
            cell_shrink_incr_frac: 0.2,
            min_free_frac: 0.08,
            max_keep_frac: 0.5,
            page_release_freq: 1,
            level_freq: [20, 5],
            gc_reporting: false,
            gc_torture: false,
        }
    }
}

/// Collection statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total collections performed
    pub collections: u64,
    /// Collections per level (0 = youngest only)
    pub collections_by_level: [u64; NUM_GENERATIONS],
    /// Level of the last collection
    pub last_level: usize,
    /// Live nodes after the last collection
    pub last_live_nodes: usize,
    /// Free nodes after the last collection
    pub last_free_nodes: usize,
    /// Cumulative stop-the-world time
    pub total_pause: Duration,
    /// Stop-the-world time of the last collection
    pub last_pause: Duration,
}

/// The heap: every user-visible value of the runtime lives here.
pub struct Heap {
    pub(crate) config: GcConfig,

    // Page table. Node references are (page, slot) pairs; released page
    // ids are recycled.
    pub(crate) pages: Vec<Option<Page>>,
    pub(crate) free_page_ids: Vec<usize>,
    pub(crate) class_pages: [Vec<usize>; NUM_NODE_CLASSES],

    // Generation lists and the per-class free cursor into new space.
    pub(crate) pegs: [Links; NUM_PEGS],
    pub(crate) free_cursor: [Link; NUM_NODE_CLASSES],

    // Occupancy bookkeeping.
    pub(crate) alloc_count: [usize; NUM_NODE_CLASSES],
    pub(crate) page_count: [usize; NUM_NODE_CLASSES],
    pub(crate) old_count: [[usize; NUM_GENERATIONS]; NUM_NODE_CLASSES],
    pub(crate) nodes_in_use: usize,
    pub(crate) node_limit: usize,
    pub(crate) cell_limit: usize,
    pub(crate) orig_node_limit: usize,
    pub(crate) orig_cell_limit: usize,
    pub(crate) max_node_limit: usize,
    pub(crate) max_cell_limit: usize,
    pub(crate) small_cells: usize,
    pub(crate) large_cells: usize,

    // Collector scheduling state.
    pub(crate) gens_to_collect: usize,
    pub(crate) collect_counts: [u32; NUM_OLD_GENERATIONS],
    pub(crate) release_countdown: u32,
    pub(crate) in_gc: bool,
    pub(crate) torture: bool,
    pub(crate) reporting: bool,
    pub(crate) interrupts_suspended: bool,
    pub(crate) stats: GcStats,

    // Singletons.
    pub(crate) nil: NodeRef,
    pub(crate) blank: NodeRef,

    // Root set.
    pub(crate) protect_stack: Vec<NodeRef>,
    pub(crate) precious: NodeRef,
    pub(crate) transient: NodeRef,
    pub(crate) current_expr: NodeRef,
    pub(crate) extra_roots: Vec<NodeRef>,
    pub(crate) root_hook: Option<RootHook>,

    // Finalizer registry.
    pub(crate) finalizer_head: NodeRef,
    pub(crate) finalizers_running: bool,
    pub(crate) native_finalizers: FxHashMap<u32, NativeFinalizer>,
    pub(crate) next_finalizer_token: u32,
    pub(crate) eval_hook: Option<EvalHook>,
}

impl Heap {
    /// Create a heap with the default configuration.
    pub fn new() -> Heap {
        Self::with_config(GcConfig::default())
    }

    /// Create a heap with a custom configuration.
    pub fn with_config(config: GcConfig) -> Heap {
        let mut pegs = [Links::self_loop(Link::peg(0)); NUM_PEGS];
        for (i, links) in pegs.iter_mut().enumerate() {
            *links = Links::self_loop(Link::peg(i));
        }
        let mut free_cursor = [new_peg(0); NUM_NODE_CLASSES];
        for (c, cur) in free_cursor.iter_mut().enumerate() {
            *cur = new_peg(c as u8);
        }

        let mut heap = Heap {
            pages: Vec::new(),
            free_page_ids: Vec::new(),
            class_pages: Default::default(),
            pegs,
            free_cursor,
            alloc_count: [0; NUM_NODE_CLASSES],
            page_count: [0; NUM_NODE_CLASSES],
            old_count: [[0; NUM_GENERATIONS]; NUM_NODE_CLASSES],
            nodes_in_use: 0,
            node_limit: config.node_limit,
            cell_limit: config.cell_limit,
            orig_node_limit: config.node_limit,
            orig_cell_limit: config.cell_limit,
            max_node_limit: config.max_node_limit.max(config.node_limit),
            max_cell_limit: config.max_cell_limit.max(config.cell_limit),
            small_cells: 0,
            large_cells: 0,
            gens_to_collect: 0,
            collect_counts: config.level_freq,
            release_countdown: config.page_release_freq,
            in_gc: false,
            torture: config.gc_torture,
            reporting: config.gc_reporting,
            interrupts_suspended: false,
            stats: GcStats::default(),
            nil: NodeRef::NIL,
            blank: NodeRef::NIL,
            protect_stack: Vec::with_capacity(config.protect_capacity),
            precious: NodeRef::NIL,
            transient: NodeRef::NIL,
            current_expr: NodeRef::NIL,
            extra_roots: Vec::new(),
            root_hook: None,
            finalizer_head: NodeRef::NIL,
            finalizers_running: false,
            native_finalizers: FxHashMap::default(),
            next_finalizer_token: 0,
            eval_hook: None,
            config,
        };

        // Bootstrap the nil singleton: the first node allocated, with all
        // three slots and the attribute self-referencing. Fields are stored
        // directly; the write barrier cannot run before nil exists.
        let nil = heap.claim_free_node(0);
        debug_assert_eq!(nil, NodeRef::NIL);
        let n = heap.node_mut(nil);
        n.ty = NodeType::Nil;
        n.attrib = nil;
        n.data = NodeData::Triple {
            tag: nil,
            car: nil,
            cdr: nil,
        };
        heap.nil = nil;
        heap.precious = nil;
        heap.transient = nil;
        heap.current_expr = nil;
        heap.finalizer_head = nil;

        let blank = heap
            .alloc_vector(NodeType::Chars, 0)
            .expect("bootstrap allocation of the blank string cannot fail");
        heap.blank = blank;
        heap
    }

    /// The nil singleton.
    #[inline]
    pub fn nil(&self) -> NodeRef {
        self.nil
    }

    /// The blank character-string singleton.
    #[inline]
    pub fn blank_string(&self) -> NodeRef {
        self.blank
    }

    // === Node access ===

    pub(crate) fn node(&self, r: NodeRef) -> &Node {
        let page = self.pages[r.page_index()]
            .as_ref()
            .expect("node reference into released page");
        &page.slots[r.slot_index()]
    }

    pub(crate) fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        let page = self.pages[r.page_index()]
            .as_mut()
            .expect("node reference into released page");
        &mut page.slots[r.slot_index()]
    }

    /// Type tag of a node.
    pub fn node_type(&self, r: NodeRef) -> NodeType {
        self.node(r).ty
    }

    /// Generation of a node: 0 is new space, old generations are 1..=2.
    pub fn generation(&self, r: NodeRef) -> u8 {
        self.node(r).generation
    }

    /// Size class of a node.
    pub fn node_class(&self, r: NodeRef) -> u8 {
        self.node(r).class
    }

    // === Allocation ===

    /// Detach the slot under the free cursor, growing a page if new space
    /// is exhausted. The slot stays on its new-space list; only the cursor
    /// advances past it.
    fn claim_free_node(&mut self, class: u8) -> NodeRef {
        if self.free_cursor[class as usize] == new_peg(class) {
            self.grow_page(class);
        }
        let l = self.free_cursor[class as usize];
        self.free_cursor[class as usize] = self.next_of(l);
        let r = l.node();
        self.nodes_in_use += 1;
        let nil = self.nil;
        let n = self.node_mut(r);
        n.generation = 0;
        n.marked = false;
        n.gp = 0;
        n.named = 0;
        n.flags = 0;
        n.attrib = nil;
        r
    }

    /// Collect if the torture flag, the node budget, or the vector budget
    /// demands it.
    fn maybe_gc(&mut self, cells_needed: usize) {
        if self.torture || self.nodes_in_use >= self.node_limit || cells_needed > self.vheap_free()
        {
            self.gc_internal(cells_needed, None);
        }
    }

    /// Allocate a non-vector node of the given type, with every reference
    /// slot set to nil.
    pub fn alloc_node(&mut self, ty: NodeType) -> HeapResult<NodeRef> {
        assert!(
            !ty.is_vector(),
            "alloc_node cannot allocate vectors; use alloc_vector"
        );
        self.maybe_gc(0);
        if self.nodes_in_use >= self.node_limit {
            return Err(HeapError::ConsExhausted {
                limit: self.node_limit,
            });
        }
        let nil = self.nil;
        let r = self.claim_free_node(0);
        let n = self.node_mut(r);
        n.ty = ty;
        n.data = match ty {
            t if t.uses_triple() => NodeData::Triple {
                tag: nil,
                car: nil,
                cdr: nil,
            },
            NodeType::Env => NodeData::Env {
                frame: nil,
                enclos: nil,
                hashtab: nil,
            },
            NodeType::Builtin | NodeType::Special => NodeData::Function { offset: 0 },
            NodeType::ExtPtr => NodeData::ExtPtr {
                raw: 0,
                prot: nil,
                tag: nil,
            },
            _ => unreachable!(),
        };
        Ok(r)
    }

    /// Allocate a vector of `length` elements of the given type.
    ///
    /// Reference-valued vectors come back with every element set to a safe
    /// canonical value (nil, or the blank string for string vectors), and
    /// character strings are zeroed through their NUL terminator. Numeric
    /// and raw vectors are not pre-initialized.
    pub fn alloc_vector(&mut self, ty: NodeType, length: usize) -> HeapResult<NodeRef> {
        assert!(ty.is_vector(), "alloc_vector requires a vector type");
        let cells = ty
            .cell_count(length)
            .filter(|c| c.checked_mul(8).is_some())
            .ok_or(HeapError::VectorTooLong { length })?;
        let (class, alloc_cells) = class_for_cells(cells);

        self.maybe_gc(alloc_cells);
        if self.nodes_in_use >= self.node_limit {
            return Err(HeapError::ConsExhausted {
                limit: self.node_limit,
            });
        }
        if alloc_cells > self.vheap_free() {
            return Err(HeapError::VectorExhausted {
                needed: alloc_cells,
                free: self.vheap_free(),
            });
        }

        let r = self.claim_free_node(class);
        let buffer = if class == LARGE_CLASS {
            self.large_cells += cells;
            Some(vec![0u64; cells].into_boxed_slice())
        } else {
            self.small_cells += alloc_cells;
            None
        };
        let n = self.node_mut(r);
        n.ty = ty;
        n.data = NodeData::Vector(crate::node::VecHeader {
            length,
            truelength: 0,
            buffer,
        });

        match ty {
            NodeType::Chars => self.vec_cells_mut(r).fill(0),
            NodeType::Strings => {
                let blank = self.blank;
                self.vec_cells_mut(r).fill(blank.0 as u64);
            }
            NodeType::Exprs | NodeType::Generic => {
                let nil = self.nil;
                self.vec_cells_mut(r).fill(nil.0 as u64);
            }
            _ => {}
        }
        Ok(r)
    }

    /// Allocate a list cell.
    pub fn cons(&mut self, car: NodeRef, cdr: NodeRef) -> HeapResult<NodeRef> {
        self.protect(car);
        self.protect(cdr);
        let cell = self.alloc_node(NodeType::Cons);
        self.unprotect(2);
        let cell = cell?;
        let nil = self.nil;
        self.init_triple(cell, nil, car, cdr);
        Ok(cell)
    }

    /// Allocate a chain of `n` list cells, each car set to nil.
    pub fn alloc_list(&mut self, n: usize) -> HeapResult<NodeRef> {
        let mut result = self.nil;
        for _ in 0..n {
            let nil = self.nil;
            result = self.cons(nil, result)?;
        }
        Ok(result)
    }

    /// Allocate an environment whose frame is `valuelist`, tagged pairwise
    /// with the symbols of `namelist`.
    pub fn new_environment(
        &mut self,
        namelist: NodeRef,
        valuelist: NodeRef,
        enclos: NodeRef,
    ) -> HeapResult<NodeRef> {
        self.protect(namelist);
        self.protect(valuelist);
        self.protect(enclos);
        let env = self.alloc_node(NodeType::Env);
        self.unprotect(3);
        let env = env?;
        let nil = self.nil;
        match &mut self.node_mut(env).data {
            NodeData::Env {
                frame,
                enclos: e,
                hashtab,
            } => {
                *frame = valuelist;
                *e = enclos;
                *hashtab = nil;
            }
            _ => unreachable!(),
        }
        let mut v = valuelist;
        let mut n = namelist;
        while v != nil && n != nil {
            let name = self.car(n);
            self.set_tag(v, name);
            v = self.cdr(v);
            n = self.cdr(n);
        }
        Ok(env)
    }

    /// Allocate an unevaluated promise for `expr` in `env`.
    pub fn make_promise(&mut self, expr: NodeRef, env: NodeRef) -> HeapResult<NodeRef> {
        self.protect(expr);
        self.protect(env);
        let p = self.alloc_node(NodeType::Promise);
        self.unprotect(2);
        let p = p?;
        let nil = self.nil;
        self.init_triple(p, env, nil, expr);
        Ok(p)
    }

    /// Allocate a closure.
    pub fn make_closure(
        &mut self,
        formals: NodeRef,
        body: NodeRef,
        env: NodeRef,
    ) -> HeapResult<NodeRef> {
        self.protect(formals);
        self.protect(body);
        self.protect(env);
        let c = self.alloc_node(NodeType::Closure);
        self.unprotect(3);
        let c = c?;
        self.init_triple(c, env, formals, body);
        Ok(c)
    }

    /// Allocate a symbol with the given print name (a `Chars` node) and
    /// value.
    pub fn make_symbol(&mut self, printname: NodeRef, value: NodeRef) -> HeapResult<NodeRef> {
        assert_eq!(
            self.node_type(printname),
            NodeType::Chars,
            "symbol print name must be a character string"
        );
        self.protect(printname);
        self.protect(value);
        let s = self.alloc_node(NodeType::Symbol);
        self.unprotect(2);
        let s = s?;
        let nil = self.nil;
        self.init_triple(s, nil, printname, value);
        Ok(s)
    }

    /// Allocate an external pointer.
    pub fn make_external_ptr(
        &mut self,
        raw: usize,
        tag: NodeRef,
        prot: NodeRef,
    ) -> HeapResult<NodeRef> {
        self.protect(tag);
        self.protect(prot);
        let p = self.alloc_node(NodeType::ExtPtr);
        self.unprotect(2);
        let p = p?;
        match &mut self.node_mut(p).data {
            NodeData::ExtPtr {
                raw: r,
                prot: pr,
                tag: t,
            } => {
                *r = raw;
                *pr = prot;
                *t = tag;
            }
            _ => unreachable!(),
        }
        Ok(p)
    }

    /// Allocate a builtin function node for a host function table offset.
    pub fn make_builtin(&mut self, offset: u32) -> HeapResult<NodeRef> {
        let b = self.alloc_node(NodeType::Builtin)?;
        match &mut self.node_mut(b).data {
            NodeData::Function { offset: o } => *o = offset,
            _ => unreachable!(),
        }
        Ok(b)
    }

    /// Allocate a special-form node for a host function table offset.
    pub fn make_special(&mut self, offset: u32) -> HeapResult<NodeRef> {
        let s = self.alloc_node(NodeType::Special)?;
        match &mut self.node_mut(s).data {
            NodeData::Function { offset: o } => *o = offset,
            _ => unreachable!(),
        }
        Ok(s)
    }

    /// Allocate a character string holding `s`.
    pub fn mk_char(&mut self, s: &str) -> HeapResult<NodeRef> {
        self.mk_char_bytes(s.as_bytes())
    }

    /// Allocate a character string holding `bytes`.
    pub fn mk_char_bytes(&mut self, bytes: &[u8]) -> HeapResult<NodeRef> {
        let v = self.alloc_vector(NodeType::Chars, bytes.len())?;
        let cells = self.vec_cells_mut(v);
        // SAFETY: the cell slice is live and at least length+1 bytes long
        // (the cell count reserves the NUL terminator).
        let dst =
            unsafe { std::slice::from_raw_parts_mut(cells.as_mut_ptr() as *mut u8, bytes.len()) };
        dst.copy_from_slice(bytes);
        Ok(v)
    }

    pub(crate) fn init_triple(&mut self, r: NodeRef, tag: NodeRef, car: NodeRef, cdr: NodeRef) {
        match &mut self.node_mut(r).data {
            NodeData::Triple {
                tag: t,
                car: a,
                cdr: d,
            } => {
                *t = tag;
                *a = car;
                *d = cdr;
            }
            _ => panic!("heap corruption: three-slot store into a mismatched payload"),
        }
    }

    // === Vector cell access ===

    pub(crate) fn vec_cells(&self, r: NodeRef) -> &[u64] {
        let n = self.node(r);
        let h = match &n.data {
            NodeData::Vector(h) => h,
            _ => self.bad_node(r),
        };
        let cells = n.ty.cell_count(h.length).expect("vector length overflow");
        if n.class == LARGE_CLASS {
            let buf = h.buffer.as_deref().expect("large vector buffer missing");
            &buf[..cells]
        } else {
            let page = self.pages[r.page_index()]
                .as_ref()
                .expect("node reference into released page");
            let off = r.slot_index() * class_cells(n.class);
            &page.data[off..off + cells]
        }
    }

    pub(crate) fn vec_cells_mut(&mut self, r: NodeRef) -> &mut [u64] {
        let page = self.pages[r.page_index()]
            .as_mut()
            .expect("node reference into released page");
        let class = page.class;
        let per = class_cells(class);
        let slot = r.slot_index();
        let Page { slots, data, .. } = page;
        let n = &mut slots[slot];
        let ty = n.ty;
        let h = match &mut n.data {
            NodeData::Vector(h) => h,
            _ => panic!("vector cell access on non-vector node"),
        };
        let cells = ty.cell_count(h.length).expect("vector length overflow");
        if class == LARGE_CLASS {
            let buf = h
                .buffer
                .as_deref_mut()
                .expect("large vector buffer missing");
            &mut buf[..cells]
        } else {
            let off = slot * per;
            &mut data[off..off + cells]
        }
    }

    fn vec_header(&self, r: NodeRef) -> &crate::node::VecHeader {
        match &self.node(r).data {
            NodeData::Vector(h) => h,
            _ => self.bad_node(r),
        }
    }

    /// Element count of a vector.
    pub fn vec_length(&self, r: NodeRef) -> usize {
        self.vec_header(r).length
    }

    /// True length of a vector (reserved capacity hint, mutator-owned).
    pub fn truelength(&self, r: NodeRef) -> usize {
        self.vec_header(r).truelength
    }

    /// Set the true length of a vector.
    pub fn set_truelength(&mut self, r: NodeRef, tl: usize) {
        match &mut self.node_mut(r).data {
            NodeData::Vector(h) => h.truelength = tl,
            _ => panic!("set_truelength on non-vector node"),
        }
    }

    fn check_elt(&self, r: NodeRef, ty: NodeType, i: usize) {
        assert_eq!(self.node_type(r), ty, "element access with wrong type");
        assert!(
            i < self.vec_length(r),
            "element index {i} out of bounds for length {}",
            self.vec_length(r)
        );
    }

    /// Read an integer element.
    pub fn int_elt(&self, r: NodeRef, i: usize) -> i32 {
        self.check_elt(r, NodeType::Int, i);
        read_i32(self.vec_cells(r), i)
    }

    /// Write an integer element.
    pub fn set_int_elt(&mut self, r: NodeRef, i: usize, x: i32) {
        self.check_elt(r, NodeType::Int, i);
        write_i32(self.vec_cells_mut(r), i, x);
    }

    /// Read a logical element.
    pub fn logical_elt(&self, r: NodeRef, i: usize) -> i32 {
        self.check_elt(r, NodeType::Logical, i);
        read_i32(self.vec_cells(r), i)
    }

    /// Write a logical element.
    pub fn set_logical_elt(&mut self, r: NodeRef, i: usize, x: i32) {
        self.check_elt(r, NodeType::Logical, i);
        write_i32(self.vec_cells_mut(r), i, x);
    }

    /// Read a real element.
    pub fn real_elt(&self, r: NodeRef, i: usize) -> f64 {
        self.check_elt(r, NodeType::Real, i);
        f64::from_bits(self.vec_cells(r)[i])
    }

    /// Write a real element.
    pub fn set_real_elt(&mut self, r: NodeRef, i: usize, x: f64) {
        self.check_elt(r, NodeType::Real, i);
        self.vec_cells_mut(r)[i] = x.to_bits();
    }

    /// Read a complex element as (re, im).
    pub fn complex_elt(&self, r: NodeRef, i: usize) -> (f64, f64) {
        self.check_elt(r, NodeType::Complex, i);
        let cells = self.vec_cells(r);
        (
            f64::from_bits(cells[2 * i]),
            f64::from_bits(cells[2 * i + 1]),
        )
    }

    /// Write a complex element.
    pub fn set_complex_elt(&mut self, r: NodeRef, i: usize, re: f64, im: f64) {
        self.check_elt(r, NodeType::Complex, i);
        let cells = self.vec_cells_mut(r);
        cells[2 * i] = re.to_bits();
        cells[2 * i + 1] = im.to_bits();
    }

    /// Read a raw byte element.
    pub fn raw_elt(&self, r: NodeRef, i: usize) -> u8 {
        self.check_elt(r, NodeType::Raw, i);
        self.raw_bytes(r)[i]
    }

    /// Write a raw byte element.
    pub fn set_raw_elt(&mut self, r: NodeRef, i: usize, x: u8) {
        self.check_elt(r, NodeType::Raw, i);
        self.raw_bytes_mut(r)[i] = x;
    }

    /// The bytes of a raw vector.
    pub fn raw_bytes(&self, r: NodeRef) -> &[u8] {
        assert_eq!(self.node_type(r), NodeType::Raw);
        let len = self.vec_length(r);
        let cells = self.vec_cells(r);
        // SAFETY: the cell slice is live and holds at least `len` bytes.
        unsafe { std::slice::from_raw_parts(cells.as_ptr() as *const u8, len) }
    }

    /// The bytes of a raw vector, mutably.
    pub fn raw_bytes_mut(&mut self, r: NodeRef) -> &mut [u8] {
        assert_eq!(self.node_type(r), NodeType::Raw);
        let len = self.vec_length(r);
        let cells = self.vec_cells_mut(r);
        // SAFETY: the cell slice is live and holds at least `len` bytes.
        unsafe { std::slice::from_raw_parts_mut(cells.as_mut_ptr() as *mut u8, len) }
    }

    /// The bytes of a character string, excluding the NUL terminator.
    pub fn char_bytes(&self, r: NodeRef) -> &[u8] {
        assert_eq!(self.node_type(r), NodeType::Chars);
        let len = self.vec_length(r);
        let cells = self.vec_cells(r);
        // SAFETY: the cell slice is live and holds at least len+1 bytes.
        unsafe { std::slice::from_raw_parts(cells.as_ptr() as *const u8, len) }
    }

    /// Read a generic- or expression-vector element.
    pub fn elt(&self, r: NodeRef, i: usize) -> NodeRef {
        let ty = self.node_type(r);
        assert!(
            matches!(ty, NodeType::Generic | NodeType::Exprs),
            "elt requires a generic or expression vector"
        );
        assert!(i < self.vec_length(r));
        NodeRef(self.vec_cells(r)[i] as u32)
    }

    /// Read a string-vector element (a `Chars` node).
    pub fn str_elt(&self, r: NodeRef, i: usize) -> NodeRef {
        self.check_elt(r, NodeType::Strings, i);
        NodeRef(self.vec_cells(r)[i] as u32)
    }

    // === Flag bits ===

    /// The general-purpose bits of a node.
    pub fn gp(&self, r: NodeRef) -> u16 {
        self.node(r).gp
    }

    /// Set the general-purpose bits of a node.
    pub fn set_gp(&mut self, r: NodeRef, gp: u16) {
        self.node_mut(r).gp = gp;
    }

    /// The named counter of a node.
    pub fn named(&self, r: NodeRef) -> u8 {
        self.node(r).named
    }

    /// Set the named counter of a node.
    pub fn set_named(&mut self, r: NodeRef, named: u8) {
        self.node_mut(r).named = named;
    }

    fn flag(&self, r: NodeRef, bit: u8) -> bool {
        self.node(r).flags & bit != 0
    }

    fn set_flag(&mut self, r: NodeRef, bit: u8, on: bool) {
        let n = self.node_mut(r);
        if on {
            n.flags |= bit;
        } else {
            n.flags &= !bit;
        }
    }

    /// The object bit.
    pub fn is_object(&self, r: NodeRef) -> bool {
        self.flag(r, FLAG_OBJECT)
    }

    /// Set the object bit. A plain field store.
    pub fn set_object(&mut self, r: NodeRef, on: bool) {
        self.set_flag(r, FLAG_OBJECT, on);
    }

    /// The debug bit.
    pub fn is_debug(&self, r: NodeRef) -> bool {
        self.flag(r, FLAG_DEBUG)
    }

    /// Set the debug bit.
    pub fn set_debug(&mut self, r: NodeRef, on: bool) {
        self.set_flag(r, FLAG_DEBUG, on);
    }

    /// The trace bit.
    pub fn is_traced(&self, r: NodeRef) -> bool {
        self.flag(r, FLAG_TRACE)
    }

    /// Set the trace bit.
    pub fn set_traced(&mut self, r: NodeRef, on: bool) {
        self.set_flag(r, FLAG_TRACE, on);
    }

    /// The missing bit.
    pub fn is_missing(&self, r: NodeRef) -> bool {
        self.flag(r, FLAG_MISSING)
    }

    /// Set the missing bit.
    pub fn set_missing(&mut self, r: NodeRef, on: bool) {
        self.set_flag(r, FLAG_MISSING, on);
    }

    /// Whether a promise's evaluation has been entered.
    pub fn promise_seen(&self, r: NodeRef) -> bool {
        self.gp(r) & GP_PROMISE_SEEN != 0
    }

    /// Mark a promise's evaluation as entered or left.
    pub fn set_promise_seen(&mut self, r: NodeRef, on: bool) {
        let gp = self.gp(r);
        self.set_gp(
            r,
            if on {
                gp | GP_PROMISE_SEEN
            } else {
                gp & !GP_PROMISE_SEEN
            },
        );
    }

    /// Whether a symbol is a `..n` symbol.
    pub fn is_ddval(&self, r: NodeRef) -> bool {
        self.gp(r) & GP_DDVAL != 0
    }

    /// Set the `..n` bit of a symbol.
    pub fn set_ddval(&mut self, r: NodeRef, on: bool) {
        let gp = self.gp(r);
        self.set_gp(r, if on { gp | GP_DDVAL } else { gp & !GP_DDVAL });
    }

    // === Budgets and statistics ===

    /// Nodes currently allocated.
    pub fn nodes_in_use(&self) -> usize {
        self.nodes_in_use
    }

    /// Current node limit.
    pub fn node_limit(&self) -> usize {
        self.node_limit
    }

    /// Current vector-cell limit.
    pub fn cell_limit(&self) -> usize {
        self.cell_limit
    }

    /// Vector cells still available under the current limit.
    pub fn vheap_free(&self) -> usize {
        self.cell_limit
            .saturating_sub(self.small_cells + self.large_cells)
    }

    /// Vector cells allocated in small-class pages.
    pub fn small_valloc_cells(&self) -> usize {
        self.small_cells
    }

    /// Vector cells allocated in large buffers.
    pub fn large_valloc_cells(&self) -> usize {
        self.large_cells
    }

    /// Pages currently allocated for a class.
    pub fn page_count(&self, class: u8) -> usize {
        self.page_count[class as usize]
    }

    /// Slots currently allocated for a class.
    pub fn alloc_count(&self, class: u8) -> usize {
        self.alloc_count[class as usize]
    }

    /// Collection statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Whether asynchronous interrupts are currently suspended. Raised for
    /// the duration of a collection, including finalizer execution.
    pub fn interrupts_suspended(&self) -> bool {
        self.interrupts_suspended
    }

    /// Force a collection before every allocation.
    pub fn gc_torture(&mut self, on: bool) {
        self.torture = on;
    }

    /// Toggle per-collection reporting; returns the previous setting.
    pub fn gc_info(&mut self, on: bool) -> bool {
        std::mem::replace(&mut self.reporting, on)
    }

    /// Set upper limits for the adaptive node and cell budgets. Limits can
    /// only be raised above the current budgets, never below.
    pub fn mem_limits(&mut self, max_nodes: Option<usize>, max_cells: Option<usize>) {
        if let Some(n) = max_nodes {
            self.max_node_limit = n.max(self.node_limit);
        }
        if let Some(c) = max_cells {
            self.max_cell_limit = c.max(self.cell_limit);
        }
    }

    /// Count live nodes per type after a full collection.
    pub fn memory_profile(&mut self) -> [usize; NUM_NODE_TYPES] {
        self.gc();
        let mut counts = [0usize; NUM_NODE_TYPES];
        for class in 0..NUM_NODE_CLASSES as u8 {
            for g in 1..=NUM_OLD_GENERATIONS {
                let peg = crate::list::old_peg(class, g);
                let mut l = self.next_of(peg);
                while l != peg {
                    counts[self.node(l.node()).ty as usize] += 1;
                    l = self.next_of(l);
                }
            }
        }
        counts
    }

    /// Whether a node currently sits on its generation's old-to-new list.
    pub fn in_old_to_new(&self, r: NodeRef) -> bool {
        let n = self.node(r);
        if n.generation == 0 {
            return false;
        }
        let peg = crate::list::old_to_new_peg(n.class, n.generation as usize);
        self.list_contains(peg, r)
    }

    /// Validate list and counter invariants; panics on violation.
    ///
    /// Every node must be on exactly one list, matching its class; members
    /// of old lists must be marked with the anchoring generation; the slot
    /// population of each class must equal pages times slots-per-page; and
    /// the node accounting must agree with the lists.
    pub fn check_integrity(&self) {
        for class in 0..NUM_NODE_CLASSES as u8 {
            let mut class_total = 0usize;
            for (which, peg) in class_pegs(class).iter().enumerate() {
                for r in self.list_members(*peg) {
                    class_total += 1;
                    let n = self.node(r);
                    assert_eq!(n.class, class, "node on a list of the wrong class");
                    match which {
                        0 => assert!(!n.marked, "marked node in new space"),
                        1 | 2 => {
                            assert!(n.marked, "unmarked node in an old generation");
                            assert_eq!(
                                n.generation as usize, which,
                                "node generation disagrees with its list"
                            );
                        }
                        _ => {
                            assert!(n.marked);
                            assert_eq!(n.generation as usize, which - 2);
                        }
                    }
                }
            }
            assert_eq!(
                class_total,
                self.alloc_count[class as usize],
                "slot population of class {class} disagrees with its lists"
            );
            if class != LARGE_CLASS {
                assert_eq!(
                    self.alloc_count[class as usize],
                    self.page_count[class as usize] * crate::page::slots_per_page(class),
                    "alloc count of class {class} disagrees with its pages"
                );
            }
        }

        // Old counts cover both the old and old-to-new lists.
        let mut tenured = 0usize;
        for class in 0..NUM_NODE_CLASSES as u8 {
            for g in 1..=NUM_OLD_GENERATIONS {
                let on_lists = self
                    .list_members(crate::list::old_peg(class, g))
                    .len()
                    + self
                        .list_members(crate::list::old_to_new_peg(class, g))
                        .len();
                assert_eq!(
                    on_lists, self.old_count[class as usize][g],
                    "old count of class {class} generation {g} disagrees with its lists"
                );
                tenured += on_lists;
            }
        }

        // New-space members ahead of the free cursor are allocated.
        let mut new_allocated = 0usize;
        for class in 0..NUM_NODE_CLASSES as u8 {
            let peg = new_peg(class);
            let stop = self.free_cursor[class as usize];
            let mut l = self.next_of(peg);
            while l != peg && l != stop {
                new_allocated += 1;
                l = self.next_of(l);
            }
        }
        assert_eq!(
            tenured + new_allocated,
            self.nodes_in_use,
            "node accounting disagrees with the lists"
        );
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest class whose slot accommodates `cells`, with the cell footprint
/// actually charged (the class capacity for small classes, the exact count
/// for large vectors).
fn class_for_cells(cells: usize) -> (u8, usize) {
    for c in 1..LARGE_CLASS {
        if cells <= CLASS_CELLS[c as usize] {
            return (c, CLASS_CELLS[c as usize]);
        }
    }
    (LARGE_CLASS, cells)
}

fn read_i32(cells: &[u64], i: usize) -> i32 {
    let w = cells[i / 2];
    if i % 2 == 0 {
        w as u32 as i32
    } else {
        (w >> 32) as u32 as i32
    }
}

fn write_i32(cells: &mut [u64], i: usize, x: i32) {
    let w = &mut cells[i / 2];
    if i % 2 == 0 {
        *w = (*w & 0xFFFF_FFFF_0000_0000) | x as u32 as u64;
    } else {
        *w = (*w & 0x0000_0000_FFFF_FFFF) | ((x as u32 as u64) << 32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_singletons() {
        let heap = Heap::new();
        assert_eq!(heap.nil(), NodeRef::NIL);
        assert_eq!(heap.node_type(heap.nil()), NodeType::Nil);
        // Nil self-references through all three slots and the attribute.
        assert_eq!(heap.car(heap.nil()), heap.nil());
        assert_eq!(heap.cdr(heap.nil()), heap.nil());
        assert_eq!(heap.tag(heap.nil()), heap.nil());
        assert_eq!(heap.attrib(heap.nil()), heap.nil());
        assert_eq!(heap.node_type(heap.blank_string()), NodeType::Chars);
        assert_eq!(heap.char_bytes(heap.blank_string()), b"");
    }

    #[test]
    fn test_class_selection() {
        assert_eq!(class_for_cells(0), (1, 1));
        assert_eq!(class_for_cells(1), (1, 1));
        assert_eq!(class_for_cells(2), (2, 2));
        assert_eq!(class_for_cells(3), (3, 4));
        assert_eq!(class_for_cells(16), (6, 16));
        assert_eq!(class_for_cells(17), (LARGE_CLASS, 17));
    }

    #[test]
    fn test_int_vector_elements() {
        let mut heap = Heap::new();
        let v = heap.alloc_vector(NodeType::Int, 5).unwrap();
        assert_eq!(heap.vec_length(v), 5);
        assert_eq!(heap.node_class(v), 3);
        for i in 0..5 {
            heap.set_int_elt(v, i, (i as i32) * 7 - 3);
        }
        for i in 0..5 {
            assert_eq!(heap.int_elt(v, i), (i as i32) * 7 - 3);
        }
    }

    #[test]
    fn test_real_and_complex_elements() {
        let mut heap = Heap::new();
        let v = heap.alloc_vector(NodeType::Real, 3).unwrap();
        heap.set_real_elt(v, 0, 1.5);
        heap.set_real_elt(v, 2, -0.25);
        assert_eq!(heap.real_elt(v, 0), 1.5);
        assert_eq!(heap.real_elt(v, 2), -0.25);

        let c = heap.alloc_vector(NodeType::Complex, 2).unwrap();
        heap.set_complex_elt(c, 1, 3.0, -4.0);
        assert_eq!(heap.complex_elt(c, 1), (3.0, -4.0));
    }

    #[test]
    fn test_reference_vectors_canonically_initialized() {
        let mut heap = Heap::new();
        let g = heap.alloc_vector(NodeType::Generic, 4).unwrap();
        for i in 0..4 {
            assert_eq!(heap.elt(g, i), heap.nil());
        }
        let s = heap.alloc_vector(NodeType::Strings, 4).unwrap();
        for i in 0..4 {
            assert_eq!(heap.str_elt(s, i), heap.blank_string());
        }
    }

    #[test]
    fn test_char_round_trip() {
        let mut heap = Heap::new();
        let c = heap.mk_char("generation").unwrap();
        assert_eq!(heap.char_bytes(c), b"generation");
        assert_eq!(heap.vec_length(c), 10);
    }

    #[test]
    fn test_large_vector_class() {
        let mut heap = Heap::new();
        let v = heap.alloc_vector(NodeType::Real, 1000).unwrap();
        assert_eq!(heap.node_class(v), LARGE_CLASS);
        assert_eq!(heap.large_valloc_cells(), 1000);
        heap.set_real_elt(v, 999, 2.75);
        assert_eq!(heap.real_elt(v, 999), 2.75);
    }

    #[test]
    fn test_vector_too_long() {
        let mut heap = Heap::new();
        let err = heap.alloc_vector(NodeType::Complex, usize::MAX / 2).unwrap_err();
        assert!(matches!(err, HeapError::VectorTooLong { .. }));
    }

    #[test]
    fn test_raw_bytes() {
        let mut heap = Heap::new();
        let v = heap.alloc_vector(NodeType::Raw, 10).unwrap();
        // Raw vectors are not pre-initialized; contents are whatever was
        // last written.
        for i in 0..10 {
            heap.set_raw_elt(v, i, i as u8 + 1);
        }
        assert_eq!(heap.raw_bytes(v), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        heap.set_raw_elt(v, 9, 0xAB);
        assert_eq!(heap.raw_elt(v, 9), 0xAB);
    }

    #[test]
    fn test_integrity_after_allocation() {
        let mut heap = Heap::new();
        for _ in 0..100 {
            heap.alloc_node(NodeType::Cons).unwrap();
        }
        heap.alloc_vector(NodeType::Int, 12).unwrap();
        heap.check_integrity();
    }
}
