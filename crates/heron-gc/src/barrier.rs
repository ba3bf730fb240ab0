//! Write barrier and the reference-field accessor surface.
//!
//! Every mutation of a heap-stored reference field routes through
//! `check_old_to_new`: when an older container is made to reference a
//! younger node, the container moves from its old list onto the matching
//! old-to-new list, so the next collection of its generation rescans it.
//! Field reads bypass the barrier.

use crate::heap::Heap;
use crate::list::old_to_new_peg;
use crate::node::{NodeData, NodeRef, NodeType};

impl Heap {
    /// Whether `x` must be rescanned if it comes to reference `y`.
    ///
    /// Old nodes stay marked between collections, so a marked container
    /// referencing an unmarked node (or a marked one of a younger
    /// generation) holds an old-to-new edge.
    fn is_older(&self, x: NodeRef, y: NodeRef) -> bool {
        let nx = self.node(x);
        let ny = self.node(y);
        nx.marked && (!ny.marked || nx.generation > ny.generation)
    }

    /// Record a potential old-to-new edge from `x` to `y`.
    pub(crate) fn check_old_to_new(&mut self, x: NodeRef, y: NodeRef) {
        if self.is_older(x, y) {
            let n = self.node(x);
            let peg = old_to_new_peg(n.class, n.generation as usize);
            self.unsnap(x.link());
            self.snap(x.link(), peg);
        }
    }

    fn triple(&self, r: NodeRef) -> (NodeRef, NodeRef, NodeRef) {
        match &self.node(r).data {
            NodeData::Triple { tag, car, cdr } => (*tag, *car, *cdr),
            _ => self.bad_node(r),
        }
    }

    fn set_triple_slot(&mut self, r: NodeRef, slot: usize, v: NodeRef) {
        assert_ne!(r, self.nil, "cannot mutate the nil singleton");
        self.check_old_to_new(r, v);
        match &mut self.node_mut(r).data {
            NodeData::Triple { tag, car, cdr } => match slot {
                0 => *tag = v,
                1 => *car = v,
                2 => *cdr = v,
                _ => unreachable!(),
            },
            _ => panic!("heap corruption: three-slot store into a mismatched payload"),
        }
    }

    fn env_slots(&self, r: NodeRef) -> (NodeRef, NodeRef, NodeRef) {
        match &self.node(r).data {
            NodeData::Env {
                frame,
                enclos,
                hashtab,
            } => (*frame, *enclos, *hashtab),
            _ => self.bad_node(r),
        }
    }

    fn set_env_slot(&mut self, r: NodeRef, slot: usize, v: NodeRef) {
        self.check_old_to_new(r, v);
        match &mut self.node_mut(r).data {
            NodeData::Env {
                frame,
                enclos,
                hashtab,
            } => match slot {
                0 => *frame = v,
                1 => *enclos = v,
                2 => *hashtab = v,
                _ => unreachable!(),
            },
            _ => panic!("heap corruption: environment store into a mismatched payload"),
        }
    }

    // === Attributes ===

    /// The attribute list of a node.
    pub fn attrib(&self, r: NodeRef) -> NodeRef {
        self.node(r).attrib
    }

    /// Set the attribute list of a node.
    pub fn set_attrib(&mut self, r: NodeRef, v: NodeRef) {
        assert_ne!(r, self.nil, "cannot mutate the nil singleton");
        self.check_old_to_new(r, v);
        self.node_mut(r).attrib = v;
    }

    // === List cells, calls, dotted lists ===

    /// The car of a cons-layout node.
    pub fn car(&self, r: NodeRef) -> NodeRef {
        self.triple(r).1
    }

    /// The cdr of a cons-layout node.
    pub fn cdr(&self, r: NodeRef) -> NodeRef {
        self.triple(r).2
    }

    /// The tag of a cons-layout node.
    pub fn tag(&self, r: NodeRef) -> NodeRef {
        self.triple(r).0
    }

    /// Set the car of a cons-layout node.
    pub fn set_car(&mut self, r: NodeRef, v: NodeRef) {
        self.set_triple_slot(r, 1, v);
    }

    /// Set the cdr of a cons-layout node.
    pub fn set_cdr(&mut self, r: NodeRef, v: NodeRef) {
        self.set_triple_slot(r, 2, v);
    }

    /// Set the tag of a cons-layout node.
    pub fn set_tag(&mut self, r: NodeRef, v: NodeRef) {
        self.set_triple_slot(r, 0, v);
    }

    // === Environments ===

    /// The frame of an environment.
    pub fn frame(&self, r: NodeRef) -> NodeRef {
        self.env_slots(r).0
    }

    /// The enclosing environment.
    pub fn enclos(&self, r: NodeRef) -> NodeRef {
        self.env_slots(r).1
    }

    /// The hash table of an environment.
    pub fn hashtab(&self, r: NodeRef) -> NodeRef {
        self.env_slots(r).2
    }

    /// Set the frame of an environment.
    pub fn set_frame(&mut self, r: NodeRef, v: NodeRef) {
        self.set_env_slot(r, 0, v);
    }

    /// Set the enclosing environment.
    pub fn set_enclos(&mut self, r: NodeRef, v: NodeRef) {
        self.set_env_slot(r, 1, v);
    }

    /// Set the hash table of an environment.
    pub fn set_hashtab(&mut self, r: NodeRef, v: NodeRef) {
        self.set_env_slot(r, 2, v);
    }

    // === Closures ===

    /// The formal arguments of a closure.
    pub fn formals(&self, r: NodeRef) -> NodeRef {
        self.closure_slot(r).1
    }

    /// The body of a closure.
    pub fn body(&self, r: NodeRef) -> NodeRef {
        self.closure_slot(r).2
    }

    /// The defining environment of a closure.
    pub fn closure_env(&self, r: NodeRef) -> NodeRef {
        self.closure_slot(r).0
    }

    fn closure_slot(&self, r: NodeRef) -> (NodeRef, NodeRef, NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Closure);
        self.triple(r)
    }

    /// Set the formal arguments of a closure.
    pub fn set_formals(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Closure);
        self.set_triple_slot(r, 1, v);
    }

    /// Set the body of a closure.
    pub fn set_body(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Closure);
        self.set_triple_slot(r, 2, v);
    }

    /// Set the defining environment of a closure.
    pub fn set_closure_env(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Closure);
        self.set_triple_slot(r, 0, v);
    }

    // === Promises ===

    /// The forced value of a promise, nil while pending.
    pub fn promise_value(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.triple(r).1
    }

    /// The deferred expression of a promise.
    pub fn promise_expr(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.triple(r).2
    }

    /// The evaluation environment of a promise.
    pub fn promise_env(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.triple(r).0
    }

    /// Store the forced value of a promise.
    pub fn set_promise_value(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.set_triple_slot(r, 1, v);
    }

    /// Replace the deferred expression of a promise.
    pub fn set_promise_expr(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.set_triple_slot(r, 2, v);
    }

    /// Replace the evaluation environment of a promise.
    pub fn set_promise_env(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Promise);
        self.set_triple_slot(r, 0, v);
    }

    // === Symbols ===

    /// The print name of a symbol.
    pub fn symbol_printname(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Symbol);
        self.triple(r).1
    }

    /// The value slot of a symbol.
    pub fn symbol_value(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Symbol);
        self.triple(r).2
    }

    /// The internal-function slot of a symbol.
    pub fn symbol_internal(&self, r: NodeRef) -> NodeRef {
        assert_eq!(self.node_type(r), NodeType::Symbol);
        self.triple(r).0
    }

    /// Set the value slot of a symbol.
    pub fn set_symbol_value(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Symbol);
        self.set_triple_slot(r, 2, v);
    }

    /// Set the internal-function slot of a symbol.
    pub fn set_symbol_internal(&mut self, r: NodeRef, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Symbol);
        self.set_triple_slot(r, 0, v);
    }

    // === External pointers ===

    /// The raw address of an external pointer.
    pub fn extptr_raw(&self, r: NodeRef) -> usize {
        match &self.node(r).data {
            NodeData::ExtPtr { raw, .. } => *raw,
            _ => self.bad_node(r),
        }
    }

    /// The protection value of an external pointer.
    pub fn extptr_prot(&self, r: NodeRef) -> NodeRef {
        match &self.node(r).data {
            NodeData::ExtPtr { prot, .. } => *prot,
            _ => self.bad_node(r),
        }
    }

    /// The tag of an external pointer.
    pub fn extptr_tag(&self, r: NodeRef) -> NodeRef {
        match &self.node(r).data {
            NodeData::ExtPtr { tag, .. } => *tag,
            _ => self.bad_node(r),
        }
    }

    /// Replace the raw address of an external pointer. Not a reference
    /// field, so no barrier.
    pub fn set_extptr_raw(&mut self, r: NodeRef, raw: usize) {
        match &mut self.node_mut(r).data {
            NodeData::ExtPtr { raw: a, .. } => *a = raw,
            _ => panic!("set_extptr_raw on non-external-pointer node"),
        }
    }

    /// Set the protection value of an external pointer.
    pub fn set_extptr_prot(&mut self, r: NodeRef, v: NodeRef) {
        self.check_old_to_new(r, v);
        match &mut self.node_mut(r).data {
            NodeData::ExtPtr { prot, .. } => *prot = v,
            _ => panic!("set_extptr_prot on non-external-pointer node"),
        }
    }

    /// Set the tag of an external pointer.
    pub fn set_extptr_tag(&mut self, r: NodeRef, v: NodeRef) {
        self.check_old_to_new(r, v);
        match &mut self.node_mut(r).data {
            NodeData::ExtPtr { tag, .. } => *tag = v,
            _ => panic!("set_extptr_tag on non-external-pointer node"),
        }
    }

    // === Function nodes ===

    /// The host function-table offset of a builtin or special.
    pub fn function_offset(&self, r: NodeRef) -> u32 {
        match &self.node(r).data {
            NodeData::Function { offset } => *offset,
            _ => self.bad_node(r),
        }
    }

    // === Reference-vector elements ===

    /// Store a generic- or expression-vector element.
    pub fn set_elt(&mut self, r: NodeRef, i: usize, v: NodeRef) {
        let ty = self.node_type(r);
        assert!(
            matches!(ty, NodeType::Generic | NodeType::Exprs),
            "set_elt requires a generic or expression vector"
        );
        assert!(i < self.vec_length(r));
        self.check_old_to_new(r, v);
        self.vec_cells_mut(r)[i] = v.0 as u64;
    }

    /// Store a string-vector element; the value must be a character
    /// string.
    pub fn set_str_elt(&mut self, r: NodeRef, i: usize, v: NodeRef) {
        assert_eq!(self.node_type(r), NodeType::Strings);
        assert_eq!(
            self.node_type(v),
            NodeType::Chars,
            "string vector elements must be character strings"
        );
        assert!(i < self.vec_length(r));
        self.check_old_to_new(r, v);
        self.vec_cells_mut(r)[i] = v.0 as u64;
    }
}
