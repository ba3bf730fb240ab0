//! Root management: the protect stack, the precious list, registered
//! external roots, and the transient raw-allocation chain.
//!
//! Roots are explicit; the collector never scans the native stack. The
//! protect stack is the mutator's LIFO of in-progress temporaries, the
//! precious list keeps long-lived objects alive regardless of other
//! reachability, and external collaborators (symbol table, context chain,
//! display lists) either register their anchors or supply an enumerator
//! hook consulted at every collection.

use crate::error::HeapResult;
use crate::heap::{Heap, RootHook};
use crate::node::{NodeRef, NodeType};

/// Saved top of the transient allocation chain; restoring it releases
/// every transient buffer allocated since.
#[derive(Debug, Clone, Copy)]
pub struct TransientMark(NodeRef);

impl Heap {
    // === Protect stack ===

    /// Push a reference onto the protect stack and hand it back.
    ///
    /// Overflow is fatal and allocates nothing: the stack's full capacity
    /// is reserved up front.
    pub fn protect(&mut self, r: NodeRef) -> NodeRef {
        if self.protect_stack.len() >= self.config.protect_capacity {
            panic!("protect(): protection stack overflow");
        }
        self.protect_stack.push(r);
        r
    }

    /// Pop the top `n` protected references.
    pub fn unprotect(&mut self, n: usize) {
        if n > self.protect_stack.len() {
            panic!("unprotect(): protection stack imbalance");
        }
        let keep = self.protect_stack.len() - n;
        self.protect_stack.truncate(keep);
    }

    /// Locate `r` from the top of the protect stack and remove it.
    pub fn unprotect_ptr(&mut self, r: NodeRef) {
        match self.protect_stack.iter().rposition(|&p| p == r) {
            Some(i) => {
                self.protect_stack.remove(i);
            }
            None => panic!("unprotect_ptr: pointer not found"),
        }
    }

    /// Protect `r` and return the slot index for later reprotection.
    pub fn protect_with_index(&mut self, r: NodeRef) -> usize {
        self.protect(r);
        self.protect_stack.len() - 1
    }

    /// Replace the protected reference at `index`.
    pub fn reprotect(&mut self, r: NodeRef, index: usize) {
        if index >= self.protect_stack.len() {
            panic!("reprotect(): protection stack imbalance");
        }
        self.protect_stack[index] = r;
    }

    /// Current protect-stack depth.
    pub fn protect_depth(&self) -> usize {
        self.protect_stack.len()
    }

    // === Precious list ===

    /// Keep `r` alive across collections until released, independent of
    /// any other reachability.
    pub fn preserve_object(&mut self, r: NodeRef) -> HeapResult<()> {
        let head = self.precious;
        self.precious = self.cons(r, head)?;
        Ok(())
    }

    /// Remove the first precious-list entry holding `r`. Quietly ignores
    /// references that were never preserved.
    pub fn release_object(&mut self, r: NodeRef) {
        let nil = self.nil;
        let mut prev = nil;
        let mut cur = self.precious;
        while cur != nil {
            let next = self.cdr(cur);
            if self.car(cur) == r {
                if prev == nil {
                    self.precious = next;
                } else {
                    self.set_cdr(prev, next);
                }
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    // === External roots ===

    /// Register a long-lived external anchor (e.g. the symbol table or
    /// global environment) as a root.
    pub fn add_root(&mut self, r: NodeRef) {
        self.extra_roots.push(r);
    }

    /// Remove a previously registered external anchor.
    pub fn remove_root(&mut self, r: NodeRef) {
        if let Some(i) = self.extra_roots.iter().rposition(|&p| p == r) {
            self.extra_roots.swap_remove(i);
        }
    }

    /// Install the host's root enumerator, consulted at every collection
    /// in addition to the registered anchors.
    pub fn set_root_hook(&mut self, hook: RootHook) {
        self.root_hook = Some(hook);
    }

    /// The expression currently under evaluation, treated as a root.
    pub fn current_expression(&self) -> NodeRef {
        self.current_expr
    }

    /// Set the expression currently under evaluation.
    pub fn set_current_expression(&mut self, r: NodeRef) {
        self.current_expr = r;
    }

    // === Transient allocations ===

    /// Allocate a raw scratch buffer of `n` elements of `eltsize` bytes,
    /// rooted through the transient chain until the enclosing
    /// `transient_release`.
    ///
    /// The chain is threaded through the attribute links of the buffers,
    /// so releasing the top re-exposes every older buffer and abandons the
    /// newer ones to the collector. Depth is unbounded.
    pub fn alloc_transient(&mut self, n: usize, eltsize: usize) -> HeapResult<NodeRef> {
        let bytes = n
            .checked_mul(eltsize)
            .ok_or(crate::error::HeapError::VectorTooLong { length: n })?;
        let v = self.alloc_vector(NodeType::Raw, bytes)?;
        let head = self.transient;
        self.set_attrib(v, head);
        self.transient = v;
        Ok(v)
    }

    /// Save the transient chain top for scoped release.
    pub fn transient_mark(&self) -> TransientMark {
        TransientMark(self.transient)
    }

    /// Restore a saved transient chain top, releasing every buffer
    /// allocated since the mark. Must run on every exit path of the scope
    /// that took the mark.
    pub fn transient_release(&mut self, mark: TransientMark) {
        self.transient = mark.0;
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::Heap;

    #[test]
    fn test_protect_round_trip() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let a = heap.cons(nil, nil).unwrap();
        let b = heap.cons(nil, nil).unwrap();
        assert_eq!(heap.protect(a), a);
        heap.protect(b);
        assert_eq!(heap.protect_depth(), 2);
        heap.unprotect(2);
        assert_eq!(heap.protect_depth(), 0);
    }

    #[test]
    fn test_unprotect_ptr_finds_topmost() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let a = heap.cons(nil, nil).unwrap();
        let b = heap.cons(nil, nil).unwrap();
        heap.protect(a);
        heap.protect(b);
        heap.protect(a);
        heap.unprotect_ptr(a);
        assert_eq!(heap.protect_stack, vec![a, b]);
    }

    #[test]
    #[should_panic(expected = "protection stack imbalance")]
    fn test_unprotect_imbalance() {
        let mut heap = Heap::new();
        heap.unprotect(1);
    }

    #[test]
    #[should_panic(expected = "pointer not found")]
    fn test_unprotect_ptr_missing() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let a = heap.cons(nil, nil).unwrap();
        heap.unprotect_ptr(a);
    }

    #[test]
    fn test_reprotect() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let a = heap.cons(nil, nil).unwrap();
        let b = heap.cons(nil, nil).unwrap();
        let i = heap.protect_with_index(a);
        heap.reprotect(b, i);
        assert_eq!(heap.protect_stack, vec![b]);
        heap.unprotect(1);
    }

    #[test]
    fn test_precious_list() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let a = heap.cons(nil, nil).unwrap();
        let b = heap.cons(nil, nil).unwrap();
        heap.preserve_object(a).unwrap();
        heap.preserve_object(b).unwrap();
        heap.release_object(a);
        // b is still preserved.
        let mut found = Vec::new();
        let mut cur = heap.precious;
        while cur != nil {
            found.push(heap.car(cur));
            cur = heap.cdr(cur);
        }
        assert_eq!(found, vec![b]);
    }

    #[test]
    fn test_transient_chain() {
        let mut heap = Heap::new();
        let mark = heap.transient_mark();
        let a = heap.alloc_transient(16, 8).unwrap();
        let b = heap.alloc_transient(4, 1).unwrap();
        assert_eq!(heap.vec_length(b), 4);
        assert_eq!(heap.attrib(b), a);
        heap.transient_release(mark);
        assert_eq!(heap.transient_mark().0, heap.nil());
        let _ = a;
    }
}
