//! Finalizer registration, reachability flagging, and safe invocation.
//!
//! The registry is an in-heap chain of list cells: `car` holds the
//! registered object, `tag` the finalizer, and a `gp` bit records that the
//! object has been found unreachable and the finalizer is due. The chain
//! is deliberately not a root of the main mark; after the drain, dying
//! registrations are flagged and the registry itself is forwarded, keeping
//! finalizer-only-reachable objects alive for exactly one more collection.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::{HeapError, HeapResult};
use crate::heap::{EvalHook, Heap, NativeFinalizer};
use crate::node::{NodeRef, NodeType};

/// `gp` bit on a registry entry: the finalizer is eligible to run.
const GP_FINALIZE_PENDING: u16 = 1 << 2;

impl Heap {
    /// Install the host evaluator used to invoke callable finalizers.
    pub fn set_eval_hook(&mut self, hook: EvalHook) {
        self.eval_hook = Some(hook);
    }

    /// Register `fun` to run once after `obj` becomes unreachable.
    ///
    /// `obj` must be an environment or external pointer; `fun` must be
    /// callable. The call `(fun obj)` is evaluated through the host hook
    /// in a fresh top-level context.
    pub fn register_finalizer(&mut self, obj: NodeRef, fun: NodeRef) -> HeapResult<()> {
        if !matches!(self.node_type(obj), NodeType::Env | NodeType::ExtPtr) {
            return Err(HeapError::InvalidFinalizerTarget);
        }
        if !self.node_type(fun).is_callable() {
            return Err(HeapError::InvalidFinalizerFunction);
        }
        self.push_registration(obj, fun)
    }

    /// Register a native finalizer to run once after `obj` becomes
    /// unreachable. The callable is stored out of heap, keyed by a token
    /// kept in a raw vector, and may itself allocate and trigger
    /// collections when it runs.
    pub fn register_native_finalizer(
        &mut self,
        obj: NodeRef,
        fun: NativeFinalizer,
    ) -> HeapResult<()> {
        if !matches!(self.node_type(obj), NodeType::Env | NodeType::ExtPtr) {
            return Err(HeapError::InvalidFinalizerTarget);
        }
        self.protect(obj);
        let token = self.next_finalizer_token;
        let holder = self.alloc_vector(NodeType::Raw, 4);
        self.unprotect(1);
        let holder = holder?;
        self.next_finalizer_token += 1;
        self.raw_bytes_mut(holder)
            .copy_from_slice(&token.to_le_bytes());
        self.native_finalizers.insert(token, fun);
        self.push_registration(obj, holder)
    }

    /// Append a registration at the registry tail, so finalizers run in
    /// registration order.
    fn push_registration(&mut self, obj: NodeRef, fun: NodeRef) -> HeapResult<()> {
        let nil = self.nil;
        self.protect(fun);
        let entry = self.cons(obj, nil);
        self.unprotect(1);
        let entry = entry?;
        self.set_tag(entry, fun);
        if self.finalizer_head == nil {
            self.finalizer_head = entry;
        } else {
            let mut last = self.finalizer_head;
            while self.cdr(last) != nil {
                last = self.cdr(last);
            }
            self.set_cdr(last, entry);
        }
        Ok(())
    }

    /// After the main mark: flag every registration whose object did not
    /// survive on its own. Flagged entries keep their flag until they run.
    pub(crate) fn flag_pending_finalizers(&mut self) {
        let nil = self.nil;
        let mut entry = self.finalizer_head;
        while entry != nil {
            let obj = self.car(entry);
            if !self.node(obj).marked && self.gp(entry) & GP_FINALIZE_PENDING == 0 {
                let gp = self.gp(entry);
                self.set_gp(entry, gp | GP_FINALIZE_PENDING);
            }
            entry = self.cdr(entry);
        }
    }

    /// Whether any registered finalizer is due.
    pub fn finalizers_pending(&self) -> bool {
        let nil = self.nil;
        let mut entry = self.finalizer_head;
        while entry != nil {
            if self.gp(entry) & GP_FINALIZE_PENDING != 0 {
                return true;
            }
            entry = self.cdr(entry);
        }
        false
    }

    /// Run finalizers queued by earlier collections, if any. Safe to call
    /// from the host at quiescent points.
    pub fn run_pending_finalizers(&mut self) -> bool {
        if self.in_gc || self.finalizers_running {
            return false;
        }
        self.run_finalizers()
    }

    /// Walk the registry and invoke every flagged finalizer, each in a
    /// fresh top-level context. Entries are unlinked before invocation, so
    /// a finalizer runs at most once even if it panics, allocates, or
    /// triggers further collections. Returns whether any ran.
    pub(crate) fn run_finalizers(&mut self) -> bool {
        if self.finalizers_running {
            return false;
        }
        self.finalizers_running = true;
        let nil = self.nil;
        let mut ran = false;
        let mut prev = nil;
        let mut cur = self.finalizer_head;
        while cur != nil {
            let next = self.cdr(cur);
            if self.gp(cur) & GP_FINALIZE_PENDING != 0 {
                // Unlink first: the at-most-once guarantee must hold on
                // every exit path of the invocation.
                if prev == nil {
                    self.finalizer_head = next;
                } else {
                    self.set_cdr(prev, next);
                }
                ran = true;
                self.invoke_finalizer(cur);
            } else {
                prev = cur;
            }
            cur = next;
        }
        self.finalizers_running = false;
        ran
    }

    fn invoke_finalizer(&mut self, entry: NodeRef) {
        let obj = self.car(entry);
        let fun = self.tag(entry);

        // Fresh top-level context: the protect-stack top and the current
        // expression are restored on every exit path, and a panicking
        // finalizer is contained here.
        let saved_depth = self.protect_depth();
        let saved_expr = self.current_expression();
        self.protect(entry);

        let outcome = if self.node_type(fun) == NodeType::Raw {
            let token = u32::from_le_bytes(
                self.raw_bytes(fun)
                    .try_into()
                    .expect("native finalizer token truncated"),
            );
            match self.native_finalizers.remove(&token) {
                Some(mut native) => {
                    let result = catch_unwind(AssertUnwindSafe(|| native(self, obj)));
                    drop(native);
                    result
                }
                None => Ok(()),
            }
        } else {
            match self.eval_hook.take() {
                Some(mut hook) => {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        let nil = self.nil;
                        let args = self.cons(obj, nil)?;
                        self.protect(args);
                        let call = self.alloc_node(NodeType::Language);
                        self.unprotect(1);
                        let call = call?;
                        self.init_triple(call, nil, fun, args);
                        self.protect(call);
                        hook(self, call);
                        Ok::<(), HeapError>(())
                    }));
                    self.eval_hook = Some(hook);
                    match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => {
                            tracing::warn!(
                                target: "heron::gc",
                                "allocation failed while building a finalizer call"
                            );
                            Ok(())
                        }
                        Err(payload) => Err(payload),
                    }
                }
                None => {
                    tracing::warn!(
                        target: "heron::gc",
                        "callable finalizer skipped: no evaluator installed"
                    );
                    Ok(())
                }
            }
        };

        if outcome.is_err() {
            tracing::warn!(target: "heron::gc", "finalizer raised an error; continuing");
        }
        self.unprotect(self.protect_depth() - saved_depth);
        self.set_current_expression(saved_expr);
    }
}
