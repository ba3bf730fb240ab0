//! Collector correctness tests.
//!
//! These exercise the generational collector end to end: survival under
//! torture, promotion, the write barrier, finalizer semantics, large-vector
//! and page release, heap sizing, and the structural invariants.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use heron_gc::{GcConfig, Heap, HeapError, NodeType};

fn tiny_config() -> GcConfig {
    GcConfig {
        node_limit: 600,
        cell_limit: 4096,
        protect_capacity: 1024,
        ..GcConfig::default()
    }
}

#[test]
fn s1_torture_induced_survival() {
    let mut heap = Heap::new();
    heap.gc_torture(true);

    let v = heap.alloc_vector(NodeType::Int, 100).unwrap();
    heap.protect(v);
    for i in 0..100 {
        heap.set_int_elt(v, i, i as i32 * 3);
    }

    heap.gc();
    let base = heap.nodes_in_use();

    let nil = heap.nil();
    for _ in 0..10_000 {
        heap.cons(nil, nil).unwrap();
    }

    heap.gc();
    assert_eq!(heap.vec_length(v), 100);
    for i in 0..100 {
        assert_eq!(heap.int_elt(v, i), i as i32 * 3);
    }
    assert_eq!(heap.nodes_in_use(), base);
    heap.check_integrity();

    heap.unprotect(1);
    heap.gc();
    assert_eq!(heap.nodes_in_use(), base - 1);
}

#[test]
fn s2_generational_promotion() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let o = heap.cons(nil, nil).unwrap();
    heap.protect(o);
    assert_eq!(heap.generation(o), 0);

    heap.gc();
    assert_eq!(heap.generation(o), 1);
    heap.gc();
    assert_eq!(heap.generation(o), 2);
    heap.gc();
    assert_eq!(heap.generation(o), 2);

    let live = heap.nodes_in_use();
    heap.unprotect(1);
    heap.gc();
    assert_eq!(heap.nodes_in_use(), live - 1);
}

#[test]
fn s3_write_barrier_tracks_old_to_new() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let p = heap.cons(nil, nil).unwrap();
    heap.protect(p);
    heap.gc();
    assert!(heap.generation(p) >= 1);
    assert!(!heap.in_old_to_new(p));

    let q = heap.cons(nil, nil).unwrap();
    heap.set_car(p, q);
    assert!(heap.in_old_to_new(p));

    // A youngest-only collection must not reclaim q: p's old-to-new entry
    // is rescanned.
    let live = heap.nodes_in_use();
    heap.collect_generation(0);
    assert_eq!(heap.nodes_in_use(), live);
    assert_eq!(heap.car(p), q);
    assert_eq!(heap.generation(q), 1);
    heap.check_integrity();
    heap.unprotect(1);
}

#[test]
fn s4_finalizer_runs_once() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let counter = Rc::new(Cell::new(0u32));

    let env = heap.new_environment(nil, nil, nil).unwrap();
    let c = counter.clone();
    heap.register_native_finalizer(env, Box::new(move |_, _| c.set(c.get() + 1)))
        .unwrap();

    // No references besides the registry.
    heap.gc();
    assert_eq!(counter.get(), 1);
    heap.gc();
    assert_eq!(counter.get(), 1);
    assert!(!heap.finalizers_pending());
}

#[test]
fn s4_finalizer_gets_its_object() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let seen = Rc::new(Cell::new(None));

    let obj = heap.make_external_ptr(0xBEEF, nil, nil).unwrap();
    let s = seen.clone();
    heap.register_native_finalizer(obj, Box::new(move |h, o| s.set(Some(h.extptr_raw(o)))))
        .unwrap();

    heap.gc();
    assert_eq!(seen.get(), Some(0xBEEF));
}

#[test]
fn finalizer_may_allocate_and_collect() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let ran = Rc::new(Cell::new(false));

    let env = heap.new_environment(nil, nil, nil).unwrap();
    let flag = ran.clone();
    heap.register_native_finalizer(
        env,
        Box::new(move |h, _| {
            let nil = h.nil();
            let mut chain = nil;
            for _ in 0..100 {
                chain = h.cons(nil, chain).unwrap();
            }
            h.protect(chain);
            h.gc();
            h.unprotect(1);
            flag.set(true);
        }),
    )
    .unwrap();

    heap.gc();
    assert!(ran.get());
    heap.check_integrity();
}

#[test]
fn finalizer_panic_is_contained() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let second_ran = Rc::new(Cell::new(false));

    let a = heap.new_environment(nil, nil, nil).unwrap();
    heap.register_native_finalizer(a, Box::new(|_, _| panic!("finalizer failure")))
        .unwrap();
    let b = heap.new_environment(nil, nil, nil).unwrap();
    let flag = second_ran.clone();
    heap.register_native_finalizer(b, Box::new(move |_, _| flag.set(true)))
        .unwrap();

    let depth = heap.protect_depth();
    heap.gc();
    // The panic neither aborted the collection nor skipped the second
    // finalizer, and the protect stack top was restored.
    assert!(second_ran.get());
    assert_eq!(heap.protect_depth(), depth);
    heap.check_integrity();
}

#[test]
fn callable_finalizer_goes_through_eval_hook() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let calls: Rc<RefCell<Vec<(heron_gc::NodeRef, heron_gc::NodeRef)>>> =
        Rc::new(RefCell::new(Vec::new()));

    let fun = heap.make_closure(nil, nil, nil).unwrap();
    heap.protect(fun);
    let log = calls.clone();
    heap.set_eval_hook(Box::new(move |h, call| {
        let fun = h.car(call);
        let obj = h.car(h.cdr(call));
        log.borrow_mut().push((fun, obj));
    }));

    let env = heap.new_environment(nil, nil, nil).unwrap();
    heap.register_finalizer(env, fun).unwrap();

    heap.gc();
    let recorded = calls.borrow();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, fun);
    assert_eq!(heap.node_type(recorded[0].1), NodeType::Env);
    heap.unprotect(1);
}

#[test]
fn s5_large_vector_release() {
    let mut heap = Heap::new();
    assert_eq!(heap.large_valloc_cells(), 0);

    let v = heap.alloc_vector(NodeType::Real, 10_000_000).unwrap();
    assert_eq!(heap.large_valloc_cells(), 10_000_000);
    heap.set_real_elt(v, 9_999_999, 1.0);

    // Drop the only reference and collect: the buffer is freed and the
    // accounting returns to zero.
    heap.gc();
    assert_eq!(heap.large_valloc_cells(), 0);
    heap.check_integrity();
}

#[test]
fn s6_page_release() {
    let mut heap = Heap::new();
    for _ in 0..500 {
        heap.alloc_vector(NodeType::Int, 2).unwrap();
    }
    let grown = heap.page_count(1);
    assert!(grown > 2);

    // All of them are garbage; a level>=1 collection hands the surplus
    // pages back.
    heap.gc();
    assert!(heap.page_count(1) < grown);
    heap.check_integrity();
}

#[test]
fn s7_heap_sizing_growth() {
    let mut heap = Heap::with_config(GcConfig {
        node_limit: 1000,
        node_grow_incr_min: 100,
        node_grow_incr_frac: 0.2,
        protect_capacity: 64,
        ..GcConfig::default()
    });
    let nil = heap.nil();
    let mut chain = nil;
    for _ in 0..650 {
        chain = heap.cons(nil, chain).unwrap();
    }
    heap.protect(chain);

    assert_eq!(heap.node_limit(), 1000);
    heap.gc();
    // Steady occupancy above the grow fraction: the limit grows by
    // exactly the minimum increment plus the fractional increment.
    assert_eq!(heap.node_limit(), 1000 + 100 + 200);
    heap.unprotect(1);
}

#[test]
fn round_trip_is_bitwise_and_addresses_are_stable() {
    let mut heap = Heap::new();
    let v = heap.alloc_vector(NodeType::Real, 33).unwrap();
    heap.protect(v);
    for i in 0..33 {
        heap.set_real_elt(v, i, (i as f64).sin());
    }
    let c = heap.mk_char("stability probe").unwrap();
    heap.protect(c);
    let char_addr = heap.char_bytes(c).as_ptr() as usize;

    for _ in 0..7 {
        heap.gc();
    }

    for i in 0..33 {
        assert_eq!(heap.real_elt(v, i).to_bits(), (i as f64).sin().to_bits());
    }
    assert_eq!(heap.char_bytes(c).as_ptr() as usize, char_addr);
    assert_eq!(heap.char_bytes(c), b"stability probe");
    heap.unprotect(2);
}

#[test]
fn back_to_back_collections_are_idempotent() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let mut chain = nil;
    for _ in 0..50 {
        chain = heap.cons(nil, chain).unwrap();
    }
    heap.protect(chain);
    let v = heap.alloc_vector(NodeType::Strings, 5).unwrap();
    heap.protect(v);

    heap.gc();
    heap.gc();
    let snapshot = (
        heap.nodes_in_use(),
        heap.small_valloc_cells(),
        heap.large_valloc_cells(),
        heap.generation(chain),
        heap.generation(v),
    );
    heap.gc();
    let again = (
        heap.nodes_in_use(),
        heap.small_valloc_cells(),
        heap.large_valloc_cells(),
        heap.generation(chain),
        heap.generation(v),
    );
    assert_eq!(snapshot, again);
    heap.check_integrity();
    heap.unprotect(2);
}

#[test]
fn write_barrier_covers_reference_vectors() {
    let mut heap = Heap::new();
    let v = heap.alloc_vector(NodeType::Generic, 4).unwrap();
    heap.protect(v);
    heap.gc();
    assert!(heap.generation(v) >= 1);

    let nil = heap.nil();
    let fresh = heap.cons(nil, nil).unwrap();
    heap.set_elt(v, 2, fresh);
    assert!(heap.in_old_to_new(v));

    heap.collect_generation(0);
    assert_eq!(heap.elt(v, 2), fresh);
    assert!(heap.generation(fresh) >= 1);

    let s = heap.alloc_vector(NodeType::Strings, 2).unwrap();
    heap.protect(s);
    heap.gc();
    let name = heap.mk_char("young").unwrap();
    heap.set_str_elt(s, 0, name);
    assert!(heap.in_old_to_new(s));
    heap.collect_generation(0);
    assert_eq!(heap.char_bytes(heap.str_elt(s, 0)), b"young");
    heap.unprotect(2);
}

#[test]
fn precious_list_keeps_and_releases() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let obj = heap.cons(nil, nil).unwrap();
    heap.preserve_object(obj).unwrap();

    heap.gc();
    let live = heap.nodes_in_use();
    assert_eq!(heap.cdr(obj), nil);

    heap.release_object(obj);
    heap.gc();
    // The object and its precious cell are both gone.
    assert_eq!(heap.nodes_in_use(), live - 2);
}

#[test]
fn external_roots_and_root_hook() {
    let mut heap = Heap::new();
    let nil = heap.nil();

    let table = heap.alloc_vector(NodeType::Generic, 8).unwrap();
    heap.add_root(table);
    heap.gc();
    assert_eq!(heap.vec_length(table), 8);

    let hooked = heap.cons(nil, nil).unwrap();
    heap.set_root_hook(Box::new(move |yield_root| yield_root(hooked)));
    heap.gc();
    assert_eq!(heap.car(hooked), nil);
    assert!(heap.generation(hooked) >= 1);

    heap.remove_root(table);
    heap.check_integrity();
}

#[test]
fn transient_buffers_follow_marks() {
    let mut heap = Heap::new();
    let outer = heap.alloc_transient(64, 8).unwrap();
    heap.raw_bytes_mut(outer)[0] = 7;

    let mark = heap.transient_mark();
    let inner = heap.alloc_transient(16, 8).unwrap();
    heap.raw_bytes_mut(inner)[0] = 9;
    heap.gc();
    // Both buffers are rooted through the chain.
    assert_eq!(heap.raw_bytes(outer)[0], 7);
    assert_eq!(heap.raw_bytes(inner)[0], 9);

    heap.transient_release(mark);
    let live = heap.nodes_in_use();
    heap.gc();
    // The inner buffer was abandoned, the outer one survives.
    assert_eq!(heap.nodes_in_use(), live - 1);
    assert_eq!(heap.raw_bytes(outer)[0], 7);
}

#[test]
fn allocation_errors_are_recoverable() {
    let mut heap = Heap::with_config(GcConfig {
        node_limit: 200,
        max_node_limit: 200,
        cell_limit: 64,
        max_cell_limit: 64,
        protect_capacity: 512,
        ..GcConfig::default()
    });
    let nil = heap.nil();

    let err = heap.alloc_vector(NodeType::Real, 1000).unwrap_err();
    assert!(matches!(err, HeapError::VectorExhausted { .. }));

    // Chain cells through each other: the growing chain is reachable
    // through the cons arguments whenever a collection triggers, so the
    // node budget genuinely fills up.
    let mut chain = nil;
    let mut node_err = None;
    for _ in 0..400 {
        match heap.cons(nil, chain) {
            Ok(cell) => chain = cell,
            Err(e) => {
                node_err = Some(e);
                break;
            }
        }
    }
    assert!(matches!(node_err, Some(HeapError::ConsExhausted { .. })));
    let _ = chain;

    // The heap stays usable after both failures.
    let ok = heap.alloc_vector(NodeType::Int, 2).unwrap();
    assert_eq!(heap.vec_length(ok), 2);
    heap.check_integrity();
}

#[test]
#[should_panic(expected = "protection stack overflow")]
fn protect_overflow_is_fatal() {
    let mut heap = Heap::with_config(GcConfig {
        protect_capacity: 4,
        ..GcConfig::default()
    });
    let nil = heap.nil();
    for _ in 0..5 {
        heap.protect(nil);
    }
}

#[test]
fn memory_profile_counts_live_nodes() {
    let mut heap = Heap::new();
    let nil = heap.nil();
    let mut chain = nil;
    for _ in 0..10 {
        chain = heap.cons(nil, chain).unwrap();
    }
    heap.protect(chain);
    let env = heap.new_environment(nil, nil, nil).unwrap();
    heap.protect(env);

    let profile = heap.memory_profile();
    assert!(profile[NodeType::Cons as usize] >= 10);
    assert!(profile[NodeType::Env as usize] >= 1);
    assert!(profile[NodeType::Nil as usize] >= 1);
    heap.unprotect(2);
}

#[test]
fn environments_promises_and_closures_survive() {
    let mut heap = Heap::new();
    let nil = heap.nil();

    let name = heap.mk_char("answer").unwrap();
    heap.protect(name);
    let sym = heap.make_symbol(name, nil).unwrap();
    heap.protect(sym);
    let names = heap.cons(sym, nil).unwrap();
    heap.protect(names);
    let forty_two = heap.alloc_vector(NodeType::Int, 1).unwrap();
    heap.set_int_elt(forty_two, 0, 42);
    heap.protect(forty_two);
    let values = heap.cons(forty_two, nil).unwrap();
    heap.protect(values);

    let env = heap.new_environment(names, values, nil).unwrap();
    heap.protect(env);
    let body = heap.alloc_node(NodeType::Language).unwrap();
    heap.protect(body);
    let clo = heap.make_closure(nil, body, env).unwrap();
    heap.protect(clo);
    let prom = heap.make_promise(body, env).unwrap();
    heap.protect(prom);
    heap.set_promise_seen(prom, true);

    for _ in 0..3 {
        heap.gc();
    }

    assert_eq!(heap.tag(heap.frame(env)), sym);
    assert_eq!(heap.int_elt(heap.car(heap.frame(env)), 0), 42);
    assert_eq!(heap.char_bytes(heap.symbol_printname(sym)), b"answer");
    assert_eq!(heap.closure_env(clo), env);
    assert_eq!(heap.body(clo), body);
    assert_eq!(heap.promise_env(prom), env);
    assert_eq!(heap.promise_expr(prom), body);
    assert_eq!(heap.promise_value(prom), nil);
    assert!(heap.promise_seen(prom));
    heap.check_integrity();
    heap.unprotect(9);
}

#[test]
fn churn_preserves_invariants() {
    let mut heap = Heap::with_config(tiny_config());
    let nil = heap.nil();
    let keep = heap.alloc_vector(NodeType::Generic, 8).unwrap();
    heap.protect(keep);

    for round in 0..40 {
        for i in 0..30 {
            match i % 4 {
                0 => {
                    let cell = heap.cons(nil, nil).unwrap();
                    if i % 8 == 0 {
                        heap.set_elt(keep, (round + i) % 8, cell);
                    }
                }
                1 => {
                    heap.alloc_vector(NodeType::Int, (i % 5) * 3).unwrap();
                }
                2 => {
                    heap.alloc_vector(NodeType::Real, i % 7).unwrap();
                }
                _ => {
                    let s = heap.mk_char("churn").unwrap();
                    heap.protect(s);
                    heap.unprotect(1);
                }
            }
        }
        if round % 10 == 9 {
            heap.gc();
            heap.check_integrity();
        }
    }
    heap.check_integrity();
    // The survivors written into the kept vector are intact.
    for i in 0..8 {
        let e = heap.elt(keep, i);
        if e != nil {
            assert_eq!(heap.node_type(e), NodeType::Cons);
        }
    }
    heap.unprotect(1);
}
