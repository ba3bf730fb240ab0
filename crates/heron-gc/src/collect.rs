//! The tracing collector: level selection, the five-phase generational
//! mark, large-vector sweep, new-space sorting, page release scheduling,
//! adaptive heap sizing, and reporting.
//!
//! Collections are stop-the-world and happen only inside allocation entry
//! points or explicit requests. Objects never move; liveness flows through
//! the intrusive lists. Old nodes stay marked between collections; a
//! demoted generation is unmarked wholesale and its survivors are re-marked
//! through root forwarding.

use std::time::Instant;

use crate::heap::Heap;
use crate::list::{new_peg, old_peg, old_to_new_peg};
use crate::node::{
    CLASS_CELLS, LARGE_CLASS, NUM_GENERATIONS, NUM_NODE_CLASSES, NUM_OLD_GENERATIONS, NodeData,
    NodeRef,
};
use crate::page::slots_per_page;

impl Heap {
    /// Force a full collection, then run eligible finalizers.
    pub fn gc(&mut self) {
        self.gc_internal(0, Some(NUM_OLD_GENERATIONS));
    }

    /// Collect generations `0..=level`. Level 0 collects new space only.
    pub fn collect_generation(&mut self, level: usize) {
        self.gc_internal(0, Some(level.min(NUM_OLD_GENERATIONS)));
    }

    pub(crate) fn gc_internal(&mut self, size_needed: usize, forced_level: Option<usize>) {
        if self.in_gc {
            panic!("garbage collection re-entered from within a collection");
        }
        let saved_interrupts = self.interrupts_suspended;
        self.interrupts_suspended = true;

        self.collect_and_report(size_needed, forced_level);

        // Finalizers run after reclamation. When one of them freed memory
        // and the request is still unsatisfied, collect once more, but
        // never run finalizers twice in one collection.
        if !self.finalizers_running {
            let ran = self.run_finalizers();
            if ran && (self.nodes_in_use >= self.node_limit || size_needed > self.vheap_free()) {
                self.collect_and_report(size_needed, forced_level);
            }
        }

        self.interrupts_suspended = saved_interrupts;
    }

    fn collect_and_report(&mut self, size_needed: usize, forced_level: Option<usize>) {
        tracing::debug!(
            target: "heron::gc",
            nodes_in_use = self.nodes_in_use,
            node_limit = self.node_limit,
            vheap_free = self.vheap_free(),
            size_needed,
            "GC cycle starting"
        );

        let start = Instant::now();
        self.in_gc = true;
        let gens_collected = self.run_gen_collect(size_needed, forced_level);
        self.in_gc = false;

        self.stats.collections += 1;
        self.stats.collections_by_level[gens_collected] += 1;
        self.stats.last_level = gens_collected;
        self.stats.last_live_nodes = self.nodes_in_use;
        self.stats.last_free_nodes = self.node_limit.saturating_sub(self.nodes_in_use);
        let pause = start.elapsed();
        self.stats.last_pause = pause;
        self.stats.total_pause += pause;

        if self.reporting {
            self.report(gens_collected);
        }
    }

    /// One generational collection. Returns the number of old generations
    /// collected (0 = youngest only).
    fn run_gen_collect(&mut self, size_needed: usize, forced_level: Option<usize>) -> usize {
        let mut level = match forced_level {
            Some(l) => l,
            None => {
                // Bump the level while the deepest in-scope generation's
                // countdown has run out.
                let mut level = self.gens_to_collect;
                while level < NUM_OLD_GENERATIONS {
                    if self.collect_counts[level] == 0 {
                        self.collect_counts[level] = self.config.level_freq[level];
                        level += 1;
                    } else {
                        self.collect_counts[level] -= 1;
                        break;
                    }
                }
                level
            }
        };

        let gens_collected;
        loop {
            let this_level = level;
            let mut worklist: Vec<NodeRef> = Vec::new();

            // Phase 1: absorb old-to-new edges of the collected
            // generations, aging every referenced child up to the
            // referring generation, then splicing the entries back into
            // their old lists.
            for g in 1..=this_level {
                for class in 0..NUM_NODE_CLASSES as u8 {
                    let peg = old_to_new_peg(class, g);
                    let mut l = self.next_of(peg);
                    while l != peg {
                        let next = self.next_of(l);
                        let r = l.node();
                        for i in 0..self.child_count(r) {
                            let child = self.child_at(r, i);
                            self.age_node_and_children(child, g as u8);
                        }
                        self.unsnap(l);
                        debug_assert_eq!(self.node(r).generation as usize, g);
                        self.snap(l, old_peg(class, g));
                        l = next;
                    }
                }
            }

            // Phase 2: demote the collected generations to new space.
            // Marks are cleared and the generation of survivors-to-be is
            // pre-incremented; reachable nodes are re-tenured by the
            // drain, the rest become free slots.
            for g in 1..=this_level {
                for class in 0..NUM_NODE_CLASSES as u8 {
                    self.old_count[class as usize][g] = 0;
                    let peg = old_peg(class, g);
                    let mut l = self.next_of(peg);
                    while l != peg {
                        let next = self.next_of(l);
                        let n = self.node_mut(l.node());
                        n.marked = false;
                        if g + 1 < NUM_GENERATIONS {
                            n.generation = (g + 1) as u8;
                        }
                        l = next;
                    }
                    self.bulk_move(peg, new_peg(class));
                }
            }

            // Phase 3: the uncollected generations' old-to-new entries
            // keep their places; only their children are forwarded.
            for g in (this_level + 1)..NUM_GENERATIONS {
                for class in 0..NUM_NODE_CLASSES as u8 {
                    let peg = old_to_new_peg(class, g);
                    let mut l = self.next_of(peg);
                    while l != peg {
                        self.forward_children(l.node(), &mut worklist);
                        l = self.next_of(l);
                    }
                }
            }

            // Phase 4: forward every root.
            self.forward_roots(&mut worklist);

            // Phase 5: drain.
            self.process_worklist(&mut worklist);

            // Finalization-only reachability: flag dying registrations,
            // then keep the whole registry alive one more collection.
            self.flag_pending_finalizers();
            let head = self.finalizer_head;
            self.forward(head, &mut worklist);
            self.process_worklist(&mut worklist);

            self.sweep_large();

            for class in 0..NUM_NODE_CLASSES as u8 {
                self.free_cursor[class as usize] = self.next_of(new_peg(class));
            }

            // Recompute occupancy from the tenured population.
            let mut live = 0usize;
            let mut small = 0usize;
            for class in 0..NUM_NODE_CLASSES {
                for g in 1..NUM_GENERATIONS {
                    live += self.old_count[class][g];
                    if class >= 1 && class < LARGE_CLASS as usize {
                        small += self.old_count[class][g] * CLASS_CELLS[class];
                    }
                }
            }
            self.nodes_in_use = live;
            self.small_cells = small;
            let collected = self.node_limit as isize - live as isize;

            // Escalate when too little came free; restart immediately
            // when the pending request still cannot be satisfied.
            if this_level < NUM_OLD_GENERATIONS {
                let min_nodes = (self.config.min_free_frac * self.node_limit as f64) as isize;
                let min_cells = (self.config.min_free_frac * self.cell_limit as f64) as usize;
                if collected < min_nodes
                    || self.vheap_free() < size_needed.saturating_add(min_cells)
                {
                    level = this_level + 1;
                    if collected <= 0 || self.vheap_free() < size_needed {
                        continue;
                    }
                } else {
                    level = 0;
                }
            } else {
                level = 0;
            }
            gens_collected = this_level;
            break;
        }
        self.gens_to_collect = level;

        if gens_collected == NUM_OLD_GENERATIONS {
            self.sort_new_space();
            self.adjust_heap_size(size_needed);
        }
        if gens_collected > 0 {
            self.release_countdown = self.release_countdown.saturating_sub(1);
            if self.release_countdown == 0 {
                self.release_countdown = self.config.page_release_freq.max(1);
                self.try_release_pages();
            }
        }
        gens_collected
    }

    /// Mark an unmarked node, detach it from its list, and push it onto
    /// the worklist. Nodes born since the last collection tenure into the
    /// first old generation.
    pub(crate) fn forward(&mut self, r: NodeRef, worklist: &mut Vec<NodeRef>) {
        let n = self.node_mut(r);
        if !n.marked {
            n.marked = true;
            if n.generation == 0 {
                n.generation = 1;
            }
            self.unsnap(r.link());
            worklist.push(r);
        }
    }

    fn forward_children(&mut self, r: NodeRef, worklist: &mut Vec<NodeRef>) {
        for i in 0..self.child_count(r) {
            let child = self.child_at(r, i);
            self.forward(child, worklist);
        }
    }

    pub(crate) fn process_worklist(&mut self, worklist: &mut Vec<NodeRef>) {
        while let Some(r) = worklist.pop() {
            let (class, g) = {
                let n = self.node(r);
                (n.class, n.generation as usize)
            };
            self.snap(r.link(), old_peg(class, g));
            self.old_count[class as usize][g] += 1;
            self.forward_children(r, worklist);
        }
    }

    /// Promote `start` and everything it transitively references up to
    /// generation `g`. Ties favor the referrer: nodes already at or above
    /// `g` are left alone.
    fn age_node_and_children(&mut self, start: NodeRef, g: u8) {
        let mut pending: Vec<NodeRef> = Vec::new();
        self.age_one(start, g, &mut pending);
        while let Some(r) = pending.pop() {
            let class = self.node(r).class;
            self.snap(r.link(), old_peg(class, g as usize));
            self.old_count[class as usize][g as usize] += 1;
            for i in 0..self.child_count(r) {
                let child = self.child_at(r, i);
                self.age_one(child, g, &mut pending);
            }
        }
    }

    fn age_one(&mut self, r: NodeRef, g: u8, pending: &mut Vec<NodeRef>) {
        let (marked, generation, class) = {
            let n = self.node(r);
            (n.marked, n.generation, n.class)
        };
        if !marked || generation < g {
            if marked {
                self.old_count[class as usize][generation as usize] -= 1;
            } else {
                self.node_mut(r).marked = true;
            }
            self.node_mut(r).generation = g;
            self.unsnap(r.link());
            pending.push(r);
        }
    }

    fn forward_roots(&mut self, worklist: &mut Vec<NodeRef>) {
        let nil = self.nil;
        self.forward(nil, worklist);
        let blank = self.blank;
        self.forward(blank, worklist);
        let precious = self.precious;
        self.forward(precious, worklist);
        let transient = self.transient;
        self.forward(transient, worklist);
        let current = self.current_expr;
        self.forward(current, worklist);
        for i in 0..self.protect_stack.len() {
            let r = self.protect_stack[i];
            self.forward(r, worklist);
        }
        for i in 0..self.extra_roots.len() {
            let r = self.extra_roots[i];
            self.forward(r, worklist);
        }
        if let Some(mut hook) = self.root_hook.take() {
            let mut yielded = Vec::new();
            hook(&mut |r| yielded.push(r));
            self.root_hook = Some(hook);
            for r in yielded {
                self.forward(r, worklist);
            }
        }
    }

    /// Release the buffers of unreachable large vectors. Their headers
    /// were demoted to new space by the mark phase; the slots become free
    /// for the next large allocation.
    fn sweep_large(&mut self) {
        let peg = new_peg(LARGE_CLASS);
        let mut l = self.next_of(peg);
        while l != peg {
            let next = self.next_of(l);
            let n = self.node_mut(l.node());
            let mut freed = 0usize;
            if let NodeData::Vector(h) = &mut n.data {
                if let Some(buffer) = h.buffer.take() {
                    freed = buffer.len();
                }
                n.data = NodeData::Free;
            }
            self.large_cells -= freed;
            l = next;
        }
    }

    /// Rebuild each new-space list in page-traversal order after a full
    /// collection. Nothing moves; only the free-list order changes, which
    /// restores allocation locality.
    fn sort_new_space(&mut self) {
        for class in 0..NUM_NODE_CLASSES as u8 {
            let peg = new_peg(class);
            self.pegs[peg.peg_index()] = crate::node::Links::self_loop(peg);
            let ids = self.class_pages[class as usize].clone();
            let spp = slots_per_page(class);
            for id in ids {
                for slot in 0..spp {
                    let r = NodeRef::new(id, slot);
                    if !self.node(r).marked {
                        self.snap(r.link(), peg);
                    }
                }
            }
            self.free_cursor[class as usize] = self.next_of(peg);
        }
    }

    /// Adapt the node and cell limits to post-collection occupancy. Only
    /// called after full collections.
    fn adjust_heap_size(&mut self, size_needed: usize) {
        let min_n_free = (self.orig_node_limit as f64 * self.config.min_free_frac) as usize;
        let min_v_free = (self.orig_cell_limit as f64 * self.config.min_free_frac) as usize;
        let n_needed = self.nodes_in_use + min_n_free;
        let v_needed = self.small_cells + self.large_cells + size_needed + min_v_free;
        let node_occup = n_needed as f64 / self.node_limit as f64;
        let vect_occup = v_needed as f64 / self.cell_limit as f64;

        if node_occup > self.config.node_grow_frac {
            let change = self.config.node_grow_incr_min
                + (self.config.node_grow_incr_frac * self.node_limit as f64) as usize;
            if self
                .node_limit
                .checked_add(change)
                .is_some_and(|n| n <= self.max_node_limit)
            {
                self.node_limit += change;
            }
        } else if node_occup < self.config.node_shrink_frac {
            let change = self.config.node_shrink_incr_min
                + (self.config.node_shrink_incr_frac * self.node_limit as f64) as usize;
            self.node_limit = self.node_limit.saturating_sub(change);
            if self.node_limit < n_needed {
                self.node_limit = n_needed.min(self.max_node_limit);
            }
            if self.node_limit < self.orig_node_limit {
                self.node_limit = self.orig_node_limit;
            }
        }

        if vect_occup > 1.0 && v_needed < self.max_cell_limit {
            self.cell_limit = v_needed;
        }
        if vect_occup > self.config.cell_grow_frac {
            let change = self.config.cell_grow_incr_min
                + (self.config.cell_grow_incr_frac * self.cell_limit as f64) as usize;
            if self.max_cell_limit - self.cell_limit >= change {
                self.cell_limit += change;
            }
        } else if vect_occup < self.config.cell_shrink_frac {
            let change = self.config.cell_shrink_incr_min
                + (self.config.cell_shrink_incr_frac * self.cell_limit as f64) as usize;
            self.cell_limit = self.cell_limit.saturating_sub(change);
            if self.cell_limit < v_needed {
                self.cell_limit = v_needed;
            }
            if self.cell_limit < self.orig_cell_limit {
                self.cell_limit = self.orig_cell_limit;
            }
        }
    }

    fn report(&self, gens_collected: usize) {
        let by_level = &self.stats.collections_by_level;
        tracing::info!(
            target: "heron::gc",
            collection = self.stats.collections,
            level = gens_collected,
            live_nodes = self.nodes_in_use,
            pause_us = self.stats.last_pause.as_micros() as u64,
            "Garbage collection {} = {}+{}+{} (level {})",
            self.stats.collections,
            by_level[0],
            by_level[1],
            by_level[2],
            gens_collected
        );
        let free_nodes = self.node_limit.saturating_sub(self.nodes_in_use);
        let node_pct = (100.0 * free_nodes as f64 / self.node_limit as f64).round();
        tracing::info!(
            target: "heron::gc",
            free_nodes,
            free_pct = node_pct,
            "{} cons cells free ({}%)",
            free_nodes,
            node_pct
        );
        let free_cells = self.vheap_free();
        let mbytes = free_cells as f64 * 8.0 / (1024.0 * 1024.0);
        let cell_pct = (100.0 * free_cells as f64 / self.cell_limit as f64).round();
        tracing::info!(
            target: "heron::gc",
            free_cells,
            free_pct = cell_pct,
            "{:.1} Mbytes of heap free ({}%)",
            mbytes,
            cell_pct
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    #[test]
    fn test_collect_empty_heap() {
        let mut heap = Heap::new();
        heap.gc();
        assert_eq!(heap.stats().collections, 1);
        assert_eq!(heap.stats().last_level, NUM_OLD_GENERATIONS);
        heap.check_integrity();
    }

    #[test]
    fn test_unreachable_nodes_reclaimed() {
        let mut heap = Heap::new();
        heap.gc();
        let live = heap.nodes_in_use();
        let nil = heap.nil();
        for _ in 0..500 {
            heap.cons(nil, nil).unwrap();
        }
        assert_eq!(heap.nodes_in_use(), live + 500);
        heap.gc();
        assert_eq!(heap.nodes_in_use(), live);
        heap.check_integrity();
    }

    #[test]
    fn test_protected_chain_survives() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let mut chain = nil;
        for _ in 0..10 {
            chain = heap.cons(nil, chain).unwrap();
        }
        heap.protect(chain);
        heap.gc();
        heap.check_integrity();
        let mut len = 0;
        let mut cur = chain;
        while cur != nil {
            len += 1;
            cur = heap.cdr(cur);
        }
        assert_eq!(len, 10);
        heap.unprotect(1);
    }

    #[test]
    fn test_promotion_is_capped() {
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
        heap.unprotect(1);
    }

    #[test]
    fn test_level_zero_leaves_tenured_alone() {
        let mut heap = Heap::new();
        let nil = heap.nil();
        let o = heap.cons(nil, nil).unwrap();
        heap.protect(o);
        heap.gc();
        assert_eq!(heap.generation(o), 1);
        heap.collect_generation(0);
        assert_eq!(heap.generation(o), 1);
        heap.unprotect(1);
        heap.check_integrity();
    }

    #[test]
    fn test_vector_contents_stable_across_collections() {
        let mut heap = Heap::new();
        let v = heap.alloc_vector(NodeType::Real, 64).unwrap();
        heap.protect(v);
        for i in 0..64 {
            heap.set_real_elt(v, i, i as f64 * 0.5);
        }
        for _ in 0..5 {
            heap.gc();
        }
        for i in 0..64 {
            assert_eq!(heap.real_elt(v, i), i as f64 * 0.5);
        }
        heap.unprotect(1);
    }
}
