// Bookkeeping for the per-process anonymous-mapping arena.
//
// Each process keeps an address-sorted list of the *free* (unmapped)
// sub-intervals of [MMAP_BEGIN, MMAP_END). The mapped portion of the
// arena is exactly the complement of that list. Nodes for every
// process's list come from one global fixed-capacity pool and are
// linked by index, so a node is owned either by a process list or by
// the pool's own free list, never both.
//
// The arithmetic here is pure list surgery; mapping and unmapping of
// the frames themselves happens in vm.rs.

use crate::memlayout::{MMAP_BEGIN, MMAP_PAGES};
use crate::param::N_MMAP;
use crate::riscv::PGSIZE;

#[cfg(target_os = "none")]
use crate::spinlock::Mutex;

#[cfg(target_os = "none")]
pub static POOL: Mutex<RegionPool> = Mutex::new(RegionPool::new(), "mmap pool");

#[derive(Clone, Copy)]
struct Region {
    begin: usize,
    npages: usize,
    next: Option<u16>,
}

// Head of one process's free-region list: an index into the pool.
#[derive(Clone, Copy, Default)]
pub struct RegionList {
    head: Option<u16>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { head: None }
    }
}

pub struct RegionPool {
    nodes: [Region; N_MMAP],
    free: Option<u16>,
}

impl RegionPool {
    pub const fn new() -> Self {
        let mut nodes = [Region {
            begin: 0,
            npages: 0,
            next: None,
        }; N_MMAP];
        // thread every node onto the pool free list
        let mut i = 0;
        while i < N_MMAP {
            nodes[i].next = if i + 1 < N_MMAP {
                Some((i + 1) as u16)
            } else {
                None
            };
            i += 1;
        }
        Self {
            nodes,
            free: Some(0),
        }
    }

    fn alloc_node(&mut self, begin: usize, npages: usize) -> Option<u16> {
        let i = self.free?;
        self.free = self.nodes[i as usize].next;
        self.nodes[i as usize] = Region {
            begin,
            npages,
            next: None,
        };
        Some(i)
    }

    fn free_node(&mut self, i: u16) {
        self.nodes[i as usize].next = self.free;
        self.free = Some(i);
    }

    // A fresh list whose single node spans the whole arena.
    // Only boot and exec ask for this; running out of nodes there is fatal.
    pub fn full_list(&mut self) -> RegionList {
        let i = self
            .alloc_node(MMAP_BEGIN, MMAP_PAGES)
            .expect("mmap pool exhausted");
        RegionList { head: Some(i) }
    }

    // Return every node of a list to the pool.
    pub fn release(&mut self, list: &mut RegionList) {
        let mut cur = list.head.take();
        while let Some(i) = cur {
            cur = self.nodes[i as usize].next;
            self.free_node(i);
        }
    }

    // Duplicate a list for fork. On node exhaustion the partial copy is
    // rolled back and None returned.
    pub fn clone_list(&mut self, src: &RegionList) -> Option<RegionList> {
        let mut dst = RegionList::default();
        let mut tail: Option<u16> = None;
        let mut cur = src.head;
        while let Some(i) = cur {
            let Region { begin, npages, next } = self.nodes[i as usize];
            match self.alloc_node(begin, npages) {
                Some(ni) => {
                    match tail {
                        Some(t) => self.nodes[t as usize].next = Some(ni),
                        None => dst.head = Some(ni),
                    }
                    tail = Some(ni);
                }
                None => {
                    self.release(&mut dst);
                    return None;
                }
            }
            cur = next;
        }
        Some(dst)
    }

    // Does some free node enclose [begin, begin + npages*PGSIZE)?
    pub fn encloses(&self, list: &RegionList, begin: usize, npages: usize) -> bool {
        self.find_enclosing(list, begin, begin + npages * PGSIZE).1.is_some()
    }

    // Does [begin, begin + npages*PGSIZE) touch any free run? Used to
    // reject munmap of a range that is not (fully) mapped.
    pub fn overlaps(&self, list: &RegionList, begin: usize, npages: usize) -> bool {
        let end = begin + npages * PGSIZE;
        let mut cur = list.head;
        while let Some(i) = cur {
            let n = &self.nodes[i as usize];
            let n_end = n.begin + n.npages * PGSIZE;
            if begin < n_end && n.begin < end {
                return true;
            }
            cur = n.next;
        }
        false
    }

    // First free run of at least npages, for mmap(start = 0).
    pub fn find_fit(&self, list: &RegionList, npages: usize) -> Option<usize> {
        let mut cur = list.head;
        while let Some(i) = cur {
            let n = &self.nodes[i as usize];
            if n.npages >= npages {
                return Some(n.begin);
            }
            cur = n.next;
        }
        None
    }

    fn find_enclosing(
        &self,
        list: &RegionList,
        begin: usize,
        end: usize,
    ) -> (Option<u16>, Option<u16>) {
        let mut prev = None;
        let mut cur = list.head;
        while let Some(i) = cur {
            let n = &self.nodes[i as usize];
            let n_end = n.begin + n.npages * PGSIZE;
            if begin >= n.begin && end <= n_end {
                return (prev, cur);
            }
            prev = cur;
            cur = n.next;
        }
        (prev, None)
    }

    // Carve [begin, begin + npages*PGSIZE) out of the free list.
    // The caller has already checked the range with encloses(); a range
    // that is not free here is a kernel bug.
    // Err only when an interior split needs a node and the pool is dry.
    pub fn reserve(
        &mut self,
        list: &mut RegionList,
        begin: usize,
        npages: usize,
    ) -> Result<(), ()> {
        assert!(begin % PGSIZE == 0, "reserve: begin not aligned");
        let end = begin + npages * PGSIZE;
        let (prev, cur) = self.find_enclosing(list, begin, end);
        let cur = cur.expect("reserve: no enclosing free region");
        let node = self.nodes[cur as usize];
        let node_end = node.begin + node.npages * PGSIZE;

        if begin == node.begin && end == node_end {
            // exact fit: unlink the node
            match prev {
                Some(p) => self.nodes[p as usize].next = node.next,
                None => list.head = node.next,
            }
            self.free_node(cur);
        } else if begin == node.begin {
            // shrink from the front
            self.nodes[cur as usize].begin = end;
            self.nodes[cur as usize].npages -= npages;
        } else if end == node_end {
            // shrink from the back
            self.nodes[cur as usize].npages -= npages;
        } else {
            // interior: split into two
            let tail = self
                .alloc_node(end, (node_end - end) / PGSIZE)
                .ok_or(())?;
            self.nodes[tail as usize].next = node.next;
            self.nodes[cur as usize].npages = (begin - node.begin) / PGSIZE;
            self.nodes[cur as usize].next = Some(tail);
        }
        Ok(())
    }

    // Give [begin, begin + npages*PGSIZE) back to the free list at its
    // sorted position, then coalesce with the successor and predecessor
    // so adjacent free runs never touch.
    // Err when the pool has no node to record the hole with; the caller
    // must check before tearing down mappings.
    pub fn insert_free(
        &mut self,
        list: &mut RegionList,
        begin: usize,
        npages: usize,
    ) -> Result<(), ()> {
        assert!(begin % PGSIZE == 0, "insert_free: begin not aligned");
        let new = self.alloc_node(begin, npages).ok_or(())?;

        let mut prev = None;
        let mut cur = list.head;
        while let Some(i) = cur {
            if self.nodes[i as usize].begin >= begin {
                break;
            }
            prev = cur;
            cur = self.nodes[i as usize].next;
        }
        match prev {
            Some(p) => self.nodes[p as usize].next = Some(new),
            None => list.head = Some(new),
        }
        self.nodes[new as usize].next = cur;

        // merge with the successor
        if let Some(c) = cur {
            let new_end = begin + npages * PGSIZE;
            if new_end == self.nodes[c as usize].begin {
                self.nodes[new as usize].npages += self.nodes[c as usize].npages;
                self.nodes[new as usize].next = self.nodes[c as usize].next;
                self.free_node(c);
            }
        }
        // merge with the predecessor
        if let Some(p) = prev {
            let p_node = self.nodes[p as usize];
            if p_node.begin + p_node.npages * PGSIZE == begin {
                self.nodes[p as usize].npages += self.nodes[new as usize].npages;
                self.nodes[p as usize].next = self.nodes[new as usize].next;
                self.free_node(new);
            }
        }
        Ok(())
    }

    // The free runs of a list, in address order.
    pub fn runs<'a>(&'a self, list: &RegionList) -> RunIter<'a> {
        RunIter {
            pool: self,
            cur: list.head,
        }
    }
}

pub struct RunIter<'a> {
    pool: &'a RegionPool,
    cur: Option<u16>,
}

impl<'a> Iterator for RunIter<'a> {
    // (begin, npages)
    type Item = (usize, usize);
    fn next(&mut self) -> Option<Self::Item> {
        let i = self.cur?;
        let n = &self.pool.nodes[i as usize];
        self.cur = n.next;
        Some((n.begin, n.npages))
    }
}

#[cfg(test)]
mod region_tests {
    use super::*;

    const P: usize = PGSIZE;

    fn pool_and_list() -> (RegionPool, RegionList) {
        let mut pool = RegionPool::new();
        let list = pool.full_list();
        (pool, list)
    }

    fn runs(pool: &RegionPool, list: &RegionList) -> Vec<(usize, usize)> {
        pool.runs(list).collect()
    }

    // address-sorted, disjoint, adjacent runs never touch
    fn check_invariants(pool: &RegionPool, list: &RegionList) {
        let rs = runs(pool, list);
        for w in rs.windows(2) {
            let (a_begin, a_np) = w[0];
            let (b_begin, _) = w[1];
            assert!(a_begin + a_np * P < b_begin);
        }
    }

    #[test]
    fn starts_as_one_full_run() {
        let (pool, list) = pool_and_list();
        assert_eq!(runs(&pool, &list), vec![(MMAP_BEGIN, MMAP_PAGES)]);
    }

    #[test]
    fn reserve_splits_and_insert_coalesces() {
        let (mut pool, mut list) = pool_and_list();
        let b = MMAP_BEGIN;

        pool.reserve(&mut list, b + 4 * P, 3).unwrap();
        pool.reserve(&mut list, b + 10 * P, 2).unwrap();
        pool.reserve(&mut list, b + 2 * P, 2).unwrap();
        check_invariants(&pool, &list);
        assert_eq!(
            runs(&pool, &list),
            vec![
                (b, 2),
                (b + 7 * P, 3),
                (b + 12 * P, MMAP_PAGES - 12),
            ]
        );

        pool.reserve(&mut list, b + 8 * P, 1).unwrap();
        check_invariants(&pool, &list);

        pool.insert_free(&mut list, b + 8 * P, 1).unwrap();
        pool.insert_free(&mut list, b + 2 * P, 2).unwrap();
        pool.insert_free(&mut list, b + 4 * P, 3).unwrap();
        check_invariants(&pool, &list);

        // the three freed sub-ranges merged with the surviving runs:
        // everything below the mapping at b+10*P is one node again.
        assert_eq!(
            runs(&pool, &list),
            vec![(b, 10), (b + 12 * P, MMAP_PAGES - 12)]
        );
    }

    #[test]
    fn reserve_then_free_roundtrips() {
        let (mut pool, mut list) = pool_and_list();
        let b = MMAP_BEGIN + 17 * P;

        pool.reserve(&mut list, b, 5).unwrap();
        assert!(!pool.encloses(&list, b, 1));
        pool.insert_free(&mut list, b, 5).unwrap();
        assert_eq!(runs(&pool, &list), vec![(MMAP_BEGIN, MMAP_PAGES)]);
    }

    #[test]
    fn exact_front_and_back_cases() {
        let (mut pool, mut list) = pool_and_list();
        let b = MMAP_BEGIN;

        // front of the arena
        pool.reserve(&mut list, b, 4).unwrap();
        assert_eq!(runs(&pool, &list), vec![(b + 4 * P, MMAP_PAGES - 4)]);

        // back of the remaining run
        let last = b + MMAP_PAGES * P - 2 * P;
        pool.reserve(&mut list, last, 2).unwrap();
        assert_eq!(runs(&pool, &list), vec![(b + 4 * P, MMAP_PAGES - 6)]);

        // exact fit removes the node entirely
        pool.reserve(&mut list, b + 4 * P, MMAP_PAGES - 6).unwrap();
        assert_eq!(runs(&pool, &list), vec![]);
    }

    #[test]
    fn find_fit_skips_small_runs() {
        let (mut pool, mut list) = pool_and_list();
        let b = MMAP_BEGIN;
        pool.reserve(&mut list, b + 2 * P, MMAP_PAGES - 4).unwrap();
        // two 2-page runs remain, at both ends of the arena
        assert_eq!(pool.find_fit(&list, 2), Some(b));
        assert_eq!(pool.find_fit(&list, 3), None);
    }

    #[test]
    fn clone_matches_source() {
        let (mut pool, mut list) = pool_and_list();
        pool.reserve(&mut list, MMAP_BEGIN + 8 * P, 4).unwrap();
        let copy = pool.clone_list(&list).unwrap();
        assert_eq!(runs(&pool, &list), runs(&pool, &copy));
    }

    #[test]
    fn release_returns_nodes() {
        let (mut pool, mut list) = pool_and_list();
        for i in 0..8 {
            pool.reserve(&mut list, MMAP_BEGIN + (2 * i + 1) * P, 1).unwrap();
        }
        pool.release(&mut list);
        // all nodes back in the pool: another full list still works
        let other = pool.full_list();
        assert_eq!(runs(&pool, &other), vec![(MMAP_BEGIN, MMAP_PAGES)]);
    }
}
