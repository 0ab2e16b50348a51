//! Random operation sequences against the allocator's bookkeeping invariants.

use kernel_vpa::{
    PAGE_SIZE, PageCounts, PageRange, RunState, VirtualAddress, VirtualPageAllocator, VpaError,
};
use quickcheck::{Arbitrary, Gen, QuickCheck};

const BASE: VirtualAddress = VirtualAddress::new(0x10_0000);
const TOTAL_PAGES: u64 = 256;
const MAX_TESTS: u64 = 300;

#[derive(Clone, Debug)]
enum Op {
    Allocate { pages: u64 },
    /// Given `n` used runs, releases the one at `index % n`.
    Unallocate { index: usize },
    Reserve { page: u64, pages: u64 },
    /// Given `n` reserved runs, releases the one at `index % n`.
    Unreserve { index: usize },
    CleanupFreePages,
    CleanupAllocations,
    PromoteNodeSupply,
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 16 {
            0..=5 => Self::Allocate {
                pages: u64::arbitrary(g) % 24 + 1,
            },
            6..=9 => Self::Unallocate {
                index: usize::arbitrary(g),
            },
            10 | 11 => {
                let page = u64::arbitrary(g) % TOTAL_PAGES;
                let pages = (u64::arbitrary(g) % 8 + 1).min(TOTAL_PAGES - page);
                Self::Reserve { page, pages }
            }
            12 => Self::Unreserve {
                index: usize::arbitrary(g),
            },
            13 => Self::CleanupFreePages,
            14 => Self::CleanupAllocations,
            _ => Self::PromoteNodeSupply,
        }
    }
}

type Snapshot = (PageCounts, Vec<PageRange>, Vec<(PageRange, RunState)>);

fn snapshot(vpa: &VirtualPageAllocator) -> Snapshot {
    let mut free: Vec<_> = vpa.free_runs().collect();
    free.sort_by_key(|run| run.start);
    (vpa.counts(), free, vpa.allocations().collect())
}

/// Free, reserved and used runs partition the managed range exactly, the
/// counters match the indices and both trees are balanced.
fn invariants_hold(vpa: &VirtualPageAllocator) -> bool {
    let (counts, free, allocations) = snapshot(vpa);

    let pages_in = |state: RunState| -> u64 {
        allocations
            .iter()
            .filter(|(_, s)| *s == state)
            .map(|(run, _)| run.pages)
            .sum()
    };
    let expected = PageCounts {
        free: free.iter().map(|run| run.pages).sum(),
        used: pages_in(RunState::Used),
        reserved: pages_in(RunState::Reserved),
    };

    let mut runs: Vec<_> = free
        .iter()
        .copied()
        .chain(allocations.iter().map(|(run, _)| *run))
        .collect();
    runs.sort_by_key(|run| run.start);

    let disjoint = runs.windows(2).all(|w| w[0].end() <= w[1].start);
    let in_bounds = runs
        .iter()
        .all(|run| run.pages > 0 && run.start >= BASE && run.end() <= BASE + TOTAL_PAGES * PAGE_SIZE);

    counts == expected
        && counts.tracked() == TOTAL_PAGES
        && disjoint
        && in_bounds
        && vpa.is_balanced()
}

fn runs_in(vpa: &VirtualPageAllocator, state: RunState) -> Vec<PageRange> {
    vpa.allocations()
        .filter(|(_, s)| *s == state)
        .map(|(run, _)| run)
        .collect()
}

fn apply(vpa: &mut VirtualPageAllocator, op: &Op) -> bool {
    let before = snapshot(vpa);

    match *op {
        Op::Allocate { pages } => {
            let best = vpa
                .free_runs()
                .filter(|run| run.pages >= pages)
                .map(|run| run.pages)
                .min();
            match (vpa.allocate_pages(pages), best) {
                (Ok(addr), Some(best)) => before.1.contains(&PageRange::new(addr, best)),
                (Err(VpaError::OutOfVirtualSpace { .. }), None) => snapshot(vpa) == before,
                (Err(VpaError::NodeSupplyExhausted), Some(_)) => snapshot(vpa) == before,
                _ => false,
            }
        }
        Op::Unallocate { index } => {
            let used = runs_in(vpa, RunState::Used);
            if used.is_empty() {
                return true;
            }
            let run = used[index % used.len()];
            match vpa.unallocate_pages(run.start, run.pages) {
                Ok(released) => released,
                Err(VpaError::NodeSupplyExhausted) => snapshot(vpa) == before,
                Err(_) => false,
            }
        }
        Op::Reserve { page, pages } => {
            match vpa.reserve_pages(BASE + page * PAGE_SIZE, pages) {
                Ok(()) => true,
                Err(VpaError::Overlap { .. } | VpaError::NodeSupplyExhausted) => {
                    snapshot(vpa) == before
                }
                Err(_) => false,
            }
        }
        Op::Unreserve { index } => {
            let reserved = runs_in(vpa, RunState::Reserved);
            if reserved.is_empty() {
                return true;
            }
            let run = reserved[index % reserved.len()];
            match vpa.unreserve_pages(run.start, run.pages) {
                Ok(released) => released,
                Err(VpaError::NodeSupplyExhausted) => snapshot(vpa) == before,
                Err(_) => false,
            }
        }
        Op::CleanupFreePages => match vpa.cleanup_free_pages() {
            Ok(_) => {
                let (_, free, _) = snapshot(vpa);
                free.windows(2).all(|w| !w[0].is_adjacent_to(&w[1]))
            }
            Err(VpaError::NodeSupplyExhausted) => snapshot(vpa) == before,
            Err(_) => false,
        },
        Op::CleanupAllocations => {
            vpa.cleanup_allocations();
            let allocations: Vec<_> = vpa.allocations().collect();
            allocations
                .windows(2)
                .all(|w| w[0].1 != w[1].1 || !w[0].0.is_adjacent_to(&w[1].0))
        }
        Op::PromoteNodeSupply => {
            vpa.promote_node_supply();
            true
        }
    }
}

fn check(ops: Vec<Op>) -> bool {
    let Ok(mut vpa) = VirtualPageAllocator::new(BASE, TOTAL_PAGES) else {
        return false;
    };
    ops.iter()
        .all(|op| apply(&mut vpa, op) && invariants_hold(&vpa))
}

#[test]
fn bookkeeping_survives_random_operations() {
    let mut qc = QuickCheck::new().tests(MAX_TESTS);
    qc.quickcheck(check as fn(_) -> bool);
}

#[test]
fn bookkeeping_survives_long_runs() {
    let mut qc = QuickCheck::new().tests(20).r#gen(Gen::new(2000));
    qc.quickcheck(check as fn(_) -> bool);
}
