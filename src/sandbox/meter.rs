//! Per-step allocation accounting for execution units.
//!
//! Every allocation in the process goes through [`MeteredAllocator`]. Threads
//! with an attached [`Meter`] are charged for what they allocate and credited
//! for what they free, so a step is measured by the memory it holds, not by
//! the total it ever requested.
//!
//! The meter never fails an allocation: Rust aborts the process on a null
//! return. Growth past the budget is reported through [`Meter::over_budget`]
//! and turned into a `MemoryError` by the execution context. A single request
//! that would cross the ceiling is never handed to the system allocator; the
//! requesting thread is parked for good instead and its context abandons it.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::time::Duration;

/// Hard limit relative to the budget. The gap absorbs what a step allocates
/// between two budget checks.
const CEILING_FACTOR: isize = 4;

#[global_allocator]
static ALLOCATOR: MeteredAllocator = MeteredAllocator;

thread_local! {
    static ACTIVE: Cell<*const Meter> = const { Cell::new(ptr::null()) };
}

#[derive(Debug)]
pub struct Meter {
    budget: isize,
    live: AtomicIsize,
    baseline: AtomicIsize,
    refused: AtomicBool,
}

impl Meter {
    pub fn new(budget: u64) -> Self {
        Self {
            budget: isize::try_from(budget).unwrap_or(isize::MAX),
            live: AtomicIsize::new(0),
            baseline: AtomicIsize::new(0),
            refused: AtomicBool::new(false),
        }
    }

    /// Starts measuring a new step from what is currently held
    pub fn begin_step(&self) {
        self.baseline
            .store(self.live.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Bytes the current step holds beyond what was held when it began
    pub fn usage(&self) -> isize {
        let live = self.live.load(Ordering::Relaxed);
        live.saturating_sub(self.baseline.load(Ordering::Relaxed)).max(0)
    }

    pub fn over_budget(&self) -> bool {
        self.usage() > self.budget
    }

    /// The metered thread asked for more than the ceiling and is parked
    pub fn refused(&self) -> bool {
        self.refused.load(Ordering::Acquire)
    }

    fn ceiling(&self) -> isize {
        self.budget.saturating_mul(CEILING_FACTOR)
    }

    fn charge(&self, size: usize) -> bool {
        let size = isize::try_from(size).unwrap_or(isize::MAX);
        let live = self.live.load(Ordering::Relaxed).saturating_add(size);
        if live.saturating_sub(self.baseline.load(Ordering::Relaxed)) > self.ceiling() {
            self.refused.store(true, Ordering::Release);
            return false;
        }
        self.live.store(live, Ordering::Relaxed);
        true
    }

    fn credit(&self, size: usize) {
        let size = isize::try_from(size).unwrap_or(isize::MAX);
        self.live.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Keeps a meter attached to the current thread until dropped
pub struct Attached<'a> {
    _meter: PhantomData<&'a Meter>,
    // Attachment is per thread
    _not_send: PhantomData<*const ()>,
}

/// Charges every allocation and release on the current thread to `meter`
pub fn attach(meter: &Meter) -> Attached<'_> {
    ACTIVE.with(|active| active.set(meter));
    Attached {
        _meter: PhantomData,
        _not_send: PhantomData,
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| active.set(ptr::null()));
    }
}

fn active<'a>() -> Option<&'a Meter> {
    let meter = ACTIVE.try_with(Cell::get).unwrap_or(ptr::null());
    // SAFETY: the pointer is only non-null while an `Attached` guard borrows
    // the meter on this thread
    unsafe { meter.as_ref() }
}

fn admit(size: usize) {
    if let Some(meter) = active()
        && !meter.charge(size)
    {
        park_forever();
    }
}

fn release(size: usize) {
    if let Some(meter) = active() {
        meter.credit(size);
    }
}

/// Never returns. Sleeping does not allocate.
fn park_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

pub struct MeteredAllocator;

// SAFETY: every request is forwarded unchanged to `System`
unsafe impl GlobalAlloc for MeteredAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        admit(layout.size());
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        admit(layout.size());
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        release(layout.size());
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        if new_size > old_size {
            admit(new_size - old_size);
        } else {
            release(old_size - new_size);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}
