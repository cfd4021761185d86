use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::bitmap::MarkBitmap;
use crate::config::MarkingOptions;
use crate::heap::{HeapRegionClaimer, RegionHeap};
use crate::mark_stack::{MarkStack, MarkStackInitError, ENTRIES_PER_CHUNK};
use crate::mark_stats::{MarkStatsCache, RegionMarkStats};
use crate::obj_array::{should_be_sliced, split_slice};
use crate::object::ObjectHeader;
use crate::region::HeapRegion;
use crate::region_set::FreeRegionList;
use crate::root_regions::RootRegions;
use crate::satb::{SatbBufferClosure, SatbQueueSet};
use crate::sync::{BarrierSync, SuspendibleThreadSet, Terminator};
use crate::task_entry::TaskEntry;
use crate::task_queue::{MarkDeque, MarkDequeSet};
use crate::utils::HEAP_WORD_SIZE;

// Work-based clock periods. The clock runs when either counter crosses
// its limit, keeping the expensive time checks off the per-reference
// path.
const WORDS_SCANNED_PERIOD: usize = 12 * 1024;
const REFS_REACHED_PERIOD: usize = 1024;

// Partial local drains stop at min(capacity / 3, this).
const GC_DRAIN_STACK_TARGET_SIZE: usize = 64;

const REGION_MARK_STATS_CACHE_SIZE: usize = 1024;

// Step size for concurrent bitmap clearing, between yield checks.
const BITMAP_CLEAR_CHUNK_BYTES: usize = 1024 * 1024;

/// Root-source hook the host supplies at remark: stack roots of every
/// claimed mutator thread plus that thread's unflushed SATB entries are
/// fed into the sink.
pub trait RemarkThreadRoots {
    fn threads_do(&self, worker_id: u32, sink: &mut dyn FnMut(*mut ObjectHeader));
}

/// External weak/soft/phantom reference machinery. The marking core only
/// provides the three closures the processor drives.
pub trait ReferenceProcessor {
    fn process_discovered_references(
        &mut self,
        is_alive: &mut dyn FnMut(*mut ObjectHeader) -> bool,
        keep_alive: &mut dyn FnMut(*mut ObjectHeader),
        complete_gc: &mut dyn FnMut(),
    );
}

/// Running timing summary, enough for the step-diff predictor and the
/// end-of-phase log line.
#[derive(Default)]
struct NumberSeq {
    num: usize,
    sum: f64,
    max: f64,
}

impl NumberSeq {
    fn add(&mut self, v: f64) {
        self.num += 1;
        self.sum += v;
        if v > self.max {
            self.max = v;
        }
    }

    fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }
}

/// Global state of one marking cycle: the claim cursor, the overflow
/// stack, the per-region statistics, phase flags and the two overflow
/// barriers. Owned by the collector handle and passed to the workers
/// explicitly.
pub struct ConcurrentMark {
    heap: *const RegionHeap,
    opts: MarkingOptions,

    mark_bitmap_1: MarkBitmap,
    mark_bitmap_2: MarkBitmap,
    prev_mark_bitmap: AtomicPtr<MarkBitmap>,
    next_mark_bitmap: AtomicPtr<MarkBitmap>,

    root_regions: RootRegions,
    global_mark_stack: MarkStack,

    /// Address cursor into the collection-set chain; null means
    /// exhausted. Only ever advances within a cycle.
    finger: AtomicCell<*mut u8>,

    max_num_tasks: usize,
    num_active_tasks: AtomicUsize,
    tasks: Vec<*mut MarkTask>,
    task_queues: MarkDequeSet,

    terminator: Terminator,
    first_overflow_barrier_sync: BarrierSync,
    second_overflow_barrier_sync: BarrierSync,

    has_overflown: AtomicBool,
    concurrent: AtomicBool,
    has_aborted: AtomicBool,
    restart_for_overflow: AtomicBool,

    sts: SuspendibleThreadSet,
    satb: SatbQueueSet,

    region_mark_stats: Box<[RegionMarkStats]>,
    top_at_rebuild_starts: Box<[AtomicPtr<u8>]>,

    num_concurrent_workers: usize,
    max_concurrent_workers: usize,
    workers: Mutex<Pool>,

    remark_times_ms: Mutex<NumberSeq>,
}

unsafe impl Send for ConcurrentMark {}
unsafe impl Sync for ConcurrentMark {}

impl ConcurrentMark {
    pub fn new(heap: &RegionHeap, opts: MarkingOptions) -> Result<Box<Self>, MarkStackInitError> {
        let max_num_tasks = opts.parallel_gc_threads.max(1);
        let num_concurrent_workers = opts.conc_workers().min(max_num_tasks);

        let heap_begin = heap.reserved_begin();
        let heap_bytes = heap.options().max_heap_size;

        let mut global_mark_stack = MarkStack::new();
        global_mark_stack.initialize(opts.mark_stack_size, opts.mark_stack_size_max)?;

        let (task_queues, mut deques) = MarkDequeSet::new(max_num_tasks, opts.task_queue_capacity);

        let region_mark_stats: Box<[RegionMarkStats]> = (0..heap.max_regions())
            .map(|_| RegionMarkStats::new())
            .collect();
        let top_at_rebuild_starts: Box<[AtomicPtr<u8>]> = (0..heap.max_regions())
            .map(|_| AtomicPtr::new(null_mut()))
            .collect();

        debug!(
            "concurrent marking: {} conc workers of {} tasks",
            num_concurrent_workers, max_num_tasks
        );

        let mut cm = Box::new(Self {
            heap: heap as *const RegionHeap,
            opts,
            mark_bitmap_1: MarkBitmap::create("prev-mark-bitmap", heap_begin, heap_bytes),
            mark_bitmap_2: MarkBitmap::create("next-mark-bitmap", heap_begin, heap_bytes),
            prev_mark_bitmap: AtomicPtr::new(null_mut()),
            next_mark_bitmap: AtomicPtr::new(null_mut()),
            root_regions: RootRegions::new(heap.max_regions()),
            global_mark_stack,
            finger: AtomicCell::new(null_mut()),
            max_num_tasks,
            num_active_tasks: AtomicUsize::new(0),
            tasks: Vec::with_capacity(max_num_tasks),
            task_queues,
            terminator: Terminator::new(max_num_tasks),
            first_overflow_barrier_sync: BarrierSync::new(),
            second_overflow_barrier_sync: BarrierSync::new(),
            has_overflown: AtomicBool::new(false),
            concurrent: AtomicBool::new(false),
            has_aborted: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
            sts: SuspendibleThreadSet::new(),
            satb: SatbQueueSet::new(),
            region_mark_stats,
            top_at_rebuild_starts,
            num_concurrent_workers,
            max_concurrent_workers: num_concurrent_workers,
            workers: Mutex::new(Pool::new(max_num_tasks as u32)),
            remark_times_ms: Mutex::new(NumberSeq::default()),
        });

        cm.prev_mark_bitmap
            .store(&cm.mark_bitmap_1 as *const _ as *mut MarkBitmap, Ordering::Relaxed);
        cm.next_mark_bitmap
            .store(&cm.mark_bitmap_2 as *const _ as *mut MarkBitmap, Ordering::Relaxed);

        let cm_ptr = &mut *cm as *mut ConcurrentMark;
        let stats_ptr = cm.region_mark_stats.as_ptr();
        let max_regions = heap.max_regions();
        for worker_id in 0..max_num_tasks {
            let task = Box::new(MarkTask::new(
                worker_id as u32,
                cm_ptr,
                heap as *const RegionHeap,
                deques.remove(0),
                stats_ptr,
                max_regions,
            ));
            cm.tasks.push(Box::into_raw(task));
        }

        cm.reset_at_marking_complete();
        Ok(cm)
    }

    #[inline]
    fn heap(&self) -> &RegionHeap {
        unsafe { &*self.heap }
    }

    #[inline]
    pub fn options(&self) -> &MarkingOptions {
        &self.opts
    }

    #[inline]
    pub fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    #[inline]
    pub fn satb_queue_set(&self) -> &SatbQueueSet {
        &self.satb
    }

    #[inline]
    pub fn suspendible_thread_set(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    #[inline]
    pub fn next_mark_bitmap(&self) -> *const MarkBitmap {
        self.next_mark_bitmap.load(Ordering::Acquire)
    }

    #[inline]
    pub fn prev_mark_bitmap(&self) -> *const MarkBitmap {
        self.prev_mark_bitmap.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    fn set_has_overflown(&self) {
        self.has_overflown.store(true, Ordering::Release);
    }

    fn clear_has_overflown(&self) {
        self.has_overflown.store(false, Ordering::Release);
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    #[inline]
    pub fn finger(&self) -> *mut u8 {
        self.finger.load()
    }

    #[inline]
    pub fn out_of_regions(&self) -> bool {
        self.finger.load().is_null()
    }

    pub fn active_tasks(&self) -> usize {
        self.num_active_tasks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn task(&self, worker_id: usize) -> *mut MarkTask {
        debug_assert!(worker_id < self.max_num_tasks);
        self.tasks[worker_id]
    }

    pub fn mark_stack_push(&self, buffer: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        if !self.global_mark_stack.par_push_chunk(buffer) {
            self.set_has_overflown();
            return false;
        }
        true
    }

    pub fn mark_stack_pop(&self, buffer: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        self.global_mark_stack.par_pop_chunk(buffer)
    }

    #[inline]
    pub fn mark_stack_size(&self) -> usize {
        self.global_mark_stack.size()
    }

    #[inline]
    pub fn mark_stack_empty(&self) -> bool {
        self.global_mark_stack.is_empty()
    }

    #[inline]
    pub fn mark_stack_allocated_chunks(&self) -> usize {
        self.global_mark_stack.allocated_chunks()
    }

    fn partial_mark_stack_size_target(&self) -> usize {
        (self.global_mark_stack.capacity() / 4).max(1)
    }

    pub fn try_stealing(&self, worker_id: usize) -> Option<TaskEntry> {
        self.task_queues.steal(worker_id)
    }

    /// Hand out the region under the cursor and advance the cursor to the
    /// next chain link. Returns null at exhaustion, and also for a
    /// claimed-but-empty region, in which case the caller simply retries.
    pub fn claim_region(&self, _worker_id: u32) -> *mut HeapRegion {
        loop {
            let old_finger = self.finger.load();
            if old_finger.is_null() {
                return null_mut();
            }

            debug_assert!(self.heap().is_in_reserved(old_finger), "invariant");
            let curr_region = self.heap().heap_region_containing(old_finger);

            // The finger load above is sequentially consistent, so the
            // region field reads below cannot float ahead of it.
            let next = unsafe { (*curr_region).cset_next() };
            let end = if next.is_null() {
                null_mut()
            } else {
                unsafe { (*next).bottom() }
            };

            if self.finger.compare_exchange(old_finger, end).is_ok() {
                unsafe {
                    let bottom = (*curr_region).bottom();
                    let limit = (*curr_region).ntams();
                    if limit > bottom {
                        return curr_region;
                    }
                    // Claimed an empty region; the cursor has advanced,
                    // the caller retries for the next one.
                    debug_assert!(limit == bottom, "the region limit should be at bottom");
                    return null_mut();
                }
            }
            // Lost the race, reread the finger.
        }
    }

    fn set_concurrency(&self, active_tasks: usize) {
        assert!(active_tasks <= self.max_num_tasks, "we should not have more");
        self.num_active_tasks.store(active_tasks, Ordering::Relaxed);
        self.terminator.reset_for_reuse(active_tasks);
        self.first_overflow_barrier_sync.set_n_workers(active_tasks);
        self.second_overflow_barrier_sync.set_n_workers(active_tasks);
    }

    fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.set_concurrency(active_tasks);
        self.concurrent.store(concurrent, Ordering::Release);
        if !concurrent {
            // STW phases start after the chain has been fully handed out.
            assert!(
                self.out_of_regions(),
                "only way to get here: finger {:p}",
                self.finger()
            );
        }
    }

    fn set_finger_to_cset_head(&self) {
        let head = self.heap().collection_set_head();
        let addr = if head.is_null() {
            null_mut()
        } else {
            unsafe { (*head).bottom() }
        };
        self.finger.store(addr);
    }

    /// Re-initialize the marking structures for a restart. Worker 0 runs
    /// this between the two overflow barriers (concurrent phase), the
    /// remark pause runs it when scheduling the restart.
    pub fn reset_marking_for_restart(&self) {
        // The stack is drained at this point; expansion requires that.
        let stack = unsafe { &mut *(std::ptr::addr_of!(self.global_mark_stack) as *mut MarkStack) };
        stack.set_empty();

        if self.has_overflown() {
            stack.expand();
            for stats in self.region_mark_stats.iter() {
                stats.clear_during_overflow();
            }
        }

        self.clear_has_overflown();
        self.set_finger_to_cset_head();

        self.task_queues.set_empty();
    }

    fn reset_at_marking_complete(&self) {
        self.reset_marking_for_restart();
        self.num_active_tasks.store(0, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.has_aborted.store(false, Ordering::Release);
        self.reset_marking_for_restart();

        for &task in self.tasks.iter() {
            unsafe {
                (*task).reset(self.next_mark_bitmap());
            }
        }

        for i in 0..self.heap().max_regions() {
            self.top_at_rebuild_starts[i].store(null_mut(), Ordering::Relaxed);
            self.region_mark_stats[i].clear();
        }
    }

    pub fn clear_statistics_in_region(&self, region_idx: u32) {
        for &task in self.tasks.iter() {
            unsafe {
                (*task).clear_mark_stats_cache(region_idx);
            }
        }
        self.top_at_rebuild_starts[region_idx as usize].store(null_mut(), Ordering::Relaxed);
        self.region_mark_stats[region_idx as usize].clear();
    }

    fn clear_statistics(&self, r: *mut HeapRegion) {
        unsafe {
            let region_idx = (*r).index();
            if (*r).is_humongous() {
                assert!((*r).is_starts_humongous(), "got humongous continues region here");
                let size_in_regions = self
                    .heap()
                    .humongous_obj_size_in_regions((*((*r).bottom() as *mut ObjectHeader)).word_size());
                for j in region_idx..(region_idx + size_in_regions as u32) {
                    self.clear_statistics_in_region(j);
                }
            } else {
                self.clear_statistics_in_region(region_idx);
            }
        }
    }

    /// A humongous object found dead outside the marking pass loses its
    /// marks and its gathered statistics.
    pub fn humongous_object_eagerly_reclaimed(&self, r: *mut HeapRegion) {
        unsafe {
            let bottom = (*r).bottom();
            let prev = &*self.prev_mark_bitmap();
            let next = &*self.next_mark_bitmap();
            if prev.is_marked(bottom) {
                prev.clear(bottom);
            }
            if next.is_marked(bottom) {
                next.clear(bottom);
            }
        }
        self.clear_statistics(r);
    }

    pub fn region_live_words(&self, region_idx: u32) -> usize {
        self.region_mark_stats[region_idx as usize].live_words()
    }

    pub fn top_at_rebuild_start(&self, region_idx: u32) -> *mut u8 {
        self.top_at_rebuild_starts[region_idx as usize].load(Ordering::Relaxed)
    }

    fn update_top_at_rebuild_start(&self, r: *mut HeapRegion) {
        unsafe {
            let region_idx = (*r).index() as usize;
            debug_assert!(
                self.top_at_rebuild_starts[region_idx].load(Ordering::Relaxed).is_null(),
                "TARS for region {} already set",
                region_idx
            );
            // Only regions the RemSet rebuild will scan carry a TARS.
            if (*r).is_old() || (*r).is_starts_humongous() {
                self.top_at_rebuild_starts[region_idx].store((*r).top(), Ordering::Relaxed);
            }
        }
    }

    pub fn add_to_liveness(&self, worker_id: u32, obj: *const ObjectHeader, size: usize) {
        unsafe {
            (*self.task(worker_id as usize)).update_liveness(obj, size);
        }
    }

    fn do_yield_check(&self) {
        if self.sts.should_yield() {
            self.sts.yield_now();
        }
    }

    /*
     * Both barrier entries leave the suspendible thread set for the
     * blocking wait and rejoin afterwards, otherwise one worker waiting
     * in the barrier and another trying to yield for a safepoint
     * deadlock against each other. During remark the workers never
     * joined the set, so the leave/join pair is skipped.
     */
    fn enter_first_sync_barrier(&self, _worker_id: u32) -> bool {
        let concurrent = self.concurrent();
        if concurrent {
            self.sts.leave();
        }
        let entered = self.first_overflow_barrier_sync.enter();
        if concurrent {
            self.sts.join();
        }
        entered
    }

    fn enter_second_sync_barrier(&self, _worker_id: u32) {
        let concurrent = self.concurrent();
        if concurrent {
            self.sts.leave();
        }
        self.second_overflow_barrier_sync.enter();
        if concurrent {
            self.sts.join();
        }
    }

    fn calc_active_marking_workers(&self) -> usize {
        self.num_concurrent_workers.clamp(1, self.max_concurrent_workers.max(1))
    }

    fn run_gang(&self, n_workers: usize, f: impl Fn(usize) + Sync) {
        let mut pool = self.workers.lock();
        pool.scoped(|scope| {
            for worker_id in 0..n_workers {
                let f = &f;
                scope.execute(move || f(worker_id));
            }
        });
    }

    // Cycle phases, invoked by the external scheduler in order.

    /// STW: reset marking structures and snapshot NTAMS for every region.
    pub fn pre_initial_mark(&self) {
        self.reset();

        let next_bitmap = self.next_mark_bitmap();
        for i in 0..self.heap().num_regions() {
            unsafe {
                (*self.heap().region_at(i)).note_start_of_marking(next_bitmap);
            }
        }
        self.set_finger_to_cset_head();

        self.root_regions.reset();
    }

    /// STW: activate the write barrier and arm the root-region scan.
    pub fn post_initial_mark(&self) {
        self.satb.set_active_all_threads(true, false);
        self.root_regions.prepare_for_scan();
    }

    fn scan_root_region(&self, hr: *mut HeapRegion, worker_id: u32) {
        unsafe {
            debug_assert!(
                (*hr).is_old() || ((*hr).is_survivor() && (*hr).ntams() == (*hr).bottom()),
                "root regions must be old or survivor but region {} is {}",
                (*hr).index(),
                (*hr).kind().as_str()
            );
            let task = &mut *self.task(worker_id as usize);

            // Everything in [NTAMS, top) is implicitly live; its referents
            // must survive, so mark and enqueue them.
            let mut curr = (*hr).ntams();
            let end = (*hr).top();
            while curr < end {
                let obj = curr as *mut ObjectHeader;
                let size = (*obj).oop_iterate(|slot| {
                    let referent = (*(slot as *const AtomicPtr<ObjectHeader>)).load(Ordering::Acquire);
                    if !referent.is_null() {
                        task.increment_refs_reached();
                        task.make_reference_alive(referent);
                    }
                });
                curr = curr.add(size * HEAP_WORD_SIZE);
            }
        }
    }

    /// Concurrent: drain the root-region registry with a small gang.
    pub fn scan_root_regions(&self) {
        if !self.root_regions.scan_in_progress() {
            return;
        }
        assert!(
            !self.has_aborted(),
            "aborting before root region scanning is finished not supported"
        );

        let n_workers = self
            .calc_active_marking_workers()
            .min(self.root_regions.num_root_regions())
            .max(1);
        debug!(
            "running root region scan using {} workers for {} work units",
            n_workers,
            self.root_regions.num_root_regions()
        );

        let cm_addr = self as *const Self as usize;
        self.run_gang(n_workers, move |worker_id| {
            let cm = unsafe { &*(cm_addr as *const ConcurrentMark) };
            loop {
                let hr = cm.root_regions.claim_next();
                if hr.is_null() {
                    break;
                }
                cm.scan_root_region(hr, worker_id as u32);
            }
        });

        self.root_regions.scan_finished();
    }

    fn run_marking_worker(&self, worker_id: usize) {
        self.sts.join();

        assert!(worker_id < self.active_tasks(), "invariant");
        let task = self.task(worker_id);
        unsafe {
            (*task).record_start_time();
            if !self.has_aborted() {
                loop {
                    (*task).do_marking_step(
                        self.opts.conc_mark_step_millis,
                        true,  /* do_termination */
                        false, /* is_serial */
                    );

                    self.do_yield_check();
                    if self.has_aborted() || !(*task).has_aborted() {
                        break;
                    }
                }
            }
            (*task).record_end_time();
            assert!(
                !(*task).has_aborted() || self.has_aborted(),
                "invariant"
            );
        }

        self.sts.leave();
    }

    /// The concurrent marking phase proper.
    pub fn mark_from_roots(&self) {
        self.restart_for_overflow.store(false, Ordering::Release);

        let active_workers = self.calc_active_marking_workers();
        info!("using {} workers for marking", active_workers);

        self.set_concurrency_and_phase(active_workers, true /* concurrent */);

        let cm_addr = self as *const Self as usize;
        self.run_gang(active_workers, move |worker_id| {
            let cm = unsafe { &*(cm_addr as *const ConcurrentMark) };
            cm.run_marking_worker(worker_id);
        });
        self.print_stats();
    }

    fn finalize_marking(&self, threads: Option<&(dyn RemarkThreadRoots + Sync)>) {
        let active_workers = self.max_num_tasks;
        self.set_concurrency_and_phase(active_workers, false /* concurrent */);
        self.terminator.reset_for_reuse(active_workers);

        let cm_addr = self as *const Self as usize;
        self.run_gang(active_workers, move |worker_id| {
            let cm = unsafe { &*(cm_addr as *const ConcurrentMark) };
            let task = cm.task(worker_id);
            unsafe {
                (*task).record_start_time();
                if let Some(threads) = threads {
                    let task = &mut *task;
                    threads.threads_do(task.worker_id(), &mut |obj| {
                        if !obj.is_null() {
                            task.increment_refs_reached();
                            task.make_reference_alive(obj);
                        }
                    });
                }
                loop {
                    (*task).do_marking_step(
                        1_000_000_000.0, /* something very large */
                        true,            /* do_termination */
                        false,           /* is_serial */
                    );
                    // On overflow we do not want to restart here, the
                    // pause schedules a whole new concurrent mark.
                    if !((*task).has_aborted() && !cm.has_overflown()) {
                        break;
                    }
                }
                (*task).record_end_time();
            }
        });

        assert!(
            self.has_overflown() || self.satb.completed_buffers_num() == 0,
            "invariant: has_overflown = {}, num buffers = {}",
            self.has_overflown(),
            self.satb.completed_buffers_num()
        );

        self.print_stats();
    }

    /// STW remark pause: finish marking from SATB, then either complete
    /// the cycle (weak refs, cache flush, bitmap swap, empty-region
    /// reclaim) or schedule a restart after overflow.
    pub fn remark(
        &self,
        threads: Option<&(dyn RemarkThreadRoots + Sync)>,
        mut ref_processor: Option<&mut dyn ReferenceProcessor>,
    ) {
        if self.has_aborted() {
            return;
        }

        let start = Instant::now();
        self.finalize_marking(threads);

        let mark_finished = !self.has_overflown();
        if mark_finished {
            if let Some(rp) = ref_processor.as_deref_mut() {
                self.weak_refs_work(rp);
            }

            // End of the cycle, the write barrier goes quiet.
            self.satb.set_active_all_threads(false, true);

            self.flush_all_task_caches();
            self.swap_mark_bitmaps();

            for i in 0..self.heap().num_regions() {
                self.update_top_at_rebuild_start(self.heap().region_at(i));
            }

            self.reclaim_empty_regions();

            assert!(!self.restart_for_overflow(), "sanity");
            self.reset_at_marking_complete();
        } else {
            // We overflowed, restart concurrent marking.
            self.restart_for_overflow.store(true, Ordering::Release);
            self.reset_marking_for_restart();
        }

        self.remark_times_ms
            .lock()
            .add(start.elapsed().as_secs_f64() * 1000.0);
    }

    fn weak_refs_work(&self, rp: &mut dyn ReferenceProcessor) {
        // Reference processing drives a single serial task.
        self.set_concurrency_and_phase(1, false);

        let cm_ptr = self as *const Self;
        let task = self.task(0);
        let drain_interval = self.opts.ref_proc_drain_interval.max(1);
        let mut ref_counter = drain_interval;

        let mut is_alive = move |obj: *mut ObjectHeader| unsafe { (*cm_ptr).is_alive(obj) };
        let mut keep_alive = move |obj: *mut ObjectHeader| unsafe {
            let t = &mut *task;
            if obj.is_null() {
                return;
            }
            t.increment_refs_reached();
            t.make_reference_alive(obj);
            ref_counter -= 1;
            if ref_counter == 0 {
                t.drain_local_queue(true);
                t.drain_global_stack(true);
                ref_counter = drain_interval;
            }
        };
        let mut complete_gc = move || unsafe {
            let t = &mut *task;
            loop {
                t.do_marking_step(
                    1_000_000_000.0,
                    false, /* do_termination */
                    true,  /* is_serial */
                );
                if !t.has_aborted() || (*cm_ptr).has_overflown() {
                    break;
                }
            }
        };

        rp.process_discovered_references(&mut is_alive, &mut keep_alive, &mut complete_gc);
    }

    /// Single-threaded reference precleaning between concurrent mark and
    /// remark, shaving work off the pause.
    pub fn preclean(&self, rp: &mut dyn ReferenceProcessor) {
        assert!(
            self.opts.use_reference_precleaning,
            "precleaning must be enabled"
        );
        self.sts.join();
        self.set_concurrency_and_phase(1, true);

        let cm_ptr = self as *const Self;
        let task = self.task(0);

        let mut is_alive = move |obj: *mut ObjectHeader| unsafe { (*cm_ptr).is_alive(obj) };
        let mut keep_alive = move |obj: *mut ObjectHeader| unsafe {
            let t = &mut *task;
            if !obj.is_null() {
                t.increment_refs_reached();
                t.make_reference_alive(obj);
            }
        };
        let mut complete_gc = move || unsafe {
            let t = &mut *task;
            t.do_marking_step(1_000_000_000.0, false, true);
        };
        rp.process_discovered_references(&mut is_alive, &mut keep_alive, &mut complete_gc);

        self.sts.leave();
    }

    /// Liveness query handed to the reference processor: everything
    /// outside the reserved heap is live, inside it the NTAMS rule and
    /// the next bitmap decide.
    pub fn is_alive(&self, obj: *mut ObjectHeader) -> bool {
        let addr = obj as *const u8;
        if !self.heap().is_in_reserved(addr) {
            return true;
        }
        unsafe {
            let r = self.heap().heap_region_containing(addr);
            if (*r).obj_allocated_since_next_marking(addr) {
                return true;
            }
            (*self.next_mark_bitmap()).is_marked(addr)
        }
    }

    fn flush_all_task_caches(&self) {
        let mut hits = 0;
        let mut misses = 0;
        for &task in self.tasks.iter() {
            let (h, m) = unsafe { (*task).flush_mark_stats_cache() };
            hits += h;
            misses += m;
        }
        let sum = hits + misses;
        debug!(
            "mark stats cache hits {} misses {} ratio {:.3}",
            hits,
            misses,
            if sum == 0 { 0.0 } else { hits as f64 / sum as f64 }
        );
    }

    fn swap_mark_bitmaps(&self) {
        let prev = self.prev_mark_bitmap.load(Ordering::Acquire);
        let next = self.next_mark_bitmap.load(Ordering::Acquire);
        self.prev_mark_bitmap.store(next, Ordering::Release);
        self.next_mark_bitmap.store(prev, Ordering::Release);
    }

    /// Regions that marked no live word and saw no allocation since the
    /// NTAMS snapshot are handed back to the free list. Each worker
    /// collects into a local list, merged into the global cleanup list
    /// under one lock acquisition.
    fn reclaim_empty_regions(&self) {
        let n_workers = self.max_num_tasks;
        let claimer = HeapRegionClaimer::new(self.heap().num_regions(), n_workers);
        let cleanup_list = Mutex::new(FreeRegionList::new("Empty Regions After Mark List"));
        let cm_addr = self as *const Self as usize;
        let claimer_ref = &claimer;
        let cleanup_ref = &cleanup_list;

        self.run_gang(n_workers, move |worker_id| {
            let cm = unsafe { &*(cm_addr as *const ConcurrentMark) };
            let mut local_cleanup_list = FreeRegionList::new("Local Cleanup List");
            cm.heap()
                .par_iterate_regions_from_worker_offset(claimer_ref, worker_id, |hr| {
                    unsafe {
                        let r = &*hr;
                        // Continuations are reclaimed with their start.
                        if r.is_continues_humongous() || r.is_young() || r.is_archive() {
                            return false;
                        }
                        if r.used() == 0
                            || cm.region_live_words(r.index()) != 0
                            || r.top() != r.ntams()
                        {
                            return false;
                        }

                        let index = r.index();
                        if r.is_starts_humongous() {
                            let obj = r.bottom() as *mut ObjectHeader;
                            let num = cm
                                .heap()
                                .humongous_obj_size_in_regions((*obj).word_size());
                            for j in 0..num {
                                let part = cm.heap().region_at(index as usize + j);
                                cm.heap().free_region(part, &mut local_cleanup_list);
                                cm.clear_statistics_in_region(index + j as u32);
                            }
                        } else {
                            cm.heap().free_region(hr, &mut local_cleanup_list);
                            cm.clear_statistics_in_region(index);
                        }
                        trace!("reclaimed empty region {}", index);
                    }
                    false
                });

            if !local_cleanup_list.is_empty() {
                let mut cleanup = cleanup_ref.lock();
                cleanup.add_ordered_list(&mut local_cleanup_list);
            }
        });

        let mut cleanup = cleanup_list.lock();
        if !cleanup.is_empty() {
            debug!("reclaimed {} empty regions", cleanup.length());
            self.heap().prepend_to_freelist(&mut cleanup);
        }
    }

    fn clear_bitmap(&self, bitmap: *const MarkBitmap, n_workers: usize, may_yield: bool) {
        let claimer = HeapRegionClaimer::new(self.heap().num_regions(), n_workers);
        let cm_addr = self as *const Self as usize;
        let claimer_ref = &claimer;
        let bitmap_addr = bitmap as usize;

        self.run_gang(n_workers, move |worker_id| {
            let cm = unsafe { &*(cm_addr as *const ConcurrentMark) };
            let bitmap = unsafe { &*(bitmap_addr as *const MarkBitmap) };
            if may_yield {
                cm.sts.join();
            }
            cm.heap()
                .par_iterate_regions_from_worker_offset(claimer_ref, worker_id, |hr| {
                    unsafe {
                        let mut cur = (*hr).bottom();
                        let end = (*hr).end();
                        while cur < end {
                            let chunk_end = end.min(cur.add(BITMAP_CLEAR_CHUNK_BYTES));
                            bitmap.clear_range(cur, chunk_end);
                            cur = chunk_end;

                            if may_yield {
                                cm.do_yield_check();
                                if cm.has_aborted() {
                                    return true;
                                }
                            }
                        }
                    }
                    false
                });
            if may_yield {
                cm.sts.leave();
            }
        });
    }

    /// Concurrent, yielding clear of the next bitmap, preparing it for
    /// the following cycle.
    pub fn cleanup_for_next_mark(&self) {
        self.clear_bitmap(self.next_mark_bitmap(), self.max_concurrent_workers, true);
    }

    /// Safepoint-only clear of the prev bitmap.
    pub fn clear_prev_bitmap(&self) {
        self.clear_bitmap(self.prev_mark_bitmap(), self.max_num_tasks, false);
    }

    /// External cancellation (host shutdown, full collection).
    pub fn concurrent_cycle_abort(&self) {
        self.has_aborted.store(true, Ordering::Release);
        self.satb.abandon_partial_marking();
        if self.satb.is_active() {
            self.satb.set_active_all_threads(false, true);
        }
        self.first_overflow_barrier_sync.abort();
        self.second_overflow_barrier_sync.abort();
        self.root_regions.cancel_scan();
        warn!("concurrent mark abort");
    }

    fn print_stats(&self) {
        for worker_id in 0..self.active_tasks() {
            unsafe {
                (*self.task(worker_id)).print_stats();
            }
        }
    }

    /// Convenience driver running one whole marking cycle, restarting
    /// after overflow the way the external scheduler would.
    pub fn run_marking_cycle(
        &self,
        threads: Option<&(dyn RemarkThreadRoots + Sync)>,
        mut ref_processor: Option<&mut dyn ReferenceProcessor>,
    ) {
        self.pre_initial_mark();
        self.post_initial_mark();
        self.scan_root_regions();
        loop {
            self.mark_from_roots();
            if self.has_aborted() {
                return;
            }
            match ref_processor {
                Some(ref mut rp) => self.remark(threads, Some(&mut **rp)),
                None => self.remark(threads, None),
            }
            if !self.restart_for_overflow() {
                break;
            }
            info!("restarting marking after mark stack overflow");
        }
    }
}

impl Drop for ConcurrentMark {
    fn drop(&mut self) {
        for &task in self.tasks.iter() {
            unsafe {
                drop(Box::from_raw(task));
            }
        }
    }
}

/// Per-worker marking task: the claim-a-region loop, the drains, the
/// work-based clock and the overflow protocol, plus the bindings the
/// scan closures need (current region, current alive bitmap, stats
/// cache).
pub struct MarkTask {
    worker_id: u32,
    cm: *mut ConcurrentMark,
    heap: *const RegionHeap,

    task_queue: MarkDeque,
    mark_stats_cache: MarkStatsCache,

    next_mark_bitmap: *const MarkBitmap,

    curr_region: *mut HeapRegion,
    curr_alive_bitmap: *const MarkBitmap,
    curr_dest_bitmap: *const MarkBitmap,
    /// NTAMS of the current region; null exactly when `curr_region` is.
    region_limit: *mut u8,

    calls: usize,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,
    oop_closure_bound: bool,

    time_target_ms: f64,
    step_start: Instant,
    cycle_start: Instant,
    elapsed_time_ms: f64,
    termination_time_ms: f64,
    step_times_ms: NumberSeq,
    marking_step_diffs_ms: NumberSeq,
}

unsafe impl Send for MarkTask {}

struct TaskSatbClosure<'a> {
    task: &'a mut MarkTask,
}

impl<'a> SatbBufferClosure for TaskSatbClosure<'a> {
    fn do_buffer(&mut self, buffer: &[*mut ObjectHeader]) {
        for &obj in buffer {
            if !obj.is_null() {
                self.task.increment_refs_reached();
                self.task.make_reference_alive(obj);
            }
        }
    }
}

impl MarkTask {
    fn new(
        worker_id: u32,
        cm: *mut ConcurrentMark,
        heap: *const RegionHeap,
        task_queue: MarkDeque,
        mark_stats: *const RegionMarkStats,
        max_regions: usize,
    ) -> Self {
        let mut task = Self {
            worker_id,
            cm,
            heap,
            task_queue,
            mark_stats_cache: MarkStatsCache::new(
                mark_stats,
                max_regions,
                REGION_MARK_STATS_CACHE_SIZE,
            ),
            next_mark_bitmap: core::ptr::null(),
            curr_region: null_mut(),
            curr_alive_bitmap: core::ptr::null(),
            curr_dest_bitmap: core::ptr::null(),
            region_limit: null_mut(),
            calls: 0,
            words_scanned: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            oop_closure_bound: false,
            time_target_ms: 0.0,
            step_start: Instant::now(),
            cycle_start: Instant::now(),
            elapsed_time_ms: 0.0,
            termination_time_ms: 0.0,
            step_times_ms: NumberSeq::default(),
            marking_step_diffs_ms: NumberSeq::default(),
        };
        // Seed the predictor so the first step does not run the full
        // target.
        task.marking_step_diffs_ms.add(0.5);
        task
    }

    #[inline]
    fn cm(&self) -> &ConcurrentMark {
        unsafe { &*self.cm }
    }

    #[inline]
    fn heap(&self) -> &RegionHeap {
        unsafe { &*self.heap }
    }

    #[inline]
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    fn clear_has_aborted(&mut self) {
        self.has_aborted = false;
    }

    pub fn queue_size(&self) -> usize {
        self.task_queue.size()
    }

    pub fn words_scanned(&self) -> usize {
        self.words_scanned
    }

    /// Destination bitmap of the current region, carried for the
    /// compaction collaborator.
    pub fn curr_dest_bitmap(&self) -> *const MarkBitmap {
        self.curr_dest_bitmap
    }

    pub fn reset(&mut self, next_mark_bitmap: *const MarkBitmap) {
        assert!(!next_mark_bitmap.is_null(), "invariant");
        self.next_mark_bitmap = next_mark_bitmap;
        self.clear_region_fields();

        self.calls = 0;
        self.elapsed_time_ms = 0.0;
        self.termination_time_ms = 0.0;
        self.words_scanned = 0;
        self.refs_reached = 0;

        self.mark_stats_cache.reset_all();
    }

    pub fn record_start_time(&mut self) {
        self.cycle_start = Instant::now();
    }

    pub fn record_end_time(&mut self) {
        self.elapsed_time_ms += self.cycle_start.elapsed().as_secs_f64() * 1000.0;
    }

    fn setup_for_region(&mut self, hr: *mut HeapRegion) {
        assert!(!hr.is_null(), "claim_region() should have filtered out null regions");
        self.curr_region = hr;
        unsafe {
            self.curr_alive_bitmap = (*hr).alive_bitmap();
            self.curr_dest_bitmap = (*hr).dest_bitmap();
            self.region_limit = (*hr).ntams();
        }
    }

    fn giveup_current_region(&mut self) {
        assert!(!self.curr_region.is_null(), "invariant");
        self.clear_region_fields();
    }

    fn clear_region_fields(&mut self) {
        self.curr_region = null_mut();
        self.curr_alive_bitmap = core::ptr::null();
        self.curr_dest_bitmap = core::ptr::null();
        self.region_limit = null_mut();
    }

    pub fn clear_mark_stats_cache(&mut self, region_idx: u32) {
        self.mark_stats_cache.reset(region_idx);
    }

    pub fn flush_mark_stats_cache(&mut self) -> (usize, usize) {
        self.mark_stats_cache.evict_all()
    }

    #[inline]
    pub fn increment_refs_reached(&mut self) {
        self.refs_reached += 1;
    }

    #[inline]
    fn update_liveness(&mut self, obj: *const ObjectHeader, size: usize) {
        let region_idx = self.heap().addr_to_region_index(obj as *const u8);
        self.mark_stats_cache.add_live_words(region_idx, size);
    }

    fn recalculate_limits(&mut self) {
        self.real_words_scanned_limit = self.words_scanned + WORDS_SCANNED_PERIOD;
        self.words_scanned_limit = self.real_words_scanned_limit;

        self.real_refs_reached_limit = self.refs_reached + REFS_REACHED_PERIOD;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pull the next clock call closer after an infrequent expensive
    /// operation raised the per-word cost.
    fn decrease_limits(&mut self) {
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * WORDS_SCANNED_PERIOD / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * REFS_REACHED_PERIOD / 4);
    }

    #[inline]
    fn check_limits(&mut self) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.reached_limit();
        }
    }

    fn reached_limit(&mut self) {
        debug_assert!(
            self.words_scanned >= self.words_scanned_limit
                || self.refs_reached >= self.refs_reached_limit,
            "shouldn't have been called otherwise"
        );
        self.abort_marking_if_regular_check_fail();
    }

    fn abort_marking_if_regular_check_fail(&mut self) {
        if !self.regular_clock_call() {
            self.set_has_aborted();
        }
    }

    /// The marking clock. Returns false when this step must abort; the
    /// checks run in a fixed order so the cheapest global conditions win.
    fn regular_clock_call(&mut self) -> bool {
        if self.has_aborted() {
            return false;
        }

        self.recalculate_limits();

        // (1) A flagged overflow aborts everyone.
        if self.cm().has_overflown() {
            return false;
        }

        // Everything below only applies to the concurrent phase.
        if !self.cm().concurrent() {
            return true;
        }

        // (2) Marking aborted for a full collection.
        if self.cm().has_aborted() {
            return false;
        }

        // (3) A pending safepoint wants us off the heap.
        if self.cm().sts.should_yield() {
            return false;
        }

        // (4) The soft time target ran out.
        let elapsed_time_ms = self.step_start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_time_ms > self.time_target_ms {
            self.has_timed_out = true;
            return false;
        }

        // (5) Completed SATB buffers want processing and we are not the
        // one already draining them.
        if !self.draining_satb_buffers && self.cm().satb.process_completed_buffers() {
            return false;
        }

        true
    }

    // Work movement between the local deque and the global stack.

    fn move_entries_to_global_stack(&mut self) {
        let mut buffer = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        let mut n = 0;
        while n < ENTRIES_PER_CHUNK {
            match self.task_queue.pop_local() {
                Some(entry) => {
                    buffer[n] = entry;
                    n += 1;
                }
                None => break,
            }
        }

        if n > 0 && !self.cm().mark_stack_push(&buffer) {
            self.set_has_aborted();
        }

        // This was expensive, get the clock called earlier.
        self.decrease_limits();
    }

    fn get_entries_from_global_stack(&mut self) -> bool {
        let mut buffer = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        if !self.cm().mark_stack_pop(&mut buffer) {
            return false;
        }

        for entry in buffer {
            if entry.is_null() {
                break;
            }
            self.push(entry);
        }

        self.decrease_limits();
        true
    }

    fn push(&mut self, entry: TaskEntry) {
        if !self.task_queue.push_local(entry) {
            // The local queue is full; spilling a chunk frees at least
            // ENTRIES_PER_CHUNK slots (or everything we had), so the
            // retry cannot fail.
            self.move_entries_to_global_stack();
            let success = self.task_queue.push_local(entry);
            assert!(success, "invariant");
        }
    }

    pub fn drain_local_queue(&mut self, partially: bool) {
        if self.has_aborted() {
            return;
        }

        // Partial drains leave entries behind for others to steal.
        let target_size = if partially {
            (self.task_queue.max_elems() / 3).min(GC_DRAIN_STACK_TARGET_SIZE)
        } else {
            0
        };

        if self.task_queue.size() > target_size {
            while let Some(entry) = self.task_queue.pop_local() {
                self.scan_task_entry(entry);
                if self.task_queue.size() <= target_size || self.has_aborted() {
                    break;
                }
            }
        }
    }

    pub fn drain_global_stack(&mut self, partially: bool) {
        if self.has_aborted() {
            return;
        }

        debug_assert!(
            partially || self.task_queue.size() == 0,
            "local queue drains before the global stack"
        );

        if partially {
            let target = self.cm().partial_mark_stack_size_target();
            while !self.has_aborted() && self.cm().mark_stack_size() > target {
                if self.get_entries_from_global_stack() {
                    self.drain_local_queue(partially);
                } else {
                    break;
                }
            }
        } else {
            while !self.has_aborted() && self.get_entries_from_global_stack() {
                self.drain_local_queue(partially);
            }
        }
    }

    fn drain_satb_buffers(&mut self) {
        if self.has_aborted() {
            return;
        }

        // Keep the clock from aborting us for the very buffers we are
        // processing.
        self.draining_satb_buffers = true;

        let cm = self.cm as *const ConcurrentMark;
        loop {
            if self.has_aborted() {
                break;
            }
            let mut closure = TaskSatbClosure { task: self };
            let more = unsafe { (*cm).satb.apply_closure_to_completed_buffer(&mut closure) };
            if !more {
                break;
            }
            self.abort_marking_if_regular_check_fail();
        }

        self.draining_satb_buffers = false;

        debug_assert!(
            self.has_aborted()
                || self.cm().concurrent()
                || self.cm().satb.completed_buffers_num() == 0,
            "invariant"
        );

        self.decrease_limits();
    }

    // Scanning.

    /// Mark `obj` in its region's alive bitmap, obeying the NTAMS rule.
    /// Returns true iff this call flipped the bit.
    fn mark_in_alive_bitmap(&mut self, hr: *mut HeapRegion, obj: *mut ObjectHeader) -> bool {
        unsafe {
            debug_assert!(
                (*hr).is_in_reserved(obj as *const u8),
                "marking object {:p} outside region {}",
                obj,
                (*hr).index()
            );

            if (*hr).obj_allocated_since_next_marking(obj as *const u8) {
                return false;
            }

            // A continuation's bitmap is never consulted; the sole object
            // of the run is marked at the start region's bottom.
            debug_assert!(!(*hr).is_continues_humongous(), "invariant");

            let bitmap = (*hr).alive_bitmap();
            debug_assert!(!bitmap.is_null(), "region {} has no bound alive bitmap", (*hr).index());
            debug_assert!(
                bitmap == self.next_mark_bitmap,
                "region alive bitmap is not this cycle's next bitmap"
            );
            if hr == self.curr_region {
                debug_assert!(bitmap == self.curr_alive_bitmap, "bound bitmap mismatch");
            }

            let success = (*bitmap).par_mark(obj as *const u8);
            if success {
                self.update_liveness(obj, (*obj).word_size());
            }
            success
        }
    }

    /// Mark the object and, when newly marked, queue it for scanning.
    /// Primitive arrays carry no references and are only accounted.
    pub fn make_reference_alive(&mut self, obj: *mut ObjectHeader) -> bool {
        let hr = self.heap().heap_region_containing(obj as *const u8);

        if !self.mark_in_alive_bitmap(hr, obj) {
            return false;
        }

        let entry = TaskEntry::from_obj(obj);
        if unsafe { (*obj).is_prim_array() } {
            self.process_grey_task_entry::<false>(entry);
        } else {
            self.push(entry);
        }

        true
    }

    /// Field closure: follow one reference slot of an object living in
    /// `scan_region`. References leaving the region are dropped here;
    /// the other region sees them through its own target-object queue.
    fn deal_with_reference(&mut self, scan_region: *mut HeapRegion, slot: *mut *mut ObjectHeader) {
        self.increment_refs_reached();

        let obj =
            unsafe { (*(slot as *const AtomicPtr<ObjectHeader>)).load(Ordering::Acquire) };
        if obj.is_null() {
            return;
        }

        if !unsafe { (*scan_region).is_in_reserved(obj as *const u8) } {
            return;
        }

        self.make_reference_alive(obj);
    }

    /// Root dispatch for the region's target-object queue: the queue
    /// holds references into the region; anything else is a stale entry
    /// and dropped.
    fn dispatch_target_obj(&mut self, entry: TaskEntry) {
        debug_assert!(entry.is_obj(), "target queues hold whole objects");
        self.increment_refs_reached();

        let obj = entry.obj();
        if !unsafe { (*self.curr_region).is_in_reserved(obj as *const u8) } {
            return;
        }
        self.make_reference_alive(obj);
    }

    fn trim_target_object_queue(&mut self, queue: *const crate::task_queue::TargetObjQueue) {
        loop {
            if self.has_aborted() {
                return;
            }
            let entry = match unsafe { (*queue).pop() } {
                Some(entry) => entry,
                None => return,
            };
            self.dispatch_target_obj(entry);
            self.check_limits();
        }
    }

    pub fn scan_task_entry(&mut self, entry: TaskEntry) {
        self.process_grey_task_entry::<true>(entry);
    }

    fn process_grey_task_entry<const SCAN: bool>(&mut self, entry: TaskEntry) {
        debug_assert!(
            SCAN || (entry.is_obj() && unsafe { (*entry.obj()).is_prim_array() }),
            "skipping scan of grey non-primitive-array"
        );
        debug_assert!(
            entry.is_array_slice() || self.is_marked_in_region_bitmap(entry.base_obj()),
            "any stolen object should be a slice or marked"
        );

        if SCAN {
            let words = if entry.is_array_slice() {
                let (base, from, len) = entry.slice();
                self.process_array_slice(base, from, len)
            } else {
                let obj = entry.obj();
                if should_be_sliced(obj) {
                    self.process_obj_array(obj)
                } else {
                    self.scan_object_fields(obj)
                }
            };
            self.words_scanned += words;
        }

        self.check_limits();
    }

    fn is_marked_in_region_bitmap(&self, obj: *mut ObjectHeader) -> bool {
        unsafe {
            let hr = self.heap().heap_region_containing(obj as *const u8);
            let bitmap = (*hr).alive_bitmap();
            !bitmap.is_null() && (*bitmap).is_marked(obj as *const u8)
        }
    }

    fn scan_object_fields(&mut self, obj: *mut ObjectHeader) -> usize {
        let scan_region = self.heap().heap_region_containing(obj as *const u8);
        let task = self as *mut Self;
        unsafe {
            (*obj).oop_iterate(|slot| {
                (*task).deal_with_reference(scan_region, slot);
            })
        }
    }

    /// First visit of a large reference array: scan the head slice and
    /// queue the tail.
    fn process_obj_array(&mut self, obj: *mut ObjectHeader) -> usize {
        debug_assert!(should_be_sliced(obj), "invariant");
        let len = unsafe { (*obj).ref_len() } as u32;
        let overhead = unsafe { (*obj).word_size() - (*obj).ref_len() };
        overhead + self.process_array_slice(obj, 0, len)
    }

    /// Scan up to one slice step of elements and re-push the remaining
    /// tail, keeping single arrays from starving the clock.
    fn process_array_slice(&mut self, base: *mut ObjectHeader, from: u32, remaining: u32) -> usize {
        let (to, tail) = split_slice(from, remaining);
        if let Some((tail_from, tail_len)) = tail {
            self.push(TaskEntry::from_slice(base, tail_from, tail_len));
        }

        let scan_region = self.heap().heap_region_containing(base as *const u8);
        let task = self as *mut Self;
        unsafe {
            (*base).oop_iterate_range(from as usize, to as usize, |slot| {
                (*task).deal_with_reference(scan_region, slot);
            })
        }
    }

    /// Scan the sole object of a humongous run, then relieve queue
    /// pressure.
    fn scan_humongous_object(&mut self, addr: *mut u8) -> bool {
        debug_assert!(
            unsafe { (*self.curr_region).is_in_reserved(addr) },
            "humongous object must start in the current region"
        );

        self.scan_task_entry(TaskEntry::from_obj(addr as *mut ObjectHeader));
        self.drain_local_queue(true);
        self.drain_global_stack(true);

        !self.has_aborted()
    }

    pub fn should_exit_termination(&mut self) -> bool {
        if !self.regular_clock_call() {
            return true;
        }
        // Quit the protocol when the global stack has work again or this
        // task wants out.
        !self.cm().mark_stack_empty() || self.has_aborted()
    }

    pub fn print_stats(&self) {
        debug!(
            "marking stats, task = {}, calls = {}, elapsed = {:.2}ms, termination = {:.2}ms, \
             step avg = {:.2}ms, step max = {:.2}ms, cache hits = {}, cache misses = {}",
            self.worker_id,
            self.calls,
            self.elapsed_time_ms,
            self.termination_time_ms,
            self.step_times_ms.avg(),
            self.step_times_ms.max,
            self.mark_stats_cache.hits(),
            self.mark_stats_cache.misses(),
        );
    }

    /*
     * The building block of the marking phase. One invocation runs until
     * the soft time target expires, work runs out, or a global condition
     * (overflow, yield request, abort) asks it to stop; the caller
     * re-invokes it until it completes without aborting.
     *
     * Work sources, in the order they are tapped:
     *   (1) the current region's target-object queue, scanned through
     *       the field closure which feeds the local deque;
     *   (2) the local deque and the global overflow stack, partially
     *       drained between regions so other workers can steal;
     *   (3) unclaimed regions behind the claim cursor;
     *   (4) other workers' deques, via stealing, once the cursor is
     *       exhausted;
     *   (5) the termination protocol.
     *
     * On global-stack overflow every worker lands here with the abort
     * flag set and the overflow flag raised, and the two-barrier
     * rendezvous below re-initializes the marking state before the
     * restart.
     */
    pub fn do_marking_step(&mut self, time_target_ms: f64, do_termination: bool, is_serial: bool) {
        assert!(time_target_ms >= 1.0, "minimum granularity is 1ms");

        self.step_start = Instant::now();

        // Stealing only makes sense together with termination, and never
        // serially.
        let do_stealing = do_termination && !is_serial;

        let diff_prediction_ms = self.marking_step_diffs_ms.avg();
        self.time_target_ms = time_target_ms - diff_prediction_ms;

        self.recalculate_limits();

        self.clear_has_aborted();
        self.has_timed_out = false;
        self.draining_satb_buffers = false;

        self.calls += 1;

        debug_assert!(!self.oop_closure_bound, "closure left bound");
        self.oop_closure_bound = true;

        if self.cm().has_overflown() {
            // The stack overflowed during a pause or a yield; abort into
            // the overflow protocol at the bottom of this method.
            self.set_has_aborted();
        }

        // First pull whatever SATB buffers are already completed, then
        // level the queues.
        self.drain_satb_buffers();
        self.drain_local_queue(true);
        self.drain_global_stack(true);

        loop {
            if !self.has_aborted() && !self.curr_region.is_null() {
                let hr = self.curr_region;
                let is_humongous = unsafe { (*hr).is_humongous() };
                if is_humongous {
                    // Only the start region's bottom bit is meaningful;
                    // continuation regions are claimed and released
                    // without a scan.
                    let scan = unsafe {
                        (*hr).is_starts_humongous()
                            && (*(*hr).alive_bitmap()).is_marked((*hr).bottom())
                    };
                    if scan {
                        let bottom = unsafe { (*hr).bottom() };
                        self.scan_humongous_object(bottom);
                    }
                    self.giveup_current_region();
                    self.abort_marking_if_regular_check_fail();
                } else {
                    let queue = unsafe { (*hr).target_obj_queue() as *const _ };
                    self.trim_target_object_queue(queue);
                    if !self.has_aborted() {
                        self.giveup_current_region();
                        self.abort_marking_if_regular_check_fail();
                    }
                }
            }

            // Level the queues again between regions.
            self.drain_local_queue(true);
            self.drain_global_stack(true);

            // Claim the next region. claim_region may return null with
            // more regions pending (it claimed an empty one), hence the
            // out_of_regions re-check.
            while !self.has_aborted()
                && self.curr_region.is_null()
                && !self.cm().out_of_regions()
            {
                debug_assert!(self.region_limit.is_null(), "invariant");
                let claimed_region = self.cm().claim_region(self.worker_id);
                if !claimed_region.is_null() {
                    self.setup_for_region(claimed_region);
                }
                // Claiming can spin over a block of empty regions; keep
                // the clock running.
                self.abort_marking_if_regular_check_fail();
            }

            if !self.has_aborted() && self.curr_region.is_null() {
                debug_assert!(
                    self.cm().out_of_regions(),
                    "at this point we should be out of regions"
                );
            }

            if self.curr_region.is_null() || self.has_aborted() {
                break;
            }
        }

        if !self.has_aborted() {
            // Shave SATB work off the remark pause while we are at it.
            self.drain_satb_buffers();
        }

        self.drain_local_queue(false);
        self.drain_global_stack(false);

        if do_stealing && !self.has_aborted() {
            // Out of own work; help the others.
            while !self.has_aborted() {
                match self.cm().try_stealing(self.worker_id as usize) {
                    Some(entry) => {
                        self.scan_task_entry(entry);
                        self.drain_local_queue(false);
                        self.drain_global_stack(false);
                    }
                    None => break,
                }
            }
        }

        if do_termination && !self.has_aborted() {
            debug_assert!(self.cm().out_of_regions(), "only way to reach here");
            debug_assert!(self.task_queue.size() == 0, "only way to reach here");
            let termination_start = Instant::now();

            let task_ptr = self as *mut MarkTask;
            let finished = is_serial
                || self
                    .cm()
                    .terminator
                    .offer_termination(|| unsafe { (*task_ptr).should_exit_termination() });
            self.termination_time_ms += termination_start.elapsed().as_secs_f64() * 1000.0;

            if finished {
                // All workers went idle together; the phase is done.
                assert!(self.cm().out_of_regions(), "only way to reach here");
                assert!(self.cm().mark_stack_empty(), "only way to reach here");
                assert!(self.task_queue.size() == 0, "only way to reach here");
                assert!(!self.cm().has_overflown(), "only way to reach here");
                assert!(!self.has_aborted(), "should never happen if termination has completed");
            } else {
                // More work appeared, abort and restart the step.
                self.set_has_aborted();
            }
        }

        self.oop_closure_bound = false;
        let elapsed_time_ms = self.step_start.elapsed().as_secs_f64() * 1000.0;
        self.step_times_ms.add(elapsed_time_ms);

        if self.has_aborted() {
            if self.has_timed_out {
                let diff_ms = elapsed_time_ms - self.time_target_ms;
                // Only time-outs feed the predictor, other abort causes
                // would skew it.
                self.marking_step_diffs_ms.add(diff_ms.max(0.0));
            }

            if self.cm().has_overflown() {
                // A global overflow; every task synchronizes here so the
                // marking state can be re-initialized for the restart.
                if !is_serial {
                    if !self.cm().enter_first_sync_barrier(self.worker_id) {
                        // The barrier was aborted, drop the overflow
                        // handling and leave as fast as possible.
                        return;
                    }
                    // All tasks have stopped marking work at this point.
                }

                self.clear_region_fields();
                self.flush_mark_stats_cache();

                if !is_serial {
                    // Only the concurrent phase resets here; during
                    // remark the overflow flag must survive this method
                    // so the pause schedules the restart.
                    if self.cm().concurrent() && self.worker_id == 0 {
                        self.cm().reset_marking_for_restart();
                        info!("concurrent mark reset for overflow");
                    }

                    self.cm().enter_second_sync_barrier(self.worker_id);
                }
                // Everything is re-initialized, ready to restart.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionOptions;

    #[test]
    fn number_seq_tracks_avg_and_max() {
        let mut seq = NumberSeq::default();
        seq.add(1.0);
        seq.add(3.0);
        seq.add(2.0);
        assert_eq!(seq.num, 3);
        assert!((seq.avg() - 2.0).abs() < 1e-9);
        assert!((seq.max - 3.0).abs() < 1e-9);
    }

    #[test]
    fn claim_cursor_walks_chain_and_is_monotone() {
        let opts = RegionOptions::setup_sizes(4 * 1024 * 1024, None, Some(64), None);
        let heap = RegionHeap::new(opts);
        let cm = ConcurrentMark::new(&heap, MarkingOptions::default()).unwrap();

        // Put a few words into the cset regions so they are not empty.
        for i in [3usize, 7, 11] {
            unsafe {
                let r = &mut *heap.region_at(i);
                r.set_kind(crate::region::RegionKind::Old);
                r.set_top(r.bottom().add(64));
            }
        }
        heap.build_collection_set(&[3, 7, 11]);
        cm.pre_initial_mark();

        let mut claimed = vec![];
        loop {
            let r = cm.claim_region(0);
            if r.is_null() {
                if cm.out_of_regions() {
                    break;
                }
                continue;
            }
            claimed.push(unsafe { (*r).index() });
        }
        assert_eq!(claimed, vec![3, 7, 11]);
        assert!(cm.out_of_regions());

        // Exhausted cursor stays exhausted.
        assert!(cm.claim_region(1).is_null());
        assert!(cm.finger().is_null());
    }

    #[test]
    fn claim_skips_empty_region_but_advances() {
        let opts = RegionOptions::setup_sizes(4 * 1024 * 1024, None, Some(64), None);
        let heap = RegionHeap::new(opts);
        let cm = ConcurrentMark::new(&heap, MarkingOptions::default()).unwrap();

        unsafe {
            let r = &mut *heap.region_at(2);
            r.set_kind(crate::region::RegionKind::Old);
            r.set_top(r.bottom().add(128));
        }
        // Region 5 stays empty: NTAMS == bottom.
        unsafe {
            (*heap.region_at(5)).set_kind(crate::region::RegionKind::Old);
        }
        heap.build_collection_set(&[5, 2]);
        cm.pre_initial_mark();

        // First claim hits the empty region: null, but the cursor moved.
        let first = cm.claim_region(0);
        assert!(first.is_null());
        assert!(!cm.out_of_regions());

        let second = cm.claim_region(0);
        assert_eq!(unsafe { (*second).index() }, 2);
        assert!(cm.out_of_regions());
    }

    #[test]
    fn concurrent_claims_hand_out_each_region_once() {
        let opts = RegionOptions::setup_sizes(8 * 1024 * 1024, None, Some(128), None);
        let heap = RegionHeap::new(opts);
        let cm = ConcurrentMark::new(&heap, MarkingOptions::default()).unwrap();

        let indices: Vec<usize> = (0..32).collect();
        for &i in &indices {
            unsafe {
                let r = &mut *heap.region_at(i);
                r.set_kind(crate::region::RegionKind::Old);
                r.set_top(r.bottom().add(64));
            }
        }
        heap.build_collection_set(&indices);
        cm.pre_initial_mark();

        let claimed = Mutex::new(vec![]);
        std::thread::scope(|s| {
            for w in 0..4u32 {
                let cm = &cm;
                let claimed = &claimed;
                s.spawn(move || loop {
                    let r = cm.claim_region(w);
                    if r.is_null() {
                        if cm.out_of_regions() {
                            break;
                        }
                        continue;
                    }
                    claimed.lock().push(unsafe { (*r).index() });
                });
            }
        });

        let mut claimed = claimed.into_inner();
        claimed.sort_unstable();
        assert_eq!(claimed.len(), 32);
        claimed.dedup();
        assert_eq!(claimed.len(), 32, "a region was claimed twice");
    }
}
