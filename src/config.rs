use std::mem::size_of;

use crate::utils::{align_down, align_up, formatted_size, HEAP_WORD_SIZE};

/// Geometry of the region-partitioned heap. Derived once at heap creation
/// and immutable afterwards.
#[derive(Default, Clone, Copy, Debug)]
pub struct RegionOptions {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_bytes_mask: usize,
    pub region_count: usize,
    pub humongous_threshold_words: usize,
    pub humongous_threshold_bytes: usize,
    pub max_heap_size: usize,
}

impl RegionOptions {
    pub const MIN_REGION_SIZE: usize = 64 * 1024;
    pub const MIN_NUM_REGIONS: usize = 2;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

    pub fn setup_sizes(
        max_heap_size: usize,
        min_region_size: Option<usize>,
        target_num_regions: Option<usize>,
        max_region_size: Option<usize>,
    ) -> RegionOptions {
        let mut opts = RegionOptions::default();
        let mut region_size;
        let min_region_size = min_region_size
            .map(|x| x.max(Self::MIN_REGION_SIZE))
            .unwrap_or(Self::MIN_REGION_SIZE);
        let target_num_regions = target_num_regions.unwrap_or(2048);
        let max_region_size = max_region_size.unwrap_or(Self::MAX_REGION_SIZE);
        if min_region_size > max_heap_size / Self::MIN_NUM_REGIONS {
            panic!(
                "Max heap size ({}) is too low to afford the minimum number of regions ({}) of minimum region size ({})",
                formatted_size(max_heap_size),
                Self::MIN_NUM_REGIONS,
                formatted_size(min_region_size)
            );
        }

        region_size = max_heap_size / target_num_regions;
        region_size = region_size.max(min_region_size);
        region_size = max_region_size.min(region_size);

        let page_size = 4096;

        // Region size is a power of two so that addr_to_region is a shift.
        let region_size_log = (region_size as f64).log2() as usize;
        region_size = 1 << region_size_log;
        let max_heap_size = align_up(max_heap_size, region_size.max(page_size));

        opts.region_size_bytes_shift = region_size_log;
        opts.region_size_bytes = region_size;
        opts.region_size_words = region_size / HEAP_WORD_SIZE;
        opts.region_size_bytes_mask = opts.region_size_bytes - 1;
        opts.region_count = max_heap_size / opts.region_size_bytes;
        // An object taking more than half a region is humongous and gets a
        // contiguous run of regions for itself.
        opts.humongous_threshold_words = align_down(opts.region_size_words / 2, 8);
        opts.humongous_threshold_bytes = opts.humongous_threshold_words * size_of::<usize>();
        opts.max_heap_size = max_heap_size;
        opts
    }
}

// Returns the maximum number of workers to be used in a concurrent phase
// based on the number of workers being used in a STW phase.
pub(crate) fn scale_concurrent_worker_threads(num_gc_workers: usize) -> usize {
    ((num_gc_workers + 2) / 4).max(1)
}

/// Tunables of the marking core, the analog of the collector's command
/// line flags. `default()` mirrors the shipped defaults; tests dial the
/// sizes down to force the interesting paths.
#[derive(Clone, Debug)]
pub struct MarkingOptions {
    /// Worker count for STW phases (remark).
    pub parallel_gc_threads: usize,
    /// Worker count for concurrent marking. 0 means "derive from
    /// `parallel_gc_threads`".
    pub conc_gc_threads: usize,
    /// Initial overflow mark stack capacity, in entries.
    pub mark_stack_size: usize,
    /// Maximum overflow mark stack capacity, in entries.
    pub mark_stack_size_max: usize,
    /// Number of referents a keep-alive closure processes before it forces
    /// a drain of the marking stacks.
    pub ref_proc_drain_interval: usize,
    /// Soft time target of one marking step, in milliseconds.
    pub conc_mark_step_millis: f64,
    /// Run the single threaded precleaning pass between concurrent mark
    /// and remark.
    pub use_reference_precleaning: bool,
    /// Whether the remark pause unloads classes. The marking core only
    /// carries the switch; unloading itself lives with the host.
    pub class_unloading_with_concurrent_mark: bool,
    /// Capacity of a worker's local mark deque, in entries.
    pub task_queue_capacity: usize,
}

impl Default for MarkingOptions {
    fn default() -> Self {
        Self {
            parallel_gc_threads: 4,
            conc_gc_threads: 0,
            mark_stack_size: 32 * 1024,
            mark_stack_size_max: 512 * 1024,
            ref_proc_drain_interval: 1000,
            conc_mark_step_millis: 10.0,
            use_reference_precleaning: true,
            class_unloading_with_concurrent_mark: true,
            task_queue_capacity: 8 * 1024,
        }
    }
}

impl MarkingOptions {
    pub fn conc_workers(&self) -> usize {
        if self.conc_gc_threads == 0 {
            scale_concurrent_worker_threads(self.parallel_gc_threads)
        } else {
            self.conc_gc_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_size_is_power_of_two() {
        let opts = RegionOptions::setup_sizes(64 * 1024 * 1024, None, Some(64), None);
        assert!(opts.region_size_bytes.is_power_of_two());
        assert_eq!(opts.region_count * opts.region_size_bytes, opts.max_heap_size);
        assert!(opts.humongous_threshold_words <= opts.region_size_words / 2);
    }

    #[test]
    fn conc_worker_scaling() {
        assert_eq!(scale_concurrent_worker_threads(1), 1);
        assert_eq!(scale_concurrent_worker_threads(4), 1);
        assert_eq!(scale_concurrent_worker_threads(6), 2);
        assert_eq!(scale_concurrent_worker_threads(8), 2);
        assert_eq!(scale_concurrent_worker_threads(16), 4);
        let opts = MarkingOptions {
            parallel_gc_threads: 8,
            conc_gc_threads: 0,
            ..Default::default()
        };
        assert_eq!(opts.conc_workers(), 2);
    }
}
