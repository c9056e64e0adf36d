use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Metric {
    /// Counter of child node lookups during traversals
    NodeRequests,
    /// Counter of node lookups which had to read the sector from the file
    NodeCacheMisses,
    /// Counter of sectors handed out by the allocator
    SectorAllocations,
    /// Counter of sector images written to the file
    SectorWrites,
    /// Timer used to record average node load time
    NodeLoadTime,
}

struct ActiveMetrics {
    node_requests: AtomicU64,
    node_cache_misses: AtomicU64,
    sector_allocations: AtomicU64,
    sector_writes: AtomicU64,
    node_load_time: Timer,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub node_requests: u64,
    pub node_cache_misses: u64,
    pub sector_allocations: u64,
    pub sector_writes: u64,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    node_requests: AtomicU64::new(0),
                    node_cache_misses: AtomicU64::new(0),
                    sector_allocations: AtomicU64::new(0),
                    sector_writes: AtomicU64::new(0),
                    node_load_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        if let Some(ref metrics) = self.metrics {
            let counter = match metric {
                Metric::NodeRequests => &metrics.node_requests,
                Metric::NodeCacheMisses => &metrics.node_cache_misses,
                Metric::SectorAllocations => &metrics.sector_allocations,
                Metric::SectorWrites => &metrics.sector_writes,
                _ => panic!("Specified metric is not a Counter"),
            };

            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::NodeLoadTime => &metrics.node_load_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Read out the counters. `None` if collection is not active.
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|metrics| MetricsSnapshot {
            node_requests: metrics.node_requests.load(Ordering::Relaxed),
            node_cache_misses: metrics.node_cache_misses.load(Ordering::Relaxed),
            sector_allocations: metrics.sector_allocations.load(Ordering::Relaxed),
            sector_writes: metrics.sector_writes.load(Ordering::Relaxed),
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let sector_allocations = metrics.sector_allocations.load(Ordering::Relaxed);
            println!("  sector allocations    {}", sector_allocations);

            let sector_writes = metrics.sector_writes.load(Ordering::Relaxed);
            println!("  sector writes         {}", sector_writes);

            let tot_node_requests = metrics.node_requests.load(Ordering::Relaxed);
            println!("  node requests         {}", tot_node_requests);

            if tot_node_requests != 0 {
                let cache_misses = metrics.node_cache_misses.load(Ordering::Relaxed);
                let percentage_cache_misses =
                    (cache_misses as f64 / tot_node_requests as f64) * 100.0;

                println!(
                    "  node cache misses     {} - {:.2}% of node requests",
                    cache_misses, percentage_cache_misses
                );
            }

            if let Some(mean) = metrics.node_load_time.mean() {
                println!("  node load mean        {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}
