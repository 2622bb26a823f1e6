//! # NUMA Topology and Thread Pinning
//!
//! PM directories are ordered by NUMA node, and a worker thread is pinned
//! to one node when it first attaches to an undo segment. From then on the
//! thread allocates extents and undo space from that node's directory, so
//! every load and store it issues against the heap stays node-local.
//!
//! Topology is read once from sysfs (`/sys/devices/system/node/node<N>/
//! cpulist`) and cached. On machines without that tree (non-Linux, or
//! single-socket containers) the node count degrades to one and pinning
//! becomes a no-op: affinity is a performance contract, not a correctness
//! one.

use std::fs;
use std::sync::atomic::{AtomicI32, Ordering};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

static NODE_CPUS: Mutex<Option<HashMap<usize, Vec<usize>>>> = Mutex::new(None);
static NODE_COUNT: AtomicI32 = AtomicI32::new(-1);

thread_local! {
    static LOCAL_NODE: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Parse a sysfs cpulist string such as `"0-3,7,9-11"`.
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for range in list.trim().split(',') {
        if range.is_empty() {
            continue;
        }
        match range.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = range.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

fn sysfs_cpulist(node: usize) -> Option<String> {
    fs::read_to_string(format!("/sys/devices/system/node/node{node}/cpulist")).ok()
}

/// Number of NUMA nodes visible through sysfs; at least one.
pub fn node_count() -> usize {
    let cached = NODE_COUNT.load(Ordering::Relaxed);
    if cached >= 0 {
        return cached.max(1) as usize;
    }
    let mut count = 0;
    while sysfs_cpulist(count).is_some() {
        count += 1;
    }
    NODE_COUNT.store(count as i32, Ordering::Relaxed);
    count.max(1)
}

fn node_cpus(node: usize) -> Vec<usize> {
    let mut cache = NODE_CPUS.lock();
    let map = cache.get_or_insert_with(HashMap::new);
    if let Some(cpus) = map.get(&node) {
        return cpus.clone();
    }
    let cpus = sysfs_cpulist(node)
        .map(|list| parse_cpulist(&list))
        .unwrap_or_default();
    map.insert(node, cpus.clone());
    cpus
}

/// Pin the calling thread to the CPUs of `node`. Returns whether the
/// affinity actually took effect; the thread-local node id is recorded
/// either way so storage placement stays consistent.
pub fn bind_current_thread(node: usize) -> bool {
    LOCAL_NODE.with(|n| n.set(node));

    let cpus = node_cpus(node);
    if cpus.is_empty() {
        return false;
    }

    #[cfg(target_os = "linux")]
    {
        // SAFETY: cpu_set_t is a plain bitmask; zeroed is its empty value.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in &cpus {
            // SAFETY: CPU_SET only writes within the set for ids below
            // CPU_SETSIZE, which sysfs cpu ids satisfy on any supported
            // kernel.
            unsafe { libc::CPU_SET(*cpu, &mut set) };
        }
        // SAFETY: pid 0 targets the calling thread; the set is a valid,
        // fully initialized cpu_set_t of the advertised size.
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc == 0 {
            debug!(node, cpus = cpus.len(), "pinned thread to NUMA node");
            return true;
        }
        false
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// NUMA node this thread was last bound to (0 if never bound).
pub fn current_node() -> usize {
    LOCAL_NODE.with(|n| n.get())
}
