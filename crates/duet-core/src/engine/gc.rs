//! Deferred deallocation for session audio
//!
//! A three-minute stereo stem pair is ~120MB of `f32`. Route renderers hold
//! the session through [`basedrop::Shared`], so when the last reference is
//! released on a real-time thread (after a new session replaces the old
//! one) the drop only enqueues a pointer. The memory is returned by a
//! background collector thread where a slow `munmap` can't cause an xrun.
//!
//! Route snapshots swapped through `basedrop::SharedCell` use the same
//! collector.

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// How often the collector frees queued allocations
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn start_collector() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("duet-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread for good
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::debug!("Session GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .expect("Failed to spawn session GC thread");

    rx.recv().expect("Session GC thread exited before handing out its handle")
}

/// Handle for allocating `Shared<T>` / `SharedCell<T>` values
///
/// Starts the collector thread on first use.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(start_collector).clone()
}
