use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StandSnapshot {
    pub timestamp_us: u64,
    pub tick: u64,
    pub connected: bool,
    pub high_speed: bool,
    pub sequencer_running: bool,
    pub steps_remaining: u32,
    pub shutdown_latched: bool,
    pub shutdown_episodes: u64,
    pub read_faults: u64,
    pub redline_trips: u64,
    pub last_tick_us: u64,
}

const INDEX_MASK: usize = 0b11;
const FRESH: usize = 0b100;

/// Single-writer, single-reader triple buffer.
///
/// The writer fills its private slot and swaps it with the shared back
/// slot; the reader swaps the back slot in only when it holds a fresh
/// value. Neither side ever touches the slot the other owns.
struct TripleBuffer<T: Copy + Default> {
    slots: [UnsafeCell<T>; 3],
    back: AtomicUsize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

unsafe impl<T: Copy + Default + Send> Send for TripleBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for TripleBuffer<T> {}

impl<T: Copy + Default> TripleBuffer<T> {
    fn new() -> Self {
        let slots = std::array::from_fn(|_| UnsafeCell::new(T::default()));
        Self {
            slots,
            back: AtomicUsize::new(1),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(2),
        }
    }

    fn write(&self, value: T) {
        let w = self.write_idx.load(Ordering::Relaxed);
        unsafe {
            *self.slots[w].get() = value;
        }
        let prev = self.back.swap(w | FRESH, Ordering::AcqRel);
        self.write_idx.store(prev & INDEX_MASK, Ordering::Relaxed);
    }

    fn read(&self) -> T {
        if self.back.load(Ordering::Acquire) & FRESH != 0 {
            let r = self.read_idx.load(Ordering::Relaxed);
            let prev = self.back.swap(r, Ordering::AcqRel);
            self.read_idx.store(prev & INDEX_MASK, Ordering::Relaxed);
        }
        let r = self.read_idx.load(Ordering::Relaxed);
        unsafe { *self.slots[r].get() }
    }
}

/// Hands the loop's per-tick snapshot to one observer thread without
/// blocking the loop.
pub struct StateExchange {
    stand_state: TripleBuffer<StandSnapshot>,
}

impl StateExchange {
    pub fn new() -> Self {
        Self {
            stand_state: TripleBuffer::new(),
        }
    }

    /// Called by the telemetry loop every tick (non-blocking).
    pub fn publish_state(&self, state: StandSnapshot) {
        self.stand_state.write(state);
    }

    /// Called by the single observer (console) thread.
    pub fn read_state(&self) -> StandSnapshot {
        self.stand_state.read()
    }
}

impl Default for StateExchange {
    fn default() -> Self {
        Self::new()
    }
}
