//! Character console device
//!
//! Input arrives from the host side through [`Console::feed_input`]; output
//! is captured for the host to drain. The device signals the kernel through
//! the registered `read_avail`/`write_done` callbacks, which stand in for
//! the device interrupt edges: one `read_avail` per queued input byte, one
//! `write_done` per completed output byte.

use std::sync::{Arc, Mutex};

use crossbeam::queue::SegQueue;

use crate::Statistics;

type DeviceCallback = Box<dyn Fn() + Send + Sync>;

pub struct Console {
    input: SegQueue<u8>,
    output: Mutex<Vec<u8>>,
    read_avail: Mutex<Option<DeviceCallback>>,
    write_done: Mutex<Option<DeviceCallback>>,
    stats: Arc<Statistics>,
}

impl Console {
    pub fn new(stats: Arc<Statistics>) -> Self {
        Self {
            input: SegQueue::new(),
            output: Mutex::new(Vec::new()),
            read_avail: Mutex::new(None),
            write_done: Mutex::new(None),
            stats,
        }
    }

    /// Register the interrupt callbacks. Called once by the kernel console
    /// layer before any I/O.
    pub fn set_handlers(&self, read_avail: DeviceCallback, write_done: DeviceCallback) {
        *self.read_avail.lock().unwrap() = Some(read_avail);
        *self.write_done.lock().unwrap() = Some(write_done);
    }

    /// Host side: queue input bytes, signalling `read_avail` once per byte.
    pub fn feed_input(&self, bytes: &[u8]) {
        for &b in bytes {
            self.input.push(b);
            if let Some(cb) = self.read_avail.lock().unwrap().as_ref() {
                cb();
            }
        }
    }

    /// Take one queued input byte. The kernel calls this only after a
    /// `read_avail` signal, but a `None` is still reported rather than
    /// trusted away.
    pub fn get_char(&self) -> Option<u8> {
        let b = self.input.pop();
        if b.is_some() {
            self.stats.add_console_read();
        }
        b
    }

    /// Emit one output byte and signal `write_done`.
    pub fn put_char(&self, b: u8) {
        self.output.lock().unwrap().push(b);
        self.stats.add_console_write();
        if let Some(cb) = self.write_done.lock().unwrap().as_ref() {
            cb();
        }
    }

    /// Host side: drain everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.output.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_feed_and_get() {
        let console = Console::new(Arc::new(Statistics::new()));
        console.feed_input(b"hi");
        assert_eq!(console.get_char(), Some(b'h'));
        assert_eq!(console.get_char(), Some(b'i'));
        assert_eq!(console.get_char(), None);
    }

    #[test]
    fn test_callbacks_fire_per_byte() {
        let console = Console::new(Arc::new(Statistics::new()));
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let (r, w) = (Arc::clone(&reads), Arc::clone(&writes));
        console.set_handlers(
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move || {
                w.fetch_add(1, Ordering::SeqCst);
            }),
        );
        console.feed_input(b"abc");
        console.put_char(b'x');
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(console.take_output(), b"x");
    }
}
