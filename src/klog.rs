//! Kernel log with ring buffering
//!
//! Implements a printk-style log that always works:
//! - Messages are stored in a ring buffer
//! - The buffer provides dmesg-like access to dispatcher events
//!
//! There is no console layer here; emitting the ring to a device is the
//! job of an external collaborator. `snapshot()` exposes the buffered
//! text for that collaborator (and for tests).
//!
//! The buffer lock is held for the duration of one formatted message so
//! that interleaved `klogln!` calls never shear each other's output.

use core::fmt::{self, Write};

use spin::Mutex;

/// Ring buffer size (must be power of 2)
const KLOG_BUFFER_SIZE: usize = 4096;

/// Ring buffer for log messages
struct RingBuffer {
    /// Buffer storage
    data: [u8; KLOG_BUFFER_SIZE],
    /// Write position (next byte to write)
    head: usize,
    /// Read position (oldest retained byte)
    tail: usize,
    /// Has the buffer wrapped (overwritten old data)?
    wrapped: bool,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            data: [0; KLOG_BUFFER_SIZE],
            head: 0,
            tail: 0,
            wrapped: false,
        }
    }

    fn write_byte(&mut self, byte: u8) {
        self.data[self.head] = byte;
        self.head = (self.head + 1) & (KLOG_BUFFER_SIZE - 1);

        // If we caught up to tail, we've overwritten data
        if self.head == self.tail {
            self.tail = (self.tail + 1) & (KLOG_BUFFER_SIZE - 1);
            self.wrapped = true;
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    fn available(&self) -> usize {
        if self.head >= self.tail && !self.wrapped {
            self.head - self.tail
        } else {
            KLOG_BUFFER_SIZE - self.tail + self.head
        }
    }
}

/// Global log state
static KLOG: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

/// Log writer for fmt::Write
///
/// Holds the buffer lock for the duration of all write_str calls,
/// ensuring entire formatted messages are stored atomically.
pub struct KlogWriter {
    guard: spin::MutexGuard<'static, RingBuffer>,
}

impl KlogWriter {
    /// Create a new KlogWriter, acquiring the buffer lock
    pub fn new() -> Self {
        Self { guard: KLOG.lock() }
    }
}

impl Default for KlogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for KlogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.guard.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print to the kernel log
///
/// Messages go to the ring buffer. Always succeeds - never blocks on
/// anything but the buffer lock and never fails.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::klog::KlogWriter::new();
        let _ = write!(writer, $($arg)*);
    }};
}

/// Print to the kernel log with newline
#[macro_export]
macro_rules! klogln {
    () => {
        $crate::klog!("\n")
    };
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::klog::KlogWriter::new();
        let _ = write!(writer, $($arg)*);
        let _ = writer.write_str("\n");
    }};
}

/// Copy the currently buffered log text
///
/// Returns the retained bytes in arrival order, lossily decoded. Oldest
/// data may have been overwritten if the ring wrapped.
pub fn snapshot() -> alloc::string::String {
    let buf = KLOG.lock();
    let mut out = alloc::vec::Vec::with_capacity(buf.available());
    let mut pos = buf.tail;
    let end = buf.head;
    if buf.wrapped || pos != end {
        loop {
            out.push(buf.data[pos]);
            pos = (pos + 1) & (KLOG_BUFFER_SIZE - 1);
            if pos == end {
                break;
            }
        }
    }
    alloc::string::String::from_utf8_lossy(&out).into_owned()
}

/// Get log buffer statistics: (bytes retained, capacity, overflowed)
pub fn stats() -> (usize, usize, bool) {
    let buf = KLOG.lock();
    (buf.available(), KLOG_BUFFER_SIZE, buf.wrapped)
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_klogln_lands_in_snapshot() {
        klogln!("klog self-test marker {}", 42);
        let text = super::snapshot();
        assert!(text.contains("klog self-test marker 42"));
    }
}
