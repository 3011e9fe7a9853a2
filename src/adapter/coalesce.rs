//! Write coalescing: buffered small writes merged into contiguous runs.

/// Buffered records per descriptor before a flush is forced.
pub const MAX_PENDING_WRITES: usize = 50;

/// Per-descriptor buffer of outstanding writes, in arrival order.
#[derive(Default)]
pub struct WriteBuffer {
    records: Vec<(u64, Vec<u8>)>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one record. Returns true once the buffer holds more than
    /// [`MAX_PENDING_WRITES`] records and must be flushed.
    pub fn push(&mut self, position: u64, data: Vec<u8>) -> bool {
        self.records.push((position, data));
        self.records.len() > MAX_PENDING_WRITES
    }

    /// Drain the buffer, concatenating adjacent contiguous records (the
    /// next record starts where the prior one ended) into single runs.
    pub fn take_runs(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut runs: Vec<(u64, Vec<u8>)> = Vec::new();
        for (position, data) in self.records.drain(..) {
            match runs.last_mut() {
                Some((start, buf)) if *start + buf.len() as u64 == position => {
                    buf.extend_from_slice(&data);
                }
                _ => runs.push((position, data)),
            }
        }
        runs
    }
}
