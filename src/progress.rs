//! Progress update callbacks

/// Progress reporting for long-running memory operations
pub trait ProgressCallbacks {
    /// A new operation begins at `addr`, moving `total` bytes
    fn init(&mut self, addr: u32, total: usize);
    /// `current` bytes have been moved so far
    fn update(&mut self, current: usize);
    /// The operation finished
    fn finish(&mut self);
}
