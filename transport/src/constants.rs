/// Per-candidate connect deadline in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Scratch buffer size for the non-blocking read pump (4 KiB)
pub const READ_BUFFER_SIZE: usize = 4096;
