pub struct Settings {
    // readMemoryBatch merges sibling requests into ranges of at most this many bytes,
    pub max_batch_bytes: usize,
    // with at most this many unrequested bytes between two consecutive requests (0 = contiguous only).
    pub max_batch_gap: usize,

    pub max_string_len: usize, // cap for pointer-relative strings, in characters (narrow or wide)
    pub max_blob_len: usize, // cap for raw memory dumps, in bytes
    pub float_precision: usize, // digits after the point for type-aware float formatting

    // Formatted-string cache is dropped wholesale when it grows past this.
    pub format_cache_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self { Settings {
        max_batch_bytes: 4096,
        max_batch_gap: 0,

        max_string_len: 256,
        max_blob_len: 64,
        float_precision: 6,

        format_cache_capacity: 4096,
    } }
}
