//! Configuration surface (`set_property`/`get_property`).

/// Per-queue size limits. `0` on any axis disables that axis's check
/// (`0` disables the axis entirely).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub items: u64,
    pub bytes: u64,
    pub time_ns: u64,
}

impl SizeLimits {
    pub fn items_enabled(&self) -> bool {
        self.items != 0
    }

    pub fn bytes_enabled(&self) -> bool {
        self.bytes != 0
    }

    pub fn time_enabled(&self) -> bool {
        self.time_ns != 0
    }
}

/// `MAX_BUFFERING_LEVEL` from the glossary: buffering level is scaled into
/// `[0, BUFFERING_LEVEL_SCALE]`.
pub const BUFFERING_LEVEL_SCALE: u64 = 1_000_000;

/// Construction-time and runtime-tunable defaults for a [`crate::MultiQueue`].
///
/// Chained builder methods rather than an external config-file format,
/// since the core is entirely in-memory and has no persisted state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Properties {
    pub max_size: SizeLimits,
    pub use_buffering: bool,
    pub low_watermark_ppm: u32,
    pub high_watermark_ppm: u32,
    pub sync_by_running_time: bool,
    pub use_interleave: bool,
    pub min_interleave_ns: u64,
    pub unlinked_cache_time_ns: u64,
}

impl Properties {
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size.bytes = bytes;
        self
    }

    pub fn with_max_size_items(mut self, items: u64) -> Self {
        self.max_size.items = items;
        self
    }

    pub fn with_max_size_time_ns(mut self, time_ns: u64) -> Self {
        self.max_size.time_ns = time_ns;
        self
    }

    pub fn with_use_buffering(mut self, use_buffering: bool) -> Self {
        self.use_buffering = use_buffering;
        self
    }

    pub fn with_watermarks_ppm(mut self, low: u32, high: u32) -> Self {
        self.low_watermark_ppm = low.min(BUFFERING_LEVEL_SCALE as u32);
        self.high_watermark_ppm = high.min(BUFFERING_LEVEL_SCALE as u32);
        self
    }

    pub fn with_sync_by_running_time(mut self, sync: bool) -> Self {
        self.sync_by_running_time = sync;
        self
    }

    pub fn with_use_interleave(mut self, use_interleave: bool) -> Self {
        self.use_interleave = use_interleave;
        self
    }

    pub fn with_unlinked_cache_time_ns(mut self, ns: u64) -> Self {
        self.unlinked_cache_time_ns = ns;
        self
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            max_size: SizeLimits {
                items: 200,
                bytes: 10 * 1024 * 1024,
                time_ns: 2_000_000_000,
            },
            use_buffering: false,
            low_watermark_ppm: 100_000,
            high_watermark_ppm: 990_000,
            sync_by_running_time: false,
            use_interleave: false,
            min_interleave_ns: 0,
            unlinked_cache_time_ns: 0,
        }
    }
}
