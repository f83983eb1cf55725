//! Frame sink collaborator.
//!
//! Display hardware is out of scope — assembled frames leave the core
//! through this narrow interface. [`StatsSink`] is the built-in headless
//! implementation: counts frames and logs a periodic summary.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use framelink_core::FrameMeta;

/// Consumer of assembled frames. `present` must not block — it runs on the
/// consumer loop between `get_frame`/return cycles.
pub trait FrameSink: Send + Sync {
    fn present(&self, meta: &FrameMeta, data: &[u8]);
}

// ── StatsSink ─────────────────────────────────────────────────────────────────

/// Headless sink: tallies frames/bytes and logs every 30th frame.
pub struct StatsSink {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl StatsSink {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for StatsSink {
    fn present(&self, meta: &FrameMeta, data: &[u8]) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed) + data.len() as u64;
        if n == 1 {
            info!(
                "First frame: {}×{} ts={} ({} bytes)",
                meta.width,
                meta.height,
                meta.timestamp,
                data.len()
            );
        } else if n % 30 == 0 {
            info!("Displayed {} frames ({} bytes total)", n, total);
        } else {
            debug!("Frame {}: ts={} {} bytes", n, meta.timestamp, data.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::{PixelFormat, Timestamp};

    #[test]
    fn counts_presented_frames() {
        let sink = StatsSink::new();
        let meta = FrameMeta {
            len: 4,
            width: 2,
            height: 1,
            format: PixelFormat::Yuyv,
            timestamp: Timestamp::ZERO,
        };
        sink.present(&meta, &[0; 4]);
        sink.present(&meta, &[0; 4]);
        assert_eq!(sink.frames(), 2);
    }
}
