use serde::{Deserialize, Serialize};

use crate::types::PixelFormat;

// ── FrameConfig ───────────────────────────────────────────────────────────────

/// Frame geometry negotiated per session and copied into each data protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            fps: 30,
        }
    }
}

impl FrameConfig {
    /// Worst-case payload bytes for one frame of this geometry (YUYV = 2 B/px).
    pub fn max_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    /// Interval between frames in microseconds.
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.fps.max(1) as u64
    }
}

// ── CamConfig ─────────────────────────────────────────────────────────────────

/// Camera tuning parameters, settable over the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamConfig {
    pub brightness: u32,
    pub contrast: u32,
    pub saturation: u32,
    pub exposure: u32,
}

impl Default for CamConfig {
    fn default() -> Self {
        Self {
            brightness: 128,
            contrast: 32,
            saturation: 64,
            exposure: 100,
        }
    }
}

// ── RuntimeConfig ─────────────────────────────────────────────────────────────

/// Tunables loaded from `framelink.json` (if present) with env-var overrides.
///
/// | Env var                  | Field                 |
/// |--------------------------|-----------------------|
/// | `FRAMELINK_PUSH_SLOTS`   | `push_pool_size`      |
/// | `FRAMELINK_PLAY_SLOTS`   | `play_pool_size`      |
/// | `FRAMELINK_ASSEMBLY`     | `assembly_capacity`   |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Control-connection pool slots reserved for push clients.
    pub push_pool_size: usize,
    /// Control-connection pool slots reserved for play clients.
    pub play_pool_size: usize,
    /// Outgoing control-action queue depth per connection.
    pub action_queue_depth: usize,
    /// Reassembly slots (frames in flight).
    pub assembly_capacity: usize,
    /// Ready-queue backlog required before `get_frame` starts draining.
    pub ready_backlog: usize,
    /// Minimum interval between consecutive `get_frame` returns, ms.
    pub min_frame_interval_ms: u64,
    pub frame: FrameConfig,
    pub cam: CamConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            push_pool_size: 4,
            play_pool_size: 1,
            action_queue_depth: 8,
            assembly_capacity: 4,
            ready_backlog: 0,
            min_frame_interval_ms: 0,
            frame: FrameConfig::default(),
            cam: CamConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `path` if it exists, fall back to defaults, then apply
    /// env-var overrides.
    pub fn load(path: &str) -> Self {
        let mut cfg = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| match serde_json::from_str::<Self>(&s) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Ignoring malformed {}: {}", path, e);
                    None
                }
            })
            .unwrap_or_default();

        if let Some(n) = env_usize("FRAMELINK_PUSH_SLOTS") {
            cfg.push_pool_size = n;
        }
        if let Some(n) = env_usize("FRAMELINK_PLAY_SLOTS") {
            cfg.play_pool_size = n;
        }
        if let Some(n) = env_usize("FRAMELINK_ASSEMBLY") {
            cfg.assembly_capacity = n;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_config() {
        let json = r#"{ "push_pool_size": 2, "frame": { "width": 1280, "height": 720 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).expect("valid partial config");
        assert_eq!(cfg.push_pool_size, 2);
        assert_eq!(cfg.frame.width, 1280);
        // Untouched fields keep their defaults
        assert_eq!(cfg.play_pool_size, 1);
        assert_eq!(cfg.frame.fps, 30);
    }

    #[test]
    fn frame_len_accounts_for_yuyv() {
        let cfg = FrameConfig::default();
        assert_eq!(cfg.max_frame_len(), 640 * 480 * 2);
    }
}
