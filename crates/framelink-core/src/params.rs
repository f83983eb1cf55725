//! Parameter-ID lookup tables for the `*-set-params` / `*-get-params`
//! control messages. Thin mapping shims — the control plane carries
//! `(param_id: u16, value: u32)` pairs and both ends translate through
//! these tables.

use crate::config::{CamConfig, FrameConfig};
use crate::types::PixelFormat;

// ── Camera parameters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamParam {
    Brightness,
    Contrast,
    Saturation,
    Exposure,
}

impl CamParam {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Self::Brightness),
            1 => Some(Self::Contrast),
            2 => Some(Self::Saturation),
            3 => Some(Self::Exposure),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        match self {
            Self::Brightness => 0,
            Self::Contrast => 1,
            Self::Saturation => 2,
            Self::Exposure => 3,
        }
    }

    pub fn get(self, cfg: &CamConfig) -> u32 {
        match self {
            Self::Brightness => cfg.brightness,
            Self::Contrast => cfg.contrast,
            Self::Saturation => cfg.saturation,
            Self::Exposure => cfg.exposure,
        }
    }

    pub fn set(self, cfg: &mut CamConfig, value: u32) {
        match self {
            Self::Brightness => cfg.brightness = value,
            Self::Contrast => cfg.contrast = value,
            Self::Saturation => cfg.saturation = value,
            Self::Exposure => cfg.exposure = value,
        }
    }
}

// ── Frame parameters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParam {
    Width,
    Height,
    Format,
    Fps,
}

impl FrameParam {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Self::Width),
            1 => Some(Self::Height),
            2 => Some(Self::Format),
            3 => Some(Self::Fps),
            _ => None,
        }
    }

    pub fn id(self) -> u16 {
        match self {
            Self::Width => 0,
            Self::Height => 1,
            Self::Format => 2,
            Self::Fps => 3,
        }
    }

    pub fn get(self, cfg: &FrameConfig) -> u32 {
        match self {
            Self::Width => cfg.width,
            Self::Height => cfg.height,
            Self::Format => cfg.format.to_wire() as u32,
            Self::Fps => cfg.fps,
        }
    }

    /// Apply a value received over the wire. Returns `false` when the value
    /// does not map onto the parameter (e.g. unknown pixel format code).
    pub fn set(self, cfg: &mut FrameConfig, value: u32) -> bool {
        match self {
            Self::Width => cfg.width = value,
            Self::Height => cfg.height = value,
            Self::Format => match PixelFormat::from_wire(value as u8) {
                Some(f) => cfg.format = f,
                None => return false,
            },
            Self::Fps => cfg.fps = value,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cam_param_id_round_trip() {
        for p in [
            CamParam::Brightness,
            CamParam::Contrast,
            CamParam::Saturation,
            CamParam::Exposure,
        ] {
            assert_eq!(CamParam::from_id(p.id()), Some(p));
        }
        assert_eq!(CamParam::from_id(99), None);
    }

    #[test]
    fn frame_param_rejects_bad_format_code() {
        let mut cfg = FrameConfig::default();
        assert!(!FrameParam::Format.set(&mut cfg, 200));
        assert_eq!(cfg.format, FrameConfig::default().format);
        assert!(FrameParam::Format.set(&mut cfg, PixelFormat::Nv12.to_wire() as u32));
        assert_eq!(cfg.format, PixelFormat::Nv12);
    }
}
