use serde::{Deserialize, Serialize};

/// Layer-dependent confidence floor.
///
/// Early layers use a lower floor so adhesion problems are caught while they
/// are still cheap to fix; later layers raise it to suppress noise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThreshold {
    /// Layers below this use `early_floor`.
    pub early_layers: u32,
    pub early_floor: f32,
    /// Layers below this (and not early) use `mid_floor`.
    pub mid_layers: u32,
    pub mid_floor: f32,
    pub late_floor: f32,
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self {
            early_layers: 10,
            early_floor: 0.70,
            mid_layers: 50,
            mid_floor: 0.75,
            late_floor: 0.80,
        }
    }
}

impl AdaptiveThreshold {
    pub fn floor(&self, layer: u32) -> f32 {
        if layer < self.early_layers {
            self.early_floor
        } else if layer < self.mid_layers {
            self.mid_floor
        } else {
            self.late_floor
        }
    }
}
