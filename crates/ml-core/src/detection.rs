use serde::{Deserialize, Serialize};

/// Unclassified model output for one box.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawDetection {
    pub class_id: i64,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],
}

/// A qualifying defect on one analyzed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub defect_type: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub frame_sequence: u64,
    pub timestamp_ms: i64,
}

/// Model class names indexed by class id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefectClasses {
    names: Vec<String>,
}

impl DefectClasses {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Defect type for `class_id`, or `None` for ids the model table lacks.
    pub fn name(&self, class_id: i64) -> Option<&str> {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.names.get(idx))
            .map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for DefectClasses {
    fn default() -> Self {
        Self::new(["warping", "stringing", "spaghetti"])
    }
}
