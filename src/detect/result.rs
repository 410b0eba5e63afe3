/// Axis-aligned box in native-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Detector-style `[x, y, width, height]` array.
    pub fn from_xywh(xywh: [f32; 4]) -> Self {
        Self::new(xywh[0], xywh[1], xywh[2], xywh[3])
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Independent per-axis scale.
    pub fn scaled(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            x: self.x * scale_x,
            y: self.y * scale_y,
            width: self.width * scale_x,
            height: self.height * scale_y,
        }
    }
}

/// One raw detector output. Lives for a single detection cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    /// 0..=1
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            bbox,
        }
    }

    /// Confidence as a whole percentage, the way labels display it.
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}
