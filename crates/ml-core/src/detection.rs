/// Label given to the synthetic roller class. Roller markers are only used to
/// locate rollers in the frame and are never counted as defects.
pub const ROLLER_LABEL: &str = "roller";

/// Axis-aligned box in frame pixels, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Box area in px².
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Top-left and bottom-right corners truncated to whole pixels.
    pub fn corners_px(&self) -> [(i32, i32); 2] {
        [
            (self.x1 as i32, self.y1 as i32),
            (self.x2 as i32, self.y2 as i32),
        ]
    }

    /// Inclusive point-in-box test.
    pub fn contains(&self, (x, y): (i32, i32)) -> bool {
        let (x, y) = (x as f32, y as f32);
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    /// Intersection over union; zero for disjoint or degenerate boxes.
    pub fn iou(&self, other: &Self) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Scale the box from detector input space back into frame space.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }
}

/// Unlabelled detector output for a single object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub class_id: i64,
    pub score: f32,
}

/// Labelled detection produced for one inference cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    pub class_id: i64,
    pub confidence: f32,
}

impl Detection {
    pub fn is_roller_marker(&self) -> bool {
        self.label == ROLLER_LABEL
    }
}

/// Maps detector class ids onto the labels used by the thresholds and counters.
#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    names: Vec<String>,
    roller_class: Option<i64>,
}

impl ClassLabels {
    /// `roller_class` forces that class id onto [`ROLLER_LABEL`] regardless of
    /// the name the model was trained with.
    pub fn new(names: Vec<String>, roller_class: Option<i64>) -> Self {
        Self {
            names,
            roller_class,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn label(&self, class_id: i64) -> String {
        if self.roller_class == Some(class_id) {
            return ROLLER_LABEL.to_string();
        }
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.names.get(idx))
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn apply(&self, raw: &[RawDetection]) -> Vec<Detection> {
        raw.iter()
            .map(|det| Detection {
                label: self.label(det.class_id),
                bbox: det.bbox,
                class_id: det.class_id,
                confidence: det.score,
            })
            .collect()
    }
}
