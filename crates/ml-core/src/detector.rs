use std::cmp::Ordering;

use anyhow::Result;

use crate::detection::{BoundingBox, RawDetection};

/// Overlap above which the weaker of two boxes is suppressed, whatever their
/// classes.
pub const NMS_IOU_THRESHOLD: f32 = 0.7;
/// Most detections kept per frame after suppression.
pub const MAX_DETECTIONS: usize = 300;

/// Borrowed BGR8 frame handed to a detector.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> FrameView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            anyhow::bail!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }
}

/// Object detector capability. Boxes come back in frame pixel space.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: FrameView<'_>, min_confidence: f32) -> Result<Vec<RawDetection>>;
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(&mut self, frame: FrameView<'_>, min_confidence: f32) -> Result<Vec<RawDetection>> {
        (**self).detect(frame, min_confidence)
    }
}

/// How a detector lays out one candidate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    /// `x1, y1, x2, y2, score, class`.
    Corners,
    /// `cx, cy, w, h` followed by one score per class.
    CentreClassScores,
}

/// Turn raw rows into detections at or above `min_confidence`, in model
/// input space. Short rows are skipped.
pub fn decode_rows(rows: &[Vec<f32>], layout: RowLayout, min_confidence: f32) -> Vec<RawDetection> {
    rows.iter()
        .filter_map(|row| match layout {
            RowLayout::Corners => {
                let [x1, y1, x2, y2, score, class, ..] = row.as_slice() else {
                    return None;
                };
                Some(RawDetection {
                    bbox: BoundingBox::new(*x1, *y1, *x2, *y2),
                    class_id: *class as i64,
                    score: *score,
                })
            }
            RowLayout::CentreClassScores => {
                let [cx, cy, w, h, scores @ ..] = row.as_slice() else {
                    return None;
                };
                let (class_id, score) = scores
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;
                Some(RawDetection {
                    bbox: BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
                    class_id: class_id as i64,
                    score,
                })
            }
        })
        .filter(|det| det.score >= min_confidence)
        .collect()
}

/// Class-agnostic non-maximum suppression: strongest first, dropping any box
/// overlapping a kept one by more than `iou_threshold`.
pub fn suppress_overlaps(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

#[cfg(feature = "with-tch")]
mod torch {
    use std::{convert::TryFrom, path::Path};

    use anyhow::Result;
    use tch::{self, Device, Kind, Tensor};

    use super::{
        FrameView, NMS_IOU_THRESHOLD, ObjectDetector, RowLayout, decode_rows, suppress_overlaps,
    };
    use crate::detection::RawDetection;

    /// TorchScript-backed detector wrapper.
    pub struct TorchDetector {
        module: tch::CModule,
        device: Device,
        input_size: (i64, i64),
    }

    impl TorchDetector {
        /// Load a TorchScript module onto `device`.
        pub fn load<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            input_size: (i64, i64),
        ) -> Result<Self> {
            let module = tch::CModule::load_on_device(model_path, device)?;
            Ok(Self {
                module,
                device,
                input_size,
            })
        }

        /// BGR frame to a normalized RGB NCHW tensor resized to the model input.
        fn frame_to_tensor(&self, frame: FrameView<'_>) -> Tensor {
            let (in_w, in_h) = self.input_size;
            let tensor = Tensor::from_slice(frame.data)
                .to_device(self.device)
                .to_kind(Kind::Float)
                .view([1, frame.height as i64, frame.width as i64, 3])
                .flip([3])
                .permute([0, 3, 1, 2])
                / 255.0;
            if (frame.width as i64, frame.height as i64) == (in_w, in_h) {
                tensor
            } else {
                tensor.upsample_bilinear2d([in_h, in_w], false, None, None)
            }
        }

        /// Accepts `[1, N, 6]` corner rows or the channel-major `[1, C, N]`
        /// export with centre/size boxes and per-class scores.
        fn parse_rows(output: &Tensor) -> Result<(Vec<Vec<f32>>, RowLayout)> {
            let shape = output.size();
            if shape.len() != 3 || shape[0] != 1 {
                anyhow::bail!("unexpected detector output shape: {shape:?}");
            }
            let cpu = output.to_device(Device::Cpu).to_kind(Kind::Float).squeeze_dim(0);
            let (preds, layout) = if shape[2] == 6 {
                (cpu.contiguous(), RowLayout::Corners)
            } else {
                if shape[1] < 5 {
                    anyhow::bail!(
                        "detector output requires at least 5 channels, got {}",
                        shape[1]
                    );
                }
                (cpu.permute([1, 0]).contiguous(), RowLayout::CentreClassScores)
            };
            Ok((Vec::<Vec<f32>>::try_from(&preds)?, layout))
        }
    }

    impl ObjectDetector for TorchDetector {
        fn detect(
            &mut self,
            frame: FrameView<'_>,
            min_confidence: f32,
        ) -> Result<Vec<RawDetection>> {
            let input = tch::no_grad(|| self.frame_to_tensor(frame));
            let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
            let (in_w, in_h) = self.input_size;
            let sx = frame.width as f32 / in_w as f32;
            let sy = frame.height as f32 / in_h as f32;

            let (rows, layout) = Self::parse_rows(&output)?;
            let candidates = decode_rows(&rows, layout, min_confidence);
            Ok(suppress_overlaps(candidates, NMS_IOU_THRESHOLD)
                .into_iter()
                .map(|det| RawDetection {
                    bbox: det.bbox.scaled(sx, sy),
                    ..det
                })
                .collect())
        }
    }
}
