//! Annotated evidence frames written as JPEG files.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use image::{RgbImage, codecs::jpeg::JpegEncoder};

use crate::inspection::channel::Channel;

/// Folder an evidence frame is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceKind {
    /// Roller and defect markers seen in the same cycle.
    Defect(Channel),
    /// Any cycle with a roller marker while archive-everything is on.
    Archive(Channel),
    /// Non-normal head measurement (BF).
    HeadDefect,
    /// Head evidence copied while archive-everything is on.
    HeadArchive,
}

impl EvidenceKind {
    fn relative_dir(self) -> PathBuf {
        match self {
            EvidenceKind::Defect(ch) => Path::new(ch.label()).join("Defect"),
            EvidenceKind::Archive(ch) => Path::new("All")
                .join(ch.label())
                .join(format!("All_{}", ch.label())),
            EvidenceKind::HeadDefect => Path::new(Channel::Bf.label()).join("Head_Defect"),
            EvidenceKind::HeadArchive => Path::new("All").join(Channel::Bf.label()).join("All_Head"),
        }
    }
}

/// Writes evidence frames beneath one root directory. Each worker owns its own sink.
pub struct EvidenceSink {
    root: PathBuf,
    quality: u8,
    counters: HashMap<EvidenceKind, u64>,
}

impl EvidenceSink {
    pub fn new(root: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            root: root.into(),
            quality: quality.clamp(1, 100),
            counters: HashMap::new(),
        }
    }

    pub fn dir(&self, kind: EvidenceKind) -> PathBuf {
        self.root.join(kind.relative_dir())
    }

    /// Encode a BGR frame and store it under `kind`. Returns the written path.
    pub fn save(&mut self, kind: EvidenceKind, bgr: &[u8], width: u32, height: u32) -> Result<PathBuf> {
        let dir = self.dir(kind);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create evidence folder {}", dir.display()))?;

        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        let name = format!("{}_{:06}.jpg", Local::now().format("%Y%m%d_%H%M%S%.3f"), counter);
        let path = dir.join(name);

        let rgb = bgr_to_rgb(bgr);
        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or_else(|| anyhow!("frame does not match {width}x{height}"))?;
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        JpegEncoder::new_with_quality(BufWriter::new(file), self.quality)
            .encode_image(&image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        Ok(path)
    }
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}
