//! Update archives: a zip with a `manifest.json` and the image files.

use std::{
    fmt, fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use log::{debug, error};
use serde::Deserialize;
use tempfile::TempDir;

use crate::{ChipTarget, error::*};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Marker of archives meant for the chip's second-stage bootloader.
const STAGED_MARKER: &str = r#""type": "mcuboot""#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// Whole image replaced by the vendor programming tool.
    LegacyImageReplace,
    /// Image uploaded to a secondary slot, confirmed, then swapped in.
    StagedBootloaderImage,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::LegacyImageReplace => f.write_str("legacy"),
            UpdateKind::StagedBootloaderImage => f.write_str("mcuboot"),
        }
    }
}

/// A file listed in the manifest. Its position is its slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file: PathBuf,
    pub slot: usize,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    files: Vec<RawManifestFile>,
}

#[derive(Debug, Deserialize)]
struct RawManifestFile {
    file: String,
}

/// An update archive extracted into a temporary directory.
///
/// The directory is removed when the archive is dropped.
pub struct UpdateArchive {
    dir: TempDir,
    chip: ChipTarget,
    kind: UpdateKind,
    entries: Vec<ManifestEntry>,
}

impl UpdateArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> DfuResult<Self> {
        let path = path.as_ref();
        let dir = extract(path)?;
        let manifest = read_manifest(dir.path(), path)?;
        let (chip, kind) = classify_manifest(&manifest).ok_or_else(|| {
            error!("Could not determine chip family from image");
            DfuError::UnrecognizedArchive(format!(
                "{}: no chip family in manifest",
                path.display()
            ))
        })?;

        let raw: RawManifest = serde_json::from_str(&manifest)?;
        let entries = raw
            .files
            .into_iter()
            .enumerate()
            .map(|(slot, f)| {
                let file = PathBuf::from(f.file);
                if !is_inside_archive(&file) {
                    error!("Manifest points outside the archive");
                    return Err(DfuError::UnrecognizedArchive(format!(
                        "{}: manifest file {} escapes the archive",
                        path.display(),
                        file.display()
                    )));
                }
                Ok(ManifestEntry { file, slot })
            })
            .collect::<DfuResult<Vec<_>>>()?;

        Ok(UpdateArchive {
            dir,
            chip,
            kind,
            entries,
        })
    }

    pub fn chip(&self) -> ChipTarget {
        self.chip
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Extracted path of the file assigned to `slot`.
    pub fn image_for_slot(&self, slot: usize) -> DfuResult<PathBuf> {
        let entry = self.entries.get(slot).ok_or_else(|| {
            DfuError::Configuration(format!(
                "manifest lists {} file(s), no image for slot {slot}",
                self.entries.len()
            ))
        })?;
        Ok(self.dir.path().join(&entry.file))
    }
}

/// Which chip and update mechanism the archive at `path` targets.
///
/// The archive is extracted to a temporary directory that is gone again
/// when this returns.
pub fn classify<P: AsRef<Path>>(path: P) -> DfuResult<(ChipTarget, UpdateKind)> {
    let path = path.as_ref();
    let dir = extract(path)?;
    let manifest = read_manifest(dir.path(), path)?;
    classify_manifest(&manifest).ok_or_else(|| {
        DfuError::UnrecognizedArchive(format!(
            "{}: no chip family in manifest",
            path.display()
        ))
    })
}

/// Classify by marker substrings. A manifest naming both chips, or
/// neither, is not classified.
pub fn classify_manifest(manifest: &str) -> Option<(ChipTarget, UpdateKind)> {
    let kind = if manifest.contains(STAGED_MARKER) {
        UpdateKind::StagedBootloaderImage
    } else {
        UpdateKind::LegacyImageReplace
    };
    let secondary = manifest.contains(ChipTarget::Secondary.name());
    let primary = manifest.contains(ChipTarget::Primary.name());
    match (secondary, primary) {
        (true, false) => Some((ChipTarget::Secondary, kind)),
        (false, true) => Some((ChipTarget::Primary, kind)),
        _ => None,
    }
}

/// Resolve the chip to update from the user's choice and the archive.
pub fn check_chip(
    requested: Option<ChipTarget>,
    detected: ChipTarget,
) -> DfuResult<ChipTarget> {
    match requested {
        Some(chip) if chip != detected => {
            error!("Chip family does not match image");
            Err(DfuError::Configuration(format!(
                "requested {chip}, but the image targets {detected}"
            )))
        }
        _ => Ok(detected),
    }
}

/// Relative and free of `..`, so it stays below the extraction directory.
fn is_inside_archive(file: &Path) -> bool {
    file.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn extract(path: &Path) -> DfuResult<TempDir> {
    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let dir = TempDir::new()?;
    archive.extract(dir.path())?;
    debug!("Extracted {} into {}", path.display(), dir.path().display());
    Ok(dir)
}

fn read_manifest(dir: &Path, archive: &Path) -> DfuResult<String> {
    match fs::read_to_string(dir.join(MANIFEST_FILE)) {
        Ok(manifest) => Ok(manifest),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            error!("Manifest file not found");
            Err(DfuError::UnrecognizedArchive(format!(
                "{}: no {MANIFEST_FILE}",
                archive.display()
            )))
        }
        Err(e) => Err(e.into()),
    }
}
