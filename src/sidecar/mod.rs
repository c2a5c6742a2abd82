//! Per-image metadata files stored next to the images they describe.
//!
//! A sidecar for `shots/login.png` lives at `shots/login.png.shotmeta.json`.
//! The image itself is never written to; only the sidecar changes.

pub mod models;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::errors::{Result, ShotError};
use crate::hash::hash_file;
use crate::storage::write_atomic;
use models::{
    Annotation, AnnotationPatch, CaptureMetadata, ChecksumStatus, EditOperation, EditRecord,
    IntegrityWarning, SIDECAR_VERSION, ScanEntry, SidecarData, SidecarLoad, SidecarUpdate,
    major_of,
};

pub const SIDECAR_SUFFIX: &str = ".shotmeta.json";

pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tiff", "tif"];

pub fn is_supported_image(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX))
}

/// Deterministic sidecar location: same directory, full file name plus the
/// suffix, so `shot.png` and `shot.jpg` never share one.
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    let mut name = image_path.file_name().unwrap_or_default().to_os_string();
    name.push(SIDECAR_SUFFIX);
    image_path.with_file_name(name)
}

/// The image a sidecar belongs to, if that image still exists.
pub async fn image_for_sidecar(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let image = sidecar.with_file_name(name.strip_suffix(SIDECAR_SUFFIX)?);
    if !is_supported_image(&image) {
        return None;
    }
    match tokio::fs::metadata(&image).await {
        Ok(meta) if meta.is_file() => Some(image),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SidecarStore;

impl SidecarStore {
    pub fn new() -> Self {
        Self
    }

    pub fn sidecar_path(&self, image_path: &Path) -> PathBuf {
        sidecar_path(image_path)
    }

    pub async fn exists(&self, image_path: &Path) -> bool {
        tokio::fs::try_exists(sidecar_path(image_path))
            .await
            .unwrap_or(false)
    }

    /// Writes a fresh sidecar for an existing image, replacing any previous one.
    pub async fn create(
        &self,
        image_path: &Path,
        metadata: CaptureMetadata,
        tags: BTreeSet<String>,
        notes: &str,
        annotations: Vec<Annotation>,
    ) -> Result<SidecarData> {
        if !tokio::fs::try_exists(image_path).await? {
            return Err(ShotError::NotFound(image_path.display().to_string()));
        }
        let checksum = hash_file(image_path).await?;
        let now = Utc::now();
        let data = SidecarData {
            version: SIDECAR_VERSION.to_string(),
            original_image_path: image_path.to_path_buf(),
            original_image_checksum: checksum,
            created_at: now,
            modified_at: now,
            metadata,
            tags,
            notes: notes.to_string(),
            annotations,
            edit_history: vec![EditRecord::new(EditOperation::Created, None)],
            ocr_text: None,
            ocr_completed: false,
        };
        self.write(image_path, &data).await?;
        log::debug!("created sidecar for {}", image_path.display());
        Ok(data)
    }

    /// Loads and verifies a sidecar. Integrity problems come back as warnings;
    /// an unparsable file is treated as absent.
    pub async fn load(&self, image_path: &Path) -> Result<Option<SidecarLoad>> {
        let path = sidecar_path(image_path);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ShotError::Io(e)),
        };
        let data: SidecarData = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("ignoring corrupt sidecar {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let mut warnings = Vec::new();
        if data.major_version() != major_of(SIDECAR_VERSION) {
            log::warn!(
                "sidecar {} has schema {} (expected {})",
                path.display(),
                data.version,
                SIDECAR_VERSION
            );
            warnings.push(IntegrityWarning::SchemaMismatch {
                found: data.version.clone(),
                expected: SIDECAR_VERSION.to_string(),
            });
        }
        match checksum_status(image_path, &data.original_image_checksum).await? {
            ChecksumStatus::Match => {}
            ChecksumStatus::Mismatch { expected, actual } => {
                log::warn!(
                    "checksum mismatch for {}: sidecar has {}, image is {}",
                    image_path.display(),
                    &expected[..expected.len().min(16)],
                    &actual[..actual.len().min(16)]
                );
                warnings.push(IntegrityWarning::ChecksumMismatch { expected, actual });
            }
            ChecksumStatus::ImageMissing => {
                log::warn!("sidecar {} has no image", path.display());
                warnings.push(IntegrityWarning::ImageMissing);
            }
        }
        Ok(Some(SidecarLoad { data, warnings }))
    }

    pub async fn load_data(&self, image_path: &Path) -> Result<Option<SidecarData>> {
        Ok(self.load(image_path).await?.map(|l| l.data))
    }

    pub async fn verify_checksum(&self, image_path: &Path) -> Result<ChecksumStatus> {
        let data = self
            .read_raw(image_path)
            .await?
            .ok_or_else(|| ShotError::NotFound(sidecar_path(image_path).display().to_string()))?;
        checksum_status(image_path, &data.original_image_checksum).await
    }

    /// Read-merge-write. Returns `false` when there is no sidecar to update.
    pub async fn update(&self, image_path: &Path, update: SidecarUpdate) -> Result<bool> {
        self.modify(image_path, |data| {
            if let Some(tags) = update.tags {
                if tags != data.tags {
                    data.tags = tags;
                    data.edit_history
                        .push(EditRecord::new(EditOperation::TagsChanged, None));
                }
            }
            if let Some(notes) = update.notes {
                if notes != data.notes {
                    data.notes = notes;
                    data.edit_history
                        .push(EditRecord::new(EditOperation::NotesChanged, None));
                }
            }
            if let Some(annotations) = update.annotations {
                data.annotations = annotations;
            }
            if let Some(ocr_text) = update.ocr_text {
                data.ocr_text = Some(ocr_text);
            }
            if let Some(done) = update.ocr_completed {
                data.ocr_completed = done;
            }
            Ok(())
        })
        .await
    }

    pub async fn add_tags(&self, image_path: &Path, tags: &[String]) -> Result<bool> {
        self.modify(image_path, |data| {
            let before = data.tags.len();
            data.tags.extend(tags.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
            if data.tags.len() != before {
                data.edit_history.push(EditRecord::new(
                    EditOperation::TagsChanged,
                    Some(format!("added {}", tags.join(", "))),
                ));
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_tags(&self, image_path: &Path, tags: &[String]) -> Result<bool> {
        self.modify(image_path, |data| {
            let before = data.tags.len();
            for tag in tags {
                data.tags.remove(tag.trim());
            }
            if data.tags.len() != before {
                data.edit_history.push(EditRecord::new(
                    EditOperation::TagsChanged,
                    Some(format!("removed {}", tags.join(", "))),
                ));
            }
            Ok(())
        })
        .await
    }

    pub async fn add_annotation(&self, image_path: &Path, annotation: Annotation) -> Result<bool> {
        if !annotation.position.is_valid() {
            return Err(ShotError::InvalidInput(format!(
                "annotation {} has an invalid position",
                annotation.id
            )));
        }
        self.modify(image_path, |data| {
            let details = format!("{} {}", annotation.kind.as_str(), annotation.id);
            data.annotations.push(annotation);
            data.edit_history
                .push(EditRecord::new(EditOperation::AnnotationAdded, Some(details)));
            Ok(())
        })
        .await
    }

    pub async fn update_annotation(
        &self,
        image_path: &Path,
        annotation_id: &str,
        patch: AnnotationPatch,
    ) -> Result<bool> {
        if patch.position.is_some_and(|p| !p.is_valid()) {
            return Err(ShotError::InvalidInput("invalid annotation position".into()));
        }
        self.modify(image_path, |data| {
            let ann = data
                .annotations
                .iter_mut()
                .find(|a| a.id == annotation_id)
                .ok_or_else(|| ShotError::NotFound(format!("annotation {annotation_id}")))?;
            if let Some(color) = patch.color {
                ann.color = color;
            }
            if let Some(position) = patch.position {
                ann.position = position;
            }
            if let Some(text) = patch.text {
                ann.text = Some(text);
            }
            if let Some(number) = patch.number {
                ann.number = Some(number);
            }
            if let Some(blur) = patch.blur_intensity {
                ann.blur_intensity = Some(blur);
            }
            if let Some(visible) = patch.visible {
                ann.visible = visible;
            }
            if let Some(z) = patch.z_index {
                ann.z_index = z;
            }
            ann.modified_at = Utc::now();
            data.edit_history.push(EditRecord::new(
                EditOperation::AnnotationUpdated,
                Some(annotation_id.to_string()),
            ));
            Ok(())
        })
        .await
    }

    /// Returns `true` whenever the sidecar exists, even if no annotation had that id.
    pub async fn remove_annotation(&self, image_path: &Path, annotation_id: &str) -> Result<bool> {
        self.modify(image_path, |data| {
            let before = data.annotations.len();
            data.annotations.retain(|a| a.id != annotation_id);
            if data.annotations.len() != before {
                data.edit_history.push(EditRecord::new(
                    EditOperation::AnnotationRemoved,
                    Some(annotation_id.to_string()),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Entry point for the OCR collaborator. Does not refuse the write when the
    /// image checksum has drifted; it logs instead.
    pub async fn set_ocr_result(&self, image_path: &Path, text: &str) -> Result<bool> {
        if let Some(data) = self.read_raw(image_path).await? {
            if let ChecksumStatus::Mismatch { .. } =
                checksum_status(image_path, &data.original_image_checksum).await?
            {
                log::warn!(
                    "writing OCR text for {} although its checksum has changed",
                    image_path.display()
                );
            }
        }
        self.modify(image_path, |data| {
            data.ocr_text = Some(text.to_string());
            data.ocr_completed = true;
            data.edit_history.push(EditRecord::new(
                EditOperation::OcrCompleted,
                Some(format!("{} chars", text.chars().count())),
            ));
            Ok(())
        })
        .await
    }

    /// Points a sidecar at its image's new location after a move.
    pub async fn relink(&self, image_path: &Path) -> Result<bool> {
        let target = image_path.to_path_buf();
        self.modify(image_path, |data| {
            if data.original_image_path != target {
                let details = format!("from {}", data.original_image_path.display());
                data.original_image_path = target;
                data.edit_history
                    .push(EditRecord::new(EditOperation::Relinked, Some(details)));
            }
            Ok(())
        })
        .await
    }

    /// Removes the sidecar. `Ok(false)` if there was none.
    pub async fn delete(&self, image_path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(sidecar_path(image_path)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShotError::Io(e)),
        }
    }

    /// Lists supported images directly inside `dir` (not recursive), with or
    /// without a sidecar, sorted by path.
    pub async fn scan_directory(&self, dir: &Path) -> Result<Vec<ScanEntry>> {
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !is_supported_image(&path) {
                continue;
            }
            let sidecar = sidecar_path(&path);
            let has_sidecar = tokio::fs::try_exists(&sidecar).await.unwrap_or(false);
            entries.push(ScanEntry {
                image_path: path,
                sidecar_path: sidecar,
                has_sidecar,
            });
        }
        entries.sort_by(|a, b| a.image_path.cmp(&b.image_path));
        Ok(entries)
    }

    /// Parses without verifying; `None` for missing or corrupt files.
    async fn read_raw(&self, image_path: &Path) -> Result<Option<SidecarData>> {
        let path = sidecar_path(image_path);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => Ok(Some(data)),
                Err(e) => {
                    log::warn!("ignoring corrupt sidecar {}: {}", path.display(), e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ShotError::Io(e)),
        }
    }

    async fn modify<F>(&self, image_path: &Path, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut SidecarData) -> Result<()>,
    {
        let Some(mut data) = self.read_raw(image_path).await? else {
            return Ok(false);
        };
        apply(&mut data)?;
        data.modified_at = Utc::now();
        self.write(image_path, &data).await?;
        Ok(true)
    }

    async fn write(&self, image_path: &Path, data: &SidecarData) -> Result<()> {
        let json = serde_json::to_vec_pretty(data)?;
        write_atomic(&sidecar_path(image_path), &json).await
    }
}

async fn checksum_status(image_path: &Path, expected: &str) -> Result<ChecksumStatus> {
    if !tokio::fs::try_exists(image_path).await? {
        return Ok(ChecksumStatus::ImageMissing);
    }
    let actual = hash_file(image_path).await?;
    if actual == expected {
        Ok(ChecksumStatus::Match)
    } else {
        Ok(ChecksumStatus::Mismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
