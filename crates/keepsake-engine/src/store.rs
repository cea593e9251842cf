use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::ImageFormat;
use tracing::warn;

/// Sniffs the upload's real format from magic bytes; declared content types
/// are never trusted. Only JPEG and PNG are accepted.
pub fn sniff_format(bytes: &[u8]) -> Result<ImageFormat> {
    let format = image::guess_format(bytes)
        .map_err(|_| anyhow::anyhow!("unsupported image type; upload a JPEG or PNG photo"))?;
    match format {
        ImageFormat::Jpeg | ImageFormat::Png => Ok(format),
        other => bail!(
            "unsupported image type ({other:?}); upload a JPEG or PNG photo"
        ),
    }
}

pub fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        _ => "png",
    }
}

pub fn mime_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        _ => "image/png",
    }
}

/// Holds uploaded photos while their task is in flight. Files are keyed by
/// task id, so concurrent tasks can never collide.
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create upload dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn save(&self, task_id: &str, bytes: &[u8], format: ImageFormat) -> Result<UploadedImage> {
        let path = self
            .dir
            .join(format!("{task_id}.{}", extension_for(format)));
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write upload {}", path.display()))?;
        Ok(UploadedImage { path, format })
    }
}

/// One uploaded photo, removed exactly once when its pipeline finishes.
pub struct UploadedImage {
    path: PathBuf,
    format: ImageFormat,
}

impl UploadedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mime(&self) -> &'static str {
        mime_for(self.format)
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).with_context(|| format!("failed reading {}", self.path.display()))
    }

    /// Consumes the handle; a failed removal is logged and otherwise ignored
    /// so it can never override a task's recorded outcome.
    pub fn remove(self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove uploaded photo");
        }
    }
}

/// Writes finished artifacts under `<public>/generated/` and hands back the
/// URL path they are served from.
pub struct ArtifactStore {
    generated_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(public_dir: impl Into<PathBuf>) -> Result<Self> {
        let generated_dir = public_dir.into().join("generated");
        fs::create_dir_all(&generated_dir).with_context(|| {
            format!("failed to create artifact dir {}", generated_dir.display())
        })?;
        Ok(Self { generated_dir })
    }

    pub fn generated_dir(&self) -> &Path {
        &self.generated_dir
    }

    pub fn save_png(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        let path = self.generated_dir.join(file_name);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write artifact {}", path.display()))?;
        Ok(format!("/generated/{file_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    const JPEG_MAGIC: &[u8] = &[0xff, 0xd8, 0xff, 0xe0];

    #[test]
    fn sniff_accepts_jpeg_and_png_magic() -> anyhow::Result<()> {
        assert_eq!(sniff_format(PNG_MAGIC)?, ImageFormat::Png);
        assert_eq!(sniff_format(JPEG_MAGIC)?, ImageFormat::Jpeg);
        Ok(())
    }

    #[test]
    fn sniff_rejects_other_content() {
        assert!(sniff_format(b"plain text").is_err());
        // GIF decodes fine but is outside the upload contract.
        assert!(sniff_format(b"GIF89a\x01\x00\x01\x00").is_err());
    }

    #[test]
    fn upload_save_and_remove_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = UploadStore::new(temp.path().join("uploads"))?;

        let upload = store.save("task-1", b"bytes", ImageFormat::Png)?;
        assert!(upload.path().exists());
        assert_eq!(upload.mime(), "image/png");
        assert_eq!(upload.read()?, b"bytes");

        let path = upload.path().to_path_buf();
        upload.remove();
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn uploads_are_keyed_by_task_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = UploadStore::new(temp.path())?;
        let first = store.save("task-a", b"a", ImageFormat::Jpeg)?;
        let second = store.save("task-b", b"b", ImageFormat::Jpeg)?;
        assert_ne!(first.path(), second.path());
        Ok(())
    }

    #[test]
    fn artifacts_land_under_generated_with_matching_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path())?;

        let url = store.save_png("abc-card.png", b"png bytes")?;
        assert_eq!(url, "/generated/abc-card.png");
        assert!(temp.path().join("generated/abc-card.png").exists());
        Ok(())
    }
}
