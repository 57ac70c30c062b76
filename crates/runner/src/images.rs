//! Image materialization: writes data-URI attachments to temp files under
//! the project, returns the paths for prompt injection, and removes the
//! whole set when the invocation ends.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

use agentdeck_protocol::ImageAttachment;

/// Temp files written for one invocation. The directory and every file in
/// it are removed by `cleanup`, unconditionally on exit or error.
#[derive(Debug, Default)]
pub struct MaterializedImages {
    pub paths: Vec<PathBuf>,
    dir: Option<PathBuf>,
}

impl MaterializedImages {
    pub fn cleanup(&self) {
        for path in &self.paths {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        component = "runner",
                        event = "runner.images.cleanup_failed",
                        path = %path.display(),
                        error = %e,
                        "Failed to remove temp image"
                    );
                }
            }
        }
        if let Some(dir) = &self.dir {
            // Only the per-invocation timestamp directory; .tmp/images stays
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        component = "runner",
                        event = "runner.images.cleanup_dir_failed",
                        path = %dir.display(),
                        error = %e,
                        "Failed to remove temp image directory"
                    );
                }
            }
        }
    }
}

/// Decode each attachment's data URI to
/// `<cwd>/.tmp/images/<nowMs>/image_<index>.<ext>`. Malformed URIs are
/// skipped with a log; the invocation proceeds without them.
pub fn materialize_images(
    cwd: &Path,
    images: &[ImageAttachment],
) -> std::io::Result<MaterializedImages> {
    if images.is_empty() {
        return Ok(MaterializedImages::default());
    }

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let dir = cwd.join(".tmp").join("images").join(now_ms.to_string());
    fs::create_dir_all(&dir)?;

    let mut paths = Vec::new();
    for (index, image) in images.iter().enumerate() {
        // "data:<mime>;base64,<payload>": anything else is skipped, the
        // invocation proceeds without the attachment
        let decoded = image.data.split_once(',').and_then(|(header, payload)| {
            let mime = header.strip_prefix("data:")?.strip_suffix(";base64")?;
            let bytes = STANDARD.decode(payload).ok()?;
            Some((mime.to_string(), bytes))
        });
        let Some((mime, bytes)) = decoded else {
            warn!(
                component = "runner",
                event = "runner.images.skipped",
                name = %image.name,
                "Skipping malformed image attachment"
            );
            continue;
        };

        let path = dir.join(format!("image_{}.{}", index, mime_to_extension(&mime)));
        fs::write(&path, &bytes)?;
        paths.push(path);
    }

    Ok(MaterializedImages {
        paths,
        dir: Some(dir),
    })
}

fn mime_to_extension(mime: &str) -> &str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "png",
    }
}
