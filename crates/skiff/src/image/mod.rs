//! Local image store.
//!
//! An image is a directory `images/<id>/` holding a `config.json` manifest
//! and a `layer/` directory. Images may derive from another image through
//! `from`; the overlay lower stack walks that chain.

mod command;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffPaths, SkiffResult};

pub use command::resolve_command;

/// Id and name of the image installed by `image import`.
pub const BASE_IMAGE: &str = "base";

/// Timestamp format used in manifests and container records.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Image manifest (`images/<id>/config.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    /// Image id.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Version tag; empty when untagged.
    pub version: String,
    /// Creation time.
    pub create_time: String,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Container paths that get an anonymous volume.
    pub volume: Vec<String>,
    /// Exposed ports.
    pub expose: Vec<String>,
    /// Labels.
    pub label: Vec<String>,
    /// Parent image reference; empty for a root image.
    pub from: String,
    /// Entrypoint.
    #[serde(rename = "entryPoint")]
    pub entry_point: Vec<String>,
    /// Whether the entrypoint is in shell form.
    #[serde(rename = "entryPointShellType")]
    pub entry_point_shell: bool,
    /// Default command.
    pub cmd: Vec<String>,
    /// Whether the default command is in shell form.
    #[serde(rename = "CMDShellType")]
    pub cmd_shell: bool,
    /// Working directory of the container process.
    #[serde(rename = "workDir")]
    pub work_dir: String,
}

impl ImageInfo {
    /// `name[:version]`.
    #[must_use]
    pub fn reference(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.version)
        }
    }

    /// Manifest of the base image.
    #[must_use]
    pub fn base() -> Self {
        Self {
            id: BASE_IMAGE.to_string(),
            name: BASE_IMAGE.to_string(),
            create_time: chrono::Local::now().format(TIME_FORMAT).to_string(),
            entry_point: vec!["sh".to_string(), "-c".to_string()],
            cmd: vec!["echo I am base image".to_string()],
            work_dir: "/".to_string(),
            ..Self::default()
        }
    }
}

/// Reads and writes image manifests under the runtime root.
#[derive(Debug, Clone)]
pub struct ImageStore {
    paths: SkiffPaths,
}

impl ImageStore {
    /// Store rooted at `paths`.
    #[must_use]
    pub fn new(paths: SkiffPaths) -> Self {
        Self { paths }
    }

    /// Layer directory of image `id`.
    #[must_use]
    pub fn layer_dir(&self, id: &str) -> PathBuf {
        self.paths.image_layer(id)
    }

    /// Load the manifest of image `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ImageNotFound`] if there is no manifest, or an
    /// error if it cannot be parsed.
    pub fn get(&self, id: &str) -> SkiffResult<ImageInfo> {
        let path = self.paths.image_config(id);
        let json = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SkiffError::ImageNotFound {
                    reference: id.to_string(),
                }
            } else {
                SkiffError::from_io(e, format!("read {}", path.display()))
            }
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Persist `image`'s manifest, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn save(&self, image: &ImageInfo) -> SkiffResult<()> {
        fs::create_dir_all(self.paths.image(&image.id))?;
        let json = serde_json::to_string_pretty(image)?;
        fs::write(self.paths.image_config(&image.id), json)?;
        tracing::debug!(image = %image.id, "Saved image manifest");
        Ok(())
    }

    /// Every readable manifest, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be read.
    pub fn list(&self) -> SkiffResult<Vec<ImageInfo>> {
        let dir = self.paths.images();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.get(&id) {
                Ok(image) => images.push(image),
                Err(e) => tracing::warn!(image = %id, error = %e, "Skipping unreadable image"),
            }
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    /// Find an image by exact `name[:version]`, then by id prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ImageNotFound`] when nothing matches and
    /// [`SkiffError::AmbiguousReference`] when several images do.
    pub fn resolve(&self, reference: &str) -> SkiffResult<ImageInfo> {
        let images = self.list()?;

        let by_name: Vec<_> = images
            .iter()
            .filter(|image| image.reference() == reference)
            .collect();
        let matched = if by_name.is_empty() {
            images
                .iter()
                .filter(|image| !reference.is_empty() && image.id.starts_with(reference))
                .collect()
        } else {
            by_name
        };

        match matched.as_slice() {
            [image] => Ok((*image).clone()),
            [] => Err(SkiffError::ImageNotFound {
                reference: reference.to_string(),
            }),
            many => Err(SkiffError::AmbiguousReference {
                kind: "image",
                reference: reference.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Layer directories of `image` and its ancestors, most-derived first.
    ///
    /// # Errors
    ///
    /// Returns an error if an ancestor is missing or the chain loops.
    pub fn layer_chain(&self, image: &ImageInfo) -> SkiffResult<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut layers = Vec::new();
        let mut current = image.clone();

        loop {
            if !seen.insert(current.id.clone()) {
                return Err(SkiffError::Config {
                    message: format!("image '{}' derives from itself", current.id),
                });
            }
            layers.push(self.layer_dir(&current.id));
            if current.from.is_empty() {
                break;
            }
            current = self.resolve(&current.from)?;
        }

        Ok(layers)
    }

    /// Install the base image from a root filesystem tarball, plain or
    /// gzip-compressed. Importing again unpacks over the existing layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tarball cannot be read or unpacked.
    pub fn import_base(&self, tarball: &Path) -> SkiffResult<ImageInfo> {
        let layer = self.layer_dir(BASE_IMAGE);
        fs::create_dir_all(&layer)?;

        let mut file = File::open(tarball)
            .map_err(|e| SkiffError::from_io(e, format!("open {}", tarball.display())))?;
        let mut magic = [0u8; 2];
        let gzip = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
        file.seek(SeekFrom::Start(0))?;

        tracing::info!(tarball = %tarball.display(), gzip, "Importing base image");
        let reader = BufReader::new(file);
        if gzip {
            unpack(GzDecoder::new(reader), &layer)?;
        } else {
            unpack(reader, &layer)?;
        }

        let image = ImageInfo::base();
        self.save(&image)?;
        Ok(image)
    }
}

fn unpack<R: Read>(reader: R, dest: &Path) -> SkiffResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| SkiffError::from_io(e, format!("unpack into {}", dest.display())))
}
