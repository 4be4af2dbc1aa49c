//! Firmware image files and their MD5 digests.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::ErrorKind;
use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image file {0:?} not found")]
    NotFound(PathBuf),

    #[error("reading image file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed MD5 digest '{0}', expected 32 hex digits")]
    MalformedDigest(String),

    #[error("image {path:?} digest {actual} does not match expected {expected}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Precondition
    }

    pub fn status(&self) -> Status {
        match self {
            ImageError::NotFound(_) | ImageError::Io { .. } => Status::FileOperationError,
            ImageError::MalformedDigest(_) => Status::ParamFault,
            ImageError::DigestMismatch { .. } => Status::FirmwareFileNotSuitable,
        }
    }
}

/// MD5 digest of `data`
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Parse a hex MD5 digest, with or without a `0x` prefix
pub fn parse_digest(s: &str) -> Result<[u8; 16], ImageError> {
    let t = s.trim();
    let t = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);

    if t.len() != 32 {
        return Err(ImageError::MalformedDigest(s.to_string()));
    }

    let mut digest = [0u8; 16];
    hex::decode_to_slice(t, &mut digest).map_err(|_| ImageError::MalformedDigest(s.to_string()))?;

    Ok(digest)
}

/// Firmware image loaded into memory
#[derive(Clone, Debug)]
pub struct Image {
    path: PathBuf,
    data: Vec<u8>,
    digest: [u8; 16],
}

impl Image {
    /// Load an image file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref().to_path_buf();

        let data = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ImageError::NotFound(path.clone()),
            _ => ImageError::Io {
                path: path.clone(),
                source: e,
            },
        })?;

        let digest = md5(&data);
        debug!(
            "Loaded {:?}: {} bytes, md5 {}",
            path,
            data.len(),
            hex::encode(digest)
        );

        Ok(Self { path, data, digest })
    }

    /// Load an image file, checking it against an expected MD5 digest
    pub fn load_verified<P: AsRef<Path>>(path: P, md5: &str) -> Result<Self, ImageError> {
        let expected = parse_digest(md5)?;
        let image = Self::load(path)?;

        if image.digest != expected {
            error!("Image digest mismatch for {:?}", image.path);
            return Err(ImageError::DigestMismatch {
                path: image.path,
                expected: hex::encode(expected),
                actual: hex::encode(image.digest),
            });
        }

        Ok(image)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> [u8; 16] {
        self.digest
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}
