//! Firmware artifact (IPSW) inspection: checksum, container readability and
//! the embedded build manifest.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use tracing::{debug, error};

const HASH_CHUNK_BYTES: usize = 1024 * 1024;
const MANIFEST_NAME: &str = "BuildManifest.plist";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactReport {
    pub ok: bool,
    pub size: u64,
    pub sha256: Option<String>,
    pub has_manifest: bool,
    pub error: Option<String>,
}

impl ArtifactReport {
    fn failed(size: u64, error: impl Into<String>) -> Self {
        Self {
            size,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Opaque artifact check used by preflight.
pub trait ArtifactValidator: Send + Sync {
    fn validate(&self, path: &Path) -> ArtifactReport;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IpswValidator;

impl ArtifactValidator for IpswValidator {
    fn validate(&self, path: &Path) -> ArtifactReport {
        validate_ipsw(path)
    }
}

pub fn validate_ipsw(path: impl AsRef<Path>) -> ArtifactReport {
    let path = path.as_ref();
    if !path.exists() {
        return ArtifactReport::failed(0, "IPSW not found");
    }
    if !path.is_file() {
        return ArtifactReport::failed(0, "IPSW path is not a file");
    }
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => return ArtifactReport::failed(0, err.to_string()),
    };
    if size == 0 {
        return ArtifactReport::failed(0, "IPSW file is empty");
    }

    let sha256 = match hash_file(path) {
        Ok(digest) => digest,
        Err(err) => {
            error!(path = %path.display(), error = %err, "hashing IPSW failed");
            return ArtifactReport::failed(size, format!("{:#}", err));
        }
    };

    let mut report = ArtifactReport {
        size,
        sha256: Some(sha256),
        ..ArtifactReport::default()
    };
    match inspect_manifest(path) {
        Ok(has_manifest) => {
            report.has_manifest = has_manifest;
            report.ok = true;
        }
        Err(err) => {
            debug!(path = %path.display(), error = %err, "IPSW container unreadable");
            report.error = Some(err.to_string());
        }
    }
    report
}

pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; HASH_CHUNK_BYTES];
    let mut hasher = Sha256::new();
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<File>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    zip::ZipArchive::new(file).map_err(|_| anyhow!("IPSW is not a valid ZIP archive"))
}

fn manifest_entry(archive: &zip::ZipArchive<File>) -> Option<String> {
    archive
        .file_names()
        .find(|name| name.ends_with(MANIFEST_NAME))
        .map(str::to_string)
}

/// Whether the archive carries a build manifest; the entry is read through
/// to prove it is intact.
fn inspect_manifest(path: &Path) -> Result<bool> {
    let mut archive = open_archive(path)?;
    let Some(name) = manifest_entry(&archive) else {
        return Ok(false);
    };
    let mut entry = archive.by_name(&name)?;
    std::io::copy(&mut entry, &mut std::io::sink())?;
    Ok(true)
}

fn read_manifest(path: &Path) -> Result<Option<plist::Value>> {
    let mut archive = open_archive(path)?;
    let Some(name) = manifest_entry(&archive) else {
        return Ok(None);
    };
    let mut bytes = Vec::new();
    archive.by_name(&name)?.read_to_end(&mut bytes)?;
    Ok(Some(plist::Value::from_reader(Cursor::new(bytes))?))
}

/// Product type named by the IPSW's build manifest: top-level `ProductType`,
/// else the first build identity's `Info.ProductType` or `Info.DeviceClass`.
pub fn product_from_manifest(path: impl AsRef<Path>) -> Option<String> {
    let path = path.as_ref();
    let manifest = match read_manifest(path) {
        Ok(Some(manifest)) => manifest,
        Ok(None) => return None,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "manifest parsing failed");
            return None;
        }
    };
    let dict = manifest.as_dictionary()?;
    if let Some(product) = dict.get("ProductType").and_then(plist::Value::as_string) {
        return Some(product.to_string());
    }
    let info = dict
        .get("BuildIdentities")?
        .as_array()?
        .first()?
        .as_dictionary()?
        .get("Info")?
        .as_dictionary()?;
    ["ProductType", "DeviceClass"]
        .iter()
        .find_map(|key| info.get(*key).and_then(plist::Value::as_string))
        .map(str::to_string)
}
