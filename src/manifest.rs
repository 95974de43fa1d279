//! Firmware manifest: the ordered set of images to program
//!
//! Entries missing either a file name or its bytes are kept as
//! [`ManifestEntry::Incomplete`] and are skipped when programming.

use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the bytes of an image come from
#[derive(Debug, Clone, PartialEq)]
pub enum ByteSource {
    /// Read from disk when the image is programmed
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ByteSource {
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match self {
            ByteSource::File(path) => tokio::fs::read(path).await,
            ByteSource::Memory(data) => Ok(data.to_vec()),
        }
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        ByteSource::Memory(data.into())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OffsetError {
    #[error("empty flash offset")]
    Empty,
    #[error("invalid flash offset '{0}': {1}")]
    Invalid(String, ParseIntError),
}

/// Parse a hexadecimal flash offset, with or without a `0x` prefix
pub fn parse_offset(s: &str) -> Result<u32, OffsetError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(OffsetError::Empty);
    }

    u32::from_str_radix(digits, 16).map_err(|e| OffsetError::Invalid(s.to_string(), e))
}

/// A complete, programmable image
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareImage {
    pub name: String,
    pub source: ByteSource,
    /// Hexadecimal flash offset, parsed at programming time
    pub offset: String,
}

impl FirmwareImage {
    pub fn offset(&self) -> Result<u32, OffsetError> {
        parse_offset(&self.offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestEntry {
    Ready(FirmwareImage),
    Incomplete { name: Option<String>, offset: String },
}

impl ManifestEntry {
    /// Build an entry from optional parts. Empty names count as absent.
    pub fn new(name: Option<String>, source: Option<ByteSource>, offset: impl Into<String>) -> Self {
        let name = name.filter(|n| !n.is_empty());
        let offset = offset.into();

        match (name, source) {
            (Some(name), Some(source)) => ManifestEntry::Ready(FirmwareImage { name, source, offset }),
            (name, _) => ManifestEntry::Incomplete { name, offset },
        }
    }

    /// Placeholder entry with only an offset
    pub fn empty(offset: impl Into<String>) -> Self {
        ManifestEntry::Incomplete {
            name: None,
            offset: offset.into(),
        }
    }

    /// Entry backed by a file on disk, named after the file
    pub fn file(path: impl Into<PathBuf>, offset: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        Self::new(name, Some(ByteSource::File(path)), offset)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ManifestEntry::Ready(i) => Some(&i.name),
            ManifestEntry::Incomplete { name, .. } => name.as_deref(),
        }
    }

    pub fn offset(&self) -> &str {
        match self {
            ManifestEntry::Ready(i) => &i.offset,
            ManifestEntry::Incomplete { offset, .. } => offset,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ManifestEntry::Ready(_))
    }
}

/// Ordered manifest owned by the caller
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, index: usize) -> Option<ManifestEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    /// Attach a file to the entry at `index`, keeping its offset
    pub fn set_file(&mut self, index: usize, name: impl Into<String>, source: ByteSource) -> bool {
        match self.entries.get_mut(index) {
            Some(e) => {
                let offset = e.offset().to_string();
                *e = ManifestEntry::new(Some(name.into()), Some(source), offset);
                true
            }
            None => false,
        }
    }

    pub fn set_offset(&mut self, index: usize, offset: impl Into<String>) -> bool {
        let offset = offset.into();
        match self.entries.get_mut(index) {
            Some(ManifestEntry::Ready(i)) => i.offset = offset,
            Some(ManifestEntry::Incomplete { offset: o, .. }) => *o = offset,
            None => return false,
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, index: usize) -> Option<&ManifestEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_ready()).count()
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Manifest {
    type Item = &'a ManifestEntry;
    type IntoIter = std::slice::Iter<'a, ManifestEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Supplies the starting manifest for a detected chip
pub trait ManifestDefaults: Send + Sync {
    fn default_manifest(&self, chip_name: &str) -> Manifest;
}

/// Placeholder offsets by chip family
#[derive(Debug, Clone, Copy, Default)]
pub struct ChipDefaults;

impl ChipDefaults {
    pub fn offsets(chip_name: &str) -> &'static [&'static str] {
        let chip = chip_name.to_ascii_uppercase();

        if chip.starts_with("ESP32") {
            &["1000", "8000", "10000"]
        } else {
            // STM32 offsets are relative to the flash base
            &["0"]
        }
    }
}

impl ManifestDefaults for ChipDefaults {
    fn default_manifest(&self, chip_name: &str) -> Manifest {
        Self::offsets(chip_name)
            .iter()
            .map(|o| ManifestEntry::empty(*o))
            .collect()
    }
}
