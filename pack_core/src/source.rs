use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use compat_idtech3::QPath;
use zip::read::ZipArchive;

use crate::error::{PackError, SourceError};
use crate::jobs::{CancelToken, Jobs};
use crate::logging::{self, Stage};

/// Extensions the packer can reference; everything else is left out of the index.
const INDEXED_EXTENSIONS: &[&str] = &[
    "tga", "jpg", "jpeg", "png", "shader", "md3", "mdc", "ase", "skin", "wav", "ogg", "roq",
    "script", "sounds", "sps", "arena", "bsp", "objdata", "txt", "cfg", "map",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Dir,
    Pk3,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceKind::Dir => "dir",
            SourceKind::Pk3 => "pk3",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetLocation {
    File(PathBuf),
    ZipEntry { archive: PathBuf, entry: String },
}

/// A file inside a source, under the name it is stored as.
#[derive(Clone, Debug)]
pub struct Asset {
    pub name: QPath,
    pub location: AssetLocation,
}

impl Asset {
    pub fn read(&self) -> Result<Vec<u8>, SourceError> {
        match &self.location {
            AssetLocation::File(path) => fs::read(path).map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            }),
            AssetLocation::ZipEntry { archive, entry } => {
                let file = fs::File::open(archive).map_err(|source| SourceError::Io {
                    path: archive.clone(),
                    source,
                })?;
                let zip_error = |source| SourceError::Zip {
                    path: archive.clone(),
                    source,
                };
                let mut zip = ZipArchive::new(file).map_err(zip_error)?;
                let mut file = zip.by_name(entry).map_err(zip_error)?;
                let mut buffer = Vec::with_capacity(file.size() as usize);
                file.read_to_end(&mut buffer)
                    .map_err(|source| SourceError::Io {
                        path: archive.join(entry),
                        source,
                    })?;
                Ok(buffer)
            }
        }
    }

    pub fn describe(&self) -> String {
        match &self.location {
            AssetLocation::File(path) => path.display().to_string(),
            AssetLocation::ZipEntry { archive, entry } => {
                format!("{}:{}", archive.display(), entry)
            }
        }
    }
}

#[derive(Debug, Default)]
struct SourceIndex {
    entries: HashMap<QPath, Asset>,
}

impl SourceIndex {
    /// Texture fallback: `.tga` is also reachable extensionless; `.jpg` also
    /// answers for the `.tga` and extensionless names when nothing else does.
    /// A compressed `.mdc` model answers for its `.md3` name the same way.
    fn insert(&mut self, asset: Asset) {
        let name = asset.name.clone();
        match name.extension() {
            Some("tga") => {
                self.entries.insert(name.without_extension(), asset.clone());
                self.entries.insert(name, asset);
            }
            Some("jpg") => {
                if let Ok(tga) = name.with_extension("tga") {
                    self.entries.entry(tga).or_insert_with(|| asset.clone());
                }
                self.entries
                    .entry(name.without_extension())
                    .or_insert_with(|| asset.clone());
                self.entries.insert(name, asset);
            }
            Some("mdc") => {
                if let Ok(md3) = name.with_extension("md3") {
                    self.entries.entry(md3).or_insert_with(|| asset.clone());
                }
                self.entries.insert(name, asset);
            }
            _ => {
                self.entries.insert(name, asset);
            }
        }
    }

    /// Entries stored under their own name, sorted.
    fn stored(&self) -> impl Iterator<Item = &Asset> + '_ {
        let mut assets: Vec<&Asset> = self
            .entries
            .iter()
            .filter(|(key, asset)| key.key() == asset.name.key())
            .map(|(_, asset)| asset)
            .collect();
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        assets.into_iter()
    }
}

/// A directory or pk3 the packer reads assets from. Created un-indexed;
/// `index` runs once, after which the source is read-only.
#[derive(Debug)]
pub struct AssetSource {
    pub order: usize,
    pub kind: SourceKind,
    pub path: PathBuf,
    /// Present in the game install already; found assets are not copied.
    pub not_packed: bool,
    pub label: String,
    index: Option<SourceIndex>,
}

impl AssetSource {
    pub fn new(order: usize, kind: SourceKind, path: PathBuf, not_packed: bool) -> Self {
        let label = match kind {
            SourceKind::Dir => path.display().to_string(),
            SourceKind::Pk3 => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };
        Self {
            order,
            kind,
            path,
            not_packed,
            label,
            index: None,
        }
    }

    /// Builds the lookup table and returns the number of files seen.
    pub fn index(&mut self, cancel: &CancelToken) -> Result<usize, SourceError> {
        let mut index = SourceIndex::default();
        let count = match self.kind {
            SourceKind::Dir => index_dir(&self.path, &mut index, cancel)?,
            SourceKind::Pk3 => index_pk3(&self.path, &mut index, cancel)?,
        };
        self.index = Some(index);
        Ok(count)
    }

    /// Marks the source as indexed with no entries (a broken archive).
    pub fn index_empty(&mut self) {
        self.index = Some(SourceIndex::default());
    }

    fn indexed(&self) -> Result<&SourceIndex, SourceError> {
        self.index.as_ref().ok_or_else(|| SourceError::NotIndexed {
            label: self.label.clone(),
        })
    }

    pub fn get(&self, name: &QPath) -> Result<Option<&Asset>, SourceError> {
        Ok(self.indexed()?.entries.get(name))
    }

    pub fn contains(&self, name: &QPath) -> Result<bool, SourceError> {
        Ok(self.indexed()?.entries.contains_key(name))
    }

    pub fn len(&self) -> Result<usize, SourceError> {
        Ok(self.indexed()?.stored().count())
    }

    pub fn shader_files(&self) -> Result<Vec<&Asset>, SourceError> {
        Ok(self
            .indexed()?
            .stored()
            .filter(|asset| asset.name.starts_with("scripts/") && asset.name.has_extension("shader"))
            .collect())
    }

    pub fn prefix_entries(&self, prefix: &str) -> Result<Vec<&Asset>, SourceError> {
        Ok(self
            .indexed()?
            .stored()
            .filter(|asset| asset.name.starts_with(prefix))
            .collect())
    }
}

fn is_indexed_name(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((_, ext)) => INDEXED_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

fn index_dir(root: &Path, index: &mut SourceIndex, cancel: &CancelToken) -> Result<usize, SourceError> {
    let mut files = Vec::new();
    walk_dir_files(root, root, &mut files, cancel)?;
    let mut count = 0usize;
    for (full, rel) in files {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        if !is_indexed_name(&rel) {
            continue;
        }
        let Ok(name) = QPath::new(&rel) else {
            logging::debug(Stage::Index, format!("skipping over-long path {}", full.display()));
            continue;
        };
        index.insert(Asset {
            name,
            location: AssetLocation::File(full),
        });
        count += 1;
    }
    Ok(count)
}

fn walk_dir_files(
    root: &Path,
    current: &Path,
    files: &mut Vec<(PathBuf, String)>,
    cancel: &CancelToken,
) -> Result<(), SourceError> {
    if cancel.is_cancelled() {
        return Err(SourceError::Cancelled);
    }
    let io_error = |source| SourceError::Io {
        path: current.to_path_buf(),
        source,
    };
    let mut entries: Vec<_> = fs::read_dir(current)
        .map_err(io_error)?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        let file_type = entry.file_type().map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        if file_type.is_dir() {
            // Unpacked archives are sources of their own.
            if file_name.ends_with(".pk3dir") {
                continue;
            }
            walk_dir_files(root, &path, files, cancel)?;
        } else if file_type.is_file() {
            if file_name.ends_with(".pk3") {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            files.push((path, rel));
        }
    }
    Ok(())
}

fn index_pk3(path: &Path, index: &mut SourceIndex, cancel: &CancelToken) -> Result<usize, SourceError> {
    let file = fs::File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let archive = ZipArchive::new(file).map_err(|source| SourceError::Zip {
        path: path.to_path_buf(),
        source,
    })?;
    let mut count = 0usize;
    for entry in archive.file_names() {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        if entry.ends_with('/') || !is_indexed_name(entry) {
            continue;
        }
        let Ok(name) = QPath::new(entry) else {
            continue;
        };
        index.insert(Asset {
            name,
            location: AssetLocation::ZipEntry {
                archive: path.to_path_buf(),
                entry: entry.to_string(),
            },
        });
        count += 1;
    }
    Ok(count)
}

/// All sources of a run, ordered by priority (lowest `order` first).
#[derive(Debug, Default)]
pub struct SourceSet {
    sources: Vec<AssetSource>,
}

impl SourceSet {
    pub fn new(mut sources: Vec<AssetSource>) -> Self {
        sources.sort_by_key(|source| source.order);
        Self { sources }
    }

    pub fn sources(&self) -> &[AssetSource] {
        &self.sources
    }

    /// Indexes every source on the pool. A source that fails to index is
    /// reported and treated as empty; cancellation aborts.
    pub fn index_all(&mut self, jobs: &Jobs, cancel: &CancelToken) -> Result<Vec<String>, PackError> {
        let sources = std::mem::take(&mut self.sources);
        let results = jobs.map("index", sources, |mut source| {
            let result = source.index(cancel);
            (source, result)
        })?;
        let mut warnings = Vec::new();
        for (mut source, result) in results {
            match result {
                Ok(count) => {
                    logging::debug(Stage::Index, format!("indexed {} ({} files)", source.label, count));
                }
                Err(SourceError::Cancelled) => return Err(PackError::Cancelled),
                Err(err) => {
                    let message = format!("skipping source {}: {}", source.label, err);
                    logging::warn(Stage::Index, &message);
                    warnings.push(message);
                    source.index_empty();
                }
            }
            self.sources.push(source);
        }
        Ok(warnings)
    }

    /// First source, by priority, that has `name`.
    pub fn find(&self, name: &QPath) -> Result<Option<(&AssetSource, &Asset)>, SourceError> {
        for source in &self.sources {
            if let Some(asset) = source.get(name)? {
                return Ok(Some((source, asset)));
            }
        }
        Ok(None)
    }

    /// Every shader file of every source, in priority order.
    pub fn shader_files(&self) -> Result<Vec<(&AssetSource, &Asset)>, SourceError> {
        let mut files = Vec::new();
        for source in &self.sources {
            for asset in source.shader_files()? {
                files.push((source, asset));
            }
        }
        Ok(files)
    }

    /// Entries under `prefix`; a name present in several sources resolves to
    /// the highest-priority one.
    pub fn prefix_entries(&self, prefix: &str) -> Result<Vec<(&AssetSource, &Asset)>, SourceError> {
        let mut seen = std::collections::HashSet::new();
        let mut entries = Vec::new();
        for source in &self.sources {
            for asset in source.prefix_entries(prefix)? {
                if seen.insert(asset.name.clone()) {
                    entries.push((source, asset));
                }
            }
        }
        Ok(entries)
    }
}
