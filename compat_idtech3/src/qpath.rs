use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Engine limit for game paths (`MAX_QPATH`).
pub const MAX_QPATH: usize = 64;

/// A game-relative path compared ordinally and case-insensitively.
///
/// The display form keeps the spelling it was created with (separators are
/// always `/`); equality, ordering and hashing use a pre-normalized key so the
/// value can be used directly as a map key.
#[derive(Clone, Debug)]
pub struct QPath {
    display: String,
    key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QPathError {
    Empty,
    TooLong { path: String, len: usize },
}

impl fmt::Display for QPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QPathError::Empty => write!(f, "game path is empty"),
            QPathError::TooLong { path, len } => write!(
                f,
                "game path exceeds {} characters ({}): {}",
                MAX_QPATH, len, path
            ),
        }
    }
}

impl std::error::Error for QPathError {}

impl QPath {
    pub fn new(input: &str) -> Result<Self, QPathError> {
        let display = input.trim().replace('\\', "/");
        let display = display.trim_start_matches('/').to_string();
        if display.is_empty() {
            return Err(QPathError::Empty);
        }
        if display.len() > MAX_QPATH {
            return Err(QPathError::TooLong {
                len: display.len(),
                path: display,
            });
        }
        let key = display.to_ascii_lowercase();
        Ok(Self { display, key })
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Lowercased comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lowercased extension without the dot, if the last segment has one.
    pub fn extension(&self) -> Option<&str> {
        let file = self.key.rsplit('/').next().unwrap_or(&self.key);
        let (_, ext) = file.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        self.extension()
            .map(|value| value.eq_ignore_ascii_case(ext))
            .unwrap_or(false)
    }

    pub fn without_extension(&self) -> QPath {
        match self.extension() {
            Some(ext) => {
                let cut = self.display.len() - ext.len() - 1;
                let display = self.display[..cut].to_string();
                let key = self.key[..cut].to_string();
                QPath { display, key }
            }
            None => self.clone(),
        }
    }

    pub fn with_extension(&self, ext: &str) -> Result<QPath, QPathError> {
        let stem = self.without_extension();
        QPath::new(&format!("{}.{}", stem.display, ext))
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.key.starts_with(&prefix.to_ascii_lowercase())
    }

    /// Last path segment without its extension.
    pub fn file_stem(&self) -> &str {
        let file = self.display.rsplit('/').next().unwrap_or(&self.display);
        match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        self.display.rsplit_once('/').map(|(parent, _)| parent)
    }
}

impl PartialEq for QPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QPath {}

impl Hash for QPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for QPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for QPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

impl std::str::FromStr for QPath {
    type Err = QPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QPath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn case_and_separator_insensitive() {
        let a = QPath::new("Textures\\Base\\Wall.TGA").unwrap();
        let b = QPath::new("textures/base/wall.tga").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "Textures/Base/Wall.TGA");

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn rejects_long_paths() {
        let long = format!("textures/{}", "x".repeat(MAX_QPATH));
        assert!(matches!(
            QPath::new(&long),
            Err(QPathError::TooLong { .. })
        ));
        assert_eq!(QPath::new("  "), Err(QPathError::Empty));
    }

    #[test]
    fn extension_helpers() {
        let path = QPath::new("models/mapobjects/tree.MD3").unwrap();
        assert_eq!(path.extension(), Some("md3"));
        assert_eq!(path.without_extension().as_str(), "models/mapobjects/tree");
        assert_eq!(path.file_stem(), "tree");
        assert_eq!(
            path.with_extension("mdc").unwrap().as_str(),
            "models/mapobjects/tree.mdc"
        );

        let dotted_dir = QPath::new("maps/v1.0/readme").unwrap();
        assert_eq!(dotted_dir.extension(), None);
    }
}
