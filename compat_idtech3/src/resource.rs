use std::collections::HashMap;
use std::fmt;

use crate::qpath::{QPath, QPathError};

/// File and line a reference was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRef {
    pub path: String,
    pub number: usize,
}

impl fmt::Display for LineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.number)
    }
}

/// One reference extracted from a map, shader or script.
///
/// A source-only resource takes part in dependency expansion but is never
/// packed itself (e.g. a `misc_model` that the compiler bakes into the BSP).
/// A dev-only resource (editor or light image) is packed when present and
/// never reported when missing.
#[derive(Clone, Debug)]
pub struct Resource {
    pub path: QPath,
    pub is_shader: bool,
    pub line: Option<LineRef>,
    pub source_only: bool,
    pub dev_only: bool,
}

impl Resource {
    pub fn file(path: QPath) -> Self {
        Self {
            path,
            is_shader: false,
            line: None,
            source_only: false,
            dev_only: false,
        }
    }

    pub fn shader(path: QPath) -> Self {
        Self {
            path,
            is_shader: true,
            line: None,
            source_only: false,
            dev_only: false,
        }
    }

    pub fn parse_file(path: &str) -> Result<Self, QPathError> {
        QPath::new(path).map(Self::file)
    }

    pub fn parse_shader(path: &str) -> Result<Self, QPathError> {
        QPath::new(path).map(Self::shader)
    }

    pub fn at(mut self, line: LineRef) -> Self {
        self.line = Some(line);
        self
    }

    pub fn source_only(mut self, source_only: bool) -> Self {
        self.source_only = source_only;
        self
    }

    pub fn dev_only(mut self, dev_only: bool) -> Self {
        self.dev_only = dev_only;
        self
    }

    pub fn identity(&self) -> (bool, &QPath) {
        (self.is_shader, &self.path)
    }

    pub fn describe_origin(&self) -> String {
        match &self.line {
            Some(line) => line.to_string(),
            None => "<generated>".to_string(),
        }
    }
}

/// Insertion-ordered resource collection keyed by `(is_shader, path)`.
///
/// The first real reference wins; a source-only or dev-only entry is
/// upgraded when a stronger reference to the same identity arrives later.
#[derive(Clone, Debug, Default)]
pub struct ResourceSet {
    items: Vec<Resource>,
    lookup: HashMap<(bool, QPath), usize>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the set changed.
    pub fn insert(&mut self, resource: Resource) -> bool {
        let key = (resource.is_shader, resource.path.clone());
        match self.lookup.get(&key) {
            Some(&index) => {
                let existing = &mut self.items[index];
                let source_only = existing.source_only && resource.source_only;
                let dev_only = existing.dev_only && resource.dev_only;
                if source_only == existing.source_only && dev_only == existing.dev_only {
                    return false;
                }
                *existing = Resource {
                    source_only,
                    dev_only,
                    ..resource
                };
                true
            }
            None => {
                self.lookup.insert(key, self.items.len());
                self.items.push(resource);
                true
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = Resource>>(&mut self, resources: I) {
        for resource in resources {
            self.insert(resource);
        }
    }

    pub fn merge(&mut self, other: &ResourceSet) {
        for resource in other.iter() {
            self.insert(resource.clone());
        }
    }

    pub fn get(&self, is_shader: bool, path: &QPath) -> Option<&Resource> {
        self.lookup
            .get(&(is_shader, path.clone()))
            .map(|&index| &self.items[index])
    }

    pub fn contains(&self, is_shader: bool, path: &QPath) -> bool {
        self.lookup.contains_key(&(is_shader, path.clone()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.items.iter()
    }

    pub fn shaders(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.items.iter().filter(|item| item.is_shader)
    }

    pub fn files(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.items.iter().filter(|item| !item.is_shader)
    }

    pub fn packable(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.items.iter().filter(|item| !item.source_only)
    }
}

impl IntoIterator for ResourceSet {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<Resource> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut set = ResourceSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(source_only: bool) -> Resource {
        Resource::parse_file("models/mapobjects/crate.md3")
            .unwrap()
            .source_only(source_only)
    }

    #[test]
    fn source_only_is_upgraded() {
        let mut set = ResourceSet::new();
        assert!(set.insert(model(true)));
        assert!(set.insert(model(false)));
        assert_eq!(set.len(), 1);
        assert!(!set.iter().next().unwrap().source_only);
    }

    #[test]
    fn real_reference_is_kept() {
        let mut set = ResourceSet::new();
        assert!(set.insert(model(false)));
        assert!(!set.insert(model(true)));
        assert_eq!(set.len(), 1);
        assert!(!set.iter().next().unwrap().source_only);
    }

    #[test]
    fn runtime_reference_clears_dev_only() {
        let editor = || {
            Resource::parse_file("textures/base/wall_editor.tga")
                .unwrap()
                .dev_only(true)
        };
        let mut set = ResourceSet::new();
        assert!(set.insert(editor()));
        assert!(!set.insert(editor()));
        assert!(set.insert(Resource::parse_file("textures/base/wall_editor.tga").unwrap()));
        assert!(!set.iter().next().unwrap().dev_only);
        assert!(!set.insert(editor()));
        assert!(!set.iter().next().unwrap().dev_only);
    }

    #[test]
    fn shader_and_file_identities_differ() {
        let mut set = ResourceSet::new();
        set.insert(Resource::parse_shader("textures/base/wall").unwrap());
        set.insert(Resource::parse_file("TEXTURES/base/wall").unwrap());
        set.insert(Resource::parse_file("textures/base/wall").unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set.shaders().count(), 1);
        assert_eq!(set.files().count(), 1);
    }

    #[test]
    fn preserves_insertion_order() {
        let set: ResourceSet = ["b", "a", "c", "a"]
            .iter()
            .map(|name| Resource::parse_file(name).unwrap())
            .collect();
        let names: Vec<&str> = set.iter().map(|item| item.path.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
