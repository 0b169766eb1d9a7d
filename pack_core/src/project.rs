use std::fs;
use std::path::{Path, PathBuf};

use compat_idtech3::{QPath, ResourceSet};

use crate::config::{archive_key, PackOptions};
use crate::error::PackError;
use crate::logging::{self, Stage};
use crate::source::{AssetSource, SourceKind, SourceSet};

/// Archives shipped with the base game; they are read but never packed.
pub const BASE_GAME_ARCHIVES: &[&str] = &["pak0", "pak1", "pak2", "mp_bin"];

const ASSET_ROOT_NAME: &str = "etmain";

/// One map being packed: where it lives, where its assets come from and
/// everything collected about it while the run progresses.
#[derive(Debug)]
pub struct MapProject {
    pub name: String,
    /// Name inside the archive (the rename target, if any).
    pub packed_name: String,
    pub map_file: PathBuf,
    pub bsp_file: PathBuf,
    /// Parent of `maps/`.
    pub map_root: PathBuf,
    pub asset_root: PathBuf,
    pub output: PathBuf,
    pub sources: SourceSet,
    pub shaders: ResourceSet,
    pub files: ResourceSet,
    pub has_style_lights: bool,
    pub has_lightmaps: bool,
    pub is_region_compile: bool,
    pub terrain_shaders: Vec<QPath>,
    pub warnings: Vec<String>,
}

impl MapProject {
    /// Validates the on-disk layout and orders the asset sources. Nothing is
    /// indexed or parsed yet.
    pub fn discover(options: &PackOptions) -> Result<Self, PackError> {
        let map_path = options.map.as_path();
        let (name, maps_dir) = split_map_path(map_path)?;
        let map_root = maps_dir
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PackError::Environment(format!("{} has no map root", map_path.display())))?;
        let asset_root = find_asset_root(&map_root)?;

        let map_file = maps_dir.join(format!("{}.map", name));
        let bsp_file = maps_dir.join(format!("{}.bsp", name));
        if !map_file.is_file() {
            return Err(PackError::Environment(format!(
                "map source not found: {}",
                map_file.display()
            )));
        }

        let packed_name = options.rename.clone().unwrap_or_else(|| name.clone());
        let output = resolve_output(options.output.as_deref(), &asset_root, &packed_name);

        let mut warnings = Vec::new();
        let is_region_compile = maps_dir.join(format!("{}.reg", name)).is_file()
            || name.to_ascii_lowercase().ends_with("_region");
        if is_region_compile {
            let message = format!("{} looks like a region compile; the archive may be incomplete", name);
            logging::warn(Stage::Discover, &message);
            warnings.push(message);
        }

        let sources = order_sources(&map_root, &asset_root, &output, &name, &packed_name, options)?;
        for source in &sources {
            logging::debug(Stage::Discover, format!(
                "source {} [{}]{}: {}",
                source.order,
                source.kind,
                if source.not_packed { " not packed" } else { "" },
                source.label
            ));
        }

        Ok(Self {
            name,
            packed_name,
            map_file,
            bsp_file,
            map_root,
            asset_root,
            output,
            sources: SourceSet::new(sources),
            shaders: ResourceSet::new(),
            files: ResourceSet::new(),
            has_style_lights: false,
            has_lightmaps: false,
            is_region_compile,
            terrain_shaders: Vec::new(),
            warnings,
        })
    }

    pub fn is_renamed(&self) -> bool {
        !self.name.eq_ignore_ascii_case(&self.packed_name)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        logging::warn(Stage::Discover, &message);
        self.warnings.push(message);
    }
}

fn split_map_path(map_path: &Path) -> Result<(String, PathBuf), PackError> {
    let bad_layout = || {
        PackError::Environment(format!(
            "expected <root>/maps/<name>.map or .bsp, got {}",
            map_path.display()
        ))
    };
    let ext = map_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .ok_or_else(bad_layout)?;
    if ext != "map" && ext != "bsp" {
        return Err(bad_layout());
    }
    let name = map_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(bad_layout)?;
    let maps_dir = map_path.parent().ok_or_else(bad_layout)?;
    let is_maps = maps_dir
        .file_name()
        .map(|dir| dir.eq_ignore_ascii_case("maps"))
        .unwrap_or(false);
    if !is_maps {
        return Err(bad_layout());
    }
    Ok((name, maps_dir.to_path_buf()))
}

fn find_asset_root(map_root: &Path) -> Result<PathBuf, PackError> {
    let is_asset_root = map_root
        .file_name()
        .map(|name| name.eq_ignore_ascii_case(ASSET_ROOT_NAME))
        .unwrap_or(false);
    if is_asset_root {
        return Ok(map_root.to_path_buf());
    }
    let sibling = map_root
        .parent()
        .map(|parent| parent.join(ASSET_ROOT_NAME))
        .filter(|path| path.is_dir());
    sibling.ok_or_else(|| {
        PackError::Environment(format!(
            "no {} folder next to {}",
            ASSET_ROOT_NAME,
            map_root.display()
        ))
    })
}

fn resolve_output(output: Option<&Path>, asset_root: &Path, packed_name: &str) -> PathBuf {
    let file_name = format!("{}.pk3", packed_name);
    match output {
        Some(path) if path.is_dir() => path.join(file_name),
        Some(path) => path.to_path_buf(),
        None => asset_root.join(file_name),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn listed(list: &[String], key: &str) -> bool {
    list.iter().any(|name| archive_key(name) == key)
}

/// Map root, asset root, unpacked `*.pk3dir` folders, then archives in
/// reverse alphabetical order so later archives override earlier ones.
fn order_sources(
    map_root: &Path,
    asset_root: &Path,
    output: &Path,
    map_name: &str,
    packed_name: &str,
    options: &PackOptions,
) -> Result<Vec<AssetSource>, PackError> {
    let mut sources = vec![AssetSource::new(0, SourceKind::Dir, map_root.to_path_buf(), false)];
    if !same_file(map_root, asset_root) {
        sources.push(AssetSource::new(
            sources.len(),
            SourceKind::Dir,
            asset_root.to_path_buf(),
            false,
        ));
    }

    let entries = fs::read_dir(asset_root).map_err(|source| PackError::io(asset_root, source))?;
    let mut pk3dirs = Vec::new();
    let mut pk3s = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if path.is_dir() && file_name.ends_with(".pk3dir") {
            pk3dirs.push((file_name, path));
        } else if path.is_file() && file_name.ends_with(".pk3") {
            pk3s.push((file_name, path));
        }
    }
    pk3dirs.sort();
    pk3s.sort_by(|a, b| b.0.cmp(&a.0));

    let map_key = map_name.to_ascii_lowercase();
    let packed_key = packed_name.to_ascii_lowercase();
    let not_packed = |key: &str| {
        BASE_GAME_ARCHIVES.contains(&key)
            || listed(&options.exclude, key)
            || listed(&options.mod_provided, key)
    };

    for (file_name, path) in pk3dirs {
        let key = file_name.trim_end_matches(".pk3dir").to_string();
        if listed(&options.ignore, &key) {
            continue;
        }
        sources.push(AssetSource::new(
            sources.len(),
            SourceKind::Dir,
            path,
            not_packed(&key),
        ));
    }
    for (file_name, path) in pk3s {
        let key = archive_key(&file_name);
        if listed(&options.ignore, &key) || key == map_key || key == packed_key {
            continue;
        }
        if same_file(&path, output) {
            continue;
        }
        sources.push(AssetSource::new(
            sources.len(),
            SourceKind::Pk3,
            path,
            not_packed(&key),
        ));
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::{temp_dir, write_file};

    fn labels(project: &MapProject) -> Vec<(String, bool)> {
        project
            .sources
            .sources()
            .iter()
            .map(|source| {
                let name = source
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (name, source.not_packed)
            })
            .collect()
    }

    #[test]
    fn orders_sources_inside_etmain() {
        let root = temp_dir("project_etmain");
        let etmain = root.join("etmain");
        write_file(&etmain, "maps/test.map", b"");
        for name in ["pak0.pk3", "zz_textures.pk3", "aa_sounds.pk3", "test.pk3", "old.pk3", "Mod_Stuff.pk3"] {
            write_file(&etmain, name, b"PK");
        }
        fs::create_dir_all(etmain.join("wip.pk3dir")).unwrap();

        let options = PackOptions {
            map: etmain.join("maps/test.map"),
            ignore: vec!["old.pk3".to_string()],
            mod_provided: vec!["mod_stuff".to_string()],
            ..PackOptions::default()
        };
        let project = MapProject::discover(&options).unwrap();
        assert_eq!(project.name, "test");
        assert_eq!(project.output, etmain.join("test.pk3"));
        assert_eq!(
            labels(&project),
            vec![
                ("etmain".to_string(), false),
                ("wip.pk3dir".to_string(), false),
                ("zz_textures.pk3".to_string(), false),
                ("pak0.pk3".to_string(), true),
                ("Mod_Stuff.pk3".to_string(), true),
                ("aa_sounds.pk3".to_string(), false),
            ]
        );
        let orders: Vec<usize> = project.sources.sources().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4, 5]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sibling_project_folder() {
        let root = temp_dir("project_sibling");
        write_file(&root, "mymap/maps/beach.map", b"");
        write_file(&root, "mymap/maps/beach.reg", b"");
        fs::create_dir_all(root.join("etmain")).unwrap();
        let out_dir = root.join("out");
        fs::create_dir_all(&out_dir).unwrap();

        let options = PackOptions {
            map: root.join("mymap/maps/beach.bsp"),
            rename: Some("beach_final".to_string()),
            output: Some(out_dir.clone()),
            ..PackOptions::default()
        };
        let project = MapProject::discover(&options).unwrap();
        assert_eq!(project.map_file, root.join("mymap/maps/beach.map"));
        assert_eq!(project.output, out_dir.join("beach_final.pk3"));
        assert!(project.is_renamed());
        assert!(project.is_region_compile);
        assert_eq!(project.warnings.len(), 1);
        assert_eq!(
            labels(&project),
            vec![("mymap".to_string(), false), ("etmain".to_string(), false)]
        );

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn environment_errors() {
        let root = temp_dir("project_env");
        write_file(&root, "mymap/maps/lonely.map", b"");
        write_file(&root, "mymap/lonely.map", b"");

        let missing_etmain = PackOptions {
            map: root.join("mymap/maps/lonely.map"),
            ..PackOptions::default()
        };
        assert!(matches!(
            MapProject::discover(&missing_etmain),
            Err(PackError::Environment(_))
        ));

        let not_in_maps = PackOptions {
            map: root.join("mymap/lonely.map"),
            ..PackOptions::default()
        };
        assert!(matches!(
            MapProject::discover(&not_in_maps),
            Err(PackError::Environment(_))
        ));

        fs::create_dir_all(root.join("etmain")).unwrap();
        let no_source = PackOptions {
            map: root.join("mymap/maps/other.bsp"),
            ..PackOptions::default()
        };
        assert!(matches!(
            MapProject::discover(&no_source),
            Err(PackError::Environment(_))
        ));

        let _ = fs::remove_dir_all(root);
    }
}
