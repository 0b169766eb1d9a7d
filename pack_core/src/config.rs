use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Everything a packing run needs. Loaded from TOML, then overridden by
/// command-line flags.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackOptions {
    /// `<root>/maps/<name>.map` or `.bsp`.
    pub map: PathBuf,
    /// Archive path, or a directory to place `<name>.pk3` in.
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub rename: Option<String>,
    pub loose: bool,
    pub include_source: bool,
    pub shaderlist_only: bool,
    pub overwrite: bool,
    /// Archives that are never scanned.
    pub ignore: Vec<String>,
    /// Archives that are scanned but never packed.
    pub exclude: Vec<String>,
    /// Archives provided by the mod the map runs under.
    pub mod_provided: Vec<String>,
    /// Worker threads; 0 picks one per core.
    pub jobs: usize,
}

#[derive(Clone, Debug, Default)]
pub struct OptionsValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl OptionsValidation {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl PackOptions {
    pub fn parse_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn load_toml(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(path, &text)
    }

    pub fn map_name(&self) -> Option<String> {
        self.map
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    }

    pub fn validate(&self) -> OptionsValidation {
        let mut validation = OptionsValidation::default();
        if self.map.as_os_str().is_empty() {
            validation.errors.push("map path must not be empty".to_string());
        } else {
            let ext = self
                .map
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
            if !matches!(ext.as_deref(), Some("map") | Some("bsp")) {
                validation
                    .errors
                    .push(format!("map must be a .map or .bsp file: {}", self.map.display()));
            }
        }
        if let Some(rename) = &self.rename {
            if !is_valid_map_name(rename) {
                validation
                    .errors
                    .push(format!("invalid rename target '{}'", rename));
            } else if self
                .map_name()
                .map(|name| name.eq_ignore_ascii_case(rename))
                .unwrap_or(false)
            {
                validation
                    .warnings
                    .push("rename target equals the map name".to_string());
            }
        }
        if let Some(output) = &self.output {
            let is_pk3 = output
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("pk3"))
                .unwrap_or(false);
            if !is_pk3 && !output.is_dir() {
                validation.warnings.push(format!(
                    "output {} does not end in .pk3",
                    output.display()
                ));
            }
        }
        if self.dry_run && self.overwrite {
            validation
                .warnings
                .push("--overwrite has no effect with --dry-run".to_string());
        }
        if self.jobs > 256 {
            validation
                .warnings
                .push(format!("{} worker threads requested", self.jobs));
        }
        for name in self.ignore.iter().chain(&self.exclude).chain(&self.mod_provided) {
            if name.trim().is_empty() {
                validation
                    .errors
                    .push("archive names must not be empty".to_string());
                break;
            }
        }
        validation
    }
}

fn is_valid_map_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+'))
}

/// Archive file name without directories or extension, lowercased, for
/// comparing against `--ignore`/`--exclude`/`--mod` lists.
pub fn archive_key(name: &str) -> String {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let lower = file.trim().to_ascii_lowercase();
    match lower.strip_suffix(".pk3") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_with_defaults() {
        let text = r#"
map = "etmain/maps/goldrush.map"
loose = true
exclude = ["pak0.pk3", "sd-mapobjects"]
jobs = 4
"#;
        let options = PackOptions::parse_toml(Path::new("mappack.toml"), text).unwrap();
        assert!(options.loose);
        assert!(!options.dry_run);
        assert_eq!(options.exclude.len(), 2);
        assert_eq!(options.jobs, 4);
        assert_eq!(options.map_name().as_deref(), Some("goldrush"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = PackOptions::parse_toml(Path::new("mappack.toml"), "colour = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn validation_reports_errors_and_warnings() {
        let options = PackOptions {
            map: PathBuf::from("maps/test.txt"),
            rename: Some("bad name".to_string()),
            dry_run: true,
            overwrite: true,
            ..PackOptions::default()
        };
        let validation = options.validate();
        assert_eq!(validation.errors.len(), 2);
        assert_eq!(validation.warnings.len(), 1);

        let options = PackOptions {
            map: PathBuf::from("maps/test.bsp"),
            rename: Some("TEST".to_string()),
            ..PackOptions::default()
        };
        let validation = options.validate();
        assert!(validation.is_ok());
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn archive_keys_ignore_case_and_extension() {
        assert_eq!(archive_key("PAK0.PK3"), "pak0");
        assert_eq!(archive_key("etmain/sd-mapobjects.pk3"), "sd-mapobjects");
        assert_eq!(archive_key("mp_bin"), "mp_bin");
    }
}
