use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use compat_idtech3::{QPath, Resource, ResourceSet};
use zip::write::FileOptions;
use zip::CompressionMethod;

use crate::closure::Closure;
use crate::error::PackError;
use crate::jobs::CancelToken;
use crate::logging::{self, Stage};
use crate::project::MapProject;
use crate::source::{Asset, AssetSource};

pub const ARCHIVE_COMMENT_PREFIX: &str = "mappack";

/// Replaces a map name inside text auxiliaries when the map is renamed.
/// Matches ignore ASCII case and must not touch letters or digits on
/// either side, so `test` rewrites `maps/test.bsp` but not `textures`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRewrite {
    pub from: String,
    pub to: String,
}

impl LineRewrite {
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        let from = self.from.as_bytes();
        if from.is_empty() {
            return data.to_vec();
        }
        let mut out = Vec::with_capacity(data.len());
        let mut index = 0;
        while index < data.len() {
            let end = index + from.len();
            let matches = end <= data.len()
                && data[index..end].eq_ignore_ascii_case(from)
                && (index == 0 || !data[index - 1].is_ascii_alphanumeric())
                && data.get(end).map_or(true, |byte| !byte.is_ascii_alphanumeric());
            if matches {
                out.extend_from_slice(self.to.as_bytes());
                index = end;
            } else {
                out.push(data[index]);
                index += 1;
            }
        }
        out
    }

    /// Renames path segments named after the map (`maps/test/lm_0000.tga`,
    /// `levelshots/test_cc.tga`).
    pub fn rename_path(&self, name: &str) -> String {
        String::from_utf8_lossy(&self.apply(name.as_bytes())).into_owned()
    }
}

#[derive(Debug)]
pub struct PlannedEntry {
    pub archive_name: String,
    pub asset: Asset,
    pub source_order: usize,
    pub required: bool,
    pub rewrite: Option<LineRewrite>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingAsset {
    pub name: QPath,
    pub origin: String,
}

#[derive(Debug, Default)]
pub struct ArchivePlan {
    pub entries: Vec<PlannedEntry>,
    /// Found in a source the game already ships.
    pub satisfied_not_packed: usize,
    pub missing: Vec<MissingAsset>,
}

#[derive(Clone, Copy, Debug)]
pub struct PlanOptions {
    pub strict: bool,
    pub include_source: bool,
}

#[derive(Debug, Default)]
pub struct WriteSummary {
    pub entries_written: usize,
    pub io_failures: Vec<String>,
}

struct AuxFile {
    name: String,
    archive_name: String,
    required: bool,
    text: bool,
}

fn aux_files(project: &MapProject, include_source: bool) -> Vec<AuxFile> {
    let map = &project.name;
    let new = &project.packed_name;
    let mut aux = vec![AuxFile {
        name: format!("maps/{}.bsp", map),
        archive_name: format!("maps/{}.bsp", new),
        required: true,
        text: false,
    }];
    if include_source {
        aux.push(AuxFile {
            name: format!("maps/{}.map", map),
            archive_name: format!("maps/{}.map", new),
            required: true,
            text: false,
        });
    }
    for (name, archive_name) in [
        (format!("maps/{}.objdata", map), format!("maps/{}.objdata", new)),
        (format!("maps/{}_tracemap.tga", map), format!("maps/{}_tracemap.tga", new)),
    ] {
        aux.push(AuxFile {
            name,
            archive_name,
            required: false,
            text: false,
        });
    }
    for (name, archive_name) in [
        (format!("maps/{}.script", map), format!("maps/{}.script", new)),
        (format!("scripts/{}.arena", map), format!("scripts/{}.arena", new)),
        (format!("sound/maps/{}.sounds", map), format!("sound/maps/{}.sounds", new)),
        (format!("sound/maps/{}.sps", map), format!("sound/maps/{}.sps", new)),
    ] {
        aux.push(AuxFile {
            name,
            archive_name,
            required: false,
            text: true,
        });
    }
    aux.push(AuxFile {
        name: format!("scripts/q3map2_{}.shader", map),
        archive_name: format!("scripts/q3map2_{}.shader", new),
        required: project.has_style_lights,
        text: true,
    });
    aux
}

struct Planner<'a> {
    project: &'a MapProject,
    rewrite: Option<LineRewrite>,
    seen: HashSet<String>,
    plan: ArchivePlan,
}

impl<'a> Planner<'a> {
    fn add(&mut self, source: &AssetSource, asset: &Asset, archive_name: String, required: bool, text: bool) {
        if source.not_packed {
            self.plan.satisfied_not_packed += 1;
            return;
        }
        if !self.seen.insert(archive_name.to_ascii_lowercase()) {
            return;
        }
        self.plan.entries.push(PlannedEntry {
            archive_name,
            asset: asset.clone(),
            source_order: source.order,
            required,
            rewrite: if text { self.rewrite.clone() } else { None },
        });
    }

    fn add_resource(&mut self, resource: &Resource, optional: bool) -> Result<(), PackError> {
        if resource.source_only {
            return Ok(());
        }
        let project = self.project;
        match project.sources.find(&resource.path)? {
            Some((source, asset)) => {
                let archive_name = match (&self.rewrite, optional) {
                    (Some(rewrite), true) => rewrite.rename_path(asset.name.as_str()),
                    _ => asset.name.to_string(),
                };
                self.add(source, asset, archive_name, false, false);
            }
            None if optional => {}
            None if resource.dev_only => logging::debug(
                Stage::Plan,
                format!("no {} (editor image, {})", resource.path, resource.describe_origin()),
            ),
            None => self.plan.missing.push(MissingAsset {
                name: resource.path.clone(),
                origin: resource.describe_origin(),
            }),
        }
        Ok(())
    }
}

/// Resolves every candidate file to a source. Nothing is written; a strict
/// plan with missing assets fails here, before any output exists.
pub fn plan(
    project: &MapProject,
    closure: &Closure,
    options: &PlanOptions,
) -> Result<ArchivePlan, PackError> {
    let rewrite = project.is_renamed().then(|| LineRewrite {
        from: project.name.clone(),
        to: project.packed_name.clone(),
    });
    let mut planner = Planner {
        project,
        rewrite,
        seen: HashSet::new(),
        plan: ArchivePlan::default(),
    };

    let mut aux_names = HashSet::new();
    for aux in aux_files(project, options.include_source) {
        let name = QPath::new(&aux.name).map_err(|err| PackError::parse(aux.name.clone(), err))?;
        aux_names.insert(name.clone());
        match project.sources.find(&name)? {
            Some((source, asset)) if asset.name == name => {
                planner.add(source, asset, aux.archive_name, aux.required, aux.text)
            }
            _ if aux.required => return Err(PackError::MissingRequired { name: aux.name }),
            _ => {}
        }
    }

    let lightmap_prefix = format!("maps/{}/", project.name);
    for (source, asset) in project.sources.prefix_entries(&lightmap_prefix)? {
        let file_name = asset.name.as_str().rsplit('/').next().unwrap_or("");
        if !file_name.to_ascii_lowercase().starts_with("lm_") {
            continue;
        }
        let archive_name = format!("maps/{}/{}", project.packed_name, file_name);
        planner.add(source, asset, archive_name, false, false);
    }

    // `scripts/q3map2_<map>.shader` is an aux entry and may already be renamed.
    for (order, file) in closure.shader_files.iter().filter(|(_, file)| !aux_names.contains(file)) {
        let source = project
            .sources
            .sources()
            .iter()
            .find(|source| source.order == *order);
        if let Some(source) = source {
            if let Some(asset) = source.get(file)? {
                planner.add(source, asset, asset.name.to_string(), false, false);
            }
        }
    }

    let mut files = ResourceSet::new();
    files.merge(&project.files);
    files.merge(&closure.files);
    for resource in files.files() {
        planner.add_resource(resource, false)?;
    }
    for resource in closure.optional.files() {
        planner.add_resource(resource, true)?;
    }

    let plan = planner.plan;
    for missing in &plan.missing {
        let message = format!("missing {} (referenced at {})", missing.name, missing.origin);
        if options.strict {
            logging::error(Stage::Plan, message);
        } else {
            logging::warn(Stage::Plan, message);
        }
    }
    if options.strict {
        if let Some(first) = plan.missing.first() {
            return Err(PackError::Missing {
                count: plan.missing.len(),
                first: first.name.to_string(),
            });
        }
    }
    Ok(plan)
}

/// Removes the temporary archive unless the write completed.
struct PartialOutput {
    path: PathBuf,
    committed: bool,
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn write(
    plan: &ArchivePlan,
    output: &Path,
    overwrite: bool,
    cancel: &CancelToken,
) -> Result<WriteSummary, PackError> {
    if output.exists() && !overwrite {
        return Err(PackError::OutputExists(output.to_path_buf()));
    }
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PackError::io(parent, source))?;
    }
    let mut partial_name = output.as_os_str().to_owned();
    partial_name.push(".partial");
    let mut partial = PartialOutput {
        path: PathBuf::from(partial_name),
        committed: false,
    };
    let archive_error = |source| PackError::Archive {
        path: output.to_path_buf(),
        source,
    };

    let file = fs::File::create(&partial.path).map_err(|source| PackError::io(&partial.path, source))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = WriteSummary::default();
    for entry in &plan.entries {
        if cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        // Read in full before the entry starts; a failed read skips the file.
        let data = match entry.asset.read() {
            Ok(data) => match &entry.rewrite {
                Some(rewrite) => rewrite.apply(&data),
                None => data,
            },
            Err(err) if entry.required => return Err(err.into()),
            Err(err) => {
                let message = format!("skipping {}: {}", entry.archive_name, err);
                logging::warn(Stage::Write, &message);
                summary.io_failures.push(message);
                continue;
            }
        };
        zip.start_file(entry.archive_name.as_str(), options)
            .map_err(archive_error)?;
        zip.write_all(&data)
            .map_err(|source| PackError::io(&partial.path, source))?;
        summary.entries_written += 1;
        logging::debug(
            Stage::Write,
            format!("packed {} from {}", entry.archive_name, entry.asset.describe()),
        );
    }
    zip.set_comment(format!(
        "{} {}",
        ARCHIVE_COMMENT_PREFIX,
        env!("CARGO_PKG_VERSION")
    ));
    zip.finish().map_err(archive_error)?;

    fs::rename(&partial.path, output).map_err(|source| PackError::io(output, source))?;
    partial.committed = true;
    Ok(summary)
}
