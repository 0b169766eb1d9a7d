use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use compat_idtech3::bsp_q3::{read_bsp_summary, BspSummary};
use compat_idtech3::lines::decode_text;
use compat_idtech3::map_dump::{parse_map_dump, MapDumpOptions, MapParseError};
use compat_idtech3::mdx::parse_model_materials;
use compat_idtech3::scripts::{
    scan_map_script, scan_skin, scan_sound_script, scan_speaker_script, ScanInterrupted, ScriptRefs,
};
use compat_idtech3::shader_script::{parse_shader_script, ShaderParseError, ShaderParseOptions};
use compat_idtech3::{QPath, Resource};

use crate::closure::{self, lookup_key, Closure};
use crate::config::PackOptions;
use crate::error::{ConfigError, PackError};
use crate::jobs::{CancelToken, Jobs, JobsConfig};
use crate::logging::{self, Stage};
use crate::project::MapProject;
use crate::shader_table::{parse_shaderlist, ConflictEvent, ShaderEntry, ShaderTable};
use crate::source::Asset;
use crate::writer::{self, MissingAsset, PlanOptions};

/// Outcome of one packing run.
#[derive(Debug, Default)]
pub struct PackReport {
    /// `None` on a dry run.
    pub output: Option<PathBuf>,
    /// Archive names, in write order.
    pub entries: Vec<String>,
    pub skipped_not_packed: usize,
    pub missing: Vec<MissingAsset>,
    pub io_failures: Vec<String>,
    pub conflicts: Vec<ConflictEvent>,
    pub warnings: Vec<String>,
    pub included_shaders: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScriptKind {
    Sounds,
    Speakers,
    MapScript,
    Skin,
}

pub fn run(options: &PackOptions, cancel: &CancelToken) -> Result<PackReport, PackError> {
    let validation = options.validate();
    for warning in &validation.warnings {
        logging::warn(Stage::Discover, warning);
    }
    if !validation.is_ok() {
        return Err(ConfigError::Invalid(validation.errors).into());
    }

    let mut project = MapProject::discover(options)?;
    if !options.dry_run && !options.overwrite && project.output.exists() {
        return Err(PackError::OutputExists(project.output.clone()));
    }
    let jobs = Jobs::new(if options.jobs == 1 {
        JobsConfig::inline()
    } else {
        JobsConfig::threaded(options.jobs)
    })?;
    logging::info(Stage::Discover, format!(
        "packing {} ({} sources, {} workers)",
        project.name,
        project.sources.sources().len(),
        jobs.workers()
    ));

    let index_warnings = project.sources.index_all(&jobs, cancel)?;
    project.warnings.extend(index_warnings);

    let skins = read_map_dump(&mut project, options, cancel)?;
    let bsp = read_bsp(&mut project)?;
    scan_scripts(&mut project, skins, &jobs, cancel)?;
    let mut expanded = HashSet::new();
    let models = unexpanded_models(project.files.files(), &mut expanded);
    expand_models(&mut project, models, &jobs, cancel)?;
    let (shaders, conflicts) = load_shaders(&project, options, &jobs, cancel)?;
    for conflict in &conflicts {
        logging::warn(Stage::Shaders, conflict.to_string());
    }

    // Models reached through shaders (`q3map_surfaceModel`) carry materials
    // of their own; resolve again until no new model turns up.
    let closure = loop {
        let closure = closure::resolve(&project.shaders, &project.name, &shaders);
        let models = unexpanded_models(closure.files.files(), &mut expanded);
        if models.is_empty() {
            break closure;
        }
        logging::debug(Stage::Shaders, format!("{} models reached through shaders", models.len()));
        expand_models(&mut project, models, &jobs, cancel)?;
    };
    project.has_style_lights |= closure.light_style;
    logging::info(Stage::Shaders, format!(
        "{} shaders known, {} included",
        shaders.len(),
        closure.included.len()
    ));
    if let Some(bsp) = &bsp {
        report_uncovered_shaders(&mut project, bsp, &closure);
    }
    if cancel.is_cancelled() {
        return Err(PackError::Cancelled);
    }

    let plan = writer::plan(
        &project,
        &closure,
        &PlanOptions {
            strict: !options.loose,
            include_source: options.include_source,
        },
    )?;

    let mut report = PackReport {
        entries: plan
            .entries
            .iter()
            .map(|entry| entry.archive_name.clone())
            .collect(),
        skipped_not_packed: plan.satisfied_not_packed,
        missing: plan.missing.clone(),
        conflicts,
        included_shaders: closure.included.len(),
        ..PackReport::default()
    };
    if options.dry_run {
        for name in &report.entries {
            logging::info(Stage::Plan, format!("would pack {}", name));
        }
    } else {
        let summary = writer::write(&plan, &project.output, options.overwrite, cancel)?;
        report.io_failures = summary.io_failures;
        report.output = Some(project.output.clone());
        logging::info(Stage::Write, format!(
            "wrote {} ({} files)",
            project.output.display(),
            summary.entries_written
        ));
    }
    report.warnings = project.warnings;
    Ok(report)
}

fn read_map_dump(
    project: &mut MapProject,
    options: &PackOptions,
    cancel: &CancelToken,
) -> Result<Vec<Resource>, PackError> {
    let bytes = fs::read(&project.map_file).map_err(|source| PackError::io(&project.map_file, source))?;
    let text = decode_text(&bytes);
    let label = format!("maps/{}.map", project.name);
    let dump = parse_map_dump(
        &label,
        &text,
        &MapDumpOptions {
            include_source: options.include_source,
        },
        cancel,
    )
    .map_err(|err| match err {
        MapParseError::Interrupted => PackError::Cancelled,
        err => PackError::parse(label.clone(), err),
    })?;
    logging::info(Stage::Parse, format!(
        "{}: {} entities, {} brushes, {} patches, {} shaders",
        label,
        dump.entity_count,
        dump.brush_count,
        dump.patch_count,
        dump.shaders.len()
    ));

    project.shaders.merge(&dump.shaders);
    project.files.merge(&dump.files);
    project.has_style_lights |= dump.has_style_lights;
    for terrain in &dump.terrain_shaders {
        project.warn(format!(
            "terrain shader {} ({}) must be added manually",
            terrain.path,
            terrain.describe_origin()
        ));
        project.terrain_shaders.push(terrain.path.clone());
    }
    Ok(dump.skins)
}

fn read_bsp(project: &mut MapProject) -> Result<Option<BspSummary>, PackError> {
    let label = format!("maps/{}.bsp", project.name);
    let name = QPath::new(&label).map_err(|err| PackError::parse(label.clone(), err))?;
    let Some((_, asset)) = project.sources.find(&name)? else {
        return Ok(None);
    };
    let data = asset.read()?;
    let summary = read_bsp_summary(&data).map_err(|err| PackError::parse(label.clone(), err))?;
    let external = project
        .sources
        .prefix_entries(&format!("maps/{}/lm_", project.name))?;
    project.has_lightmaps = summary.has_internal_lightmaps() || !external.is_empty();
    logging::debug(Stage::Parse, format!(
        "{}: version {}, {} compiled shaders, lightmaps {}",
        label,
        summary.header.version,
        summary.shaders.len(),
        project.has_lightmaps
    ));
    Ok(Some(summary))
}

fn read_text(asset: &Asset) -> Result<String, PackError> {
    Ok(decode_text(&asset.read()?))
}

fn scan_scripts(
    project: &mut MapProject,
    skins: Vec<Resource>,
    jobs: &Jobs,
    cancel: &CancelToken,
) -> Result<(), PackError> {
    let map = &project.name;
    let mut tasks: Vec<(ScriptKind, String)> = vec![
        (ScriptKind::Sounds, format!("sound/maps/{}.sounds", map)),
        (ScriptKind::Speakers, format!("sound/maps/{}.sps", map)),
        (ScriptKind::MapScript, format!("maps/{}.script", map)),
    ];
    // Skins of compile-only models are scanned too; their shaders end up on
    // baked surfaces.
    tasks.extend(
        skins
            .iter()
            .map(|skin| (ScriptKind::Skin, skin.path.to_string())),
    );

    let sources = &project.sources;
    let results = jobs.map("scripts", tasks, |(kind, name)| -> Result<Option<ScriptRefs>, PackError> {
        let Ok(path) = QPath::new(&name) else {
            return Ok(None);
        };
        let Some((_, asset)) = sources.find(&path)? else {
            return Ok(None);
        };
        let text = read_text(asset)?;
        let scanned = match kind {
            ScriptKind::Sounds => scan_sound_script(&name, &text, cancel),
            ScriptKind::Speakers => scan_speaker_script(&name, &text, cancel),
            ScriptKind::MapScript => scan_map_script(&name, &text, cancel),
            ScriptKind::Skin => scan_skin(&name, &text, cancel),
        };
        scanned
            .map(Some)
            .map_err(|ScanInterrupted| PackError::Cancelled)
    })?;

    for result in results {
        let Some(refs) = result? else {
            continue;
        };
        project.files.merge(&refs.files);
        project.shaders.merge(&refs.shaders);
        for warning in refs.warnings {
            project.warn(warning.to_string());
        }
    }
    Ok(())
}

/// MD3/MDC files among `files` not parsed yet; marks them as parsed.
fn unexpanded_models<'a>(
    files: impl Iterator<Item = &'a Resource>,
    expanded: &mut HashSet<QPath>,
) -> Vec<Resource> {
    files
        .filter(|file| file.path.has_extension("md3") || file.path.has_extension("mdc"))
        .filter(|file| expanded.insert(file.path.clone()))
        .cloned()
        .collect()
}

/// Adds the materials embedded in `models` as shader references. Materials
/// stay packable even when the model itself is compile-only. A model that
/// fails to parse is reported and skipped.
fn expand_models(
    project: &mut MapProject,
    models: Vec<Resource>,
    jobs: &Jobs,
    cancel: &CancelToken,
) -> Result<(), PackError> {
    let sources = &project.sources;
    let results = jobs.map("models", models, |model| -> Result<Vec<Resource>, String> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let Some((_, asset)) = sources.find(&model.path).map_err(|err| err.to_string())? else {
            return Ok(Vec::new());
        };
        let data = asset.read().map_err(|err| err.to_string())?;
        let names = parse_model_materials(&data)
            .map_err(|err| format!("model {}: {}", asset.name, err))?;
        Ok(names
            .iter()
            .filter_map(|name| Resource::parse_shader(name).ok())
            .map(|mut shader| {
                shader.line = model.line.clone();
                shader
            })
            .collect())
    })?;
    if cancel.is_cancelled() {
        return Err(PackError::Cancelled);
    }
    for result in results {
        match result {
            Ok(shaders) => project.shaders.extend(shaders),
            Err(message) => project.warn(message),
        }
    }
    Ok(())
}

fn load_shaders(
    project: &MapProject,
    options: &PackOptions,
    jobs: &Jobs,
    cancel: &CancelToken,
) -> Result<(HashMap<QPath, ShaderEntry>, Vec<ConflictEvent>), PackError> {
    let mut files = project.sources.shader_files()?;
    if options.shaderlist_only {
        let mut allowed = HashSet::new();
        let list_name = QPath::new("scripts/shaderlist.txt").map_err(|err| PackError::parse("scripts/shaderlist.txt", err))?;
        for source in project.sources.sources() {
            if let Some(asset) = source.get(&list_name)? {
                allowed.extend(parse_shaderlist(&read_text(asset)?));
            }
        }
        if allowed.is_empty() {
            logging::warn(Stage::Shaders, "no scripts/shaderlist.txt found; parsing every shader file");
        } else {
            allowed.insert(format!("q3map2_{}", project.name.to_ascii_lowercase()));
            files.retain(|(_, asset)| allowed.contains(&asset.name.file_stem().to_ascii_lowercase()));
        }
    }
    logging::debug(Stage::Shaders, format!("parsing {} shader files", files.len()));

    let parse_options = ShaderParseOptions {
        dev_assets: options.include_source,
    };
    let table = ShaderTable::new();
    let results = jobs.map("shaders", files, |(source, asset)| -> Result<(), PackError> {
        let text = read_text(asset)?;
        let defs = parse_shader_script(asset.name.as_str(), &text, &parse_options, cancel).map_err(
            |err| match err {
                ShaderParseError::Interrupted => PackError::Cancelled,
                err => PackError::parse(format!("{} ({})", asset.name, source.label), err),
            },
        )?;
        for def in defs {
            table.upsert(ShaderEntry {
                def,
                source_order: source.order,
                source_label: source.label.clone(),
                not_packed: source.not_packed,
                file: asset.name.clone(),
            });
        }
        Ok(())
    })?;
    for result in results {
        result?;
    }
    Ok(table.into_parts())
}

/// Compiled surfaces whose shader the packer never saw referenced.
fn report_uncovered_shaders(project: &mut MapProject, bsp: &BspSummary, closure: &Closure) {
    let mut covered: HashSet<QPath> = project
        .shaders
        .shaders()
        .map(|shader| lookup_key(&shader.path))
        .collect();
    covered.extend(closure.included.iter().map(|shader| shader.name.clone()));
    let mut uncovered = Vec::new();
    for shader in &bsp.shaders {
        let Ok(name) = QPath::new(&shader.name) else {
            continue;
        };
        if name.key() == "noshader" || name.starts_with("textures/common/") {
            continue;
        }
        if !covered.contains(&lookup_key(&name)) {
            uncovered.push(name.to_string());
        }
    }
    for name in uncovered {
        project.warn(format!("compiled map uses shader {} that no source references", name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::source::tests::{temp_dir, write_file, write_pk3};
    use std::io::Read;
    use std::path::Path;
    use zip::read::ZipArchive;

    const MAP: &str = r#"// entity 0
{
"classname" "worldspawn"
// brush 0
{
brushDef
{
( 0 0 1 0 ) ( ( 0.03125 0 0 ) ( 0 0.03125 0 ) ) base/floor 0 0 0
( 0 0 -1 0 ) ( ( 0.03125 0 0 ) ( 0 0.03125 0 ) ) common/caulk 0 0 0
}
}
}
// entity 1
{
"classname" "misc_gamemodel"
"model" "models/props/barrel.md3"
}
// entity 2
{
"classname" "target_speaker"
"noise" "sound/world/wind.wav"
}
"#;

    const SHADERS: &str = "textures/base/floor\n{\n\tq3map_baseShader textures/base/floor_base\n\t{\n\t\tmap textures/base/floor.tga\n\t}\n}\ntextures/base/floor_base\n{\n\tsurfaceparm nomarks\n\timplicitMap textures/base/floor_blend.tga\n}\n";

    fn model_bytes(shader: &str) -> Vec<u8> {
        let mut data = vec![0u8; 108];
        data[0..4].copy_from_slice(b"IDP3");
        data[4..8].copy_from_slice(&15i32.to_le_bytes());
        data[84..88].copy_from_slice(&1i32.to_le_bytes());
        data[100..104].copy_from_slice(&108i32.to_le_bytes());
        let mut surface = vec![0u8; 108];
        surface[0..4].copy_from_slice(b"IDP3");
        surface[76..80].copy_from_slice(&1i32.to_le_bytes());
        surface[92..96].copy_from_slice(&108i32.to_le_bytes());
        surface[104..108].copy_from_slice(&(108i32 + 68).to_le_bytes());
        let mut record = vec![0u8; 68];
        record[..shader.len()].copy_from_slice(shader.as_bytes());
        surface.extend(record);
        data.extend(surface);
        data
    }

    fn bsp_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 8 + 17 * 8];
        data[0..4].copy_from_slice(b"IBSP");
        data[4..8].copy_from_slice(&47u32.to_le_bytes());
        data
    }

    fn fixture(label: &str) -> PathBuf {
        let root = temp_dir(label);
        let etmain = root.join("etmain");
        write_file(&etmain, "maps/beach.map", MAP.as_bytes());
        write_file(&etmain, "maps/beach.bsp", &bsp_bytes());
        write_file(&etmain, "scripts/beach.shader", SHADERS.as_bytes());
        write_file(&etmain, "textures/base/floor.tga", b"floor");
        write_file(&etmain, "textures/base/floor_blend.jpg", b"blend");
        write_file(&etmain, "models/props/barrel.md3", &model_bytes("models/props/barrel.tga"));
        write_file(&etmain, "models/props/barrel.tga", b"barrel");
        write_file(
            &etmain,
            "sound/maps/beach.sps",
            b"speakerScript\n{\n\tspeakerDef {\n\t\tnoise \"sound/world/waves.wav\"\n\t}\n}\n",
        );
        write_pk3(
            &etmain.join("pak0.pk3"),
            &[
                ("sound/world/wind.wav", b"wind"),
                ("sound/world/waves.wav", b"waves"),
            ],
        );
        root
    }

    fn options(root: &Path) -> PackOptions {
        PackOptions {
            map: root.join("etmain/maps/beach.map"),
            jobs: 2,
            ..PackOptions::default()
        }
    }

    #[test]
    fn packs_a_complete_map() {
        let root = fixture("pipeline_full");
        let report = run(&options(&root), &CancelToken::new()).unwrap();
        assert_eq!(
            report.entries,
            vec![
                "maps/beach.bsp",
                "sound/maps/beach.sps",
                "scripts/beach.shader",
                "models/props/barrel.md3",
                "textures/base/floor.tga",
                "textures/base/floor_blend.jpg",
                "models/props/barrel.tga",
            ]
        );
        assert_eq!(report.skipped_not_packed, 2);
        assert!(report.missing.is_empty());
        assert_eq!(report.included_shaders, 2);

        let output = report.output.unwrap();
        let mut archive = ZipArchive::new(fs::File::open(&output).unwrap()).unwrap();
        assert_eq!(archive.len(), 7);
        let mut data = Vec::new();
        archive
            .by_name("textures/base/floor_blend.jpg")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"blend");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let root = fixture("pipeline_dry");
        let options = PackOptions {
            dry_run: true,
            ..options(&root)
        };
        let report = run(&options, &CancelToken::new()).unwrap();
        assert!(report.output.is_none());
        assert_eq!(report.entries.len(), 7);
        assert!(!root.join("etmain/beach.pk3").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn strict_and_loose_missing_texture() {
        let root = fixture("pipeline_missing");
        fs::remove_file(root.join("etmain/textures/base/floor_blend.jpg")).unwrap();

        let err = run(&options(&root), &CancelToken::new()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Missing);
        assert!(!root.join("etmain/beach.pk3").exists());

        let loose = PackOptions {
            loose: true,
            ..options(&root)
        };
        let report = run(&loose, &CancelToken::new()).unwrap();
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].name.as_str(), "textures/base/floor_blend.tga");
        assert!(report.output.unwrap().exists());
        assert!(!report.entries.contains(&"textures/base/floor_blend.jpg".to_string()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn broken_model_is_a_warning() {
        let root = fixture("pipeline_bad_model");
        write_file(&root.join("etmain"), "models/props/barrel.md3", b"RIFF0000");
        let options = PackOptions {
            loose: true,
            ..options(&root)
        };
        let report = run(&options, &CancelToken::new()).unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|warning| warning.contains("models/props/barrel.md3")));
        assert!(!report.entries.contains(&"models/props/barrel.tga".to_string()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn compile_only_model_materials_are_packed() {
        let root = fixture("pipeline_misc_model");
        let etmain = root.join("etmain");
        let map = format!(
            "{}// entity 3\n{{\n\"classname\" \"misc_model\"\n\"model\" \"models/props/tree.md3\"\n\"_skin\" \"models/props/tree_winter.skin\"\n}}\n",
            MAP
        );
        write_file(&etmain, "maps/beach.map", map.as_bytes());
        write_file(&etmain, "models/props/tree.md3", &model_bytes("models/props/bark.tga"));
        write_file(&etmain, "models/props/bark.tga", b"bark");
        write_file(&etmain, "models/props/tree_winter.skin", b"bark,models/props/bark_winter.tga\n");
        write_file(&etmain, "models/props/bark_winter.tga", b"winter");

        let dry = PackOptions {
            dry_run: true,
            ..options(&root)
        };
        let report = run(&dry, &CancelToken::new()).unwrap();
        assert!(report.entries.contains(&"models/props/bark.tga".to_string()));
        assert!(report.entries.contains(&"models/props/bark_winter.tga".to_string()));
        assert!(!report.entries.contains(&"models/props/tree.md3".to_string()));
        assert!(!report.entries.contains(&"models/props/tree_winter.skin".to_string()));

        fs::remove_file(etmain.join("models/props/bark.tga")).unwrap();
        let err = run(&options(&root), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PackError::Missing { ref first, .. } if first == "models/props/bark.tga"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn surface_model_materials_are_packed() {
        let root = fixture("pipeline_surface_model");
        let etmain = root.join("etmain");
        let shaders = SHADERS.replace(
            "\tq3map_baseShader",
            "\tq3map_surfaceModel models/foliage/grass.md3 64 0.5 1 1 0 360 1\n\tq3map_baseShader",
        );
        write_file(&etmain, "scripts/beach.shader", shaders.as_bytes());
        write_file(&etmain, "models/foliage/grass.md3", &model_bytes("models/foliage/blade.tga"));
        write_file(&etmain, "models/foliage/blade.tga", b"blade");

        let options = PackOptions {
            dry_run: true,
            ..options(&root)
        };
        let report = run(&options, &CancelToken::new()).unwrap();
        assert!(report.entries.contains(&"models/foliage/grass.md3".to_string()));
        assert!(report.entries.contains(&"models/foliage/blade.tga".to_string()));
        assert!(report.missing.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_editor_image_is_allowed_in_strict_mode() {
        let root = fixture("pipeline_editor_image");
        let etmain = root.join("etmain");
        let shaders = SHADERS.replace(
            "\tq3map_baseShader",
            "\tqer_editorimage textures/base/floor_editor.tga\n\tq3map_baseShader",
        );
        write_file(&etmain, "scripts/beach.shader", shaders.as_bytes());

        let options = PackOptions {
            include_source: true,
            dry_run: true,
            ..options(&root)
        };
        let report = run(&options, &CancelToken::new()).unwrap();
        assert!(report.missing.is_empty());
        assert!(report.entries.contains(&"maps/beach.map".to_string()));
        assert!(!report
            .entries
            .iter()
            .any(|entry| entry.starts_with("textures/base/floor_editor")));

        write_file(&etmain, "textures/base/floor_editor.tga", b"editor");
        let report = run(&options, &CancelToken::new()).unwrap();
        assert!(report.entries.contains(&"textures/base/floor_editor.tga".to_string()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn structural_errors_are_fatal() {
        let root = fixture("pipeline_parse");
        write_file(&root.join("etmain"), "maps/beach.map", b"{\n\"classname\" \"worldspawn\"\n}\n}\n");
        let err = run(&options(&root), &CancelToken::new()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parse);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancelled_run_reports_cancel() {
        let root = fixture("pipeline_cancel");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run(&options(&root), &cancel).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cancelled);
        assert!(!root.join("etmain/beach.pk3").exists());
        let _ = fs::remove_dir_all(root);
    }
}
