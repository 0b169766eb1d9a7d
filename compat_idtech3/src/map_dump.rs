use std::fmt;

use crate::lines::{key_value, Interrupt, Line, LineSource};
use crate::qpath::{QPath, QPathError};
use crate::resource::{LineRef, Resource, ResourceSet};

// Shaders every install ships; never worth packing.
const COMMON_SHADERS: [&str; 3] = ["common/caulk", "common/nodraw", "common/trigger"];

const NO_SOUND: &str = "nosound";

#[derive(Debug)]
pub enum MapParseError {
    UnmatchedBrace { line: LineRef },
    UnexpectedLine {
        line: LineRef,
        state: &'static str,
        content: String,
    },
    MalformedBrushFace { line: LineRef },
    UnexpectedEof { path: String, state: &'static str },
    Path { line: LineRef, source: QPathError },
    Interrupted,
}

impl fmt::Display for MapParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapParseError::UnmatchedBrace { line } => write!(f, "{}: unmatched '}}'", line),
            MapParseError::UnexpectedLine {
                line,
                state,
                content,
            } => write!(f, "{}: unexpected line in {}: {}", line, state, content),
            MapParseError::MalformedBrushFace { line } => {
                write!(f, "{}: brush face has no shader", line)
            }
            MapParseError::UnexpectedEof { path, state } => {
                write!(f, "{}: unexpected end of file in {}", path, state)
            }
            MapParseError::Path { line, source } => write!(f, "{}: {}", line, source),
            MapParseError::Interrupted => write!(f, "map parse interrupted"),
        }
    }
}

impl std::error::Error for MapParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapParseError::Path { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MapDumpOptions {
    /// Treat compile-only references (`misc_model`) as packable.
    pub include_source: bool,
}

/// Everything a map dump references.
#[derive(Debug, Default)]
pub struct MapDump {
    pub shaders: ResourceSet,
    pub files: ResourceSet,
    /// Model references whose embedded materials still need expanding.
    pub models: Vec<Resource>,
    pub skins: Vec<Resource>,
    /// Terrain shaders cannot be resolved automatically and are reported for
    /// manual inclusion.
    pub terrain_shaders: Vec<Resource>,
    pub has_style_lights: bool,
    pub entity_count: usize,
    pub brush_count: usize,
    pub patch_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DefKind {
    Brush,
    Patch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    TopLevel,
    Entity,
    DefHeader,
    AwaitDefOpen(DefKind),
    BrushDef,
    PatchDef { shader_seen: bool },
    AfterDef,
}

impl State {
    fn label(self) -> &'static str {
        match self {
            State::TopLevel => "top level",
            State::Entity => "entity",
            State::DefHeader => "brush header",
            State::AwaitDefOpen(DefKind::Brush) => "brushDef header",
            State::AwaitDefOpen(DefKind::Patch) => "patchDef header",
            State::BrushDef => "brushDef",
            State::PatchDef { .. } => "patchDef",
            State::AfterDef => "brush",
        }
    }

    fn close(self) -> Option<State> {
        match self {
            State::Entity => Some(State::TopLevel),
            State::AfterDef => Some(State::Entity),
            State::BrushDef | State::PatchDef { .. } => Some(State::AfterDef),
            State::TopLevel | State::DefHeader | State::AwaitDefOpen(_) => None,
        }
    }
}

struct KeyValue {
    key: String,
    value: String,
    line: LineRef,
}

struct MapParser<'o> {
    options: &'o MapDumpOptions,
    state: State,
    pairs: Vec<KeyValue>,
    dump: MapDump,
}

pub fn parse_map_dump(
    path: &str,
    text: &str,
    options: &MapDumpOptions,
    interrupt: &dyn Interrupt,
) -> Result<MapDump, MapParseError> {
    let mut parser = MapParser {
        options,
        state: State::TopLevel,
        pairs: Vec::new(),
        dump: MapDump::default(),
    };
    for line in LineSource::new(path, text) {
        if interrupt.interrupted() {
            return Err(MapParseError::Interrupted);
        }
        if line.is_blank() {
            continue;
        }
        parser.feed(&line)?;
    }
    if parser.state != State::TopLevel {
        return Err(MapParseError::UnexpectedEof {
            path: path.to_string(),
            state: parser.state.label(),
        });
    }
    Ok(parser.dump)
}

impl MapParser<'_> {
    fn feed(&mut self, line: &Line<'_>) -> Result<(), MapParseError> {
        if line.first == Some('}') && line.content == "}" {
            let next = self
                .state
                .close()
                .ok_or_else(|| MapParseError::UnmatchedBrace {
                    line: line.line_ref(),
                })?;
            if self.state == State::Entity {
                self.finish_entity()?;
            }
            self.state = next;
            return Ok(());
        }

        self.state = match self.state {
            State::TopLevel if line.content == "{" => {
                self.pairs.clear();
                self.dump.entity_count += 1;
                State::Entity
            }
            State::Entity if line.content == "{" => State::DefHeader,
            State::Entity if line.first == Some('"') => {
                let (key, value) =
                    key_value(line.content).ok_or_else(|| unexpected(line, self.state))?;
                self.pairs.push(KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    line: line.line_ref(),
                });
                State::Entity
            }
            State::DefHeader if line.content.eq_ignore_ascii_case("brushDef") => {
                self.dump.brush_count += 1;
                State::AwaitDefOpen(DefKind::Brush)
            }
            State::DefHeader
                if line.content.eq_ignore_ascii_case("patchDef2")
                    || line.content.eq_ignore_ascii_case("patchDef3") =>
            {
                self.dump.patch_count += 1;
                State::AwaitDefOpen(DefKind::Patch)
            }
            State::AwaitDefOpen(DefKind::Brush) if line.content == "{" => State::BrushDef,
            State::AwaitDefOpen(DefKind::Patch) if line.content == "{" => {
                State::PatchDef { shader_seen: false }
            }
            State::BrushDef if line.first == Some('(') => {
                let shader = brush_face_shader(line.content).ok_or_else(|| {
                    MapParseError::MalformedBrushFace {
                        line: line.line_ref(),
                    }
                })?;
                self.add_surface_shader(shader, line)?;
                State::BrushDef
            }
            State::PatchDef { shader_seen: false } => {
                let shader = line
                    .tokens()
                    .next()
                    .ok_or_else(|| unexpected(line, self.state))?;
                self.add_surface_shader(shader, line)?;
                State::PatchDef { shader_seen: true }
            }
            State::PatchDef { shader_seen: true }
                if matches!(line.first, Some('(') | Some(')')) =>
            {
                self.state
            }
            state => return Err(unexpected(line, state)),
        };
        Ok(())
    }

    fn add_surface_shader(&mut self, shader: &str, line: &Line<'_>) -> Result<(), MapParseError> {
        if COMMON_SHADERS
            .iter()
            .any(|common| common.eq_ignore_ascii_case(shader))
        {
            return Ok(());
        }
        let resource = shader_resource(&texture_shader_name(shader), line.line_ref())?;
        self.dump.shaders.insert(resource);
        Ok(())
    }

    fn finish_entity(&mut self) -> Result<(), MapParseError> {
        let pairs = std::mem::take(&mut self.pairs);
        let classname = pairs
            .iter()
            .find(|pair| pair.key.eq_ignore_ascii_case("classname"))
            .map(|pair| pair.value.to_ascii_lowercase())
            .unwrap_or_default();
        let misc_model = classname == "misc_model";
        let compile_only = misc_model && !self.options.include_source;
        let is_light = classname.starts_with("light");
        let is_dlight = classname == "dlight";
        let is_terrain = pairs
            .iter()
            .any(|pair| pair.key.eq_ignore_ascii_case("terrain") && pair.value.trim() == "1");

        for pair in &pairs {
            let value = pair.value.trim();
            if value.is_empty() {
                continue;
            }
            let key = pair.key.to_ascii_lowercase();
            match key.as_str() {
                "model" | "model2" => {
                    if value.starts_with('*') {
                        continue;
                    }
                    let resource = file_resource(value, &pair.line)?.source_only(compile_only);
                    self.dump.files.insert(resource.clone());
                    self.dump.models.push(resource);
                }
                "shader" if is_terrain => {
                    let resource = shader_resource(&texture_shader_name(value), pair.line.clone())?;
                    self.dump.terrain_shaders.push(resource);
                }
                "shader" | "_fog" | "sun" | "targetshadername" | "targetshadernewname" => {
                    self.dump
                        .shaders
                        .insert(shader_resource(value, pair.line.clone())?);
                }
                "_celshader" => {
                    self.dump.shaders.insert(shader_resource(
                        &texture_shader_name(value),
                        pair.line.clone(),
                    )?);
                }
                "skin" | "_skin" => {
                    let source_only = key == "_skin" && compile_only;
                    let resource = file_resource(value, &pair.line)?.source_only(source_only);
                    self.dump.files.insert(resource.clone());
                    self.dump.skins.push(resource);
                }
                "noise" => self.add_sound(value, &pair.line)?,
                "sound" if is_dlight => self.add_sound(value, &pair.line)?,
                "style" | "_style" if is_light => {
                    if value != "0" {
                        self.dump.has_style_lights = true;
                    }
                }
                key if key.starts_with("_remap") => {
                    let Some((_, target)) = value.split_once(';') else {
                        continue;
                    };
                    let target = target.trim();
                    if !target.is_empty() {
                        self.dump
                            .shaders
                            .insert(shader_resource(target, pair.line.clone())?);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_sound(&mut self, value: &str, line: &LineRef) -> Result<(), MapParseError> {
        if value.eq_ignore_ascii_case(NO_SOUND) {
            return Ok(());
        }
        let resource = file_resource(value, line)?;
        // Extensionless values name sound-script entries, not files.
        if resource.path.extension().is_none() {
            return Ok(());
        }
        self.dump.files.insert(resource);
        Ok(())
    }
}

fn unexpected(line: &Line<'_>, state: State) -> MapParseError {
    MapParseError::UnexpectedLine {
        line: line.line_ref(),
        state: state.label(),
        content: line.content.to_string(),
    }
}

/// The shader token follows the last `)` of a brush face line.
fn brush_face_shader(content: &str) -> Option<&str> {
    let (_, rest) = content.rsplit_once(')')?;
    rest.split_whitespace().next()
}

/// Map files name surface shaders relative to `textures/`.
pub fn texture_shader_name(name: &str) -> String {
    let prefixed = name
        .get(..9)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("textures/"));
    if prefixed {
        name.to_string()
    } else {
        format!("textures/{}", name)
    }
}

fn shader_resource(name: &str, line: LineRef) -> Result<Resource, MapParseError> {
    let path = QPath::new(name).map_err(|source| MapParseError::Path {
        line: line.clone(),
        source,
    })?;
    Ok(Resource::shader(path).at(line))
}

fn file_resource(name: &str, line: &LineRef) -> Result<Resource, MapParseError> {
    let path = QPath::new(name).map_err(|source| MapParseError::Path {
        line: line.clone(),
        source,
    })?;
    Ok(Resource::file(path).at(line.clone()))
}
