use std::fmt;

use crate::lines::{Interrupt, Line, LineSource};
use crate::qpath::{QPath, QPathError};
use crate::resource::{LineRef, Resource, ResourceSet};

const SKY_SUFFIXES: [&str; 6] = ["_bk", "_dn", "_ft", "_up", "_rt", "_lf"];

#[derive(Debug)]
pub enum ShaderParseError {
    StrayBrace { line: LineRef },
    MissingOpenBrace { line: LineRef, shader: String },
    NestedStage { line: LineRef },
    Unterminated {
        path: String,
        shader: String,
        in_stage: bool,
    },
    Path { line: LineRef, source: QPathError },
    Interrupted,
}

impl fmt::Display for ShaderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderParseError::StrayBrace { line } => write!(f, "{}: brace outside a shader", line),
            ShaderParseError::MissingOpenBrace { line, shader } => {
                write!(f, "{}: expected '{{' after shader {}", line, shader)
            }
            ShaderParseError::NestedStage { line } => {
                write!(f, "{}: stage opened inside a stage", line)
            }
            ShaderParseError::Unterminated {
                path,
                shader,
                in_stage,
            } => {
                let what = if *in_stage { "stage" } else { "shader" };
                write!(f, "{}: unterminated {} in {}", path, what, shader)
            }
            ShaderParseError::Path { line, source } => write!(f, "{}: {}", line, source),
            ShaderParseError::Interrupted => write!(f, "shader parse interrupted"),
        }
    }
}

impl std::error::Error for ShaderParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShaderParseError::Path { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderParseOptions {
    /// Also collect editor/compiler-only images (`qer_editorImage` and friends).
    pub dev_assets: bool,
}

/// One shader block as written in a `.shader` file.
#[derive(Debug)]
pub struct ShaderDef {
    pub name: QPath,
    pub line: usize,
    pub files: ResourceSet,
    pub sub_shaders: Vec<QPath>,
    pub implicit: Option<QPath>,
    pub light_style: bool,
    /// No stages and nothing but `qer_*` directives.
    pub editor_only: bool,
}

impl ShaderDef {
    fn new(name: QPath, line: usize) -> Self {
        Self {
            name,
            line,
            files: ResourceSet::new(),
            sub_shaders: Vec::new(),
            implicit: None,
            light_style: false,
            editor_only: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    TopLevel,
    AfterShaderName,
    InShader,
    InStage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scan {
    Code,
    BlockComment,
}

struct ShaderParser<'o> {
    options: &'o ShaderParseOptions,
    state: State,
    scan: Scan,
    current: Option<ShaderDef>,
    shaders: Vec<ShaderDef>,
}

pub fn parse_shader_script(
    path: &str,
    text: &str,
    options: &ShaderParseOptions,
    interrupt: &dyn Interrupt,
) -> Result<Vec<ShaderDef>, ShaderParseError> {
    let mut parser = ShaderParser {
        options,
        state: State::TopLevel,
        scan: Scan::Code,
        current: None,
        shaders: Vec::new(),
    };
    for line in LineSource::new(path, text) {
        if interrupt.interrupted() {
            return Err(ShaderParseError::Interrupted);
        }
        match parser.scan {
            Scan::BlockComment => {
                if line.raw.contains("*/") {
                    parser.scan = Scan::Code;
                }
                continue;
            }
            Scan::Code => {
                if let Some(rest) = line.content.strip_prefix("/*") {
                    if !rest.contains("*/") {
                        parser.scan = Scan::BlockComment;
                    }
                    continue;
                }
            }
        }
        if line.is_blank() {
            continue;
        }
        parser.feed(&line)?;
    }
    if parser.state != State::TopLevel {
        let shader = parser
            .current
            .as_ref()
            .map(|shader| shader.name.to_string())
            .unwrap_or_default();
        return Err(ShaderParseError::Unterminated {
            path: path.to_string(),
            shader,
            in_stage: parser.state == State::InStage,
        });
    }
    Ok(parser.shaders)
}

impl ShaderParser<'_> {
    fn feed(&mut self, line: &Line<'_>) -> Result<(), ShaderParseError> {
        match self.state {
            State::TopLevel => {
                if matches!(line.first, Some('{') | Some('}')) {
                    return Err(ShaderParseError::StrayBrace {
                        line: line.line_ref(),
                    });
                }
                let (name, opened) = match line.content.strip_suffix('{') {
                    Some(name) => (name.trim(), true),
                    None => (line.content, false),
                };
                let name = name.split_whitespace().next().unwrap_or(name);
                let name = qpath(name, line)?;
                self.current = Some(ShaderDef::new(name, line.number));
                self.state = if opened {
                    State::InShader
                } else {
                    State::AfterShaderName
                };
            }
            State::AfterShaderName => {
                if line.content != "{" {
                    let shader = self
                        .current
                        .as_ref()
                        .map(|shader| shader.name.to_string())
                        .unwrap_or_default();
                    return Err(ShaderParseError::MissingOpenBrace {
                        line: line.line_ref(),
                        shader,
                    });
                }
                self.state = State::InShader;
            }
            State::InShader => {
                if line.content == "}" {
                    if let Some(shader) = self.current.take() {
                        self.shaders.push(shader);
                    }
                    self.state = State::TopLevel;
                } else if let Some(rest) = line.content.strip_prefix('{') {
                    self.mark_runtime();
                    self.state = State::InStage;
                    let rest = rest.trim();
                    let (body, closed) = match rest.strip_suffix('}') {
                        Some(body) => (body.trim(), true),
                        None => (rest, false),
                    };
                    if !body.is_empty() {
                        self.stage_directive(line, body)?;
                    }
                    if closed {
                        self.state = State::InShader;
                    }
                } else {
                    self.shader_directive(line)?;
                }
            }
            State::InStage => {
                if line.content == "}" {
                    self.state = State::InShader;
                } else if line.first == Some('{') {
                    return Err(ShaderParseError::NestedStage {
                        line: line.line_ref(),
                    });
                } else {
                    self.stage_directive(line, line.content)?;
                }
            }
        }
        Ok(())
    }

    fn mark_runtime(&mut self) {
        if let Some(shader) = self.current.as_mut() {
            shader.editor_only = false;
        }
    }

    fn shader_directive(&mut self, line: &Line<'_>) -> Result<(), ShaderParseError> {
        let mut tokens = line.tokens();
        let Some(keyword) = tokens.next() else {
            return Ok(());
        };
        let keyword = keyword.to_ascii_lowercase();
        let is_editor = keyword.starts_with("qer_");
        if !is_editor {
            self.mark_runtime();
        }
        if self.skip_quickly(&keyword, is_editor) {
            return Ok(());
        }
        let arg = tokens.next();
        let Some(shader) = self.current.as_mut() else {
            return Ok(());
        };
        match keyword.as_str() {
            "q3map_backshader" | "q3map_baseshader" | "baseshader" | "q3map_cloneshader"
            | "q3map_remapshader" | "sunshader" => {
                if let Some(arg) = arg {
                    shader.sub_shaders.push(qpath(arg, line)?);
                }
            }
            "q3map_lightimage" | "qer_editorimage" | "q3map_normalimage" => {
                if let (true, Some(arg)) = (self.options.dev_assets, arg) {
                    shader.files.insert(file(arg, line)?.dev_only(true));
                }
            }
            "implicitmap" | "implicitmask" | "implicitblend" => {
                if let Some(arg) = arg {
                    let texture = if arg == "-" {
                        shader.name.clone()
                    } else {
                        qpath(arg, line)?
                    };
                    shader.implicit = Some(texture);
                }
            }
            "skyparms" => {
                if let Some(arg) = arg {
                    let base = if arg == "-" {
                        shader.name.to_string()
                    } else {
                        arg.to_string()
                    };
                    for suffix in SKY_SUFFIXES {
                        shader.files.insert(file(&format!("{}{}", base, suffix), line)?);
                    }
                }
            }
            "q3map_surfacemodel" => {
                if let Some(arg) = arg {
                    shader.files.insert(file(arg, line)?);
                }
            }
            "q3map_lightstyle" => {
                shader.light_style = true;
            }
            _ => {}
        }
        Ok(())
    }

    // Shader files run to tens of thousands of lines; most directives never
    // reference anything.
    fn skip_quickly(&self, keyword: &str, is_editor: bool) -> bool {
        match keyword.as_bytes().first() {
            Some(b'q') => is_editor && !self.options.dev_assets,
            Some(b's') => keyword == "surfaceparm",
            Some(b'c') => keyword == "cull",
            Some(b'n') => keyword == "nopicmip" || keyword == "nomipmaps",
            Some(b't') => keyword == "tesssize",
            _ => false,
        }
    }

    fn stage_directive(&mut self, line: &Line<'_>, content: &str) -> Result<(), ShaderParseError> {
        let mut tokens = crate::lines::tokenize(content);
        let Some(keyword) = tokens.next() else {
            return Ok(());
        };
        let Some(shader) = self.current.as_mut() else {
            return Ok(());
        };
        match keyword.to_ascii_lowercase().as_str() {
            "map" | "clampmap" => {
                if let Some(texture) = tokens.next() {
                    if !is_virtual_image(texture) {
                        shader.files.insert(file(texture, line)?);
                    }
                }
            }
            "animmap" => {
                // First token is the frame rate.
                for frame in tokens.skip(1) {
                    shader.files.insert(file(frame, line)?);
                }
            }
            "videomap" => {
                if let Some(video) = tokens.next() {
                    let prefixed = video
                        .get(..6)
                        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("video/"));
                    let video = if prefixed {
                        video.to_string()
                    } else {
                        format!("video/{}", video)
                    };
                    shader.files.insert(file(&video, line)?);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn is_virtual_image(name: &str) -> bool {
    name.starts_with('$') || name.starts_with('*')
}

fn qpath(value: &str, line: &Line<'_>) -> Result<QPath, ShaderParseError> {
    QPath::new(value).map_err(|source| ShaderParseError::Path {
        line: line.line_ref(),
        source,
    })
}

fn file(value: &str, line: &Line<'_>) -> Result<Resource, ShaderParseError> {
    Ok(Resource::file(qpath(value, line)?).at(line.line_ref()))
}
