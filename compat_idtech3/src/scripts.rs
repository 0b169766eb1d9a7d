//! Line scanners for the small per-map scripts that reference assets.

use std::fmt;

use crate::lines::{tokenize, Interrupt, Line, LineSource};
use crate::qpath::QPath;
use crate::resource::{LineRef, Resource, ResourceSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptWarning {
    pub line: LineRef,
    pub message: String,
}

impl fmt::Display for ScriptWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

#[derive(Debug, Default)]
pub struct ScriptRefs {
    pub files: ResourceSet,
    pub shaders: ResourceSet,
    pub warnings: Vec<ScriptWarning>,
}

impl ScriptRefs {
    fn add_file(&mut self, line: &Line<'_>, value: &str) {
        if !has_extension(value) {
            return;
        }
        match QPath::new(value) {
            Ok(path) => {
                self.files.insert(Resource::file(path).at(line.line_ref()));
            }
            Err(err) => self.warn(line, err.to_string()),
        }
    }

    fn add_shader(&mut self, line: &Line<'_>, value: &str) {
        match QPath::new(value) {
            Ok(path) => {
                self.shaders.insert(Resource::shader(path).at(line.line_ref()));
            }
            Err(err) => self.warn(line, err.to_string()),
        }
    }

    fn warn(&mut self, line: &Line<'_>, message: String) {
        self.warnings.push(ScriptWarning {
            line: line.line_ref(),
            message,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanInterrupted;

impl fmt::Display for ScanInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script scan interrupted")
    }
}

impl std::error::Error for ScanInterrupted {}

/// `sound/maps/<map>.sounds`: `sound <path>` lines inside sound blocks.
pub fn scan_sound_script(
    path: &str,
    text: &str,
    interrupt: &dyn Interrupt,
) -> Result<ScriptRefs, ScanInterrupted> {
    scan(path, text, interrupt, |line, refs| {
        let mut tokens = line.tokens();
        if let (Some(keyword), Some(value)) = (tokens.next(), tokens.next()) {
            if keyword.eq_ignore_ascii_case("sound") {
                refs.add_file(line, value);
            }
        }
    })
}

/// `sound/maps/<map>.sps`: `noise "<path>"` lines of speaker definitions.
pub fn scan_speaker_script(
    path: &str,
    text: &str,
    interrupt: &dyn Interrupt,
) -> Result<ScriptRefs, ScanInterrupted> {
    scan(path, text, interrupt, |line, refs| {
        let mut tokens = line.tokens();
        if let (Some(keyword), Some(value)) = (tokens.next(), tokens.next()) {
            if keyword.eq_ignore_ascii_case("noise") {
                refs.add_file(line, value);
            }
        }
    })
}

/// `maps/<map>.script`: sounds played and shaders remapped at runtime.
///
/// `set` and `create` can introduce models and shaders the scanner cannot
/// follow; they are reported so the author can check the archive by hand.
pub fn scan_map_script(
    path: &str,
    text: &str,
    interrupt: &dyn Interrupt,
) -> Result<ScriptRefs, ScanInterrupted> {
    scan(path, text, interrupt, |line, refs| {
        let mut tokens = line.tokens();
        let Some(keyword) = tokens.next() else {
            return;
        };
        match keyword.to_ascii_lowercase().as_str() {
            "playsound" => {
                if let Some(value) = tokens.next() {
                    refs.add_file(line, value);
                }
            }
            "remapshader" => {
                if let (Some(_from), Some(to)) = (tokens.next(), tokens.next()) {
                    refs.add_shader(line, to);
                }
            }
            "set" | "create" => {
                refs.warn(
                    line,
                    format!("'{}' is not followed; check its assets manually", keyword),
                );
            }
            _ => {}
        }
    })
}

/// `.skin` files: `surface,path` lines. Tag entries carry no file.
pub fn scan_skin(
    path: &str,
    text: &str,
    interrupt: &dyn Interrupt,
) -> Result<ScriptRefs, ScanInterrupted> {
    scan(path, text, interrupt, |line, refs| {
        let Some((surface, value)) = line.content.split_once(',') else {
            return;
        };
        if surface.trim().to_ascii_lowercase().starts_with("tag_") {
            return;
        }
        let value = tokenize(value).next().unwrap_or("");
        if !value.is_empty() {
            refs.add_file(line, value);
        }
    })
}

fn scan<F>(
    path: &str,
    text: &str,
    interrupt: &dyn Interrupt,
    mut visit: F,
) -> Result<ScriptRefs, ScanInterrupted>
where
    F: FnMut(&Line<'_>, &mut ScriptRefs),
{
    let mut refs = ScriptRefs::default();
    for line in LineSource::new(path, text) {
        if interrupt.interrupted() {
            return Err(ScanInterrupted);
        }
        if line.is_blank() || matches!(line.first, Some('{') | Some('}')) {
            continue;
        }
        visit(&line, &mut refs);
    }
    Ok(refs)
}

fn has_extension(value: &str) -> bool {
    let file = value.rsplit(['/', '\\']).next().unwrap_or(value);
    matches!(file.rsplit_once('.'), Some((_, ext)) if !ext.is_empty())
}
