use std::collections::{HashMap, HashSet};

use compat_idtech3::{LineRef, QPath, Resource, ResourceSet};

use crate::shader_table::ShaderEntry;

/// A shader that made it into the archive's dependency set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncludedShader {
    pub name: QPath,
    pub source_order: usize,
    pub file: QPath,
}

#[derive(Debug, Default)]
pub struct Closure {
    pub included: Vec<IncludedShader>,
    /// Files every included shader (or unresolved name) needs.
    pub files: ResourceSet,
    /// Packed when present, silently skipped otherwise.
    pub optional: ResourceSet,
    /// Shader files defining the included shaders, with their source order.
    pub shader_files: Vec<(usize, QPath)>,
    pub light_style: bool,
}

struct Pending {
    name: QPath,
    line: Option<LineRef>,
    source_only: bool,
    optional: bool,
}

/// Shader names are looked up without an image extension; `textures/a.tga`
/// in a map resolves to the `textures/a` shader.
pub fn lookup_key(name: &QPath) -> QPath {
    if name.has_extension("tga") || name.has_extension("jpg") {
        name.without_extension()
    } else {
        name.clone()
    }
}

/// Expands `roots` through sub-shader references until nothing new turns up.
/// Each name is visited once, so self and mutual references terminate.
pub fn resolve(
    roots: &ResourceSet,
    map_name: &str,
    shaders: &HashMap<QPath, ShaderEntry>,
) -> Closure {
    let mut stack: Vec<Pending> = Vec::new();
    for suffix in ["_cc", ""] {
        if let Ok(name) = QPath::new(&format!("levelshots/{}{}", map_name, suffix)) {
            stack.push(Pending {
                name,
                line: None,
                source_only: false,
                optional: true,
            });
        }
    }
    for root in roots.shaders().collect::<Vec<_>>().into_iter().rev() {
        stack.push(Pending {
            name: root.path.clone(),
            line: root.line.clone(),
            source_only: root.source_only,
            optional: false,
        });
    }

    let mut closure = Closure::default();
    let mut visited: HashSet<QPath> = HashSet::new();
    let mut seen_files: HashSet<(usize, QPath)> = HashSet::new();
    while let Some(pending) = stack.pop() {
        let key = lookup_key(&pending.name);
        if !visited.insert(key.clone()) {
            continue;
        }
        let Some(entry) = shaders.get(&key) else {
            let mut texture = Resource::file(pending.name).source_only(pending.source_only);
            texture.line = pending.line;
            if pending.optional {
                closure.optional.insert(texture);
            } else {
                closure.files.insert(texture);
            }
            continue;
        };

        let def = &entry.def;
        closure.included.push(IncludedShader {
            name: def.name.clone(),
            source_order: entry.source_order,
            file: entry.file.clone(),
        });
        if seen_files.insert((entry.source_order, entry.file.clone())) {
            closure
                .shader_files
                .push((entry.source_order, entry.file.clone()));
        }
        closure.light_style |= def.light_style;
        let target = if pending.optional {
            &mut closure.optional
        } else {
            &mut closure.files
        };
        target.merge(&def.files);
        if let Some(implicit) = &def.implicit {
            let line = LineRef {
                path: entry.file.to_string(),
                number: def.line,
            };
            target.insert(Resource::file(implicit.clone()).at(line));
        }
        for sub in def.sub_shaders.iter().rev() {
            stack.push(Pending {
                name: sub.clone(),
                line: Some(LineRef {
                    path: entry.file.to_string(),
                    number: def.line,
                }),
                source_only: false,
                optional: pending.optional,
            });
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use compat_idtech3::lines::Uninterrupted;
    use compat_idtech3::shader_script::{parse_shader_script, ShaderParseOptions};

    fn table(text: &str) -> HashMap<QPath, ShaderEntry> {
        parse_shader_script(
            "scripts/test.shader",
            text,
            &ShaderParseOptions::default(),
            &Uninterrupted,
        )
        .unwrap()
        .into_iter()
        .map(|def| {
            (
                def.name.clone(),
                ShaderEntry {
                    def,
                    source_order: 1,
                    source_label: "etmain".to_string(),
                    not_packed: false,
                    file: QPath::new("scripts/test.shader").unwrap(),
                },
            )
        })
        .collect()
    }

    fn roots(names: &[&str]) -> ResourceSet {
        names
            .iter()
            .map(|name| Resource::parse_shader(name).unwrap())
            .collect()
    }

    fn file_names(set: &ResourceSet) -> Vec<&str> {
        set.iter().map(|item| item.path.as_str()).collect()
    }

    const SHADERS: &str = r#"
textures/a/self
{
	q3map_baseShader textures/a/self
	{
		map textures/a/self.tga
	}
}
textures/a/ping
{
	q3map_backShader textures/a/pong
	{
		map textures/a/ping.tga
	}
}
textures/a/pong
{
	q3map_backShader textures/a/ping
	implicitMap -
}
"#;

    #[test]
    fn self_and_mutual_references_terminate() {
        let shaders = table(SHADERS);
        let closure = resolve(&roots(&["textures/a/self", "textures/a/ping.tga"]), "test", &shaders);
        let names: Vec<&str> = closure.included.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["textures/a/self", "textures/a/ping", "textures/a/pong"]);
        assert_eq!(
            file_names(&closure.files),
            vec!["textures/a/self.tga", "textures/a/ping.tga", "textures/a/pong"]
        );
        assert_eq!(closure.shader_files, vec![(1, QPath::new("scripts/test.shader").unwrap())]);
    }

    #[test]
    fn resolving_twice_is_idempotent() {
        let shaders = table(SHADERS);
        let input = roots(&["textures/a/pong", "textures/a/self"]);
        let first = resolve(&input, "test", &shaders);
        let second = resolve(&input, "test", &shaders);
        assert_eq!(first.included, second.included);
        assert_eq!(file_names(&first.files), file_names(&second.files));
    }

    #[test]
    fn unknown_names_become_textures() {
        let shaders = table(SHADERS);
        let mut input = roots(&["textures/b/plain"]);
        input.insert(Resource::parse_shader("textures/b/editor").unwrap().source_only(true));
        let closure = resolve(&input, "beach", &shaders);
        assert!(closure.included.is_empty());
        let plain = closure.files.iter().next().unwrap();
        assert_eq!(plain.path.as_str(), "textures/b/plain");
        assert!(!plain.is_shader);
        assert_eq!(closure.files.packable().count(), 1);
        assert_eq!(
            file_names(&closure.optional),
            vec!["levelshots/beach", "levelshots/beach_cc"]
        );
    }

    #[test]
    fn levelshot_shader_is_optional() {
        let shaders = table("levelshots/beach_cc\n{\n{\nmap levelshots/beach_cc_mask.tga\n}\n}\n");
        let closure = resolve(&ResourceSet::new(), "beach", &shaders);
        assert_eq!(closure.included.len(), 1);
        assert!(closure.files.is_empty());
        assert_eq!(
            file_names(&closure.optional),
            vec!["levelshots/beach", "levelshots/beach_cc_mask.tga"]
        );
    }
}
