use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use compat_idtech3::shader_script::ShaderDef;
use compat_idtech3::QPath;
use parking_lot::Mutex;

const SHARD_COUNT: usize = 16;

/// A parsed shader plus where it came from.
#[derive(Debug)]
pub struct ShaderEntry {
    pub def: ShaderDef,
    pub source_order: usize,
    pub source_label: String,
    pub not_packed: bool,
    /// Shader file the definition lives in.
    pub file: QPath,
}

impl ShaderEntry {
    fn origin(&self) -> String {
        format!("{} ({}:{})", self.source_label, self.file, self.def.line)
    }

    fn tie_break_key(&self) -> (&str, usize) {
        (self.file.key(), self.def.line)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictKind {
    DuplicateInFile,
    Ambiguous,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConflictEvent {
    pub shader: QPath,
    pub kind: ConflictKind,
    pub kept: String,
    pub dropped: String,
}

impl fmt::Display for ConflictEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::DuplicateInFile => write!(
                f,
                "shader {} defined twice in one file; using {}, ignoring {}",
                self.shader, self.kept, self.dropped
            ),
            ConflictKind::Ambiguous => write!(
                f,
                "shader {} defined in several files of one source; using {}, ignoring {}",
                self.shader, self.kept, self.dropped
            ),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub keep_incoming: bool,
    pub event: Option<ConflictEvent>,
}

/// Decides which of two definitions of one shader survives. The result does
/// not depend on which of the two arrived first.
pub fn merge(existing: &ShaderEntry, incoming: &ShaderEntry) -> MergeOutcome {
    if existing.source_order != incoming.source_order {
        return MergeOutcome {
            keep_incoming: incoming.source_order < existing.source_order,
            event: None,
        };
    }

    let incoming_first = incoming.tie_break_key() < existing.tie_break_key();
    let event = |kind| {
        let (kept, dropped) = if incoming_first {
            (incoming, existing)
        } else {
            (existing, incoming)
        };
        Some(ConflictEvent {
            shader: existing.def.name.clone(),
            kind,
            kept: kept.origin(),
            dropped: dropped.origin(),
        })
    };

    if existing.file == incoming.file {
        return MergeOutcome {
            keep_incoming: incoming_first,
            event: event(ConflictKind::DuplicateInFile),
        };
    }
    match (existing.def.editor_only, incoming.def.editor_only) {
        (true, false) => MergeOutcome {
            keep_incoming: true,
            event: None,
        },
        (false, true) => MergeOutcome {
            keep_incoming: false,
            event: None,
        },
        (false, false) => MergeOutcome {
            keep_incoming: incoming_first,
            event: event(ConflictKind::Ambiguous),
        },
        (true, true) => MergeOutcome {
            keep_incoming: incoming_first,
            event: None,
        },
    }
}

/// Shader name to winning definition, filled concurrently by the shader
/// file workers.
pub struct ShaderTable {
    shards: Vec<Mutex<HashMap<QPath, ShaderEntry>>>,
    events: Mutex<Vec<ConflictEvent>>,
}

impl Default for ShaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn shard(&self, name: &QPath) -> &Mutex<HashMap<QPath, ShaderEntry>> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    pub fn upsert(&self, incoming: ShaderEntry) {
        let name = incoming.def.name.clone();
        let mut shard = self.shard(&name).lock();
        match shard.get_mut(&name) {
            None => {
                shard.insert(name, incoming);
            }
            Some(existing) => {
                let outcome = merge(existing, &incoming);
                if outcome.keep_incoming {
                    *existing = incoming;
                }
                if let Some(event) = outcome.event {
                    self.events.lock().push(event);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the table once every worker has joined. Events come back
    /// sorted so reports do not depend on scheduling.
    pub fn into_parts(self) -> (HashMap<QPath, ShaderEntry>, Vec<ConflictEvent>) {
        let mut shaders = HashMap::new();
        for shard in self.shards {
            shaders.extend(shard.into_inner());
        }
        let mut events = self.events.into_inner();
        events.sort();
        (shaders, events)
    }
}

/// Stems listed in `scripts/shaderlist.txt`.
pub fn parse_shaderlist(text: &str) -> HashSet<String> {
    text.lines()
        .map(|line| line.split("//").next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_end_matches(".shader").to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Jobs, JobsConfig};
    use compat_idtech3::lines::Uninterrupted;
    use compat_idtech3::shader_script::{parse_shader_script, ShaderParseOptions};

    fn entry(text: &str, order: usize, file: &str) -> ShaderEntry {
        let def = parse_shader_script(file, text, &ShaderParseOptions::default(), &Uninterrupted)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        ShaderEntry {
            def,
            source_order: order,
            source_label: format!("source{}", order),
            not_packed: false,
            file: QPath::new(file).unwrap(),
        }
    }

    const REAL: &str = "textures/a/wall\n{\n{\nmap textures/a/wall.tga\n}\n}\n";
    const STUB: &str = "textures/a/wall\n{\nqer_editorimage textures/a/wall.tga\n}\n";
    const REAL_LATER: &str = "\n\ntextures/a/wall\n{\nsurfaceparm metalsteps\n}\n";

    #[test]
    fn lower_order_wins() {
        let low = entry(STUB, 0, "scripts/a.shader");
        let high = entry(REAL, 3, "scripts/a.shader");
        assert!(!merge(&low, &high).keep_incoming);
        assert!(merge(&high, &low).keep_incoming);
        assert_eq!(merge(&high, &low).event, None);
    }

    #[test]
    fn duplicate_in_one_file_keeps_first_line() {
        let first = entry(REAL, 1, "scripts/a.shader");
        let second = entry(REAL_LATER, 1, "scripts/a.shader");
        let outcome = merge(&first, &second);
        assert!(!outcome.keep_incoming);
        assert_eq!(outcome.event.unwrap().kind, ConflictKind::DuplicateInFile);
        assert!(merge(&second, &first).keep_incoming);
    }

    #[test]
    fn real_definition_beats_editor_stub() {
        let stub = entry(STUB, 1, "scripts/a.shader");
        let real = entry(REAL, 1, "scripts/b.shader");
        assert!(stub.def.editor_only);
        assert_eq!(
            merge(&stub, &real),
            MergeOutcome {
                keep_incoming: true,
                event: None
            }
        );
        assert!(!merge(&real, &stub).keep_incoming);
    }

    #[test]
    fn two_real_definitions_are_ambiguous() {
        let a = entry(REAL, 1, "scripts/a.shader");
        let b = entry(REAL, 1, "scripts/b.shader");
        let forward = merge(&a, &b);
        let backward = merge(&b, &a);
        assert!(!forward.keep_incoming);
        assert!(backward.keep_incoming);
        assert_eq!(forward.event, backward.event);
        let event = forward.event.unwrap();
        assert_eq!(event.kind, ConflictKind::Ambiguous);
        assert!(event.kept.contains("scripts/a.shader"));
    }

    #[test]
    fn winner_is_independent_of_scheduling() {
        let specs: Vec<(&str, usize, &str)> = vec![
            (REAL, 2, "scripts/z.shader"),
            (STUB, 1, "scripts/m.shader"),
            (REAL, 1, "scripts/q.shader"),
            (REAL_LATER, 1, "scripts/c.shader"),
            (REAL, 1, "scripts/c.shader"),
            (STUB, 4, "scripts/a.shader"),
        ];
        let jobs = Jobs::new(JobsConfig::threaded(4)).unwrap();
        let mut outcomes = Vec::new();
        for rotation in 0..specs.len() {
            let mut order = specs.clone();
            order.rotate_left(rotation);
            if rotation % 2 == 1 {
                order.reverse();
            }
            let table = ShaderTable::new();
            jobs.map("shaders", order, |(text, source, file)| {
                table.upsert(entry(text, source, file));
            })
            .unwrap();
            assert_eq!(table.len(), 1);
            let (shaders, events) = table.into_parts();
            let winner = &shaders[&QPath::new("textures/a/wall").unwrap()];
            outcomes.push((winner.file.to_string(), winner.def.line, events.len()));
        }
        for outcome in &outcomes {
            assert_eq!(outcome.0, "scripts/c.shader");
            assert_eq!(outcome.1, 1);
        }
    }

    #[test]
    fn shaderlist_entries() {
        let list = parse_shaderlist("common\nSFX.shader // effects\n\n// none\n");
        assert!(list.contains("common"));
        assert!(list.contains("sfx"));
        assert_eq!(list.len(), 2);
    }
}
