use std::fmt;

// Compiled map (IBSP v46/47): the header, the shader lump and the size of the
// internal lightmap lump. Geometry lumps are bounds-checked and skipped.

const LUMP_COUNT: usize = 17;
const HEADER_LEN: usize = 8 + LUMP_COUNT * 8;
const SUPPORTED_VERSIONS: [u32; 2] = [46, 47];

const SHADERS_LUMP: usize = 1;
const LIGHTMAPS_LUMP: usize = 14;

const LUMP_NAMES: [&str; LUMP_COUNT] = [
    "entities",
    "shaders",
    "planes",
    "nodes",
    "leafs",
    "leaf_faces",
    "leaf_brushes",
    "models",
    "brushes",
    "brush_sides",
    "vertices",
    "meshverts",
    "effects",
    "faces",
    "lightmaps",
    "lightvols",
    "visdata",
];

const SHADER_RECORD_LEN: usize = 72;
const SHADER_NAME_LEN: usize = 64;
const MAX_SHADERS: usize = 65_536;

#[derive(Debug, PartialEq, Eq)]
pub enum BspError {
    Truncated { len: usize },
    BadMagic,
    UnsupportedVersion(u32),
    LumpOutOfBounds {
        lump: &'static str,
        offset: u32,
        length: u32,
    },
    PartialShaderRecord { length: u32 },
    TooManyShaders { count: usize },
}

impl fmt::Display for BspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BspError::Truncated { len } => {
                write!(f, "compiled map is {} bytes, shorter than its header", len)
            }
            BspError::BadMagic => write!(f, "not an IBSP file"),
            BspError::UnsupportedVersion(version) => {
                write!(f, "IBSP version {} is not 46 or 47", version)
            }
            BspError::LumpOutOfBounds {
                lump,
                offset,
                length,
            } => write!(
                f,
                "{} lump ({} bytes at {}) runs past the end of the file",
                lump, length, offset
            ),
            BspError::PartialShaderRecord { length } => write!(
                f,
                "shader lump length {} is not a multiple of {}",
                length, SHADER_RECORD_LEN
            ),
            BspError::TooManyShaders { count } => {
                write!(f, "shader lump holds {} records", count)
            }
        }
    }
}

impl std::error::Error for BspError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Lump {
    pub offset: u32,
    pub length: u32,
}

impl Lump {
    fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &data[start..start + self.length as usize]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BspHeader {
    pub version: u32,
    pub lumps: [Lump; LUMP_COUNT],
}

impl BspHeader {
    /// Every lump is checked against the file length here, so later slicing
    /// cannot go out of bounds.
    pub fn parse(data: &[u8]) -> Result<Self, BspError> {
        if data.len() < HEADER_LEN {
            return Err(BspError::Truncated { len: data.len() });
        }
        if &data[0..4] != b"IBSP" {
            return Err(BspError::BadMagic);
        }
        let version = u32_at(data, 4);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(BspError::UnsupportedVersion(version));
        }

        let mut lumps = [Lump {
            offset: 0,
            length: 0,
        }; LUMP_COUNT];
        for (index, lump) in lumps.iter_mut().enumerate() {
            let base = 8 + index * 8;
            *lump = Lump {
                offset: u32_at(data, base),
                length: u32_at(data, base + 4),
            };
            let end = u64::from(lump.offset) + u64::from(lump.length);
            if end > data.len() as u64 {
                return Err(BspError::LumpOutOfBounds {
                    lump: LUMP_NAMES[index],
                    offset: lump.offset,
                    length: lump.length,
                });
            }
        }
        Ok(Self { version, lumps })
    }
}

/// One entry of the shader lump: a shader some compiled surface uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BspShader {
    pub name: String,
    pub surface_flags: i32,
    pub content_flags: i32,
}

#[derive(Debug, Clone)]
pub struct BspSummary {
    pub header: BspHeader,
    pub shaders: Vec<BspShader>,
    pub lightmap_bytes: u32,
}

impl BspSummary {
    /// Internal lightmaps; external ones live in `maps/<map>/lm_*`.
    pub fn has_internal_lightmaps(&self) -> bool {
        self.lightmap_bytes > 0
    }
}

pub fn read_bsp_summary(data: &[u8]) -> Result<BspSummary, BspError> {
    let header = BspHeader::parse(data)?;
    let shaders = read_shaders(header.lumps[SHADERS_LUMP].bytes(data))?;
    Ok(BspSummary {
        lightmap_bytes: header.lumps[LIGHTMAPS_LUMP].length,
        header,
        shaders,
    })
}

fn read_shaders(lump: &[u8]) -> Result<Vec<BspShader>, BspError> {
    if lump.len() % SHADER_RECORD_LEN != 0 {
        return Err(BspError::PartialShaderRecord {
            length: lump.len() as u32,
        });
    }
    let count = lump.len() / SHADER_RECORD_LEN;
    if count > MAX_SHADERS {
        return Err(BspError::TooManyShaders { count });
    }
    Ok(lump
        .chunks_exact(SHADER_RECORD_LEN)
        .map(|record| {
            let name = &record[..SHADER_NAME_LEN];
            let len = name
                .iter()
                .position(|&byte| byte == 0)
                .unwrap_or(SHADER_NAME_LEN);
            BspShader {
                name: String::from_utf8_lossy(&name[..len]).into_owned(),
                surface_flags: u32_at(record, 64) as i32,
                content_flags: u32_at(record, 68) as i32,
            }
        })
        .collect())
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
