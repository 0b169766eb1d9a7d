use std::fmt;

// MD3 / MDC model parsing, limited to the shader names of each surface.

const MD3_IDENT: &[u8; 4] = b"IDP3";
const MD3_VERSION: i32 = 15;
const MDC_IDENT: &[u8; 4] = b"IDPC";
const MDC_VERSION: i32 = 2;
const MDC_SURFACE_IDENT: i32 = 7;
const SHADER_NAME_LEN: usize = 64;
const SHADER_RECORD_LEN: usize = SHADER_NAME_LEN + 4;
const MAX_SURFACES: i32 = 256;
const MAX_SHADERS: i32 = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModelFormat {
    Md3,
    Mdc,
}

/// Byte offsets of the fields this parser needs; everything else is skipped.
struct Layout {
    header_len: usize,
    num_surfaces: usize,
    ofs_surfaces: usize,
    surface_len: usize,
    surface_num_shaders: usize,
    surface_ofs_shaders: usize,
    surface_ofs_end: usize,
}

impl ModelFormat {
    pub fn name(self) -> &'static str {
        match self {
            ModelFormat::Md3 => "md3",
            ModelFormat::Mdc => "mdc",
        }
    }

    fn layout(self) -> Layout {
        match self {
            ModelFormat::Md3 => Layout {
                header_len: 108,
                num_surfaces: 84,
                ofs_surfaces: 100,
                surface_len: 108,
                surface_num_shaders: 76,
                surface_ofs_shaders: 92,
                surface_ofs_end: 104,
            },
            ModelFormat::Mdc => Layout {
                header_len: 112,
                num_surfaces: 84,
                ofs_surfaces: 104,
                surface_len: 124,
                surface_num_shaders: 80,
                surface_ofs_shaders: 96,
                surface_ofs_end: 120,
            },
        }
    }

    fn version(self) -> i32 {
        match self {
            ModelFormat::Md3 => MD3_VERSION,
            ModelFormat::Mdc => MDC_VERSION,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MdxError {
    Truncated { offset: usize, needed: usize },
    BadMagic,
    UnsupportedVersion { format: ModelFormat, version: i32 },
    BadSurfaceMagic { surface: usize },
    BadCount { what: &'static str, count: i32 },
    BadOffset { what: &'static str, offset: i32 },
    UnterminatedName { surface: usize, shader: usize },
}

impl fmt::Display for MdxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdxError::Truncated { offset, needed } => {
                write!(f, "model data truncated ({} bytes at {})", needed, offset)
            }
            MdxError::BadMagic => write!(f, "not an md3 or mdc model"),
            MdxError::UnsupportedVersion { format, version } => {
                write!(f, "unsupported {} version {}", format.name(), version)
            }
            MdxError::BadSurfaceMagic { surface } => {
                write!(f, "surface {} has a bad ident", surface)
            }
            MdxError::BadCount { what, count } => write!(f, "invalid {} count {}", what, count),
            MdxError::BadOffset { what, offset } => {
                write!(f, "invalid {} offset {}", what, offset)
            }
            MdxError::UnterminatedName { surface, shader } => write!(
                f,
                "surface {} shader {} name is not terminated",
                surface, shader
            ),
        }
    }
}

impl std::error::Error for MdxError {}

/// Bounds-checked little-endian reads over the model bytes.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], MdxError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(MdxError::Truncated {
                offset,
                needed: len,
            })
    }

    fn i32_at(&self, offset: usize) -> Result<i32, MdxError> {
        let bytes = self.bytes(offset, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn offset_at(&self, offset: usize, what: &'static str) -> Result<usize, MdxError> {
        let value = self.i32_at(offset)?;
        usize::try_from(value).map_err(|_| MdxError::BadOffset {
            what,
            offset: value,
        })
    }

    fn count_at(&self, offset: usize, what: &'static str, max: i32) -> Result<usize, MdxError> {
        let value = self.i32_at(offset)?;
        if !(0..=max).contains(&value) {
            return Err(MdxError::BadCount { what, count: value });
        }
        Ok(value as usize)
    }
}

pub fn detect_format(data: &[u8]) -> Option<ModelFormat> {
    match data.get(0..4)? {
        ident if ident == MD3_IDENT => Some(ModelFormat::Md3),
        ident if ident == MDC_IDENT => Some(ModelFormat::Mdc),
        _ => None,
    }
}

/// Returns the non-empty shader names of every surface, in file order.
pub fn parse_model_materials(data: &[u8]) -> Result<Vec<String>, MdxError> {
    let cursor = Cursor { data };
    cursor.bytes(0, 4)?;
    let format = detect_format(data).ok_or(MdxError::BadMagic)?;
    let layout = format.layout();
    cursor.bytes(0, layout.header_len)?;
    let version = cursor.i32_at(4)?;
    if version != format.version() {
        return Err(MdxError::UnsupportedVersion { format, version });
    }

    let num_surfaces = cursor.count_at(layout.num_surfaces, "surface", MAX_SURFACES)?;
    let mut surface = cursor.offset_at(layout.ofs_surfaces, "surface")?;
    let mut names = Vec::new();
    for index in 0..num_surfaces {
        let header = cursor.bytes(surface, layout.surface_len)?;
        let magic_ok = match format {
            ModelFormat::Md3 => &header[0..4] == MD3_IDENT,
            ModelFormat::Mdc => cursor.i32_at(surface)? == MDC_SURFACE_IDENT,
        };
        if !magic_ok {
            return Err(MdxError::BadSurfaceMagic { surface: index });
        }

        let num_shaders =
            cursor.count_at(surface + layout.surface_num_shaders, "shader", MAX_SHADERS)?;
        let ofs_shaders = cursor.offset_at(surface + layout.surface_ofs_shaders, "shader")?;
        let ofs_end = cursor.offset_at(surface + layout.surface_ofs_end, "surface end")?;
        if ofs_end == 0 {
            return Err(MdxError::BadOffset {
                what: "surface end",
                offset: 0,
            });
        }

        for shader in 0..num_shaders {
            let record = cursor.bytes(
                surface + ofs_shaders + shader * SHADER_RECORD_LEN,
                SHADER_RECORD_LEN,
            )?;
            let slot = &record[..SHADER_NAME_LEN];
            let len = slot
                .iter()
                .position(|&byte| byte == 0)
                .ok_or(MdxError::UnterminatedName {
                    surface: index,
                    shader,
                })?;
            if len > 0 {
                names.push(String::from_utf8_lossy(&slot[..len]).into_owned());
            }
        }

        surface = surface
            .checked_add(ofs_end)
            .ok_or(MdxError::BadOffset {
                what: "surface end",
                offset: ofs_end as i32,
            })?;
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_i32(data: &mut [u8], offset: usize, value: i32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn shader_record(name: &str) -> Vec<u8> {
        let mut record = vec![0u8; SHADER_RECORD_LEN];
        record[..name.len()].copy_from_slice(name.as_bytes());
        record
    }

    fn build(format: ModelFormat, surfaces: &[&[&str]]) -> Vec<u8> {
        let layout = format.layout();
        let mut data = vec![0u8; layout.header_len];
        match format {
            ModelFormat::Md3 => data[0..4].copy_from_slice(MD3_IDENT),
            ModelFormat::Mdc => data[0..4].copy_from_slice(MDC_IDENT),
        }
        put_i32(&mut data, 4, format.version());
        put_i32(&mut data, layout.num_surfaces, surfaces.len() as i32);
        put_i32(&mut data, layout.ofs_surfaces, layout.header_len as i32);
        for shaders in surfaces {
            let mut surface = vec![0u8; layout.surface_len];
            match format {
                ModelFormat::Md3 => surface[0..4].copy_from_slice(MD3_IDENT),
                ModelFormat::Mdc => put_i32(&mut surface, 0, MDC_SURFACE_IDENT),
            }
            let end = layout.surface_len + shaders.len() * SHADER_RECORD_LEN;
            put_i32(&mut surface, layout.surface_num_shaders, shaders.len() as i32);
            put_i32(&mut surface, layout.surface_ofs_shaders, layout.surface_len as i32);
            put_i32(&mut surface, layout.surface_ofs_end, end as i32);
            for name in shaders.iter() {
                surface.extend(shader_record(name));
            }
            data.extend(surface);
        }
        data
    }

    #[test]
    fn reads_md3_shader_names() {
        let data = build(
            ModelFormat::Md3,
            &[&["models/a/skin.tga", ""], &["models/a/glass"]],
        );
        assert_eq!(detect_format(&data), Some(ModelFormat::Md3));
        let names = parse_model_materials(&data).expect("parse ok");
        assert_eq!(names, vec!["models/a/skin.tga", "models/a/glass"]);
    }

    #[test]
    fn reads_mdc_shader_names() {
        let data = build(ModelFormat::Mdc, &[&["models/b/metal.jpg"]]);
        assert_eq!(detect_format(&data), Some(ModelFormat::Mdc));
        let names = parse_model_materials(&data).expect("parse ok");
        assert_eq!(names, vec!["models/b/metal.jpg"]);
    }

    #[test]
    fn bad_magic_is_reported() {
        let mut data = build(ModelFormat::Md3, &[&["models/a/skin.tga"]]);
        data[0..4].copy_from_slice(b"RIFF");
        assert_eq!(parse_model_materials(&data), Err(MdxError::BadMagic));
        assert_eq!(detect_format(&data), None);
    }

    #[test]
    fn checks_version_and_bounds() {
        let mut data = build(ModelFormat::Md3, &[&["models/a/skin.tga"]]);
        put_i32(&mut data, 4, 16);
        assert!(matches!(
            parse_model_materials(&data),
            Err(MdxError::UnsupportedVersion { version: 16, .. })
        ));

        let data = build(ModelFormat::Md3, &[&["models/a/skin.tga"]]);
        let cut = &data[..data.len() - 10];
        assert!(matches!(
            parse_model_materials(cut),
            Err(MdxError::Truncated { .. })
        ));
        assert!(matches!(
            parse_model_materials(b"IDP3"),
            Err(MdxError::Truncated { .. })
        ));
    }

    #[test]
    fn unterminated_name_is_an_error() {
        let mut data = build(ModelFormat::Md3, &[&["x"]]);
        let name_start = 108 + 108;
        for byte in &mut data[name_start..name_start + SHADER_NAME_LEN] {
            *byte = b'a';
        }
        assert_eq!(
            parse_model_materials(&data),
            Err(MdxError::UnterminatedName {
                surface: 0,
                shader: 0
            })
        );
    }

    #[test]
    fn bad_surface_ident() {
        let mut data = build(ModelFormat::Mdc, &[&["x"]]);
        put_i32(&mut data, 112, 3);
        assert_eq!(
            parse_model_materials(&data),
            Err(MdxError::BadSurfaceMagic { surface: 0 })
        );
    }
}
