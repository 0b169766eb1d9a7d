//! id Tech 3 file formats consumed by the map packer: map dumps, shader
//! scripts, auxiliary scripts, MD3/MDC models and compiled IBSP headers.
#![forbid(unsafe_code)]

pub mod bsp_q3;
pub mod lines;
pub mod map_dump;
pub mod mdx;
pub mod qpath;
pub mod resource;
pub mod scripts;
pub mod shader_script;

pub use qpath::{QPath, QPathError, MAX_QPATH};
pub use resource::{LineRef, Resource, ResourceSet};
