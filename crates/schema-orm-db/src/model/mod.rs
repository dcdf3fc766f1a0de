//! Model metadata: field definitions, the [`Registry`] and the [`Model`] handle.
//!
//! Models are declared with [`ModelDef`] and built into a [`Registry`] at
//! startup. The query layer never touches model declarations directly; it
//! asks a [`Model`] handle.

mod fields;
mod registry;

pub use fields::{FieldDef, FieldType};
pub use registry::{Model, ModelDef, PathSegment, Registry, RegistryBuilder, ResolvedPath};
