pub mod geometry;
pub mod named_list;
pub mod template;

pub use geometry::{Point, Region};
pub use named_list::NamedList;
pub use template::{
    ExtractionMethod, FieldEntry, FieldKind, FieldRef, FieldSpec, LegacyMapping, LegacyPage, Page,
    Section, Structure, StructurePage, Template, HYBRID_FORMAT, MIGRATED_SECTION,
};
