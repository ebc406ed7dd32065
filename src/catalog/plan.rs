use crate::data_types::{Field, FieldDefinition};

/// How an existing field has to be brought to its new definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    /// Only the catalog row changes (options like bounds, patterns or mime types)
    MetadataOnly,
    /// `ALTER TABLE ... RENAME COLUMN`
    Rename,
    /// Shadow-table rebuild, renaming the column first if `rename` is set
    Rebuild { rename: bool },
}

/// `new` must already have its relation target resolved to a collection id
pub fn classify(old: &Field, new: &FieldDefinition) -> FieldChange {
    let renamed = old.name != new.name;
    let structural = old.kind.field_type() != new.kind.field_type()
        || old.required != new.required
        || old.kind.relation_target() != new.kind.relation_target();

    match (structural, renamed) {
        (true, rename) => FieldChange::Rebuild { rename },
        (false, true) => FieldChange::Rename,
        (false, false) => FieldChange::MetadataOnly,
    }
}
