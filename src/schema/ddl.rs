use std::collections::HashMap;

use itertools::Itertools;

use crate::data_types::{
    CollectionId, CollectionType, Field, FieldType, CREATED_AT, EMAIL, ID, PASSWORD_HASH,
    UPDATED_AT, VERIFIED,
};
use crate::error::{Error, Result};
use crate::identifier::quote_identifier;

/// Declared SQLite type of a field column
pub fn column_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Number => "REAL",
        FieldType::Boolean => "INTEGER",
        FieldType::Text
        | FieldType::Datetime
        | FieldType::Json
        | FieldType::Relation
        | FieldType::File => "TEXT",
    }
}

fn system_column_definition(name: &str) -> String {
    let declaration = match name {
        ID => "TEXT PRIMARY KEY NOT NULL",
        CREATED_AT | UPDATED_AT | PASSWORD_HASH => "TEXT NOT NULL",
        EMAIL => "TEXT NOT NULL UNIQUE",
        VERIFIED => "INTEGER NOT NULL DEFAULT 0",
        _ => "TEXT",
    };
    format!("{} {declaration}", quote_identifier(name))
}

/// Column definition of a user field. `targets` maps collection ids to table
/// names for relation fields.
pub fn column_definition(
    field: &Field,
    targets: &HashMap<CollectionId, String>,
) -> Result<String> {
    let mut definition = format!(
        "{} {}",
        quote_identifier(&field.name),
        column_type(field.kind.field_type())
    );

    if field.required {
        definition.push_str(" NOT NULL");
    }

    if let Some(target_id) = field.kind.relation_target() {
        let target = targets.get(target_id).ok_or_else(|| Error::NotFound {
            kind: "Collection",
            name: target_id.to_string(),
        })?;
        definition.push_str(&format!(
            " REFERENCES {}(\"id\") ON DELETE RESTRICT",
            quote_identifier(target)
        ));
    }

    Ok(definition)
}

pub fn create_table_sql(
    table: &str,
    collection_type: CollectionType,
    fields: &[Field],
    targets: &HashMap<CollectionId, String>,
) -> Result<String> {
    let system = collection_type
        .system_fields()
        .iter()
        .map(|name| system_column_definition(name));
    let user = fields
        .iter()
        .map(|f| column_definition(f, targets))
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_identifier(table),
        system.chain(user).join(", ")
    ))
}
