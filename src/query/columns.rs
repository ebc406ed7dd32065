use itertools::Itertools;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;

use crate::data_types::{
    CollectionType, DatetimeOptions, Field, FieldKind, Record, TextOptions, CREATED_AT, EMAIL,
    ID, PASSWORD_HASH, UPDATED_AT, VERIFIED,
};
use crate::identifier::quote_identifier;
use crate::sql_value::SqlValue;
use crate::validation::to_logical;

/// A physical column of a collection table that may be read back, filtered or sorted on
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: FieldKind,
    pub system: bool,
}

/// The readable columns of one collection table, in table order.
/// `password_hash` is never part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSet {
    columns: Vec<Column>,
}

fn system_kind(name: &str) -> Option<FieldKind> {
    match name {
        ID | EMAIL => Some(FieldKind::Text(TextOptions::default())),
        CREATED_AT | UPDATED_AT => Some(FieldKind::Datetime(DatetimeOptions::default())),
        VERIFIED => Some(FieldKind::Boolean),
        _ => None,
    }
}

impl ColumnSet {
    pub fn new(collection_type: CollectionType, fields: &[Field]) -> Self {
        let system = collection_type
            .system_fields()
            .iter()
            .filter(|name| **name != PASSWORD_HASH)
            .filter_map(|name| {
                system_kind(name).map(|kind| Column {
                    name: name.to_string(),
                    kind,
                    system: true,
                })
            });

        let user = fields.iter().map(|f| Column {
            name: f.name.clone(),
            kind: f.kind.clone(),
            system: false,
        });

        Self {
            columns: system.chain(user).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// Comma-separated quoted column list for SELECT
    pub fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .join(", ")
    }

    /// Turn a row selected with `select_list` into a record, omitting NULLs
    pub fn decode_row(&self, row: &SqliteRow) -> Result<Record, sqlx::Error> {
        let mut record = Record::new();
        for (index, column) in self.columns.iter().enumerate() {
            let value = SqlValue::decode(row, index)?;
            if value.is_null() {
                continue;
            }
            let value = to_logical(column.kind.field_type(), value);
            if value != Value::Null {
                record.insert(column.name.clone(), value);
            }
        }
        Ok(record)
    }
}
