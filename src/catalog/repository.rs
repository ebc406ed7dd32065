use std::collections::HashMap;

use sqlx::sqlite::SqliteConnection;

use crate::data_types::{
    Collection, CollectionId, CollectionSchema, Field, FieldDefinition, FieldKind,
    RelationOptions,
};
use crate::error::{Error, Result};
use crate::repository::interface::{CollectionRecord, Error as RepositoryError};
use crate::repository::sqlite::SqliteRepository;

pub(super) fn collection_not_found(name: &str) -> Error {
    Error::NotFound {
        kind: "Collection",
        name: name.to_string(),
    }
}

pub(super) fn field_not_found(name: &str) -> Error {
    Error::NotFound {
        kind: "Field",
        name: name.to_string(),
    }
}

pub(super) async fn load_collection(conn: &mut SqliteConnection, name: &str) -> Result<Collection> {
    SqliteRepository::get_collection(conn, name)
        .await
        .map(CollectionRecord::into_collection)
        .map_err(|e| match e {
            RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                collection_not_found(name)
            }
            e => e.into(),
        })
}

pub(super) async fn load_fields(
    conn: &mut SqliteConnection,
    collection_id: &str,
) -> Result<Vec<Field>> {
    SqliteRepository::list_fields(conn, collection_id)
        .await?
        .into_iter()
        .map(|f| f.into_field().map_err(Error::from))
        .collect()
}

pub(super) async fn load_schema(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<CollectionSchema> {
    let collection = load_collection(conn, name).await?;
    let fields = load_fields(conn, &collection.id).await?;
    Ok(CollectionSchema { collection, fields })
}

/// Find the collection a relation points at, by id first and then by name
pub(super) async fn resolve_target(
    conn: &mut SqliteConnection,
    target: &str,
) -> Result<CollectionRecord> {
    match SqliteRepository::get_collection_by_id(conn, target).await {
        Ok(record) => return Ok(record),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    SqliteRepository::get_collection(conn, target)
        .await
        .map_err(|e| match e {
            RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                collection_not_found(target)
            }
            e => e.into(),
        })
}

/// Rewrite a relation definition to point at a collection id. `this` is the
/// collection the field belongs to, which a relation may name to refer to itself.
pub(super) async fn resolve_definition(
    conn: &mut SqliteConnection,
    mut definition: FieldDefinition,
    this: (&CollectionId, &str),
    targets: &mut HashMap<CollectionId, String>,
) -> Result<FieldDefinition> {
    let target = match definition.kind.relation_target() {
        Some(target) => target.to_string(),
        None => return Ok(definition),
    };

    let (this_id, this_name) = this;
    let (id, name) = if &target == this_id || target.eq_ignore_ascii_case(this_name) {
        (this_id.clone(), this_name.to_string())
    } else {
        let record = resolve_target(conn, &target).await?;
        (record.id, record.name)
    };

    definition.kind = FieldKind::Relation(RelationOptions {
        collection_id: id.clone(),
    });
    targets.insert(id, name);
    Ok(definition)
}

/// Table names of every collection referenced by relation fields
pub(super) async fn relation_targets(
    conn: &mut SqliteConnection,
    this: &Collection,
    fields: &[Field],
) -> Result<HashMap<CollectionId, String>> {
    let mut targets = HashMap::new();
    for target in fields.iter().filter_map(|f| f.kind.relation_target()) {
        if targets.contains_key(target) {
            continue;
        }
        if target == this.id {
            targets.insert(this.id.clone(), this.name.clone());
            continue;
        }
        let record = SqliteRepository::get_collection_by_id(conn, target)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::error::Error::RowNotFound) => {
                    collection_not_found(target)
                }
                e => e.into(),
            })?;
        targets.insert(record.id, record.name);
    }
    Ok(targets)
}
