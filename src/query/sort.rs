use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifier::quote_identifier;

use super::columns::ColumnSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Desc,
        }
    }

    /// `-field` sorts descending, `field` or `+field` ascending
    pub fn parse(key: &str) -> Result<Self> {
        let key = key.trim();
        let (direction, field) = match key.strip_prefix('-') {
            Some(field) => (SortDirection::Desc, field),
            None => (SortDirection::Asc, key.strip_prefix('+').unwrap_or(key)),
        };
        if field.is_empty() {
            return Err(Error::query(format!("invalid sort key {key:?}")));
        }
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }

    /// Comma-separated keys, e.g. `-created_at,title`
    pub fn parse_list(keys: &str) -> Result<Vec<Self>> {
        keys.split(',')
            .filter(|k| !k.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// ORDER BY clause with a trailing rowid tie-break, so that pages never
/// overlap. NULLs come first in ascending order.
pub(super) fn compile_order_by(keys: &[SortKey], columns: &ColumnSet) -> Result<String> {
    let mut terms = keys
        .iter()
        .map(|key| {
            let column = columns
                .get(&key.field)
                .ok_or_else(|| Error::query(format!("unknown sort field {:?}", key.field)))?;
            let direction = match key.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            Ok(format!("{} {direction}", quote_identifier(&column.name)))
        })
        .collect::<Result<Vec<_>>>()?;
    terms.push("rowid ASC".to_string());

    Ok(format!("ORDER BY {}", terms.iter().join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::CollectionType;

    #[test]
    fn test_parse_list() {
        assert_eq!(
            SortKey::parse_list("-created_at, title,+id").unwrap(),
            vec![
                SortKey::desc("created_at"),
                SortKey::asc("title"),
                SortKey::asc("id")
            ]
        );
        assert_eq!(SortKey::parse_list("").unwrap(), vec![]);
        assert!(SortKey::parse("-").is_err());
    }

    #[test]
    fn test_order_by() {
        let columns = ColumnSet::new(CollectionType::Base, &[]);
        assert_eq!(
            compile_order_by(&[SortKey::desc("created_at")], &columns).unwrap(),
            r#"ORDER BY "created_at" DESC, rowid ASC"#
        );
        assert_eq!(
            compile_order_by(&[], &columns).unwrap(),
            "ORDER BY rowid ASC"
        );
        assert!(matches!(
            compile_order_by(&[SortKey::asc("views")], &columns),
            Err(Error::QueryCompileError { .. })
        ));
    }
}
