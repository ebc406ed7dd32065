use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, TypeInfo, ValueRef};

/// A value as SQLite stores it: one of its storage classes
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn bind<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        match self {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
        }
    }

    /// Decode a column by looking at the storage class of the actual value,
    /// not at the declared column type
    pub fn decode(row: &SqliteRow, index: usize) -> Result<Self, sqlx::Error> {
        let storage_class = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                return Ok(SqlValue::Null);
            }
            raw.type_info().name().to_string()
        };

        Ok(match storage_class.as_str() {
            "INTEGER" => SqlValue::Integer(row.try_get_unchecked::<i64, _>(index)?),
            "REAL" => SqlValue::Real(row.try_get_unchecked::<f64, _>(index)?),
            "TEXT" => SqlValue::Text(row.try_get_unchecked::<String, _>(index)?),
            _ => {
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
        })
    }
}

pub fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = value.bind(query);
    }
    query
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Integer(b as i64)
    }
}
