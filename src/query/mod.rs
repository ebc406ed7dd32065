//! Compilation of list/get requests into parameterized SQL. Identifiers only
//! ever come from the catalog and are quoted; every value is bound.

pub mod columns;
pub mod filter;
pub mod sort;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::schema;
use crate::data_types::{CollectionId, Record};
use crate::error::{Error, Result};
use crate::identifier::quote_identifier;
use crate::sql_value::SqlValue;

pub use columns::{Column, ColumnSet};
pub use filter::{Filter, FilterOperator};
pub use sort::{SortDirection, SortKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub filter: Vec<Filter>,
    pub sort: Vec<SortKey>,
    /// 1-indexed
    pub page: u32,
    /// Falls back to the configured default
    pub per_page: Option<u32>,
    /// Relation fields whose ids get replaced by the referenced records
    pub expand: Vec<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            filter: vec![],
            sort: vec![],
            page: 1,
            per_page: None,
            expand: vec![],
        }
    }
}

impl ListOptions {
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter.push(filter);
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn page(mut self, page: u32, per_page: u32) -> Self {
        self.page = page;
        self.per_page = Some(per_page);
        self
    }

    pub fn expand(mut self, field: &str) -> Self {
        self.expand.push(field.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub count_sql: String,
    /// Bound to both `sql` and `count_sql`
    pub params: Vec<SqlValue>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLookup {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// A relation field to expand, with the collection its ids point into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandTarget {
    pub field: String,
    pub collection_id: CollectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub page: u32,
    pub per_page: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub items: Vec<Record>,
}

impl ListResult {
    pub fn new(page: u32, per_page: u32, total_items: u64, items: Vec<Record>) -> Self {
        Self {
            page,
            per_page,
            total_items,
            total_pages: total_items.div_ceil(per_page as u64),
            items,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCompiler {
    pub default_per_page: u32,
    pub max_per_page: u32,
}

impl Default for QueryCompiler {
    fn default() -> Self {
        Self::from_config(&schema::Query::default())
    }
}

impl QueryCompiler {
    pub fn from_config(config: &schema::Query) -> Self {
        Self {
            default_per_page: config.default_per_page,
            max_per_page: config.max_per_page,
        }
    }

    pub fn compile(
        &self,
        table: &str,
        columns: &ColumnSet,
        options: &ListOptions,
    ) -> Result<CompiledQuery> {
        let page = options.page;
        if page < 1 {
            return Err(Error::query("page must be at least 1"));
        }
        let per_page = options.per_page.unwrap_or(self.default_per_page);
        if per_page < 1 || per_page > self.max_per_page {
            return Err(Error::query(format!(
                "per_page must be between 1 and {}",
                self.max_per_page
            )));
        }

        let mut conditions = Vec::with_capacity(options.filter.len());
        let mut params = vec![];
        for filter in &options.filter {
            let (condition, values) = filter.compile(columns)?;
            conditions.push(condition);
            params.extend(values);
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.iter().join(" AND "))
        };

        let order_by = sort::compile_order_by(&options.sort, columns)?;
        let offset = (page as u64 - 1) * per_page as u64;
        let table = quote_identifier(table);

        let sql = format!(
            "SELECT {} FROM {table}{where_clause} {order_by} LIMIT {per_page} OFFSET {offset}",
            columns.select_list()
        );
        let count_sql = format!("SELECT COUNT(*) FROM {table}{where_clause}");
        debug!("Compiled list query: {sql}");

        Ok(CompiledQuery {
            sql,
            count_sql,
            params,
            page,
            per_page,
        })
    }

    pub fn compile_get(&self, table: &str, columns: &ColumnSet) -> String {
        format!(
            "SELECT {} FROM {} WHERE id = ?",
            columns.select_list(),
            quote_identifier(table)
        )
    }

    /// Resolve expand names to relation fields, in request order without duplicates
    pub fn plan_expand(&self, columns: &ColumnSet, expand: &[String]) -> Result<Vec<ExpandTarget>> {
        expand
            .iter()
            .unique()
            .map(|name| {
                let column = columns
                    .get(name)
                    .ok_or_else(|| Error::query(format!("unknown expand field {name:?}")))?;
                match column.kind.relation_target() {
                    Some(collection_id) => Ok(ExpandTarget {
                        field: column.name.clone(),
                        collection_id: collection_id.to_string(),
                    }),
                    None => Err(Error::query(format!(
                        "field {name:?} is not a relation and can't be expanded"
                    ))),
                }
            })
            .collect()
    }

    /// One batched lookup of the referenced records of a page
    pub fn compile_lookup(
        &self,
        table: &str,
        columns: &ColumnSet,
        ids: &[String],
    ) -> CompiledLookup {
        let ids = ids.iter().unique().collect_vec();
        let placeholders = ids.iter().map(|_| "?").join(", ");

        CompiledLookup {
            sql: format!(
                "SELECT {} FROM {} WHERE id IN ({placeholders})",
                columns.select_list(),
                quote_identifier(table)
            ),
            params: ids.into_iter().map(|id| SqlValue::from(id.as_str())).collect(),
        }
    }
}
