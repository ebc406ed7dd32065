use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::data_types::FieldType;
use crate::error::{Error, Result};
use crate::identifier::quote_identifier;
use crate::sql_value::SqlValue;
use crate::validation::coerce;

use super::columns::ColumnSet;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum FilterOperator {
    #[strum(serialize = "=")]
    #[serde(rename = "=")]
    Eq,
    #[strum(serialize = "!=")]
    #[serde(rename = "!=")]
    NotEq,
    #[strum(serialize = ">")]
    #[serde(rename = ">")]
    Gt,
    #[strum(serialize = "<")]
    #[serde(rename = "<")]
    Lt,
    #[strum(serialize = ">=")]
    #[serde(rename = ">=")]
    GtEq,
    #[strum(serialize = "<=")]
    #[serde(rename = "<=")]
    LtEq,
    /// Case-insensitive substring match
    #[strum(serialize = "~")]
    #[serde(rename = "~")]
    Like,
    #[strum(serialize = "!~")]
    #[serde(rename = "!~")]
    NotLike,
}

// Longest first, so that `>=` isn't read as `>` followed by `=`
const OPERATORS: &[&str] = &["!=", ">=", "<=", "!~", "=", ">", "<", "~"];

impl FilterOperator {
    fn is_ordering(&self) -> bool {
        matches!(
            self,
            FilterOperator::Gt | FilterOperator::Lt | FilterOperator::GtEq | FilterOperator::LtEq
        )
    }

    fn is_like(&self) -> bool {
        matches!(self, FilterOperator::Like | FilterOperator::NotLike)
    }
}

/// One `field operator value` condition. A list of them is AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: &str, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }

    pub fn from_parts(field: &str, operator: &str, value: Value) -> Result<Self> {
        let operator = FilterOperator::from_str(operator)
            .map_err(|_| Error::query(format!("unknown operator {operator:?}")))?;
        Ok(Self {
            field: field.to_string(),
            operator,
            value,
        })
    }

    /// Parse the textual form `title ~ 'ell' && views > 5 && author != null`.
    /// Values are quoted strings, numbers, `true`, `false` or `null`.
    pub fn parse(input: &str) -> Result<Vec<Self>> {
        let mut parser = Parser {
            input,
            position: 0,
        };
        let mut filters = vec![];

        parser.skip_whitespace();
        if parser.at_end() {
            return Ok(filters);
        }

        loop {
            let field = parser.identifier()?;
            parser.skip_whitespace();
            let operator = parser.operator()?;
            parser.skip_whitespace();
            let value = parser.value()?;
            filters.push(Filter::from_parts(&field, operator, value)?);

            parser.skip_whitespace();
            if parser.at_end() {
                return Ok(filters);
            }
            if !parser.consume("&&") {
                return Err(parser.error("expected \"&&\""));
            }
            parser.skip_whitespace();
        }
    }

    /// Render a parameterized condition, coercing the value through the column type
    pub(super) fn compile(&self, columns: &ColumnSet) -> Result<(String, Vec<SqlValue>)> {
        let column = columns
            .get(&self.field)
            .ok_or_else(|| Error::query(format!("unknown field {:?}", self.field)))?;
        let field_type = column.kind.field_type();
        let name = quote_identifier(&column.name);

        if self.value.is_null() {
            return match self.operator {
                FilterOperator::Eq => Ok((format!("{name} IS NULL"), vec![])),
                FilterOperator::NotEq => Ok((format!("{name} IS NOT NULL"), vec![])),
                op => Err(Error::query(format!(
                    "operator {op} can't be used with null on field {:?}",
                    self.field
                ))),
            };
        }

        if self.operator.is_like() {
            if matches!(field_type, FieldType::Number | FieldType::Boolean) {
                return Err(Error::query(format!(
                    "operator {} can't be used on {field_type} field {:?}",
                    self.operator, self.field
                )));
            }
            let needle = match coerce(FieldType::Text, &self.value) {
                Ok(SqlValue::Text(s)) => s,
                _ => {
                    return Err(Error::query(format!(
                        "operator {} on field {:?} needs a string",
                        self.operator, self.field
                    )))
                }
            };
            let pattern = SqlValue::Text(format!("%{}%", escape_like(&needle)));

            let sql = if self.operator == FilterOperator::Like {
                format!("{name} LIKE ? ESCAPE '\\'")
            } else {
                format!("({name} IS NULL OR {name} NOT LIKE ? ESCAPE '\\')")
            };
            return Ok((sql, vec![pattern]));
        }

        if self.operator.is_ordering() && matches!(field_type, FieldType::Boolean | FieldType::Json)
        {
            return Err(Error::query(format!(
                "operator {} can't be used on {field_type} field {:?}",
                self.operator, self.field
            )));
        }

        let value = coerce(field_type, &self.value).map_err(|e| {
            Error::query(format!("invalid value for field {:?}: {e}", self.field))
        })?;

        let sql = match self.operator {
            FilterOperator::Eq => format!("{name} = ?"),
            // NULLs are "not equal" to any value
            FilterOperator::NotEq => format!("{name} IS NOT ?"),
            FilterOperator::Gt => format!("{name} > ?"),
            FilterOperator::Lt => format!("{name} < ?"),
            FilterOperator::GtEq => format!("{name} >= ?"),
            FilterOperator::LtEq => format!("{name} <= ?"),
            FilterOperator::Like | FilterOperator::NotLike => unreachable!("handled above"),
        };
        Ok((sql, vec![value]))
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

struct Parser<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    fn at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn error(&self, reason: &str) -> Error {
        Error::query(format!(
            "can't parse filter at position {}: {reason}",
            self.position
        ))
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.position += rest.len() - rest.trim_start().len();
    }

    fn consume(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.position += token.len();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let length = rest.find(|c: char| !predicate(c)).unwrap_or(rest.len());
        self.position += length;
        &rest[..length]
    }

    fn identifier(&mut self) -> Result<String> {
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if name.is_empty() {
            return Err(self.error("expected a field name"));
        }
        Ok(name.to_string())
    }

    fn operator(&mut self) -> Result<&'static str> {
        for operator in OPERATORS {
            if self.consume(operator) {
                return Ok(operator);
            }
        }
        Err(self.error("expected an operator"))
    }

    fn value(&mut self) -> Result<Value> {
        let rest = self.rest();
        let quote = match rest.chars().next() {
            Some(q @ ('\'' | '"')) => q,
            Some(_) => {
                let token = self.take_while(|c| !c.is_whitespace() && c != '&');
                return match token {
                    "null" => Ok(Value::Null),
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => serde_json::from_str::<serde_json::Number>(token)
                        .map(Value::Number)
                        .map_err(|_| self.error(&format!("unexpected value {token:?}"))),
                };
            }
            None => return Err(self.error("expected a value")),
        };

        self.position += 1;
        let mut value = String::new();
        let mut escaped = false;
        for (offset, c) in self.rest().char_indices() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                self.position += offset + 1;
                return Ok(Value::String(value));
            } else {
                value.push(c);
            }
        }
        Err(self.error("unterminated string"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::data_types::{CollectionType, Field, FieldDefinition};

    fn columns() -> ColumnSet {
        let defs = vec![
            FieldDefinition::text("title"),
            FieldDefinition::number("views"),
            FieldDefinition::boolean("published"),
            FieldDefinition::json("meta"),
            FieldDefinition::datetime("due"),
        ];
        let fields: Vec<Field> = defs
            .into_iter()
            .enumerate()
            .map(|(i, def)| Field {
                id: format!("f{i}"),
                collection_id: "c1".to_string(),
                name: def.name,
                required: def.required,
                kind: def.kind,
                position: i as i64,
                created_at: "2024-01-01T00:00:00.000000Z".to_string(),
            })
            .collect();
        ColumnSet::new(CollectionType::Base, &fields)
    }

    #[test]
    fn test_parse() {
        let filters =
            Filter::parse(r#"title ~ 'it''s' && views>=5 && published = true && meta != null"#);
        // Doubled quotes aren't an escape
        assert!(filters.is_err());

        let filters = Filter::parse(
            r#"title ~ 'it\'s && more' && views>=5 && published = true && meta != null"#,
        )
        .unwrap();
        assert_eq!(
            filters,
            vec![
                Filter::new("title", FilterOperator::Like, "it's && more"),
                Filter::new("views", FilterOperator::GtEq, 5),
                Filter::new("published", FilterOperator::Eq, true),
                Filter::new("meta", FilterOperator::NotEq, Value::Null),
            ]
        );

        assert_eq!(Filter::parse("  ").unwrap(), vec![]);
        assert_eq!(
            Filter::parse("views < -1.5").unwrap(),
            vec![Filter::new("views", FilterOperator::Lt, -1.5)]
        );
    }

    #[rstest]
    #[case("title")]
    #[case("title ~")]
    #[case("title ~ 'open")]
    #[case("title ~ x")]
    #[case("title ~ 'a' views > 1")]
    #[case("title <> 'a'")]
    fn test_parse_errors(#[case] input: &str) {
        assert!(matches!(
            Filter::parse(input),
            Err(Error::QueryCompileError { .. })
        ));
    }

    #[rstest]
    #[case(Filter::new("title", FilterOperator::Eq, "a"), r#""title" = ?"#, vec![SqlValue::from("a")])]
    #[case(Filter::new("title", FilterOperator::NotEq, "a"), r#""title" IS NOT ?"#, vec![SqlValue::from("a")])]
    #[case(Filter::new("title", FilterOperator::Eq, Value::Null), r#""title" IS NULL"#, vec![])]
    #[case(Filter::new("title", FilterOperator::NotEq, Value::Null), r#""title" IS NOT NULL"#, vec![])]
    #[case(
        Filter::new("title", FilterOperator::Like, "50%_off"),
        r#""title" LIKE ? ESCAPE '\'"#,
        vec![SqlValue::from(r"%50\%\_off%")]
    )]
    #[case(
        Filter::new("title", FilterOperator::NotLike, "x"),
        r#"("title" IS NULL OR "title" NOT LIKE ? ESCAPE '\')"#,
        vec![SqlValue::from("%x%")]
    )]
    #[case(Filter::new("views", FilterOperator::Gt, "10"), r#""views" > ?"#, vec![SqlValue::Real(10.0)])]
    #[case(Filter::new("published", FilterOperator::Eq, true), r#""published" = ?"#, vec![SqlValue::Integer(1)])]
    #[case(
        Filter::new("due", FilterOperator::LtEq, "2024-05-01"),
        r#""due" <= ?"#,
        vec![SqlValue::from("2024-05-01T00:00:00.000000Z")]
    )]
    #[case(Filter::new("created_at", FilterOperator::Like, "2024"), r#""created_at" LIKE ? ESCAPE '\'"#, vec![SqlValue::from("%2024%")])]
    fn test_compile(
        #[case] filter: Filter,
        #[case] sql: &str,
        #[case] params: Vec<SqlValue>,
    ) {
        assert_eq!(filter.compile(&columns()).unwrap(), (sql.to_string(), params));
    }

    #[rstest]
    #[case(Filter::new("nope", FilterOperator::Eq, 1))]
    #[case(Filter::new("views", FilterOperator::Like, "1"))]
    #[case(Filter::new("published", FilterOperator::Gt, true))]
    #[case(Filter::new("meta", FilterOperator::Lt, json!({"a": 1})))]
    #[case(Filter::new("views", FilterOperator::Eq, "lots"))]
    #[case(Filter::new("views", FilterOperator::Gt, Value::Null))]
    #[case(Filter::new("title", FilterOperator::Like, json!(["a"])))]
    fn test_compile_errors(#[case] filter: Filter) {
        assert!(matches!(
            filter.compile(&columns()),
            Err(Error::QueryCompileError { .. })
        ));
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            Filter::from_parts("views", ">=", json!(3)).unwrap().operator,
            FilterOperator::GtEq
        );
        assert!(Filter::from_parts("views", "=>", json!(3)).is_err());
    }
}
