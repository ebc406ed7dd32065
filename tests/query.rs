use std::cmp::Ordering;

use rstest::rstest;
use serde_json::{json, Value};

use petrel::data_types::{CollectionType, FieldDefinition, Record};
use petrel::query::{Filter, FilterOperator, ListOptions, SortDirection, SortKey};
use petrel::{Engine, Error};

use crate::fixtures::*;

const ROWS: &[(Option<&str>, Option<f64>, Option<bool>)] = &[
    (Some("alpha"), Some(10.0), Some(true)),
    (Some("Bravo"), Some(3.5), Some(false)),
    (Some("charlie"), None, Some(true)),
    (Some("delta"), Some(7.0), None),
    (Some("Echo"), Some(10.0), Some(false)),
    (Some("foxtrot"), Some(-2.0), Some(true)),
    (None, Some(0.0), Some(false)),
    (Some("hotel"), Some(7.0), Some(true)),
    (Some("India"), None, None),
    (Some("juliett"), Some(42.0), Some(false)),
    (Some("kilo"), Some(3.5), Some(true)),
    (Some("Lima"), Some(0.5), None),
];

async fn items_engine() -> Engine {
    let engine = engine().await;
    engine
        .metadata()
        .create_collection(
            "items",
            CollectionType::Base,
            vec![
                FieldDefinition::text("name"),
                FieldDefinition::number("score"),
                FieldDefinition::boolean("flag"),
            ],
            None,
        )
        .await
        .unwrap();

    for (i, (name, score, flag)) in ROWS.iter().enumerate() {
        create(
            &engine,
            "items",
            json!({"id": format!("r{i:02}"), "name": name, "score": score, "flag": flag}),
        )
        .await;
    }
    engine
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(actual: Option<&Value>, needle: &Value) -> bool {
    match (actual.and_then(Value::as_str), needle.as_str()) {
        (Some(actual), Some(needle)) => actual
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase()),
        _ => false,
    }
}

/// What a row-by-row scan would answer for one filter
fn matches(record: &Record, filter: &Filter) -> bool {
    let actual = record.get(&filter.field);
    if filter.value.is_null() {
        return match filter.operator {
            FilterOperator::Eq => actual.is_none(),
            FilterOperator::NotEq => actual.is_some(),
            op => panic!("{op} with null"),
        };
    }

    let ordering = actual.and_then(|a| compare(a, &filter.value));
    match filter.operator {
        FilterOperator::Eq => ordering == Some(Ordering::Equal),
        FilterOperator::NotEq => ordering != Some(Ordering::Equal),
        FilterOperator::Gt => ordering == Some(Ordering::Greater),
        FilterOperator::Lt => ordering == Some(Ordering::Less),
        FilterOperator::GtEq => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        FilterOperator::LtEq => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        FilterOperator::Like => contains(actual, &filter.value),
        FilterOperator::NotLike => !contains(actual, &filter.value),
    }
}

/// NULLs sort first; ties keep insertion order
fn reference(records: &[Record], filters: &[Filter], sort: &[SortKey]) -> Vec<Record> {
    let mut selected: Vec<(usize, &Record)> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| filters.iter().all(|f| matches(r, f)))
        .collect();

    selected.sort_by(|(ia, a), (ib, b)| {
        for key in sort {
            let ordering = match (a.get(&key.field), b.get(&key.field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
            };
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        ia.cmp(ib)
    });

    selected.into_iter().map(|(_, r)| r.clone()).collect()
}

#[rstest]
#[case("", "")]
#[case("score > 5", "-score")]
#[case("score >= 3.5 && flag = true", "name")]
#[case("score < 7", "score,-name")]
#[case("score <= 7", "-flag,score")]
#[case("score != 10", "-score")]
#[case("score = 7", "")]
#[case("name ~ 'A'", "-name")]
#[case("name !~ 'a'", "")]
#[case("name > 'c'", "name")]
#[case("name = null", "")]
#[case("flag != null", "-created_at")]
#[case("flag = false && name ~ \"o\"", "-name")]
#[tokio::test]
async fn test_list_matches_reference(#[case] filter: &str, #[case] sort: &str) {
    let engine = items_engine().await;
    let everything = all_records(&engine, "items").await;
    assert_eq!(everything.len(), ROWS.len());

    let filters = Filter::parse(filter).unwrap();
    let sort = SortKey::parse_list(sort).unwrap();
    let expected = reference(&everything, &filters, &sort);

    let per_page = 4;
    let mut page = 1;
    let mut seen = vec![];
    loop {
        let options = ListOptions {
            filter: filters.clone(),
            sort: sort.clone(),
            ..Default::default()
        }
        .page(page, per_page);
        let result = engine
            .records()
            .list("items", &options, &admin())
            .await
            .unwrap();

        assert_eq!(result.total_items, expected.len() as u64);
        assert_eq!(
            result.total_pages,
            (expected.len() as u64).div_ceil(per_page as u64)
        );
        if result.items.is_empty() {
            break;
        }
        assert!(result.items.len() <= per_page as usize);
        seen.extend(result.items);
        page += 1;
    }

    assert_eq!(seen, expected, "filter {filter:?}, sort {sort:?}");
}

#[rstest]
#[case(ListOptions::default().filter(Filter::new("missing", FilterOperator::Eq, 1)))]
#[case(ListOptions::default().filter(Filter::new("flag", FilterOperator::Gt, true)))]
#[case(ListOptions::default().filter(Filter::new("score", FilterOperator::Like, "1")))]
#[case(ListOptions::default().filter(Filter::new("score", FilterOperator::Lt, "abc")))]
#[case(ListOptions::default().sort(SortKey::desc("missing")))]
#[case(ListOptions::default().expand("name"))]
#[case(ListOptions::default().page(0, 10))]
#[case(ListOptions::default().page(1, 501))]
#[tokio::test]
async fn test_invalid_queries(#[case] options: ListOptions) {
    let engine = items_engine().await;

    let err = engine
        .records()
        .list("items", &options, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueryCompileError { .. }), "{err:?}");
}

#[tokio::test]
async fn test_values_stay_parameters() {
    let engine = items_engine().await;

    let result = engine
        .records()
        .list(
            "items",
            &ListOptions::default().filter(Filter::new(
                "name",
                FilterOperator::Eq,
                "x' OR 1=1 --",
            )),
            &admin(),
        )
        .await
        .unwrap();
    assert_eq!(result.total_items, 0);

    // LIKE wildcards are matched literally
    let result = engine
        .records()
        .list(
            "items",
            &ListOptions::default().filter(Filter::new("name", FilterOperator::Like, "%")),
            &admin(),
        )
        .await
        .unwrap();
    assert_eq!(result.total_items, 0);
}

#[tokio::test]
async fn test_expand_runs_one_lookup_per_field() {
    let engine = blog_engine().await;
    let metadata = engine.metadata();
    metadata
        .add_field(
            "posts",
            FieldDefinition::relation("editor", "users"),
            None,
        )
        .await
        .unwrap();

    for user in ["u1", "u2", "u3"] {
        create(&engine, "users", json!({ "id": user, "name": user.to_uppercase() })).await;
    }
    for i in 0..20 {
        let editor = if i % 2 == 0 { json!("u1") } else { Value::Null };
        create(
            &engine,
            "posts",
            json!({
                "title": format!("Post {i}"),
                "author": format!("u{}", i % 3 + 1),
                "editor": editor,
            }),
        )
        .await;
    }

    let records = engine.records();
    let schema = metadata.get_schema("posts").await.unwrap();
    let mut items = records
        .list("posts", &ListOptions::default(), &admin())
        .await
        .unwrap()
        .items;
    assert_eq!(items.len(), 20);

    let lookups = records
        .expand(
            &schema,
            &mut items,
            &["author".to_string(), "editor".to_string(), "author".to_string()],
            &admin(),
        )
        .await
        .unwrap();
    assert_eq!(lookups, 2);

    for (i, item) in items.iter().enumerate() {
        let author = format!("u{}", i % 3 + 1);
        assert_eq!(item["author"]["id"], author.as_str());
        assert_eq!(item["author"]["name"], author.to_uppercase().as_str());
        if i % 2 == 0 {
            assert_eq!(item["editor"]["name"], "U1");
        } else {
            assert!(!item.contains_key("editor"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_totals_agree_with_items_under_concurrent_writes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = file_engine(&dir).await;
    engine
        .metadata()
        .create_collection(
            "events",
            CollectionType::Base,
            vec![FieldDefinition::text("kind")],
            None,
        )
        .await
        .unwrap();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                create(&engine, "events", json!({ "kind": format!("k{i}") })).await;
            }
        })
    };

    let options = ListOptions::default().page(1, 500);
    let mut last_total = 0;
    while !writer.is_finished() {
        let result = engine
            .records()
            .list("events", &options, &admin())
            .await
            .unwrap();
        assert_eq!(result.total_items, result.items.len() as u64);
        assert!(result.total_items >= last_total);
        last_total = result.total_items;
    }
    writer.await.unwrap();

    let result = engine
        .records()
        .list("events", &options, &admin())
        .await
        .unwrap();
    assert_eq!(result.total_items, 200);
    assert_eq!(result.items.len(), 200);
    engine.close().await;
}
