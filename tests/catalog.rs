use rstest::rstest;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use petrel::catalog::{CollectionUpdate, SchemaEvent};
use petrel::data_types::{CollectionRules, CollectionType, FieldDefinition, FieldKind, TextOptions};
use petrel::Error;

use crate::fixtures::*;

#[rstest]
#[case("1posts")]
#[case("my-posts")]
#[case("select")]
#[case("_collections")]
#[case("_shadow_posts")]
#[case("sqlite_stat")]
#[case("")]
#[tokio::test]
async fn test_invalid_collection_names(#[case] name: &str) {
    let engine = engine().await;

    let err = engine
        .metadata()
        .create_collection(name, CollectionType::Base, vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIdentifier { .. }), "{err:?}");
}

#[tokio::test]
async fn test_create_collection_errors() {
    let engine = blog_engine().await;
    let metadata = engine.metadata();

    for name in ["posts", "POSTS"] {
        let err = metadata
            .create_collection(name, CollectionType::Base, vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameConflict { .. }), "{err:?}");
    }

    let err = metadata
        .create_collection(
            "comments",
            CollectionType::Base,
            vec![FieldDefinition::text("created_at")],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReservedFieldName { .. }), "{err:?}");

    let err = metadata
        .create_collection(
            "members",
            CollectionType::Auth,
            vec![FieldDefinition::text("Email")],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReservedFieldName { .. }), "{err:?}");

    let err = metadata
        .create_collection(
            "comments",
            CollectionType::Base,
            vec![FieldDefinition::text("body"), FieldDefinition::json("BODY")],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict { .. }), "{err:?}");

    let err = metadata
        .create_collection(
            "comments",
            CollectionType::Base,
            vec![FieldDefinition::relation("post", "articles")],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");

    let err = metadata
        .create_collection(
            "comments",
            CollectionType::Base,
            vec![FieldDefinition::new(
                "body",
                FieldKind::Text(TextOptions {
                    pattern: Some("(unclosed".to_string()),
                    ..Default::default()
                }),
            )],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFieldOptions { .. }), "{err:?}");

    // None of the failures left anything behind
    let names: Vec<_> = metadata
        .list_collections()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.collection.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"comments".to_string()));
}

#[tokio::test]
async fn test_schema_accessors() {
    let engine = blog_engine().await;
    let metadata = engine.metadata();

    let users = metadata.get_collection("users").await.unwrap();
    let posts = metadata.get_schema("posts").await.unwrap();
    let names: Vec<_> = posts.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["title", "views", "author"]);
    assert!(posts.field("title").unwrap().required);
    assert_eq!(
        posts.field("author").unwrap().kind.relation_target(),
        Some(users.id.as_str())
    );

    assert_eq!(
        metadata.get_collection_by_id(&users.id).await.unwrap(),
        users
    );
    assert_eq!(
        metadata.get_fields("posts").await.unwrap(),
        posts.fields
    );

    let listed = metadata.list_collections().await.unwrap();
    assert_eq!(listed.len(), 2);
    let listed_posts = listed
        .iter()
        .find(|s| s.collection.name == "posts")
        .unwrap();
    assert_eq!(listed_posts, &posts);

    let err = metadata.get_collection("nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_schema_events() {
    let engine = engine().await;
    let mut events = engine.subscribe();
    let metadata = engine.metadata();

    let created = metadata
        .create_collection(
            "notes",
            CollectionType::Base,
            vec![FieldDefinition::text("body")],
            None,
        )
        .await
        .unwrap();
    let id = created.collection.id.clone();
    metadata
        .add_field("notes", FieldDefinition::number("rank"), None)
        .await
        .unwrap();
    metadata
        .create_index("notes", "notes_rank", &["rank"], false)
        .await
        .unwrap();
    metadata
        .update_collection(
            "notes",
            CollectionUpdate {
                name: Some("memos".to_string()),
                rules: None,
            },
        )
        .await
        .unwrap();
    metadata.delete_collection("memos").await.unwrap();

    let expected = vec![
        SchemaEvent::CollectionCreated {
            id: id.clone(),
            name: "notes".to_string(),
        },
        SchemaEvent::FieldsChanged {
            id: id.clone(),
            name: "notes".to_string(),
        },
        SchemaEvent::IndexesChanged {
            id: id.clone(),
            name: "notes".to_string(),
        },
        SchemaEvent::CollectionUpdated {
            id: id.clone(),
            name: "memos".to_string(),
            previous_name: "notes".to_string(),
        },
        SchemaEvent::CollectionDeleted {
            id,
            name: "memos".to_string(),
        },
    ];
    for event in expected {
        assert_eq!(events.try_recv().unwrap(), event);
    }
    assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);

    // A failed change publishes nothing
    let err = metadata
        .create_collection("select", CollectionType::Base, vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidIdentifier { .. }));
    assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test]
async fn test_update_rules() {
    let engine = blog_engine().await;
    let before = engine.metadata().get_collection("posts").await.unwrap();
    tick();

    let rules = CollectionRules {
        list: Some("@request.auth.id != ''".to_string()),
        delete: Some("author = @request.auth.id".to_string()),
        ..Default::default()
    };
    let updated = engine
        .metadata()
        .update_collection(
            "posts",
            CollectionUpdate {
                name: None,
                rules: Some(rules.clone()),
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.rules, rules);
    assert_eq!(updated.created_at, before.created_at);
    assert!(updated.updated_at > before.updated_at);
    assert_eq!(
        engine.metadata().get_collection("posts").await.unwrap(),
        updated
    );
}

#[tokio::test]
async fn test_rename_conflict() {
    let engine = blog_engine().await;

    let err = engine
        .metadata()
        .update_collection(
            "posts",
            CollectionUpdate {
                name: Some("Users".to_string()),
                rules: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict { .. }), "{err:?}");
    assert!(engine.metadata().get_collection("posts").await.is_ok());
}

#[tokio::test]
async fn test_delete_collection() {
    let engine = blog_engine().await;
    create(&engine, "users", json!({"id": "u1"})).await;
    create(&engine, "posts", json!({"title": "Hi", "author": "u1"})).await;
    let metadata = engine.metadata();

    let err = metadata.delete_collection("users").await.unwrap_err();
    match err {
        Error::RelationIntegrityError { errors } => {
            assert!(errors.contains_key("posts.author"))
        }
        other => panic!("unexpected error {other:?}"),
    }

    metadata.delete_collection("posts").await.unwrap();
    metadata.delete_collection("users").await.unwrap();

    assert!(metadata.list_collections().await.unwrap().is_empty());
    assert!(column_names(&engine, "posts").await.is_empty());
    assert!(foreign_keys_enabled(&engine).await);

    // The name is free again
    metadata
        .create_collection("posts", CollectionType::Base, vec![], None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_self_relation() {
    let engine = engine().await;
    engine
        .metadata()
        .create_collection(
            "nodes",
            CollectionType::Base,
            vec![
                FieldDefinition::text("label"),
                FieldDefinition::relation("parent", "nodes"),
            ],
            None,
        )
        .await
        .unwrap();

    create(&engine, "nodes", json!({"id": "root", "label": "root"})).await;
    create(&engine, "nodes", json!({"id": "leaf", "label": "leaf", "parent": "root"})).await;

    let leaf = engine
        .records()
        .get("nodes", "leaf", &admin(), &["parent".to_string()])
        .await
        .unwrap();
    assert_eq!(leaf["parent"]["label"], "root");

    // Rebuilding a self-referencing table keeps the references intact
    engine
        .metadata()
        .update_field(
            "nodes",
            "label",
            FieldDefinition::text("label").required(),
            None,
        )
        .await
        .unwrap();
    let err = engine
        .records()
        .delete("nodes", "root", &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RelationIntegrityError { .. }), "{err:?}");

    engine.metadata().delete_collection("nodes").await.unwrap();
}

#[tokio::test]
async fn test_drop_index() {
    let engine = blog_engine().await;
    let metadata = engine.metadata();

    metadata
        .create_index("posts", "posts_title", &["title", "created_at"], false)
        .await
        .unwrap();
    let err = metadata
        .create_index("posts", "posts_title", &["views"], false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameConflict { .. }), "{err:?}");
    let err = metadata
        .create_index("posts", "posts_missing", &["missing"], false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");

    let indexes = metadata.list_indexes("posts").await.unwrap();
    assert_eq!(indexes.len(), 1);
    assert!(indexes[0].sql.contains(r#"("title", "created_at")"#));

    metadata.drop_index("posts", "posts_title").await.unwrap();
    assert!(metadata.list_indexes("posts").await.unwrap().is_empty());

    let err = metadata
        .drop_index("posts", "posts_title")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");
}
