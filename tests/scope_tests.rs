// ============================================================================
// Request Scope Integration Tests
// ============================================================================

use std::sync::{Arc, Mutex};

use crudkit::{
    AttributeDef, ChangeDiff, DataStore, DataType, Engine, EngineError, EntityDef, EntityKey,
    HookScope, InMemoryStore, ManagedEntity, MetadataRegistry, Operation, Phase, Principal,
    RelationValue, RelationshipDef, RequestScope, Result, Value,
};

fn library_metadata() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::builder()
            .register_entity(
                EntityDef::new("author")
                    .with_attribute(AttributeDef::new("name", DataType::Text))
                    .with_relationship(
                        RelationshipDef::to_many("books", "book").with_inverse("author"),
                    ),
            )
            .register_entity(
                EntityDef::new("book")
                    .with_attribute(AttributeDef::new("title", DataType::Text))
                    .with_relationship(
                        RelationshipDef::to_one("author", "author").with_inverse("books"),
                    ),
            )
            .build()
            .unwrap(),
    )
}

async fn seed_library(engine: &Engine) {
    engine
        .run(Principal::new("seed"), |scope| async move {
            let author = ManagedEntity::create(&scope, "author", Some(Value::Text("a1".into())))?;
            author.update_attribute(&scope, "name", Value::Text("Herbert".into()))?;
            for id in ["b1", "b2"] {
                let book = ManagedEntity::create(&scope, "book", Some(Value::Text(id.into())))?;
                author.add_relation(&scope, "books", &book).await?;
            }
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_identity_map_reuses_wrappers() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));
    seed_library(&engine).await;

    engine
        .run(Principal::new("alice"), |scope| async move {
            let first = scope.load_one("author", "a1").await?;
            let second = scope.load_one("author", "a1").await?;
            assert!(Arc::ptr_eq(&first, &second));

            // Traversal lands on the same wrapper as a direct load.
            let book = scope.load_one("book", "b1").await?;
            let related = scope.load_related(&first, "books").await?;
            assert!(related.iter().any(|m| Arc::ptr_eq(m, &book)));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_id_within_one_request_is_rejected() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));

    let outcome = engine
        .run(Principal::new("alice"), |scope| async move {
            ManagedEntity::create(&scope, "author", Some(Value::Text("a1".into())))?;
            ManagedEntity::create(&scope, "author", Some(Value::Text("a1".into())))?;
            Ok(())
        })
        .await;
    assert!(matches!(outcome, Err(EngineError::ValidationFailed(_))));
}

#[tokio::test]
async fn test_load_one_missing_is_not_found() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));

    let outcome = engine
        .run(Principal::new("alice"), |scope| async move {
            scope.load_one("author", "missing").await?;
            Ok(())
        })
        .await;
    assert!(matches!(outcome, Err(EngineError::NotFound(_, _))));
}

#[tokio::test]
async fn test_unknown_type_and_field_are_errors() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));
    seed_library(&engine).await;

    engine
        .run(Principal::new("alice"), |scope| async move {
            assert!(matches!(
                scope.load_one("magazine", "m1").await,
                Err(EngineError::UnknownType(_))
            ));
            let author = scope.load_one("author", "a1").await?;
            assert!(matches!(
                author.get_attribute(&scope, "age"),
                Err(EngineError::UnknownField(_, _))
            ));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_relationship_diff_carries_added_and_removed() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let metadata = Arc::new(
        MetadataRegistry::builder()
            .register_entity(
                EntityDef::new("author")
                    .with_attribute(AttributeDef::new("name", DataType::Text))
                    .with_relationship(
                        RelationshipDef::to_many("books", "book").with_inverse("author"),
                    ),
            )
            .register_entity(
                EntityDef::new("book")
                    .with_attribute(AttributeDef::new("title", DataType::Text))
                    .with_relationship(
                        RelationshipDef::to_one("author", "author").with_inverse("books"),
                    ),
            )
            .bind_hook(
                "author",
                Operation::Update,
                Phase::PreCommit,
                HookScope::Field("books".into()),
                move |_: Operation,
                      _: Phase,
                      _: &Arc<ManagedEntity>,
                      _: &RequestScope,
                      diff: Option<&ChangeDiff>|
                      -> Result<()> {
                    if let Some(ChangeDiff::Relationship { added, removed, .. }) = diff {
                        let mut added: Vec<&str> = added.iter().map(|k| k.id.as_str()).collect();
                        let mut removed: Vec<&str> =
                            removed.iter().map(|k| k.id.as_str()).collect();
                        added.sort();
                        removed.sort();
                        sink.lock()
                            .unwrap()
                            .push(format!("added={:?} removed={:?}", added, removed));
                    }
                    Ok(())
                },
            )
            .build()
            .unwrap(),
    );

    let store = InMemoryStore::new(Arc::clone(&metadata));
    let engine = Engine::new(Arc::clone(&metadata), store.clone());
    seed_library(&engine).await;
    assert!(log.lock().unwrap().is_empty());

    engine
        .run(Principal::new("alice"), |scope| async move {
            let author = scope.load_one("author", "a1").await?;
            let b1 = scope.load_one("book", "b1").await?;
            let b2 = scope.load_one("book", "b2").await?;
            let b3 = ManagedEntity::create(&scope, "book", Some(Value::Text("b3".into())))?;

            // b2 out, b3 in; the owner sees a single UPDATE on `books`.
            author
                .replace_relation(&scope, "books", &[b1, b3.clone()])
                .await?;

            // Inverse sides were adjusted in memory right away.
            assert_eq!(b2.snapshot().to_one("author"), None);
            assert_eq!(
                b3.snapshot().to_one("author"),
                Some(author.key().clone())
            );
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        [r#"added=["b3"] removed=["b2"]"#]
    );

    let author = store.committed("author", "a1").await.unwrap();
    let mut members: Vec<String> = author
        .to_many("books")
        .into_iter()
        .map(|k| k.id)
        .collect();
    members.sort();
    assert_eq!(members, ["b1", "b3"]);

    let b2 = store.committed("book", "b2").await.unwrap();
    assert_eq!(b2.to_one("author"), None);
}

#[tokio::test]
async fn test_removing_an_unloaded_member_clears_its_inverse() {
    let metadata = library_metadata();
    let store = InMemoryStore::new(Arc::clone(&metadata));
    let engine = Engine::new(Arc::clone(&metadata), store.clone());
    seed_library(&engine).await;

    engine
        .run(Principal::new("alice"), |scope| async move {
            let author = scope.load_one("author", "a1").await?;
            let b1 = scope.load_one("book", "b1").await?;
            // b2 is never loaded in this request; the bookkeeping has to
            // fetch it itself to fix the far side.
            author.replace_relation(&scope, "books", &[b1]).await?;
            Ok(())
        })
        .await
        .unwrap();

    let b2 = store.committed("book", "b2").await.unwrap();
    assert_eq!(b2.to_one("author"), None);

    let author = store.committed("author", "a1").await.unwrap();
    assert_eq!(author.to_many("books"), vec![EntityKey::new("book", "b1")]);
}

#[tokio::test]
async fn test_to_one_assignment_links_both_sides() {
    let metadata = library_metadata();
    let store = InMemoryStore::new(Arc::clone(&metadata));
    let engine = Engine::new(Arc::clone(&metadata), store.clone());

    engine
        .run(Principal::new("alice"), |scope| async move {
            let author = ManagedEntity::create(&scope, "author", Some(Value::Text("a1".into())))?;
            let book = ManagedEntity::create(&scope, "book", Some(Value::Text("b1".into())))?;
            book.set_relation(&scope, "author", Some(&author)).await?;

            assert_eq!(
                author.snapshot().to_many("books"),
                vec![book.key().clone()]
            );
            Ok(())
        })
        .await
        .unwrap();

    let author = store.committed("author", "a1").await.unwrap();
    assert_eq!(author.to_many("books").len(), 1);
    let book = store.committed("book", "b1").await.unwrap();
    assert_eq!(book.to_one("author").unwrap().id, "a1");
}

#[tokio::test]
async fn test_replacing_with_the_same_members_is_a_no_op() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));
    seed_library(&engine).await;

    engine
        .run(Principal::new("alice"), |scope| async move {
            let author = scope.load_one("author", "a1").await?;
            let members = scope.load_related(&author, "books").await?;
            let before = author.snapshot();
            author.replace_relation(&scope, "books", &members).await?;
            assert_eq!(author.snapshot().to_many("books"), before.to_many("books"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_projection_includes_permitted_relationships() {
    let metadata = library_metadata();
    let engine = Engine::in_memory(Arc::clone(&metadata));
    seed_library(&engine).await;

    engine
        .run(Principal::new("alice"), |scope| async move {
            let author = scope.load_one("author", "a1").await?;
            let resource = author.to_resource(&scope)?;

            assert_eq!(resource.entity_type, "author");
            assert_eq!(resource.id, "a1");
            assert_eq!(
                resource.attributes.get("name"),
                Some(&Value::Text("Herbert".into()))
            );
            assert!(!resource.attributes.contains_key("id"));
            match resource.relationships.get("books") {
                Some(RelationValue::ToMany(keys)) => assert_eq!(keys.len(), 2),
                other => panic!("expected to-many books, got {:?}", other),
            }

            let json = resource.to_json()?;
            assert_eq!(json["id"], "a1");
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_trigger_phases_must_run_in_order() {
    let metadata = library_metadata();
    let store = InMemoryStore::new(Arc::clone(&metadata));

    let tx = store.begin().await.unwrap();
    let scope = RequestScope::new(Principal::new("alice"), Arc::clone(&metadata), tx);

    // Skipping PRESECURITY is a violation.
    assert!(matches!(
        scope.run_queued_pre_flush_triggers(),
        Err(EngineError::PhaseOrderingViolation(_))
    ));

    scope.run_queued_pre_security_triggers().unwrap();
    scope.run_queued_pre_flush_triggers().unwrap();

    // Repeating a phase is a violation too.
    assert!(matches!(
        scope.run_queued_pre_flush_triggers(),
        Err(EngineError::PhaseOrderingViolation(_))
    ));

    scope.run_queued_pre_commit_triggers().unwrap();

    // POSTCOMMIT before the transaction committed is a violation.
    assert!(matches!(
        scope.run_queued_post_commit_triggers(),
        Err(EngineError::PhaseOrderingViolation(_))
    ));

    scope.mark_committed().unwrap();
    scope.run_queued_post_commit_triggers().unwrap();
    scope.close().await.unwrap();
}

#[tokio::test]
async fn test_generated_ids_persist_without_an_explicit_id() {
    let metadata = library_metadata();
    let store = InMemoryStore::new(Arc::clone(&metadata));
    let engine = Engine::new(Arc::clone(&metadata), store.clone());

    let id = engine
        .run(Principal::new("alice"), |scope| async move {
            let author = ManagedEntity::create(&scope, "author", None)?;
            author.update_attribute(&scope, "name", Value::Text("Anon".into()))?;
            Ok(author.key().id.clone())
        })
        .await
        .unwrap();

    let committed = store.committed("author", &id).await.unwrap();
    assert_eq!(committed.attribute("id"), Value::Text(id.clone()));
    assert_eq!(committed.attribute("name"), Value::Text("Anon".into()));
}
