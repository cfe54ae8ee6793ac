//! Dependency ordering of flush writes against an in-memory executor.

mod common;

use common::{MockExecutor, MockLoader, int, row, text};
use relmap::prelude::*;
use relmap::{LinkTableInfo, RelationshipKind, WriteKind, WritePhase};
use std::sync::Arc;

fn shop(items: RelationshipInfo) -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .entity(
                EntityMapper::new("Order", "orders")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(ColumnInfo::new("note"))
                    .relationship(items),
            )
            .entity(
                EntityMapper::new("Item", "items")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(ColumnInfo::new("order_id"))
                    .column(ColumnInfo::new("name"))
                    .relationship(RelationshipInfo::many_to_one("order", "Order")),
            )
            .build()
            .expect("valid registry"),
    )
}

fn order_items() -> RelationshipInfo {
    RelationshipInfo::one_to_many("items", "Item")
        .foreign_key("order_id", "id")
        .back_populates("order")
}

/// Users and posts referencing each other through two foreign keys.
fn blog(nullable: bool, post_update: bool) -> Arc<Registry> {
    let fk = |name: &str| ColumnInfo::new(name).nullable(nullable);
    Arc::new(
        Registry::builder()
            .entity(
                EntityMapper::new("User", "users")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(fk("favorite_post_id"))
                    .relationship(
                        RelationshipInfo::one_to_many("posts", "Post")
                            .foreign_key("author_id", "id")
                            .back_populates("author"),
                    )
                    .relationship(
                        RelationshipInfo::many_to_one("favorite", "Post")
                            .foreign_key("favorite_post_id", "id")
                            .post_update(post_update),
                    ),
            )
            .entity(
                EntityMapper::new("Post", "posts")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(fk("author_id"))
                    .relationship(RelationshipInfo::many_to_one("author", "User")),
            )
            .build()
            .expect("valid registry"),
    )
}

// ============================================================================
// Inserts
// ============================================================================

#[test]
fn parent_insert_precedes_child_and_binds_generated_key() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(shop(order_items().cascade("all, delete-orphan")), exec);

    let order = session.create("Order").unwrap();
    let item = session.create("Item").unwrap();
    item.set("name", "widget").unwrap();
    order.append("items", &item).unwrap();
    session.add(&order).unwrap();
    assert_eq!(item.status(), InstanceStatus::Pending);

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.total(), 2);

    let actions = log.actions();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].table, "orders");
    assert_eq!(actions[0].returning, vec!["id".to_string()]);
    assert_eq!(actions[1].table, "items");
    assert_eq!(actions[1].value("order_id"), Some(&int(1)));
    assert_eq!(actions[1].value("name"), Some(&text("widget")));

    assert_eq!(order.status(), InstanceStatus::Persistent);
    assert_eq!(item.status(), InstanceStatus::Persistent);
    assert_eq!(order.get("id").unwrap(), int(1));
    assert_eq!(item.get("order_id").unwrap(), int(1));
    assert!(!order.is_modified());
    assert!(!item.is_modified());
    assert!(session.new_objects().unwrap().is_empty());
    assert_eq!(
        session.identity_key(&item).map(|k| k.primary_key),
        Some(vec![int(1)])
    );
}

#[test]
fn child_added_first_still_inserts_after_parent() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(shop(order_items()), exec);

    let order = session.create("Order").unwrap();
    let item = session.create("Item").unwrap();
    item.set_related("order", Some(&order)).unwrap();
    // many-to-one cascades save-update by default
    session.add(&item).unwrap();
    assert_eq!(order.status(), InstanceStatus::Pending);
    assert_eq!(order.collection("items").unwrap(), vec![item.clone()]);

    session.flush().unwrap();
    let tables: Vec<String> = log.actions().into_iter().map(|a| a.table).collect();
    assert_eq!(tables, vec!["orders", "items"]);
    assert_eq!(item.get("order_id").unwrap(), order.get("id").unwrap());
}

#[test]
fn backref_cascade_into_persistent_parent_is_opt_in() {
    let order_row = row(&[("id", int(1)), ("note", text("first"))]);

    let (exec, _log) = MockExecutor::new();
    let session = Session::new(shop(order_items()), exec);
    let order = session.load("Order", &order_row, false).unwrap();
    let item = session.create("Item").unwrap();
    item.set_related("order", Some(&order)).unwrap();
    assert_eq!(item.status(), InstanceStatus::Transient);
    assert!(!session.contains(&item));
    assert!(session.new_objects().unwrap().is_empty());

    let (exec, log) = MockExecutor::new();
    let session = Session::builder(shop(order_items()))
        .config(SessionConfig::new().cascade_backrefs(true))
        .build(exec);
    let order = session.load("Order", &order_row, false).unwrap();
    let item = session.create("Item").unwrap();
    item.set_related("order", Some(&order)).unwrap();
    assert_eq!(item.status(), InstanceStatus::Pending);
    assert_eq!(session.new_objects().unwrap(), vec![item.clone()]);

    session.flush().unwrap();
    let actions = log.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].table, "items");
    assert!(actions[0].values.contains(&("order_id".to_string(), int(1))));
    assert_eq!(item.status(), InstanceStatus::Persistent);
}

#[test]
fn flush_with_nothing_pending_writes_nothing() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(shop(order_items()), exec);
    let result = session.flush().unwrap();
    assert_eq!(result.total(), 0);
    assert_eq!(log.len(), 0);
}

// ============================================================================
// Collections and orphans
// ============================================================================

#[test]
fn collection_replace_inserts_new_member_and_deletes_orphan() {
    let (exec, log) = MockExecutor::new();
    let (loader, rows) = MockLoader::new();
    rows.insert("Order", row(&[("id", int(1)), ("note", text("first"))]));
    rows.insert(
        "Item",
        row(&[("id", int(10)), ("order_id", int(1)), ("name", text("a"))]),
    );
    rows.insert(
        "Item",
        row(&[("id", int(11)), ("order_id", int(1)), ("name", text("b"))]),
    );
    let session = Session::builder(shop(order_items().cascade("all, delete-orphan")))
        .loader(loader)
        .build(exec);

    let order = session.get("Order", vec![int(1)]).unwrap().expect("order");
    let loaded = order.collection("items").unwrap();
    assert_eq!(loaded.len(), 2);
    let a = session.get("Item", vec![int(10)]).unwrap().expect("a");
    let b = session.get("Item", vec![int(11)]).unwrap().expect("b");
    assert!(loaded.contains(&a) && loaded.contains(&b));

    let c = session.create("Item").unwrap();
    c.set("name", "c").unwrap();
    order.replace("items", &[b.clone(), c.clone()]).unwrap();

    let history = order.history("items").unwrap();
    let related = history.as_related().expect("collection history");
    assert_eq!(related.added, vec![c.clone()]);
    assert_eq!(related.deleted, vec![a.clone()]);
    assert_eq!(related.unchanged, vec![b.clone()]);
    assert_eq!(c.status(), InstanceStatus::Pending);

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.updated, 0);

    let actions = log.actions();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[0].kind, WriteKind::Insert);
    assert_eq!(actions[0].value("order_id"), Some(&int(1)));
    assert_eq!(actions[1].kind, WriteKind::Delete);
    assert_eq!(actions[1].predicate_value("id"), Some(&int(10)));

    assert_eq!(a.status(), InstanceStatus::Detached);
    assert_eq!(b.status(), InstanceStatus::Persistent);
    assert_eq!(c.status(), InstanceStatus::Persistent);
    assert!(!order.history("items").unwrap().has_changes());
}

#[test]
fn pending_orphan_is_expunged_not_inserted() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(shop(order_items().cascade("all, delete-orphan")), exec);

    let order = session.create("Order").unwrap();
    let item = session.create("Item").unwrap();
    order.append("items", &item).unwrap();
    session.add(&order).unwrap();
    order.remove("items", &item).unwrap();

    session.flush().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log.actions()[0].table, "orders");
    assert_eq!(item.status(), InstanceStatus::Transient);
}

#[test]
fn deleting_parent_without_delete_cascade_nulls_children_first() {
    let (exec, log) = MockExecutor::new();
    let (loader, rows) = MockLoader::new();
    rows.insert("Order", row(&[("id", int(1))]));
    rows.insert("Item", row(&[("id", int(10)), ("order_id", int(1))]));
    rows.insert("Item", row(&[("id", int(11)), ("order_id", int(1))]));
    let session = Session::builder(shop(order_items()))
        .loader(loader)
        .build(exec);

    let order = session.get("Order", vec![int(1)]).unwrap().expect("order");
    let items = order.collection("items").unwrap();
    session.delete(&order).unwrap();

    let result = session.flush().unwrap();
    assert_eq!(result.updated, 2);
    assert_eq!(result.deleted, 1);

    let actions = log.actions();
    assert_eq!(actions.len(), 3);
    for update in &actions[..2] {
        assert_eq!(update.kind, WriteKind::Update);
        assert_eq!(update.values, vec![("order_id".to_string(), Value::Null)]);
    }
    assert_eq!(actions[2].kind, WriteKind::Delete);
    assert_eq!(actions[2].table, "orders");
    for item in &items {
        assert_eq!(item.get("order_id").unwrap(), Value::Null);
        assert_eq!(item.status(), InstanceStatus::Persistent);
    }
}

#[test]
fn delete_cascade_loads_children_and_deletes_them_first() {
    let (exec, log) = MockExecutor::new();
    let (loader, rows) = MockLoader::new();
    rows.insert("Order", row(&[("id", int(1))]));
    rows.insert("Item", row(&[("id", int(10)), ("order_id", int(1))]));
    rows.insert("Item", row(&[("id", int(11)), ("order_id", int(1))]));
    let session = Session::builder(shop(order_items().cascade("all")))
        .loader(loader)
        .build(exec);

    let order = session.get("Order", vec![int(1)]).unwrap().expect("order");
    session.delete(&order).unwrap();
    assert_eq!(rows.related_loads.get(), 1);
    assert_eq!(session.deleted_objects().unwrap().len(), 3);

    session.flush().unwrap();
    assert_eq!(
        log.rendered(),
        vec![
            "DELETE items WHERE id = 10",
            "DELETE items WHERE id = 11",
            "DELETE orders WHERE id = 1",
        ]
    );
}

#[test]
fn passive_deletes_leave_unloaded_children_to_the_database() {
    let (exec, log) = MockExecutor::new();
    let (loader, rows) = MockLoader::new();
    rows.insert("Order", row(&[("id", int(1))]));
    rows.insert("Item", row(&[("id", int(10)), ("order_id", int(1))]));
    let registry = shop(
        order_items()
            .cascade("all")
            .passive_deletes(PassiveDeletes::Passive),
    );
    let session = Session::builder(registry).loader(loader).build(exec);

    let order = session.get("Order", vec![int(1)]).unwrap().expect("order");
    session.delete(&order).unwrap();
    session.flush().unwrap();

    assert_eq!(rows.related_loads.get(), 0);
    assert_eq!(log.rendered(), vec!["DELETE orders WHERE id = 1"]);
}

// ============================================================================
// Cycles
// ============================================================================

#[test]
fn mutual_nullable_foreign_keys_use_one_post_update() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(blog(true, false), exec);

    let user = session.create("User").unwrap();
    let post = session.create("Post").unwrap();
    post.set_related("author", Some(&user)).unwrap();
    user.set_related("favorite", Some(&post)).unwrap();
    session.add(&user).unwrap();

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.post_updated, 1);

    let actions = log.actions();
    assert_eq!(actions.len(), 3);
    assert_eq!(actions[0].table, "users");
    assert_eq!(actions[0].value("favorite_post_id"), Some(&Value::Null));
    assert_eq!(actions[1].table, "posts");
    assert_eq!(actions[1].value("author_id"), Some(&int(1)));
    assert_eq!(actions[2].phase, WritePhase::PostUpdate);
    assert_eq!(actions[2].table, "users");
    assert_eq!(actions[2].value("favorite_post_id"), Some(&int(1)));
    assert_eq!(actions[2].predicate_value("id"), Some(&int(1)));

    assert_eq!(user.get("favorite_post_id").unwrap(), int(1));
    assert!(!user.is_modified());
}

#[test]
fn mutual_non_null_foreign_keys_are_unresolvable() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(blog(false, false), exec);

    let user = session.create("User").unwrap();
    let post = session.create("Post").unwrap();
    post.set_related("author", Some(&user)).unwrap();
    user.set_related("favorite", Some(&post)).unwrap();
    session.add(&user).unwrap();

    match session.flush() {
        Err(Error::UnresolvableCycle(cycle)) => {
            assert_eq!(cycle.entities, vec!["Post", "User"]);
            assert_eq!(
                cycle.columns,
                vec!["Post.author_id", "User.favorite_post_id"]
            );
        }
        other => panic!("expected an unresolvable cycle, got {other:?}"),
    }
    assert_eq!(log.len(), 0);
    assert!(session.is_active().unwrap());
    assert_eq!(user.status(), InstanceStatus::Pending);
}

#[test]
fn post_update_relationship_is_always_deferred() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(blog(true, true), exec);

    let user = session.create("User").unwrap();
    let post = session.create("Post").unwrap();
    user.set_related("favorite", Some(&post)).unwrap();
    session.add(&user).unwrap();

    let result = session.flush().unwrap();
    assert_eq!(result.post_updated, 1);
    let actions = log.actions();
    assert_eq!(actions.len(), 3);
    assert_eq!(actions[0].value("favorite_post_id"), Some(&Value::Null));
    assert_eq!(actions[2].phase, WritePhase::PostUpdate);
    assert_eq!(actions[2].value("favorite_post_id"), Some(&int(1)));
}

#[test]
fn mutual_delete_nulls_one_side_before_deleting() {
    let (exec, log) = MockExecutor::new();
    let (loader, rows) = MockLoader::new();
    rows.insert("User", row(&[("id", int(1)), ("favorite_post_id", int(2))]));
    rows.insert("Post", row(&[("id", int(2)), ("author_id", int(1))]));
    let session = Session::builder(blog(true, false))
        .loader(loader)
        .build(exec);

    let user = session.get("User", vec![int(1)]).unwrap().expect("user");
    let post = session.get("Post", vec![int(2)]).unwrap().expect("post");
    session.delete(&user).unwrap();
    session.delete(&post).unwrap();

    let result = session.flush().unwrap();
    assert_eq!(result.deleted, 2);
    assert_eq!(result.post_updated, 1);
    let actions = log.actions();
    assert_eq!(actions.len(), 3);
    assert_eq!(actions[0].phase, WritePhase::PreDelete);
    assert_eq!(actions[0].to_string(), "UPDATE users (favorite_post_id) WHERE id = 1");
    assert_eq!(actions[1].to_string(), "DELETE posts WHERE id = 2");
    assert_eq!(actions[2].to_string(), "DELETE users WHERE id = 1");
}

// ============================================================================
// Many-to-many
// ============================================================================

fn tagging() -> Arc<Registry> {
    Arc::new(
        Registry::builder()
            .entity(
                EntityMapper::new("Post", "posts")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .relationship(
                        RelationshipInfo::many_to_many(
                            "tags",
                            "Tag",
                            LinkTableInfo::new("post_tags", "post_id", "tag_id"),
                        )
                        .back_populates("posts"),
                    ),
            )
            .entity(
                EntityMapper::new("Tag", "tags")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .relationship(RelationshipInfo::new(
                        "posts",
                        "Post",
                        RelationshipKind::ManyToMany,
                    )),
            )
            .build()
            .expect("valid registry"),
    )
}

#[test]
fn many_to_many_link_rows_follow_both_endpoints() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(tagging(), exec);

    let post = session.create("Post").unwrap();
    let tag = session.create("Tag").unwrap();
    post.append("tags", &tag).unwrap();
    assert_eq!(tag.collection("posts").unwrap(), vec![post.clone()]);
    session.add(&post).unwrap();

    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.links, 1);

    let actions = log.actions();
    assert_eq!(actions.len(), 3);
    assert_eq!(actions[2].phase, WritePhase::LinkTable);
    assert_eq!(actions[2].table, "post_tags");
    assert_eq!(actions[2].value("post_id"), Some(&int(1)));
    assert_eq!(actions[2].value("tag_id"), Some(&int(1)));

    post.remove("tags", &tag).unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.links, 1);
    assert_eq!(log.len(), 4);
    let unlink = &log.actions()[3];
    assert_eq!(unlink.kind, WriteKind::Delete);
    assert_eq!(unlink.predicate_value("post_id"), Some(&int(1)));
    assert_eq!(unlink.predicate_value("tag_id"), Some(&int(1)));
}

// ============================================================================
// Plans
// ============================================================================

#[test]
fn plan_flush_describes_without_executing() {
    let (exec, log) = MockExecutor::new();
    let session = Session::new(shop(order_items()), exec);

    let order = session.create("Order").unwrap();
    order.set("note", "n").unwrap();
    let item = session.create("Item").unwrap();
    order.append("items", &item).unwrap();
    session.add(&order).unwrap();

    let plan = session.plan_flush().unwrap();
    assert_eq!(plan.len(), 2);
    let steps = plan.describe();
    assert_eq!(steps[0].table, "orders");
    assert_eq!(steps[1].table, "items");

    let json: serde_json::Value = serde_json::from_str(&plan.to_json().unwrap()).unwrap();
    let values = json[1]["values"].as_array().expect("values array");
    let bound = values
        .iter()
        .find(|pair| pair[0] == "order_id")
        .and_then(|pair| pair[1].as_str())
        .expect("order_id placeholder");
    assert!(bound.starts_with(":Order#"), "{bound}");
    assert_eq!(json[0]["values"][0][1], "'n'");

    assert_eq!(log.len(), 0);
    assert_eq!(order.status(), InstanceStatus::Pending);
}
