use placetree_core::db::open_db_in_memory;
use placetree_core::{
    ClassificationNode, ClassificationRepoError, ClassificationRepository, NewNode, NewPlace,
    NodeContent, NodeId, NodeUpdate, PlaceService, SqliteClassificationRepository,
    SqlitePlaceRepository, TreeError, TreeService, ValidationError,
};
use rusqlite::{params, Connection};
use uuid::Uuid;

type Tree<'conn> =
    TreeService<SqliteClassificationRepository<'conn>, PlaceService<SqlitePlaceRepository<'conn>>>;

fn tree_service(conn: &Connection) -> Tree<'_> {
    let places = PlaceService::new(SqlitePlaceRepository::try_new(conn).unwrap());
    let repo = SqliteClassificationRepository::try_new(conn).unwrap();
    TreeService::new(repo, places)
}

fn seed(tree: &Tree<'_>) {
    let places = tree.places();
    places.create_place_type("nation", "Nation", None).unwrap();
    places.create_place_type("region", "Region", None).unwrap();
    places
        .create_place_type("municipality", "Municipality", None)
        .unwrap();
    for (slug, name, kind) in [
        ("italia-nation", "Italia", "nation"),
        ("lazio", "Lazio", "region"),
        ("lombardia", "Lombardia", "region"),
        ("roma", "Roma", "municipality"),
        ("milano", "Milano", "municipality"),
    ] {
        places.create_place(NewPlace::new(slug, name, kind)).unwrap();
    }
    for (slug, label) in [
        ("root", "Root"),
        ("istat-reg", "ISTAT regions"),
        ("istat-prov", "ISTAT provinces"),
    ] {
        tree.create_tag(slug, label, None).unwrap();
    }
}

fn setup(conn: &Connection) -> Tree<'_> {
    let tree = tree_service(conn);
    seed(&tree);
    tree
}

fn direct(tree: &Tree<'_>, tag: &str, place: &str) -> ClassificationNode {
    tree.create_node(NewNode::direct(tag, place)).unwrap()
}

fn ids(nodes: &[ClassificationNode]) -> Vec<NodeId> {
    nodes.iter().map(|node| node.node_uuid).collect()
}

#[test]
fn created_node_is_reachable_from_its_root() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    let italia = direct(&tree, "istat-reg", "italia-nation");
    let lazio = tree
        .create_node(NewNode::direct("istat-reg", "lazio").under(italia.node_uuid))
        .unwrap();
    let roma = tree
        .create_node(NewNode::direct("istat-reg", "roma").under(lazio.node_uuid))
        .unwrap();

    let ancestors = tree.get_ancestors(roma.node_uuid).unwrap();
    assert_eq!(ids(&ancestors), vec![italia.node_uuid, lazio.node_uuid]);
    let root = tree.get_root("istat-reg").unwrap().unwrap();
    assert_eq!(root.node_uuid, italia.node_uuid);
    assert_eq!(
        tree.node_path(roma.node_uuid).unwrap(),
        vec!["italia-nation", "lazio", "roma"]
    );
}

#[test]
fn siblings_with_same_start_date_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = direct(&tree, "istat-reg", "italia-nation");

    tree.create_node(
        NewNode::direct("istat-reg", "lazio")
            .under(italia.node_uuid)
            .starting("1970"),
    )
    .unwrap();
    let err = tree
        .create_node(
            NewNode::direct("istat-reg", "lombardia")
                .under(italia.node_uuid)
                .starting("1970"),
        )
        .unwrap_err();
    match err {
        TreeError::DuplicateSibling {
            tag,
            parent_uuid,
            start_date,
        } => {
            assert_eq!(tag, "istat-reg");
            assert_eq!(parent_uuid, Some(italia.node_uuid));
            assert_eq!(start_date, "1970");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Same date under another parent, or a different date, is allowed.
    tree.create_node(
        NewNode::direct("istat-reg", "lombardia")
            .under(italia.node_uuid)
            .starting("1971"),
    )
    .unwrap();
    tree.create_node(NewNode::direct("root", "italia-nation").starting("1970"))
        .unwrap();
}

#[test]
fn roots_with_same_start_date_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    tree.create_node(NewNode::direct("root", "italia-nation").starting("1861"))
        .unwrap();
    let err = tree
        .create_node(NewNode::direct("root", "lazio").starting("1861"))
        .unwrap_err();
    assert!(matches!(
        err,
        TreeError::DuplicateSibling {
            parent_uuid: None,
            ..
        }
    ));
}

#[test]
fn moving_a_node_onto_a_taken_start_date_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = direct(&tree, "istat-reg", "italia-nation");
    tree.create_node(
        NewNode::direct("istat-reg", "lazio")
            .under(italia.node_uuid)
            .starting("1970"),
    )
    .unwrap();
    let lombardia = tree
        .create_node(NewNode::direct("istat-reg", "lombardia").starting("1970"))
        .unwrap();

    let err = tree
        .update_node(
            lombardia.node_uuid,
            NodeUpdate {
                parent_uuid: Some(Some(italia.node_uuid)),
                ..NodeUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, TreeError::DuplicateSibling { .. }));
}

#[test]
fn node_write_checks() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia_root = direct(&tree, "root", "italia-nation");
    let italia_reg = direct(&tree, "istat-reg", "italia-nation");

    assert!(matches!(
        tree.create_node(NewNode::direct("istat-reg", "italia-nation"))
            .unwrap_err(),
        TreeError::DuplicatePlaceInTag { .. }
    ));
    assert!(matches!(
        tree.create_node(NewNode::direct("istat-reg", "lazio").under(italia_root.node_uuid))
            .unwrap_err(),
        TreeError::ParentTagMismatch { parent_tag, .. } if parent_tag == "root"
    ));
    assert!(matches!(
        tree.create_node(NewNode::direct("istat-reg", "lazio").under(Uuid::new_v4()))
            .unwrap_err(),
        TreeError::ParentNotFound(_)
    ));
    assert!(matches!(
        tree.create_node(NewNode::alias("istat-reg", italia_reg.node_uuid))
            .unwrap_err(),
        TreeError::AliasSameTag { .. }
    ));
    assert!(matches!(
        tree.create_node(NewNode::alias("istat-reg", Uuid::new_v4()))
            .unwrap_err(),
        TreeError::AliasTargetNotFound(_)
    ));
    assert!(matches!(
        tree.create_node(NewNode::direct("istat-reg", "atlantis"))
            .unwrap_err(),
        TreeError::PlaceNotFound(slug) if slug == "atlantis"
    ));
    assert!(matches!(
        tree.create_node(NewNode::direct("istat-cities", "roma"))
            .unwrap_err(),
        TreeError::UnknownTag(_)
    ));

    let mut reversed = NewNode::direct("istat-reg", "lazio").starting("2000");
    reversed.end_date = Some("1999-12-31".to_string());
    assert!(matches!(
        tree.create_node(reversed).unwrap_err(),
        TreeError::Invalid(ValidationError::EndBeforeStart { .. })
    ));
}

#[test]
fn reparenting_under_a_descendant_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = direct(&tree, "istat-reg", "italia-nation");
    let lazio = tree
        .create_node(NewNode::direct("istat-reg", "lazio").under(italia.node_uuid))
        .unwrap();
    let roma = tree
        .create_node(NewNode::direct("istat-reg", "roma").under(lazio.node_uuid))
        .unwrap();

    for new_parent in [roma.node_uuid, italia.node_uuid] {
        let err = tree
            .update_node(
                italia.node_uuid,
                NodeUpdate {
                    parent_uuid: Some(Some(new_parent)),
                    ..NodeUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, TreeError::CycleDetected { .. }));
    }

    // Detaching to a root is always allowed.
    let moved = tree
        .update_node(
            roma.node_uuid,
            NodeUpdate {
                parent_uuid: Some(None),
                ..NodeUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(moved.parent_uuid, None);
    assert_eq!(tree.get_roots("istat-reg").unwrap().len(), 2);
}

#[test]
fn children_follow_priority_then_insertion_order() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = direct(&tree, "istat-reg", "italia-nation");
    let lazio = tree
        .create_node(NewNode::direct("istat-reg", "lazio").under(italia.node_uuid))
        .unwrap();
    let lombardia = tree
        .create_node(NewNode::direct("istat-reg", "lombardia").under(italia.node_uuid))
        .unwrap();
    let roma = tree
        .create_node(
            NewNode::direct("istat-reg", "roma")
                .under(italia.node_uuid)
                .with_priority(-1),
        )
        .unwrap();
    let milano = tree
        .create_node(NewNode::direct("istat-reg", "milano").under(lombardia.node_uuid))
        .unwrap();

    let children = tree.get_children(italia.node_uuid).unwrap();
    assert_eq!(
        ids(&children),
        vec![roma.node_uuid, lazio.node_uuid, lombardia.node_uuid]
    );

    let descendants = tree.get_descendants(italia.node_uuid).unwrap();
    assert_eq!(
        ids(&descendants),
        vec![
            roma.node_uuid,
            lazio.node_uuid,
            lombardia.node_uuid,
            milano.node_uuid
        ]
    );
}

#[test]
fn used_trees_follow_alias_targets() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia_root = direct(&tree, "root", "italia-nation");
    let lazio_prov = direct(&tree, "istat-prov", "lazio");

    assert!(tree.used_trees("istat-reg").unwrap().is_empty());

    let alias = tree
        .create_node(NewNode::alias("istat-reg", italia_root.node_uuid))
        .unwrap();
    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["root"]);

    tree.create_node(NewNode::alias("istat-reg", lazio_prov.node_uuid))
        .unwrap();
    assert_eq!(
        tree.used_trees("istat-reg").unwrap(),
        vec!["istat-prov", "root"]
    );

    // Re-pointing the first alias drops `root` once nothing else uses it.
    let milano_prov = direct(&tree, "istat-prov", "milano");
    tree.update_node(
        alias.node_uuid,
        NodeUpdate {
            content: Some(NodeContent::Alias(milano_prov.node_uuid)),
            ..NodeUpdate::default()
        },
    )
    .unwrap();
    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["istat-prov"]);

    // Turning an alias into a direct node does not clear a tag still in use.
    tree.update_node(
        alias.node_uuid,
        NodeUpdate {
            content: Some(NodeContent::Direct("italia-nation".to_string())),
            ..NodeUpdate::default()
        },
    )
    .unwrap();
    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["istat-prov"]);

    // Other tags are untouched.
    assert!(tree.used_trees("root").unwrap().is_empty());
    assert!(tree.used_trees("istat-prov").unwrap().is_empty());
}

#[test]
fn maintenance_repairs_drift_and_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia_root = direct(&tree, "root", "italia-nation");
    tree.create_node(NewNode::alias("istat-reg", italia_root.node_uuid))
        .unwrap();

    conn.execute_batch(
        "DELETE FROM classification_used_trees WHERE tag_slug = 'istat-reg';
         INSERT INTO classification_used_trees (tag_slug, used_tag_slug)
         VALUES ('istat-reg', 'istat-prov');",
    )
    .unwrap();

    let repaired = tree.maintain_used_trees("istat-reg").unwrap();
    assert_eq!(repaired.added, vec!["root"]);
    assert_eq!(repaired.removed, vec!["istat-prov"]);
    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["root"]);

    let second = tree.maintain_used_trees("istat-reg").unwrap();
    assert!(second.is_noop());
    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["root"]);

    assert!(matches!(
        tree.maintain_used_trees("istat-cities").unwrap_err(),
        TreeError::UnknownTag(_)
    ));
}

#[test]
fn reference_place_follows_alias_chain() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let c = direct(&tree, "root", "italia-nation");
    let b = tree.create_node(NewNode::alias("istat-prov", c.node_uuid)).unwrap();
    let a = tree.create_node(NewNode::alias("istat-reg", b.node_uuid)).unwrap();

    assert_eq!(tree.reference_place(a.node_uuid).unwrap().slug, "italia-nation");
    assert_eq!(tree.reference_place(b.node_uuid).unwrap().slug, "italia-nation");
    assert_eq!(tree.reference_place(c.node_uuid).unwrap().name, "Italia");
    assert!(matches!(
        tree.reference_place(Uuid::new_v4()).unwrap_err(),
        TreeError::NodeNotFound(_)
    ));
}

#[test]
fn reference_place_reports_alias_ending_nowhere() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    // Storage allows a node with neither a place nor an alias target.
    let empty = Uuid::new_v4();
    conn.execute(
        "INSERT INTO classification_nodes (node_uuid, tag_slug, sort_order)
         VALUES (?1, 'root', 0);",
        params![empty.to_string()],
    )
    .unwrap();
    let alias = tree.create_node(NewNode::alias("istat-reg", empty)).unwrap();

    match tree.reference_place(alias.node_uuid).unwrap_err() {
        TreeError::UnresolvedAlias(node) => assert_eq!(node, empty),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        tree.get_node(empty).unwrap_err(),
        TreeError::Repo(ClassificationRepoError::InvalidData(_))
    ));
}

#[test]
fn alias_cycles_are_rejected_on_write_and_detected_on_read() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let b = direct(&tree, "root", "italia-nation");
    let a = tree.create_node(NewNode::alias("istat-reg", b.node_uuid)).unwrap();

    let err = tree
        .update_node(
            b.node_uuid,
            NodeUpdate {
                content: Some(NodeContent::Alias(a.node_uuid)),
                ..NodeUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, TreeError::CyclicAlias(node) if node == b.node_uuid));

    conn.execute(
        "UPDATE classification_nodes
         SET place_slug = NULL, equivalent_to_uuid = ?1
         WHERE node_uuid = ?2;",
        params![a.node_uuid.to_string(), b.node_uuid.to_string()],
    )
    .unwrap();
    match tree.reference_place(a.node_uuid).unwrap_err() {
        TreeError::CyclicAlias(node) => assert_eq!(node, a.node_uuid),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn resolve_falls_back_through_used_trees() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let n1 = direct(&tree, "root", "italia-nation");
    let lazio_root = tree
        .create_node(NewNode::direct("root", "lazio").under(n1.node_uuid))
        .unwrap();

    let n2 = tree.create_node(NewNode::alias("istat-reg", n1.node_uuid)).unwrap();
    tree.create_node(NewNode::alias("istat-reg", lazio_root.node_uuid).under(n2.node_uuid))
        .unwrap();

    assert_eq!(tree.used_trees("istat-reg").unwrap(), vec!["root"]);
    let resolved = tree.resolve("italia-nation", "istat-reg").unwrap();
    assert_eq!(ids(&resolved), vec![n2.node_uuid]);
    assert_eq!(
        tree.resolve_one("italia-nation", "istat-reg").unwrap().node_uuid,
        n2.node_uuid
    );

    // No direct node and no alias standing for the place.
    assert!(tree.resolve("milano", "istat-reg").unwrap().is_empty());
    assert!(matches!(
        tree.resolve_one("milano", "istat-reg").unwrap_err(),
        TreeError::AmbiguousResolution { count: 0, .. }
    ));
}

#[test]
fn resolve_returns_every_alias_across_used_trees() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let in_root = direct(&tree, "root", "italia-nation");
    let in_prov = direct(&tree, "istat-prov", "italia-nation");
    let via_root = tree
        .create_node(NewNode::alias("istat-reg", in_root.node_uuid))
        .unwrap();
    let via_prov = tree
        .create_node(NewNode::alias("istat-reg", in_prov.node_uuid))
        .unwrap();

    assert_eq!(
        tree.used_trees("istat-reg").unwrap(),
        vec!["istat-prov", "root"]
    );
    let resolved = tree.resolve("italia-nation", "istat-reg").unwrap();
    assert_eq!(ids(&resolved), vec![via_root.node_uuid, via_prov.node_uuid]);
    // Same order on a second call.
    let again = tree.resolve("italia-nation", "istat-reg").unwrap();
    assert_eq!(ids(&again), ids(&resolved));

    match tree.resolve_one("italia-nation", "istat-reg").unwrap_err() {
        TreeError::AmbiguousResolution {
            place_slug,
            tag,
            count,
        } => {
            assert_eq!(place_slug, "italia-nation");
            assert_eq!(tag, "istat-reg");
            assert_eq!(count, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn repository_rejects_cycles_inside_its_write_transaction() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = direct(&tree, "istat-reg", "italia-nation");
    let lazio = tree
        .create_node(NewNode::direct("istat-reg", "lazio").under(italia.node_uuid))
        .unwrap();
    let b = direct(&tree, "root", "italia-nation");
    let a = tree.create_node(NewNode::alias("istat-reg", b.node_uuid)).unwrap();

    // Writes straight to the repository skip the service checks.
    let repo = SqliteClassificationRepository::try_new(&conn).unwrap();
    let err = repo
        .update_node(
            italia.node_uuid,
            &NodeUpdate {
                parent_uuid: Some(Some(lazio.node_uuid)),
                ..NodeUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ClassificationRepoError::ParentCycle { node_uuid, parent_uuid }
            if node_uuid == italia.node_uuid && parent_uuid == lazio.node_uuid
    ));

    let err = repo
        .update_node(
            b.node_uuid,
            &NodeUpdate {
                content: Some(NodeContent::Alias(a.node_uuid)),
                ..NodeUpdate::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ClassificationRepoError::AliasCycle(node) if node == b.node_uuid));

    // Nothing changed.
    assert_eq!(tree.get_node(italia.node_uuid).unwrap().parent_uuid, None);
    assert_eq!(
        tree.get_node(b.node_uuid).unwrap().content,
        NodeContent::Direct("italia-nation".to_string())
    );
}

#[test]
fn resolve_prefers_direct_nodes() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let n1 = direct(&tree, "root", "italia-nation");
    let alias = tree.create_node(NewNode::alias("istat-reg", n1.node_uuid)).unwrap();
    let own = tree
        .create_node(NewNode::direct("istat-reg", "italia-nation").under(alias.node_uuid))
        .unwrap();

    let resolved = tree.resolve("italia-nation", "istat-reg").unwrap();
    assert_eq!(ids(&resolved), vec![own.node_uuid]);
}

#[test]
fn resolve_reports_unknown_tag_and_place() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    assert!(matches!(
        tree.resolve("italia-nation", "nonexistent-slug").unwrap_err(),
        TreeError::UnknownTag(slug) if slug == "nonexistent-slug"
    ));
    assert!(matches!(
        tree.resolve("atlantis", "istat-reg").unwrap_err(),
        TreeError::PlaceNotFound(_)
    ));
}

#[test]
fn tags_are_unique_and_listed() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    assert!(matches!(
        tree.create_tag("root", "Root again", None).unwrap_err(),
        TreeError::DuplicateTag(_)
    ));
    let slugs: Vec<String> = tree
        .list_tags()
        .unwrap()
        .into_iter()
        .map(|tag| tag.slug)
        .collect();
    assert_eq!(slugs, vec!["istat-prov", "istat-reg", "root"]);
}
