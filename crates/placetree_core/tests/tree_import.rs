use placetree_core::db::open_db_in_memory;
use placetree_core::{
    import_tree, ImportError, ImportRequest, NewNode, NewPlace, NodeContent, PlaceService,
    SqliteClassificationRepository, SqlitePlaceRepository, TreeEntry, TreeError, TreeService,
};
use rusqlite::Connection;
use serde_json::json;

type Tree<'conn> =
    TreeService<SqliteClassificationRepository<'conn>, PlaceService<SqlitePlaceRepository<'conn>>>;

fn setup(conn: &Connection) -> Tree<'_> {
    let places = PlaceService::new(SqlitePlaceRepository::try_new(conn).unwrap());
    places.create_place_type("area", "Area", None).unwrap();
    for slug in [
        "italia-nation",
        "nord-macroregion",
        "centro-macroregion",
        "piemonte-region",
        "lombardia-region",
        "lazio-region",
        "torino-province",
        "milano-province",
        "roma-province",
    ] {
        places.create_place(NewPlace::new(slug, slug, "area")).unwrap();
    }
    let tree = TreeService::new(SqliteClassificationRepository::try_new(conn).unwrap(), places);
    tree.create_tag("root", "Root", None).unwrap();
    tree.create_tag("istat-reg", "ISTAT regions", None).unwrap();
    tree
}

fn entries(value: serde_json::Value) -> Vec<TreeEntry> {
    serde_json::from_value(value).unwrap()
}

fn italy_description() -> Vec<TreeEntry> {
    entries(json!([
        { "italia-nation": [
            { "nord-macroregion": [
                { "piemonte-region": ["torino-province"] },
                { "lombardia-region": ["milano-province"] }
            ]},
            { "centro-macroregion": [
                "lazio-region>istat-reg"
            ]}
        ]}
    ]))
}

#[test]
fn import_builds_nested_tree_with_alias_leaf() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let lazio = tree
        .create_node(NewNode::direct("istat-reg", "lazio-region"))
        .unwrap();

    let description = italy_description();
    let report = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: false,
        },
    )
    .unwrap();
    assert_eq!(report.nodes, 8);
    assert_eq!(report.aliases, 1);
    assert_eq!(report.max_depth, 4);
    assert!(!report.dry_run);

    let torino = tree.find_direct_node("torino-province", "root").unwrap().unwrap();
    let chain: Vec<String> = tree
        .get_ancestors(torino.node_uuid)
        .unwrap()
        .iter()
        .map(|node| node.content.place_slug().unwrap().to_string())
        .collect();
    assert_eq!(
        chain,
        vec!["italia-nation", "nord-macroregion", "piemonte-region"]
    );
    assert_eq!(
        tree.node_path(torino.node_uuid).unwrap(),
        vec![
            "italia-nation",
            "nord-macroregion",
            "piemonte-region",
            "torino-province"
        ]
    );

    let centro = tree
        .find_direct_node("centro-macroregion", "root")
        .unwrap()
        .unwrap();
    let children = tree.get_children(centro.node_uuid).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].content, NodeContent::Alias(lazio.node_uuid));
    assert_eq!(tree.used_trees("root").unwrap(), vec!["istat-reg"]);

    // Description order is kept among siblings.
    let nord = tree.find_direct_node("nord-macroregion", "root").unwrap().unwrap();
    let regions: Vec<String> = tree
        .get_children(nord.node_uuid)
        .unwrap()
        .into_iter()
        .filter_map(|node| node.content.place_slug().map(str::to_string))
        .collect();
    assert_eq!(regions, vec!["piemonte-region", "lombardia-region"]);
}

#[test]
fn import_under_existing_place() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let italia = tree
        .create_node(NewNode::direct("root", "italia-nation"))
        .unwrap();

    let description = entries(json!([
        { "lazio-region": ["roma-province"] },
        { "piemonte-region": null }
    ]));
    let report = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: Some("italia-nation"),
            entries: &description,
            dry_run: false,
        },
    )
    .unwrap();
    assert_eq!(report.nodes, 3);
    assert_eq!(report.max_depth, 2);
    assert_eq!(tree.get_descendants(italia.node_uuid).unwrap().len(), 3);

    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: Some("milano-province"),
            entries: &description,
            dry_run: false,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImportError::AnchorNotFound { .. }));
}

#[test]
fn dry_run_validates_without_writing() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    tree.create_node(NewNode::direct("istat-reg", "lazio-region"))
        .unwrap();

    let description = italy_description();
    let report = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: true,
        },
    )
    .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.nodes, 8);
    assert!(tree.get_roots("root").unwrap().is_empty());
    assert!(tree.used_trees("root").unwrap().is_empty());
}

#[test]
fn dry_run_reports_missing_references() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    // No node for lazio-region in istat-reg yet.
    let description = italy_description();
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: true,
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ImportError::AliasTargetMissing { ref place_slug, .. } if place_slug == "lazio-region"
    ));

    let unknown = entries(json!(["atlantis"]));
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &unknown,
            dry_run: true,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImportError::Tree(TreeError::PlaceNotFound(_))));
}

#[test]
fn malformed_descriptions_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    for description in [
        json!([{ "italia-nation": [], "nord-macroregion": [] }]),
        json!([{ "lazio-region>istat-reg": ["roma-province"] }]),
        json!(["lazio-region>"]),
    ] {
        let description = entries(description);
        let err = import_tree(
            &tree,
            &ImportRequest {
                tag: "root",
                under_place: None,
                entries: &description,
                dry_run: false,
            },
        )
        .unwrap_err();
        assert!(
            matches!(err, ImportError::InvalidTreeEntry(_)),
            "unexpected error: {err}"
        );
    }
    assert!(tree.get_roots("root").unwrap().is_empty());

    let description = entries(json!(["italia-nation"]));
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "istat-prov",
            under_place: None,
            entries: &description,
            dry_run: false,
        },
    )
    .unwrap_err();
    assert!(matches!(err, ImportError::Tree(TreeError::UnknownTag(_))));
}

fn duplicate_lazio() -> Vec<TreeEntry> {
    entries(json!([{ "italia-nation": ["lazio-region", "lazio-region"] }]))
}

#[test]
fn dry_run_reports_place_repeated_in_description() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    let description = duplicate_lazio();
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: true,
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ImportError::Tree(TreeError::DuplicatePlaceInTag { ref place_slug, ref tag })
            if place_slug == "lazio-region" && tag == "root"
    ));
}

#[test]
fn dry_run_reports_place_already_in_tag() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    tree.create_node(NewNode::direct("root", "piemonte-region"))
        .unwrap();

    let description = entries(json!([{ "italia-nation": ["piemonte-region"] }]));
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: true,
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ImportError::Tree(TreeError::DuplicatePlaceInTag { ref place_slug, .. })
            if place_slug == "piemonte-region"
    ));
    assert_eq!(tree.get_roots("root").unwrap().len(), 1);
}

#[test]
fn failed_import_writes_nothing_and_retry_succeeds() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);

    let description = duplicate_lazio();
    let err = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &description,
            dry_run: false,
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ImportError::Tree(TreeError::DuplicatePlaceInTag { .. })
    ));
    assert!(tree.get_roots("root").unwrap().is_empty());
    assert!(tree
        .find_direct_node("italia-nation", "root")
        .unwrap()
        .is_none());

    let corrected = entries(json!([{ "italia-nation": ["lazio-region"] }]));
    let report = import_tree(
        &tree,
        &ImportRequest {
            tag: "root",
            under_place: None,
            entries: &corrected,
            dry_run: false,
        },
    )
    .unwrap();
    assert_eq!(report.nodes, 2);
    let roots = tree.get_roots("root").unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(tree.get_children(roots[0].node_uuid).unwrap().len(), 1);
}

#[test]
fn failed_batch_rolls_back_earlier_nodes() {
    let conn = open_db_in_memory().unwrap();
    let tree = setup(&conn);
    let existing = tree
        .create_node(NewNode::direct("root", "lazio-region"))
        .unwrap();

    let italia = uuid::Uuid::new_v4();
    let err = tree
        .create_nodes(vec![
            NewNode::direct("root", "italia-nation").with_id(italia),
            NewNode::direct("root", "nord-macroregion").under(italia),
            NewNode::direct("root", "lazio-region").under(italia),
        ])
        .unwrap_err();
    assert!(matches!(err, TreeError::DuplicatePlaceInTag { .. }));

    let roots = tree.get_roots("root").unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].node_uuid, existing.node_uuid);
    assert!(tree
        .find_direct_node("nord-macroregion", "root")
        .unwrap()
        .is_none());

    let created = tree
        .create_nodes(vec![
            NewNode::direct("root", "italia-nation").with_id(italia),
            NewNode::direct("root", "nord-macroregion").under(italia),
        ])
        .unwrap();
    assert_eq!(created[0].node_uuid, italia);
    assert_eq!(created[1].parent_uuid, Some(italia));
}
