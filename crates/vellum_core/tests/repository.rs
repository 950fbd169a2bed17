//! End-to-end repository scenarios across sessions.

use proptest::prelude::*;
use vellum_core::{DeltaLong, StoreError, Value};
use vellum_testkit::{tree_shape, TestRepository};

#[test]
fn cross_session_coherence_through_invalidations() {
    let repo = TestRepository::new();
    let mut s1 = repo.session();
    let mut s2 = repo.session();

    // S1 creates and commits a document
    s1.begin().unwrap();
    let root = s1.create_root("root").unwrap();
    let doc = s1.create_node(&root, "doc", "file").unwrap();
    s1.set_simple(&doc, "dc:title", Value::from("first")).unwrap();
    s1.commit().unwrap();

    // S2 reads it in its own transaction
    s2.begin().unwrap();
    let seen = s2.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(
        s2.simple_value(&seen, "dc:title").unwrap(),
        Value::from("first")
    );
    s2.commit().unwrap();

    // S1 modifies and commits
    s1.begin().unwrap();
    let doc1 = s1.node_by_id(doc.id()).unwrap().unwrap();
    s1.set_simple(&doc1, "dc:title", Value::from("second")).unwrap();
    s1.commit().unwrap();

    // after S2's next transaction boundary the write is visible
    s2.begin().unwrap();
    let seen = s2.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(
        s2.simple_value(&seen, "dc:title").unwrap(),
        Value::from("second")
    );
}

#[test]
fn shared_cache_sessions_stay_coherent_too() {
    let repo = TestRepository::new();
    let mut s1 = repo.shared_session();
    let mut s2 = repo.shared_session();

    s1.begin().unwrap();
    let root = s1.create_root("root").unwrap();
    let doc = s1.create_node(&root, "doc", "file").unwrap();
    s1.set_simple(&doc, "dc:title", Value::from("v1")).unwrap();
    s1.commit().unwrap();

    s2.begin().unwrap();
    let seen = s2.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(s2.simple_value(&seen, "dc:title").unwrap(), Value::from("v1"));
    s2.commit().unwrap();

    s1.begin().unwrap();
    let doc1 = s1.node_by_id(doc.id()).unwrap().unwrap();
    s1.set_simple(&doc1, "dc:title", Value::from("v2")).unwrap();
    s1.commit().unwrap();

    s2.begin().unwrap();
    let seen = s2.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(s2.simple_value(&seen, "dc:title").unwrap(), Value::from("v2"));
}

#[test]
fn counter_deltas_combine_and_apply() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let doc = session.create_node(&root, "doc", "file").unwrap();
    session
        .set_simple(&doc, "dublincore:counter", Value::Long(10))
        .unwrap();
    session.save().unwrap();

    // two deltas on the same key combine into one
    session
        .set_simple(&doc, "dublincore:counter", Value::Delta(DeltaLong::new(10, 3)))
        .unwrap();
    session
        .set_simple(&doc, "dublincore:counter", Value::Delta(DeltaLong::new(13, 4)))
        .unwrap();
    // read-your-own-writes: the combined delta is visible before save
    assert_eq!(
        session
            .simple_value(&doc, "dublincore:counter")
            .unwrap()
            .as_long(),
        Some(17)
    );
    session.save().unwrap();

    // a fresh session sees the applied value
    let mut other = repo.raw_session();
    let seen = other.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(
        other.simple_value(&seen, "dublincore:counter").unwrap(),
        Value::Long(17)
    );
}

#[test]
fn selection_completeness_is_monotonic() {
    let repo = TestRepository::new();
    let mut writer = repo.raw_session();

    let root = writer.create_root("root").unwrap();
    let folder = writer.create_node(&root, "folder", "folder").unwrap();
    for name in ["a", "b", "c"] {
        writer.create_node(&folder, name, "file").unwrap();
    }
    writer.save().unwrap();

    // a fresh session has no cached selection: the first listing
    // queries once
    let mut reader = repo.raw_session();
    let folder_seen = reader.node_by_id(folder.id()).unwrap().unwrap();
    let before = repo.memory.selection_read_count();
    let first = reader.children(&folder_seen, false).unwrap();
    assert_eq!(first.len(), 3);
    let after_first = repo.memory.selection_read_count();
    assert!(after_first > before);

    // repeated listings answer from the cache, no further queries
    for _ in 0..3 {
        let again = reader.children(&folder_seen, false).unwrap();
        assert_eq!(again.len(), 3);
    }
    assert_eq!(repo.memory.selection_read_count(), after_first);
}

#[test]
fn order_before_renumbers_densely() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let folder = session.create_node(&root, "folder", "folder").unwrap();
    let a = session.create_node(&folder, "a", "file").unwrap();
    let b = session.create_node(&folder, "b", "file").unwrap();
    session.save().unwrap();

    session.order_before(&folder, b.id(), Some(a.id())).unwrap();
    let children = session.children(&folder, false).unwrap();
    let names: Vec<String> = children.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["b", "a"]);

    // positions stay a dense 0..n sequence
    let positions: Vec<Option<i64>> = children.iter().map(|c| c.pos()).collect();
    assert_eq!(positions, vec![Some(0), Some(1)]);

    // move to the end
    session.order_before(&folder, b.id(), None).unwrap();
    let names: Vec<String> = session
        .children(&folder, false)
        .unwrap()
        .iter()
        .map(|c| c.name())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn order_before_on_unorderable_parent_is_a_noop() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    // "file" has no orderable facet
    let root = session.create_root("root").unwrap();
    let parent = session.create_node(&root, "parent", "file").unwrap();
    let a = session.create_node(&parent, "a", "note").unwrap();
    let b = session.create_node(&parent, "b", "note").unwrap();
    session.save().unwrap();

    session.order_before(&parent, b.id(), Some(a.id())).unwrap();
    // children keep null positions: nothing was renumbered
    for child in session.children(&parent, false).unwrap() {
        assert_eq!(child.pos(), None);
    }
}

#[test]
fn version_series_invariant_holds() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let doc = session.create_node(&root, "doc", "file").unwrap();
    session
        .set_simple(&doc, "hierarchy:majorversion", Value::Long(1))
        .unwrap();
    session
        .set_simple(&doc, "hierarchy:minorversion", Value::Long(0))
        .unwrap();
    session.save().unwrap();

    // three checkins: 1.0 (major), 1.1, 1.2
    let v1 = session.check_in(&doc, None, Some("first")).unwrap();
    session.check_out(&doc).unwrap();
    session
        .set_simple(&doc, "hierarchy:minorversion", Value::Long(1))
        .unwrap();
    let v2 = session.check_in(&doc, None, None).unwrap();
    session.check_out(&doc).unwrap();
    session
        .set_simple(&doc, "hierarchy:minorversion", Value::Long(2))
        .unwrap();
    let v3 = session.check_in(&doc, None, None).unwrap();
    session.save().unwrap();

    let version_ids = session.version_ids(doc.id()).unwrap();
    assert_eq!(version_ids, vec![v1.id(), v2.id(), v3.id()]);

    // exactly one latest, and the major 1.0 is the latest major
    let mut latest = Vec::new();
    let mut latest_major = Vec::new();
    for vid in &version_ids {
        let version = session.node_by_id(*vid).unwrap().unwrap();
        if session
            .simple_value(&version, "versions:islatest")
            .unwrap()
            .is_true()
        {
            latest.push(*vid);
        }
        if session
            .simple_value(&version, "versions:islatestmajor")
            .unwrap()
            .is_true()
        {
            latest_major.push(*vid);
        }
    }
    assert_eq!(latest, vec![v3.id()]);
    assert_eq!(latest_major, vec![v1.id()]);
}

#[test]
fn restore_version_brings_back_old_values() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let doc = session.create_node(&root, "doc", "file").unwrap();
    session
        .set_simple(&doc, "hierarchy:majorversion", Value::Long(1))
        .unwrap();
    session
        .set_simple(&doc, "hierarchy:minorversion", Value::Long(0))
        .unwrap();
    session.save().unwrap();
    let version = session.check_in(&doc, Some("v1"), None).unwrap();
    session.check_out(&doc).unwrap();
    session
        .set_simple(&doc, "hierarchy:minorversion", Value::Long(5))
        .unwrap();
    session.save().unwrap();

    session.restore_version(&doc, &version).unwrap();
    session.save().unwrap();

    let restored = session.node_by_id(doc.id()).unwrap().unwrap();
    assert_eq!(
        session
            .simple_value(&restored, "hierarchy:minorversion")
            .unwrap(),
        Value::Long(0)
    );
    assert!(restored.is_checked_in());
    assert!(!restored.is_version());
    // identity and placement survived the restore
    assert_eq!(restored.name(), "doc");
    assert_eq!(restored.parent_id(), Some(root.id()));
}

#[test]
fn proxies_resolve_by_series_and_target() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let doc = session.create_node(&root, "doc", "file").unwrap();
    session.save().unwrap();
    let version = session.check_in(&doc, None, None).unwrap();

    let proxy = session
        .create_proxy(&root, "proxy", doc.id(), version.id())
        .unwrap();
    session.save().unwrap();

    assert!(proxy.is_proxy());
    let by_series = session.context().get_series_proxy_ids(doc.id()).unwrap();
    assert_eq!(by_series, vec![proxy.id()]);
    let by_target = session.context().get_target_proxy_ids(version.id()).unwrap();
    assert_eq!(by_target, vec![proxy.id()]);
}

#[test]
fn copy_is_deep_and_keeps_the_original() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let src = session.create_node(&root, "src", "folder").unwrap();
    let child = session.create_node(&src, "child", "file").unwrap();
    session
        .set_simple(&child, "dc:title", Value::from("inner"))
        .unwrap();
    let dest = session.create_node(&root, "dest", "folder").unwrap();
    session.save().unwrap();

    let copy = session.copy_node(&src, &dest, "copied").unwrap();
    assert_ne!(copy.id(), src.id());

    let copied_children = session.children(&copy, false).unwrap();
    assert_eq!(copied_children.len(), 1);
    assert_eq!(copied_children[0].name(), "child");
    assert_eq!(
        session
            .simple_value(&copied_children[0], "dc:title")
            .unwrap(),
        Value::from("inner")
    );
    // the original is untouched
    assert!(session.node_by_id(child.id()).unwrap().is_some());
}

#[test]
fn move_rejects_name_conflicts() {
    let repo = TestRepository::new();
    let mut session = repo.session();

    let root = session.create_root("root").unwrap();
    let a = session.create_node(&root, "a", "folder").unwrap();
    let b = session.create_node(&root, "b", "folder").unwrap();
    let doc = session.create_node(&a, "doc", "file").unwrap();
    session.create_node(&b, "doc", "file").unwrap();
    session.save().unwrap();

    let result = session.move_node(&doc, &b, "doc");
    assert!(matches!(result, Err(StoreError::DocumentExists { .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Removal is not recursive over cached pristine descendants;
    /// every descendant must still read as deleted afterwards,
    /// whatever the tree shape.
    #[test]
    fn removal_orphans_are_always_detected(shape in tree_shape(10)) {
        let repo = TestRepository::new();
        let mut session = repo.session();

        let root = session.create_root("root").unwrap();
        let top = session.create_node(&root, "top", "folder").unwrap();
        let mut nodes = vec![top.clone()];
        for (i, parent_index) in shape.iter().enumerate() {
            let parent = nodes[*parent_index].clone();
            let node = session
                .create_node(&parent, &format!("n{i}"), "folder")
                .unwrap();
            nodes.push(node);
        }
        session.save().unwrap();

        // touch every node so its hierarchy fragment is cached
        for node in &nodes {
            session.node_by_id(node.id()).unwrap().unwrap();
        }

        session.remove_node(&top).unwrap();
        for node in &nodes {
            prop_assert!(session.node_by_id(node.id()).unwrap().is_none());
        }
        // the root is untouched
        prop_assert!(session.node_by_id(root.id()).unwrap().is_some());
    }
}
