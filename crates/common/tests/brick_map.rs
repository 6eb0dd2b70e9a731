//! Integration tests for the brick map algebra: replay, diff, merge and
//! conflict detection

mod common;

use ::common::brick_map::{
    BrickMap, BrickMapDiff, BrickMapError, ConflictType, NodeKind, OpType, PathTree,
};
use common::link;

/// Drive the same writes through any path tree
fn scripted_writes(tree: &mut dyn PathTree) -> Result<(), BrickMapError> {
    tree.create_folder("/docs/drafts")?;
    tree.add_file_entry("/docs/readme.md", vec![link("r1")])?;
    tree.append_bricks_to_file("/docs/readme.md", vec![link("r2")])?;
    tree.add_file_entry("/docs/drafts/plan.txt", vec![link("p1")])?;
    tree.copy("/docs/drafts", "/archive/drafts")?;
    tree.delete("/docs/drafts/plan.txt")?;
    tree.create_file("/empty")?;
    tree.add_file_entry("/docs/readme.md", vec![link("r3")])?;
    tree.empty_list("/archive/drafts/plan.txt")?;
    // kinds may change once the old node is deleted
    tree.create_folder("/swap/inner")?;
    tree.delete("/swap")?;
    tree.add_file_entry("/swap", vec![link("s")])?;
    tree.add_file_entry("/flip", vec![link("f")])?;
    tree.delete("/flip")?;
    tree.create_folder("/flip/child")?;
    Ok(())
}

#[test]
fn test_diff_replay_matches_direct_writes() {
    let mut direct = BrickMap::new();
    scripted_writes(&mut direct).unwrap();

    let mut diff = BrickMapDiff::default();
    scripted_writes(&mut diff).unwrap();
    let mut replayed = BrickMap::new();
    replayed.apply_diff(&diff).unwrap();

    assert!(direct.same_structure(&replayed));
    assert_eq!(replayed.get_hash_links("/docs/readme.md").unwrap(), &[link("r3")]);
    assert!(!replayed.exists("/docs/drafts/plan.txt"));
    assert!(replayed.exists("/archive/drafts/plan.txt"));
    assert!(replayed.is_empty("/archive/drafts/plan.txt").unwrap());
    assert_eq!(replayed.kind("/swap"), Some(NodeKind::File));
    assert_eq!(replayed.get_hash_links("/swap").unwrap(), &[link("s")]);
    assert_eq!(replayed.kind("/flip/child"), Some(NodeKind::Directory));
}

#[test]
fn test_replay_survives_serialization() {
    let mut diff = BrickMapDiff::default();
    scripted_writes(&mut diff).unwrap();
    let decoded = BrickMapDiff::from_bytes(&diff.to_bytes().unwrap()).unwrap();

    let mut a = BrickMap::new();
    a.apply_diff(&diff).unwrap();
    let mut b = BrickMap::new();
    b.apply_diff(&decoded).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_add_file_entry_is_truncate_then_append() {
    let mut replaced = BrickMap::new();
    replaced.add_file_entry("/f", vec![link("old")]).unwrap();
    replaced.add_file_entry("/f", vec![link("x"), link("y")]).unwrap();

    let mut manual = BrickMap::new();
    manual.add_file_entry("/f", vec![link("old")]).unwrap();
    manual.empty_list("/f").unwrap();
    manual
        .append_bricks_to_file("/f", vec![link("x"), link("y")])
        .unwrap();

    assert!(replaced.same_structure(&manual));
    assert_eq!(replaced.get_hash_links("/f").unwrap(), &[link("x"), link("y")]);
}

#[test]
fn test_merge_of_diff_converges() {
    let mut a = BrickMap::new();
    a.add_file_entry("/keep", vec![link("k")]).unwrap();
    a.add_file_entry("/dir/old", vec![link("o")]).unwrap();
    a.add_file_entry("/dir/gone", vec![link("g")]).unwrap();

    let mut b = a.clone();
    b.add_file_entry("/dir/old", vec![link("new")]).unwrap();
    b.add_file_entry("/dir/sub/added", vec![link("a")]).unwrap();
    b.delete("/dir/gone").unwrap();

    let changes = a.diff(&b);
    assert!(changes.get_hash_links("/keep").is_err());

    let mut merged = a.clone();
    merged.merge(&changes);
    assert!(merged.same_structure(&b));

    // merging the same change-set again changes nothing
    merged.merge(&changes);
    assert!(merged.same_structure(&b));
}

#[test]
fn test_merge_disjoint_changes_in_either_order() {
    let base = BrickMap::new();
    let mut left = base.clone();
    left.add_file_entry("/left", vec![link("l")]).unwrap();
    let mut right = base.clone();
    right.add_file_entry("/right", vec![link("r")]).unwrap();

    let mut one = base.clone();
    one.merge(&base.diff(&left));
    one.merge(&base.diff(&right));
    let mut two = base.clone();
    two.merge(&base.diff(&right));
    two.merge(&base.diff(&left));

    assert!(one.same_structure(&two));
    assert!(one.exists("/left") && one.exists("/right"));
}

#[test]
fn test_local_delete_conflicts_only_when_remote_has_path() {
    let mut remote = BrickMap::new();
    remote.add_file_entry("/present", vec![link("p")]).unwrap();

    let mut local = BrickMapDiff::default();
    local.delete("/present").unwrap();
    local.delete("/absent").unwrap();

    let conflicts = remote.detect_merge_conflicts(&[local]).unwrap();
    assert_eq!(conflicts.len(), 1);
    let info = &conflicts["/present"];
    assert_eq!(info.conflict_type, ConflictType::LocalDelete);
    assert_eq!(info.op, OpType::Delete);
}

#[test]
fn test_conflict_kinds() {
    let mut remote = BrickMap::new();
    remote.add_file_entry("/taken", vec![link("t")]).unwrap();

    let mut local = BrickMapDiff::default();
    local.create_file("/taken").unwrap();
    local.copy("/vanished", "/fresh").unwrap();

    let conflicts = remote.detect_merge_conflicts(&[local]).unwrap();
    assert_eq!(conflicts["/taken"].conflict_type, ConflictType::LocalOverwrite);
    assert_eq!(conflicts["/vanished"].conflict_type, ConflictType::RemoteDelete);
    assert!(!conflicts.contains_key("/fresh"));

    let mut harmless = BrickMapDiff::default();
    harmless.create_folder("/new").unwrap();
    assert!(remote.detect_merge_conflicts(&[harmless]).is_none());
}

#[test]
fn test_failed_writes_leave_no_trace() {
    let mut tree = BrickMap::new();
    tree.add_file_entry("/file", vec![link("f")]).unwrap();
    let before = tree.clone();

    assert!(matches!(
        tree.create_folder("/file/sub"),
        Err(BrickMapError::NotADirectory(_))
    ));
    assert!(matches!(tree.delete("/missing"), Err(BrickMapError::InvalidPath(_))));
    assert!(matches!(
        tree.copy("/missing", "/elsewhere"),
        Err(BrickMapError::InvalidPath(_))
    ));
    assert_eq!(tree, before);
}
