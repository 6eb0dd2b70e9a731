use std::collections::btree_map;

use super::node::Node;

/// Lazy pre-order traversal over the live nodes below a directory
///
/// Yields `(relative_path, node)` pairs. Paths are relative to the directory
/// the walk started from and use `/` as separator. The walker holds an
/// explicit stack of child iterators, so cloning it before consuming gives a
/// restartable traversal.
#[derive(Debug, Clone)]
pub struct Walk<'a> {
    stack: Vec<(String, btree_map::Iter<'a, String, Node>)>,
    recursive: bool,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(items: &'a btree_map::BTreeMap<String, Node>, recursive: bool) -> Self {
        Self {
            stack: vec![(String::new(), items.iter())],
            recursive,
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            stack: Vec::new(),
            recursive: false,
        }
    }

    /// Only the files, by relative path
    pub fn files(self) -> impl Iterator<Item = String> + 'a {
        self.filter(|(_, node)| node.is_file()).map(|(path, _)| path)
    }

    /// Only the directories, by relative path
    pub fn folders(self) -> impl Iterator<Item = String> + 'a {
        self.filter(|(_, node)| node.is_dir()).map(|(path, _)| path)
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = (String, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, iter) = self.stack.last_mut()?;
            let Some((name, node)) = iter.next() else {
                self.stack.pop();
                continue;
            };
            if node.is_deleted() {
                continue;
            }
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            if self.recursive {
                if let Node::Directory(dir) = node {
                    self.stack.push((path.clone(), dir.items.iter()));
                }
            }
            return Some((path, node));
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::brick_map::node::DirectoryNode;

    fn sample() -> BTreeMap<String, Node> {
        let now = Utc::now();
        let mut sub = DirectoryNode::new(now);
        sub.items.insert("inner.txt".into(), Node::new_file(now));
        let mut gone = Node::new_file(now);
        gone.tombstone(now);

        let mut items = BTreeMap::new();
        items.insert("a.txt".into(), Node::new_file(now));
        items.insert("gone.txt".into(), gone);
        items.insert("sub".into(), Node::Directory(sub));
        items
    }

    #[test]
    fn test_walk_recursive_skips_tombstones() {
        let items = sample();
        let paths: Vec<_> = Walk::new(&items, true).map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/inner.txt"]);
    }

    #[test]
    fn test_walk_shallow() {
        let items = sample();
        let files: Vec<_> = Walk::new(&items, false).files().collect();
        assert_eq!(files, vec!["a.txt"]);
    }

    #[test]
    fn test_walk_restartable() {
        let items = sample();
        let walk = Walk::new(&items, true);
        let first: Vec<_> = walk.clone().files().collect();
        let second: Vec<_> = walk.files().collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["a.txt", "sub/inner.txt"]);
    }
}
