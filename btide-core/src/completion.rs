//! Completion queries: which chunks of the target file are already correct,
//! and the smallest set of tree hashes that covers exactly those chunks.
//!
//! Hashing reads the file; every other query here is a pure tree walk.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::integrity;
use crate::manifest::Manifest;
use crate::merkle::{MerkleNode, MerkleTree, NodeKind};

/// Chunks whose bytes on disk match their expected hash, keyed by chunk index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedChunks(BTreeMap<usize, String>);

impl CompletedChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize, hash: String) {
        self.0.insert(index, hash);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(chunk index, hash)` in chunk order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().map(|(i, h)| (*i, h.as_str()))
    }

    /// Completed chunk hashes in chunk order.
    pub fn hashes(&self) -> Vec<String> {
        self.0.values().cloned().collect()
    }

    /// True if every chunk of `manifest` is complete.
    pub fn covers(&self, manifest: &Manifest) -> bool {
        (0..manifest.chunks().len()).all(|i| self.contains(i))
    }
}

impl FromIterator<(usize, String)> for CompletedChunks {
    fn from_iter<I: IntoIterator<Item = (usize, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Hash each chunk's byte range from `reader` and compare with the manifest.
/// A chunk whose range cannot be read in full is logged and counted incomplete.
pub fn completed_chunks<R: Read + Seek>(manifest: &Manifest, reader: &mut R) -> CompletedChunks {
    let mut done = CompletedChunks::new();
    let mut buf = Vec::new();
    for (index, chunk) in manifest.chunks().iter().enumerate() {
        buf.resize(chunk.size as usize, 0);
        let read = reader
            .seek(SeekFrom::Start(u64::from(chunk.offset)))
            .and_then(|_| reader.read_exact(&mut buf));
        if let Err(e) = read {
            tracing::warn!(
                ident = manifest.ident(),
                chunk = index,
                offset = chunk.offset,
                size = chunk.size,
                error = %e,
                "chunk unreadable, treating as incomplete"
            );
            continue;
        }
        if integrity::verify_chunk(&buf, &chunk.hash) {
            done.insert(index, chunk.hash.clone());
        }
    }
    done
}

/// Open `path` and scan it with [`completed_chunks`].
pub fn scan_file(manifest: &Manifest, path: &Path) -> std::io::Result<CompletedChunks> {
    let mut file = File::open(path)?;
    Ok(completed_chunks(manifest, &mut file))
}

/// Smallest set of hashes whose leaf ranges are entirely complete and which
/// together represent every complete chunk exactly once. Left before right.
pub fn minimum_covering_hashes(tree: &MerkleTree, completed: &CompletedChunks) -> Vec<String> {
    cover(tree.root(), completed)
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn cover<'a>(node: &'a MerkleNode, completed: &CompletedChunks) -> Vec<&'a str> {
    match node.kind() {
        NodeKind::Leaf { chunk } => {
            if completed.contains(*chunk) {
                vec![node.hash()]
            } else {
                Vec::new()
            }
        }
        NodeKind::Internal { left, right } => {
            let mut l = cover(left, completed);
            let r = cover(right, completed);
            if is_whole(&l, left) && is_whole(&r, right) {
                return vec![node.hash()];
            }
            l.extend(r);
            l
        }
    }
}

fn is_whole(contributed: &[&str], node: &MerkleNode) -> bool {
    matches!(contributed, [only] if *only == node.hash())
}

/// Every hash in the tree, in order: left subtree, node, right subtree.
pub fn all_hashes(tree: &MerkleTree) -> Vec<String> {
    tree.nodes_in_order()
        .into_iter()
        .map(|n| n.hash().to_string())
        .collect()
}

/// Leaf hashes under the node whose hash is `hash`; empty if no node matches.
pub fn chunk_hashes_under(tree: &MerkleTree, hash: &str) -> Vec<String> {
    tree.find_node(hash)
        .map(|node| node.leaf_hashes().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::integrity::hash_hex;
    use crate::manifest::tests::descriptor;

    const DATA: [&str; 4] = ["aaaa", "bbbb", "cccc", "dddd"];

    fn fixture() -> (Manifest, MerkleTree) {
        let m = Manifest::parse(&descriptor("pkg", "f.bin", &DATA)).unwrap();
        let t = MerkleTree::from_manifest(&m);
        (m, t)
    }

    fn file_with(correct: &[usize]) -> Cursor<Vec<u8>> {
        let mut bytes = vec![0u8; 16];
        for &i in correct {
            bytes[i * 4..i * 4 + 4].copy_from_slice(DATA[i].as_bytes());
        }
        Cursor::new(bytes)
    }

    #[test]
    fn zero_filled_file_has_nothing_complete() {
        let (m, t) = fixture();
        let done = completed_chunks(&m, &mut file_with(&[]));
        assert!(done.is_empty());
        assert!(minimum_covering_hashes(&t, &done).is_empty());
    }

    #[test]
    fn full_file_collapses_to_root() {
        let (m, t) = fixture();
        let done = completed_chunks(&m, &mut file_with(&[0, 1, 2, 3]));
        assert_eq!(done.len(), 4);
        assert!(done.covers(&m));
        assert_eq!(minimum_covering_hashes(&t, &done), vec![t.root().hash()]);
    }

    #[test]
    fn left_half_complete() {
        let (m, t) = fixture();
        let (left, right) = t.root().children().unwrap();
        let done = completed_chunks(&m, &mut file_with(&[0, 1]));
        assert_eq!(minimum_covering_hashes(&t, &done), vec![left.hash()]);

        let done = completed_chunks(&m, &mut file_with(&[0, 1, 3]));
        let (_, last) = right.children().unwrap();
        assert_eq!(
            minimum_covering_hashes(&t, &done),
            vec![left.hash(), last.hash()]
        );
    }

    #[test]
    fn isolated_chunks_are_listed_individually() {
        let (m, t) = fixture();
        let done = completed_chunks(&m, &mut file_with(&[1, 2]));
        assert_eq!(
            minimum_covering_hashes(&t, &done),
            vec![hash_hex(b"bbbb"), hash_hex(b"cccc")]
        );
        assert_eq!(done.hashes(), vec![hash_hex(b"bbbb"), hash_hex(b"cccc")]);
    }

    #[test]
    fn uneven_tree_cover() {
        let data = ["a", "b", "c", "d", "e"];
        let m = Manifest::parse(&descriptor("p", "f", &data)).unwrap();
        let t = MerkleTree::from_manifest(&m);
        // left = [a, b, c] (itself [a, b] + [c]), right = [d, e]
        let (left, right) = t.root().children().unwrap();
        let (ab, _) = left.children().unwrap();
        let done: CompletedChunks = [0, 1, 3, 4]
            .into_iter()
            .map(|i| (i, hash_hex(data[i].as_bytes())))
            .collect();
        assert_eq!(
            minimum_covering_hashes(&t, &done),
            vec![ab.hash(), right.hash()]
        );
    }

    #[test]
    fn short_file_marks_tail_incomplete() {
        let (m, _) = fixture();
        let mut short = Cursor::new(b"aaaabbbbcc".to_vec());
        let done = completed_chunks(&m, &mut short);
        assert!(done.contains(0));
        assert!(done.contains(1));
        assert!(!done.contains(2));
        assert!(!done.contains(3));
    }

    #[test]
    fn all_hashes_in_order() {
        let (_, t) = fixture();
        let all = all_hashes(&t);
        assert_eq!(all.len(), 7);
        assert_eq!(all[3], t.root().hash());
        assert_eq!(all[0], hash_hex(b"aaaa"));
        assert_eq!(all[6], hash_hex(b"dddd"));
    }

    #[test]
    fn chunk_hashes_under_ancestor() {
        let (_, t) = fixture();
        let (_, right) = t.root().children().unwrap();
        assert_eq!(
            chunk_hashes_under(&t, right.hash()),
            vec![hash_hex(b"cccc"), hash_hex(b"dddd")]
        );
        assert_eq!(chunk_hashes_under(&t, t.root().hash()).len(), 4);
        assert_eq!(
            chunk_hashes_under(&t, &hash_hex(b"aaaa")),
            vec![hash_hex(b"aaaa")]
        );
        assert!(chunk_hashes_under(&t, &hash_hex(b"zzz")).is_empty());
    }

    #[test]
    fn scan_file_on_disk() {
        let (m, _) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, file_with(&[2]).into_inner()).unwrap();
        let done = scan_file(&m, &path).unwrap();
        let expected = hash_hex(b"cccc");
        assert_eq!(done.iter().collect::<Vec<_>>(), vec![(2, expected.as_str())]);
        assert!(scan_file(&m, &dir.path().join("missing")).is_err());
    }
}
