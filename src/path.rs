//! Path Resolver (C4, spec.md §4.4): reconstructs the full visible path of
//! an inode by walking `parent_inode` pointers up to the root, so it can be
//! stamped into the chunked object's `filename` field on `create` and
//! `rename`.

use crate::backend::{Error, MetadataStore, Result};
use crate::inode::{id_filter, EntryDoc, Inode, ROOT_INODE};

/// Walks `entry`'s ancestry up to the root, prepending each leaf name, and
/// joins the result with `/`, producing an absolute path (e.g. `/d/file`).
/// `entry` itself is assumed to already be resident; its ancestors are
/// fetched one at a time. Root's own name never appears as a path segment.
pub async fn full_path<M: MetadataStore>(metadata: &M, entry: &EntryDoc) -> Result<Vec<u8>> {
    let mut segments: Vec<Vec<u8>> = Vec::new();

    let mut current_inode = entry.inode;
    let mut current_name = entry.filename.bytes.clone();
    let mut current_parent = entry.parent_inode;

    while current_inode != ROOT_INODE {
        segments.push(current_name);
        let parent = fetch(metadata, current_parent).await?;
        current_inode = parent.inode;
        current_name = parent.filename.bytes.clone();
        current_parent = parent.parent_inode;
    }

    segments.reverse();
    let mut full = vec![b'/'];
    full.extend(segments.join(&b'/'));
    Ok(full)
}

async fn fetch<M: MetadataStore>(metadata: &M, inode: Inode) -> Result<EntryDoc> {
    let doc = metadata
        .find_one(id_filter(inode))
        .await?
        .ok_or_else(|| Error::Storage(format!("no metadata document for inode {inode}")))?;
    EntryDoc::from_document(doc)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::backend::memory::MemoryMetadataStore;
    use crate::backend::MetadataStore;
    use crate::inode::EntryDoc;

    use super::full_path;

    /// Builds a chain of nested directories `root -> a -> b -> ... ` and a
    /// trailing leaf named `leaf`, one inode per segment, then resolves the
    /// leaf's full path.
    async fn chain_path(segments: &[&str]) -> Vec<u8> {
        let metadata = MemoryMetadataStore::default();
        let root = EntryDoc::new_root(0, 0, 0);
        metadata.insert_one(root.to_document().unwrap()).await.unwrap();

        let mut parent = crate::inode::ROOT_INODE;
        let mut leaf = root;
        for (i, name) in segments.iter().enumerate() {
            let inode = (i as i64) + 2;
            let mode = if i + 1 == segments.len() { libc::S_IFREG } else { libc::S_IFDIR } | 0o755;
            leaf = EntryDoc::new_child(inode, parent, name.as_bytes().to_vec(), mode, 0, 0, 0);
            metadata.insert_one(leaf.to_document().unwrap()).await.unwrap();
            parent = inode;
        }

        full_path(&metadata, &leaf).await.unwrap()
    }

    #[rstest]
    #[case(&["leaf"], "/leaf")]
    #[case(&["a", "leaf"], "/a/leaf")]
    #[case(&["a", "b", "leaf"], "/a/b/leaf")]
    #[case(&["a", "b", "c", "d", "leaf"], "/a/b/c/d/leaf")]
    #[tokio::test]
    async fn resolves_nested_paths(#[case] segments: &[&str], #[case] expected: &str) {
        let resolved = chain_path(segments).await;
        assert_eq!(resolved, expected.as_bytes());
    }
}
