//! The in-memory entry tree built by the scanner.
//!
//! Entries live in an arena indexed by [`EntryId`]; parents own their
//! children through the child list, the parent link is a plain back-index.
//! The tree only exists between scanning and metadata assembly.

use std::path::{Path, PathBuf};

use crate::os::EntryStat;

/// Index of an entry in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) u32);

/// Inode number placeholder before assignment.
pub(crate) const NO_INODE: u32 = u32::MAX;

/// Per-kind payload of an entry.
#[derive(Debug)]
pub enum EntryData {
    Directory {
        children: Vec<EntryId>,
    },
    File {
        /// Index of the file group this entry belongs to, assigned by the
        /// file scanner. Hardlinked entries share a group.
        group: u32,
    },
    Symlink {
        target: String,
    },
    /// Block or character device.
    Device,
    /// Pipe or socket.
    Ipc,
}

/// One node of the tree.
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub stat: EntryStat,
    pub parent: Option<EntryId>,
    pub data: EntryData,
    /// The assigned image inode number, [`NO_INODE`] until numbering.
    pub inode: u32,
}

/// The entry arena.
#[derive(Debug, Default)]
pub struct EntryArena {
    entries: Vec<Entry>,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        name: String,
        stat: EntryStat,
        parent: Option<EntryId>,
        data: EntryData,
    ) -> EntryId {
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(Entry {
            name,
            stat,
            parent,
            data,
            inode: NO_INODE,
        });
        if let Some(parent) = parent {
            match &mut self[parent].data {
                EntryData::Directory { children } => children.push(id),
                _ => unreachable!("parent is always a directory"),
            }
        }
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a child of `dir` by name. Linear; only used in path-list mode.
    pub fn find_child(&self, dir: EntryId, name: &str) -> Option<EntryId> {
        match &self[dir].data {
            EntryData::Directory { children } => children
                .iter()
                .copied()
                .find(|&c| self[c].name == name),
            _ => None,
        }
    }

    /// The path of an entry relative to the scan root, `/`-separated, empty
    /// for the root.
    pub fn rel_path(&self, id: EntryId) -> String {
        let mut components = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let ent = &self[c];
            if ent.parent.is_some() {
                components.push(ent.name.as_str());
            }
            cur = ent.parent;
        }
        components.reverse();
        components.join("/")
    }

    /// The on-disk path of an entry under the scan root.
    pub fn full_path(&self, root: &Path, id: EntryId) -> PathBuf {
        root.join(self.rel_path(id))
    }

    /// Sort every directory's children byte-wise by name.
    pub fn sort_children(&mut self) {
        for i in 0..self.entries.len() {
            if let EntryData::Directory { children } = &mut self.entries[i].data {
                let mut children = std::mem::take(children);
                children.sort_by(|&a, &b| {
                    Ord::cmp(
                        self.entries[a.0 as usize].name.as_bytes(),
                        self.entries[b.0 as usize].name.as_bytes(),
                    )
                });
                match &mut self.entries[i].data {
                    EntryData::Directory { children: slot } => *slot = children,
                    _ => unreachable!(),
                }
            }
        }
    }

    /// All entries reachable from `root` in depth-first preorder, parents
    /// before children, children in list order.
    pub fn preorder(&self, root: EntryId) -> Vec<EntryId> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let EntryData::Directory { children } = &self[id].data {
                // Reversed so the leftmost child is visited first.
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// Detach directories that are empty, repeatedly, so directories whose
    /// only content was empty directories go too. The root always stays.
    pub fn remove_empty_dirs(&mut self) {
        loop {
            let empty: Vec<EntryId> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, ent)| match &ent.data {
                    EntryData::Directory { children }
                        if children.is_empty() && ent.parent.is_some() =>
                    {
                        Some(EntryId(i as u32))
                    }
                    _ => None,
                })
                .collect();
            if empty.is_empty() {
                return;
            }
            for id in empty {
                let parent = self[id].parent.take().expect("checked non-root");
                if let EntryData::Directory { children } = &mut self[parent].data {
                    children.retain(|&c| c != id);
                }
            }
        }
    }
}

impl std::ops::Index<EntryId> for EntryArena {
    type Output = Entry;

    fn index(&self, id: EntryId) -> &Entry {
        &self.entries[id.0 as usize]
    }
}

impl std::ops::IndexMut<EntryId> for EntryArena {
    fn index_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{EntryStat, FileKind};

    fn stat(kind: FileKind) -> EntryStat {
        EntryStat {
            kind,
            size: 0,
            mode_bits: 0o755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: 0,
            dev: 1,
            ino: 1,
        }
    }

    #[test]
    fn remove_empty_dirs_recurses() {
        let mut arena = EntryArena::new();
        let dir = |arena: &mut EntryArena, name: &str, parent| {
            arena.push(
                name.into(),
                stat(FileKind::Directory),
                parent,
                EntryData::Directory { children: vec![] },
            )
        };
        let root = dir(&mut arena, "", None);
        let a = dir(&mut arena, "a", Some(root));
        let b = dir(&mut arena, "b", Some(a));
        let _c = dir(&mut arena, "c", Some(b));
        let d = dir(&mut arena, "d", Some(root));
        arena.push(
            "f".into(),
            stat(FileKind::File),
            Some(d),
            EntryData::File { group: 0 },
        );

        arena.remove_empty_dirs();
        let order = arena.preorder(root);
        let names: Vec<&str> = order.iter().map(|&id| arena[id].name.as_str()).collect();
        assert_eq!(names, ["", "d", "f"]);
    }

    #[test]
    fn preorder_follows_sorted_children() {
        let mut arena = EntryArena::new();
        let root = arena.push(
            String::new(),
            stat(FileKind::Directory),
            None,
            EntryData::Directory { children: vec![] },
        );
        for name in ["zeta", "alpha", "mid"] {
            arena.push(
                name.into(),
                stat(FileKind::File),
                Some(root),
                EntryData::File { group: 0 },
            );
        }
        arena.sort_children();
        let names: Vec<&str> = arena
            .preorder(root)
            .iter()
            .map(|&id| arena[id].name.as_str())
            .collect();
        assert_eq!(names, ["", "alpha", "mid", "zeta"]);
    }
}
