//! The mounted tree is fixed at mount time — `/image`, `/stats/<name>`,
//! `/streams/<name>` — so inodes are assigned statically instead of through
//! the refcounted lookup table a real filesystem-in-FUSE needs (cf.
//! `pbs-pxar-fuse`'s `Lookup`/`LookupRef`, which exists because pxar entries
//! come and go as the archive is walked; ours never do).

use proxmox_fuse::ROOT_ID;

pub const IMAGE_INO: u64 = 2;
pub const STATS_DIR_INO: u64 = 3;
pub const STREAMS_DIR_INO: u64 = 4;
const STAT_INO_BASE: u64 = 100;
const STREAM_INO_BASE: u64 = 200;

pub const STAT_NAMES: &[&str] = &["chunk_reads", "chunk_writes", "data_bytes_read", "data_bytes_written"];
pub const STREAM_NAMES: &[&str] =
    &["chunks_accessed", "chunks_modified", "chunks_base", "chunks_overlay"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Root,
    Image,
    StatsDir,
    StreamsDir,
    Stat(usize),
    Stream(usize),
}

pub fn node_for_inode(inode: u64) -> Option<Node> {
    match inode {
        ROOT_ID => Some(Node::Root),
        IMAGE_INO => Some(Node::Image),
        STATS_DIR_INO => Some(Node::StatsDir),
        STREAMS_DIR_INO => Some(Node::StreamsDir),
        i if (STAT_INO_BASE..STAT_INO_BASE + STAT_NAMES.len() as u64).contains(&i) => {
            Some(Node::Stat((i - STAT_INO_BASE) as usize))
        }
        i if (STREAM_INO_BASE..STREAM_INO_BASE + STREAM_NAMES.len() as u64).contains(&i) => {
            Some(Node::Stream((i - STREAM_INO_BASE) as usize))
        }
        _ => None,
    }
}

pub fn stat_inode(index: usize) -> u64 {
    STAT_INO_BASE + index as u64
}

pub fn stream_inode(index: usize) -> u64 {
    STREAM_INO_BASE + index as u64
}

/// Resolves `lookup(parent, name)`; mirrors the original `do_getattr`'s
/// flat path matching (`examples/original_source/ISR/src-mock/parcelkeeper/fuse.c`)
/// without string paths, since every node here has a stable inode.
pub fn lookup(parent: u64, name: &str) -> Option<Node> {
    match node_for_inode(parent)? {
        Node::Root => match name {
            "image" => Some(Node::Image),
            "stats" => Some(Node::StatsDir),
            "streams" => Some(Node::StreamsDir),
            _ => None,
        },
        Node::StatsDir => STAT_NAMES.iter().position(|n| *n == name).map(Node::Stat),
        Node::StreamsDir => STREAM_NAMES.iter().position(|n| *n == name).map(Node::Stream),
        _ => None,
    }
}

pub fn inode_of(node: Node) -> u64 {
    match node {
        Node::Root => ROOT_ID,
        Node::Image => IMAGE_INO,
        Node::StatsDir => STATS_DIR_INO,
        Node::StreamsDir => STREAMS_DIR_INO,
        Node::Stat(i) => stat_inode(i),
        Node::Stream(i) => stream_inode(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_children_resolve_by_name() {
        assert_eq!(lookup(ROOT_ID, "image"), Some(Node::Image));
        assert_eq!(lookup(ROOT_ID, "stats"), Some(Node::StatsDir));
        assert_eq!(lookup(ROOT_ID, "streams"), Some(Node::StreamsDir));
        assert_eq!(lookup(ROOT_ID, "nope"), None);
    }

    #[test]
    fn stat_and_stream_names_resolve_under_their_dirs() {
        assert_eq!(lookup(STATS_DIR_INO, "chunk_reads"), Some(Node::Stat(0)));
        assert_eq!(lookup(STATS_DIR_INO, "bogus"), None);
        assert_eq!(lookup(STREAMS_DIR_INO, "chunks_overlay"), Some(Node::Stream(3)));
        assert_eq!(lookup(IMAGE_INO, "anything"), None);
    }

    #[test]
    fn inode_of_and_node_for_inode_round_trip() {
        for node in [
            Node::Root,
            Node::Image,
            Node::StatsDir,
            Node::StreamsDir,
            Node::Stat(2),
            Node::Stream(1),
        ] {
            assert_eq!(node_for_inode(inode_of(node)), Some(node));
        }
    }
}
