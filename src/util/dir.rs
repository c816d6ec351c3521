use std::cmp::Ordering;

/// The side of a tree node a search continues on.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Dir {
    Left,
    Right,
}

impl Dir {
    /// Direction to take from a node ordered as `node` relative to the probe.
    /// Equal positions never reach this point because an equal key is a hit.
    #[inline]
    pub fn towards(node: Ordering) -> Option<Dir> {
        match node {
            Ordering::Greater => Some(Dir::Left),
            Ordering::Less => Some(Dir::Right),
            Ordering::Equal => None,
        }
    }
}
