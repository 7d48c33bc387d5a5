use std::cmp::Ordering;
use std::fmt;

/// Opaque identifier of one escrow instance on the remote contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EscrowId(String);

impl EscrowId {
    /// Fresh random identifier (v4 UUID string).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a confirmed remote change landed: block number, then index within the block.
///
/// Ordering follows the remote chain, which is the only authority on sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainPosition {
    block: u64,
    index: u64,
}

impl ChainPosition {
    #[must_use]
    pub const fn new(block: u64, index: u64) -> Self {
        Self { block, index }
    }

    /// Position of a read taken at the end of `block`, after every transaction in it.
    #[must_use]
    pub const fn end_of_block(block: u64) -> Self {
        Self {
            block,
            index: u64::MAX,
        }
    }

    #[must_use]
    pub const fn block(self) -> u64 {
        self.block
    }

    #[must_use]
    pub const fn index(self) -> u64 {
        self.index
    }
}

impl Ord for ChainPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for ChainPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == u64::MAX {
            write!(f, "{}:end", self.block)
        } else {
            write!(f, "{}:{}", self.block, self.index)
        }
    }
}
