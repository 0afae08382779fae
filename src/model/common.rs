use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type Id = String;

pub const WILDCARD_PACKAGE_ID: &str = "*";

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// SHA-256 over the given parts, each part terminated by a newline so that
/// `("ab", "c")` and `("a", "bc")` hash differently.
pub fn hash_parts(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

pub fn hash_parts_hex(parts: &[&str]) -> String {
    hex::encode(hash_parts(parts))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Offset-based paging, `page` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub page: usize,
    pub limit: usize,
}

impl Paging {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 100;

    pub fn new(page: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(0),
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> usize {
        self.page * self.limit
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.offset()).take(self.limit).collect()
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_parts_separates_fields() {
        assert_ne!(hash_parts_hex(&["ab", "c"]), hash_parts_hex(&["a", "bc"]));
        assert_eq!(hash_parts_hex(&["a", "b"]), hash_parts_hex(&["a", "b"]));
    }

    #[test]
    fn test_paging_clamps_limit() {
        let paging = Paging::new(Some(2), Some(1000));
        assert_eq!(paging.limit, Paging::MAX_LIMIT);
        assert_eq!(paging.offset(), 200);
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(Paging::new(Some(1), Some(3)).apply(items), vec![3, 4, 5]);
    }
}
