//! Inventory data models.
//!
//! Each `New*` struct is the typed transfer row for one entity: it is built
//! field by field from a provider DTO and upserted by its natural key.

pub mod contributor;
pub mod finding;
pub mod group;
pub mod image;
pub mod instance;
pub mod member;
pub mod registry;
pub mod repository;
pub mod user;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

pub use contributor::NewContributor;
pub use finding::NewFinding;
pub use group::NewGroup;
pub use image::NewImage;
pub use instance::{NewVcsInstance, VcsInstance, VcsKind};
pub use member::NewRepositoryMember;
pub use registry::NewRegistry;
pub use repository::NewRepository;
pub use user::NewUser;

use crate::store::UpsertBatch;

/// A row that is written with insert-or-merge semantics.
pub trait Upsertable: Clone + Debug + Send + Sync + 'static {
    /// Natural key; the conflict target of the upsert.
    type Key: Clone + Debug + Eq + Hash + Send + Sync;

    /// Entity name used in logs and metrics.
    const ENTITY: &'static str;

    fn natural_key(&self) -> Self::Key;

    /// Copy this row's mutable columns over an existing row with the same key.
    fn merge_into(self, existing: &mut Self);

    fn into_batch(rows: Vec<Self>) -> UpsertBatch;
}

/// Collapse rows sharing a natural key, keeping the last occurrence at the
/// position of the first. A single INSERT .. ON CONFLICT statement cannot
/// touch the same row twice.
pub fn dedup_by_key<T: Upsertable>(rows: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut positions: HashMap<T::Key, usize> = HashMap::new();
    let mut unique: Vec<T> = Vec::new();
    for row in rows {
        match positions.get(&row.natural_key()) {
            Some(&pos) => unique[pos] = row,
            None => {
                positions.insert(row.natural_key(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(vcs_id: i64, path: &str) -> NewGroup {
        NewGroup {
            vcs_instance_id: 1,
            vcs_id,
            parent_id: None,
            path: path.to_string(),
            visibility: "private".to_string(),
        }
    }

    #[test]
    fn dedup_keeps_last_value_at_first_position() {
        let rows = vec![group(1, "a"), group(2, "b"), group(1, "a-renamed")];
        let unique = dedup_by_key(rows);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].vcs_id, 1);
        assert_eq!(unique[0].path, "a-renamed");
        assert_eq!(unique[1].vcs_id, 2);
    }

    #[test]
    fn merge_only_touches_mutable_columns() {
        let mut stored = group(7, "old");
        let mut incoming = group(7, "new");
        incoming.vcs_instance_id = 99;
        incoming.parent_id = Some(3);
        incoming.merge_into(&mut stored);
        assert_eq!(stored.path, "new");
        assert_eq!(stored.parent_id, Some(3));
        assert_eq!(stored.vcs_instance_id, 1);
    }
}
