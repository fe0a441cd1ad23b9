use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

/// Primary key of a domain entity.
pub type EntityId = i64;

/// Identifies one tracked row: the collection it lives in plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub collection: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(collection: impl Into<String>, id: impl ToString) -> Self {
        Self {
            collection: collection.into(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.collection, self.id)
    }
}

/// A domain entity stored through the session.
///
/// Entities are persisted as JSON documents inside `COLLECTION`. Types that
/// support soft deletion override [`Entity::mark_deleted`] to flag themselves
/// and return `true`; removal then becomes an update instead of a delete.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> EntityId;

    fn mark_deleted(&mut self) -> bool {
        false
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::COLLECTION, self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("genres", 42);
        assert_eq!(key.id, "42");
        assert_eq!(key.to_string(), "genres#42");
    }

    #[test]
    fn test_entity_key_ordering_groups_by_collection() {
        let mut keys = vec![
            EntityKey::new("b", 1),
            EntityKey::new("a", 2),
            EntityKey::new("a", 1),
        ];
        keys.sort();
        assert_eq!(keys[0], EntityKey::new("a", 1));
        assert_eq!(keys[2], EntityKey::new("b", 1));
    }
}
