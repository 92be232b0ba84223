//! Infrastructure Index
//!
//! Flattens the area tree into a map keyed by location id so lookups are O(1) and the
//! structure can be shared freely between requests.

use super::types::{Area, Infrastructure, Node};
use crate::error::ErmesError;
use crate::keys::StoreKey;
use crate::store::driver::StoreConnection;
use std::collections::HashMap;

/// Key under which the serialized infrastructure tree is published.
pub const INFRASTRUCTURE_SUB_KEY: &str = "hierarchy";

struct Placement {
    node: Node,
    depth: usize,
    parent: Option<String>,
}

pub struct Topology {
    infrastructure: Infrastructure,
    index: HashMap<String, Placement>,
}

impl Topology {
    pub fn new(infrastructure: Infrastructure) -> Self {
        let mut index = HashMap::new();
        for area in &infrastructure.hierarchy {
            Self::index_area(&mut index, area, 0, None);
        }

        Self {
            infrastructure,
            index,
        }
    }

    fn index_area(
        index: &mut HashMap<String, Placement>,
        area: &Area,
        depth: usize,
        parent: Option<&str>,
    ) {
        let location_id = area.main_location.location_id.as_str();

        // The same node may serve nested areas; keep its outermost placement.
        if !index.contains_key(location_id) {
            index.insert(
                location_id.to_string(),
                Placement {
                    node: area.main_location.clone(),
                    depth,
                    parent: parent
                        .filter(|parent| *parent != location_id)
                        .map(str::to_string),
                },
            );
        }

        for child in &area.areas {
            Self::index_area(index, child, depth + 1, Some(location_id));
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ErmesError> {
        let infrastructure: Infrastructure = serde_json::from_slice(bytes)?;
        Ok(Self::new(infrastructure))
    }

    /// Reads the tree published in the Infrastructure keyspace, if any.
    pub async fn load(conn: &dyn StoreConnection) -> Result<Option<Self>, ErmesError> {
        match conn.get(&StoreKey::infrastructure(INFRASTRUCTURE_SUB_KEY)).await? {
            Some(bytes) => Ok(Some(Self::from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn publish(&self, conn: &dyn StoreConnection) -> Result<(), ErmesError> {
        let bytes = serde_json::to_vec(&self.infrastructure)?;
        conn.set(&StoreKey::infrastructure(INFRASTRUCTURE_SUB_KEY), &bytes)
            .await?;
        Ok(())
    }

    pub fn infrastructure(&self) -> &Infrastructure {
        &self.infrastructure
    }

    pub fn resolve_node(&self, location_id: &str) -> Result<&Node, ErmesError> {
        self.index
            .get(location_id)
            .map(|placement| &placement.node)
            .ok_or_else(|| ErmesError::UnknownLocation(location_id.to_string()))
    }

    pub fn parent_of(&self, location_id: &str) -> Option<&Node> {
        let parent = self.index.get(location_id)?.parent.as_deref()?;
        self.index.get(parent).map(|placement| &placement.node)
    }

    /// Ancestors of a location, nearest first.
    pub fn ancestors(&self, location_id: &str) -> Vec<&Node> {
        let mut ancestors = Vec::new();
        let mut current = location_id;

        while let Some(parent) = self.parent_of(current) {
            // A malformed tree could loop through a node that reappears deeper down
            if ancestors.len() > self.index.len() {
                break;
            }
            ancestors.push(parent);
            current = parent.location_id.as_str();
        }
        ancestors
    }

    /// Area type a location serves as main node, e.g. "city".
    pub fn area_type_of(&self, location_id: &str) -> Option<&str> {
        let depth = self.index.get(location_id)?.depth;
        self.infrastructure
            .area_types_identifiers
            .get(depth)
            .map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.index.values().map(|placement| &placement.node)
    }

    pub fn contains(&self, location_id: &str) -> bool {
        self.index.contains_key(location_id)
    }
}
