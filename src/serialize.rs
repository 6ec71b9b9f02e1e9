//! Entity graph to wire JSON.
//!
//! A related entity never repeats the relationship that leads back to the entity
//! it was reached from: the `back_populates` key of the traversed relationship is
//! threaded down as `via` and skipped.

use crate::catalog::Cardinality;
use crate::store::Row;
use serde_json::Value;
use std::collections::BTreeMap;

/// One loaded row plus its eager-loaded relationships.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityNode {
    pub row: Row,
    pub relations: BTreeMap<String, Related>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Related {
    pub cardinality: Cardinality,
    /// Key on the related entities that points back here.
    pub back_populates: Option<String>,
    pub entities: Vec<EntityNode>,
}

impl EntityNode {
    pub fn new(row: Row) -> Self {
        EntityNode {
            row,
            relations: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        self.to_json_via(None)
    }

    fn to_json_via(&self, via: Option<&str>) -> Value {
        let mut out = self.row.clone();
        if let Some(via) = via {
            out.remove(via);
        }
        for (key, related) in &self.relations {
            if Some(key.as_str()) == via {
                continue;
            }
            let back = related.back_populates.as_deref();
            let value = match related.cardinality {
                Cardinality::One => related
                    .entities
                    .first()
                    .map(|e| e.to_json_via(back))
                    .unwrap_or(Value::Null),
                Cardinality::Many => Value::Array(related.entities.iter().map(|e| e.to_json_via(back)).collect()),
            };
            out.insert(key.clone(), value);
        }
        Value::Object(out)
    }
}

pub fn entities_to_json(nodes: &[EntityNode]) -> Value {
    Value::Array(nodes.iter().map(EntityNode::to_json).collect())
}
