//! Subscription registry: table → predicate signature → subscribers.
//!
//! Entries are created on the first subscriber and removed with the last one.
//! Writers never wait on subscribers: deliveries go to per-subscriber unbounded queues.

use crate::catalog::{Catalog, TableDescriptor};
use crate::error::AppError;
use crate::notifier::event::{ChangeEvent, ChangeKind, Delta};
use crate::query::Filter;
use crate::store::CommitListener;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

struct Group {
    filter: Filter,
    subscribers: HashMap<u64, UnboundedSender<Delta>>,
}

type Registry = HashMap<String, HashMap<String, Group>>;

pub struct Notifier {
    catalog: Arc<Catalog>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub tables: usize,
    pub signatures: usize,
    pub subscribers: usize,
}

impl Notifier {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Notifier {
            catalog,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber for changes to `table` matching `filter`.
    /// Only same-table predicates can be evaluated against row images.
    pub fn subscribe(self: &Arc<Self>, table: &TableDescriptor, filter: Filter) -> Result<Subscription, AppError> {
        if !filter.is_local() {
            return Err(AppError::Unsupported(format!(
                "streaming \"{}\" with relationship filters",
                table.name
            )));
        }
        let signature = filter.signature();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut registry = self.registry();
            registry
                .entry(table.name.clone())
                .or_default()
                .entry(signature.clone())
                .or_insert_with(|| Group {
                    filter,
                    subscribers: HashMap::new(),
                })
                .subscribers
                .insert(id, sender);
        }
        tracing::debug!(table = %table.name, %signature, id, "subscriber registered");
        Ok(Subscription {
            notifier: self.clone(),
            table: table.name.clone(),
            signature,
            id,
            receiver,
        })
    }

    fn unsubscribe(&self, table: &str, signature: &str, id: u64) {
        let mut registry = self.registry();
        let Some(groups) = registry.get_mut(table) else { return };
        if let Some(group) = groups.get_mut(signature) {
            group.subscribers.remove(&id);
            if group.subscribers.is_empty() {
                groups.remove(signature);
            }
        }
        if groups.is_empty() {
            registry.remove(table);
        }
        tracing::debug!(table, signature, id, "subscriber removed");
    }

    pub fn stats(&self) -> NotifierStats {
        let registry = self.registry();
        NotifierStats {
            tables: registry.len(),
            signatures: registry.values().map(HashMap::len).sum(),
            subscribers: registry
                .values()
                .flat_map(|groups| groups.values())
                .map(|g| g.subscribers.len())
                .sum(),
        }
    }

    /// Evaluate committed changes against every signature registered on `table`
    /// and enqueue matches to all subscribers of that signature.
    pub fn dispatch(&self, table: &str, changes: &[ChangeEvent]) {
        let mut registry = self.registry();
        let Some(groups) = registry.get_mut(table) else { return };
        let Some(descriptor) = self.catalog.table(table) else {
            tracing::error!(table, "change for a table missing from catalog");
            return;
        };
        for (signature, group) in groups.iter_mut() {
            for change in changes {
                let hit = |image: &Option<serde_json::Map<String, serde_json::Value>>| {
                    image.as_ref().map_or(false, |row| group.filter.matches(descriptor, row))
                };
                let matched = match change.kind {
                    ChangeKind::Insert => hit(&change.current),
                    ChangeKind::Delete => hit(&change.previous),
                    ChangeKind::Update => hit(&change.previous) || hit(&change.current),
                };
                if !matched {
                    continue;
                }
                let delta = Delta::from_event(change);
                group
                    .subscribers
                    .retain(|id, sender| match sender.send(delta.clone()) {
                        Ok(()) => true,
                        Err(_) => {
                            tracing::debug!(table, %signature, id, "dropping closed subscriber");
                            false
                        }
                    });
            }
        }
        groups.retain(|_, g| !g.subscribers.is_empty());
        if groups.is_empty() {
            registry.remove(table);
        }
    }
}

impl CommitListener for Notifier {
    fn on_commit(&self, table: &str, changes: &[ChangeEvent]) {
        self.dispatch(table, changes);
    }
}

/// A live subscription. Dropping it removes it from the registry.
pub struct Subscription {
    notifier: Arc<Notifier>,
    table: String,
    signature: String,
    id: u64,
    receiver: UnboundedReceiver<Delta>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub async fn recv(&mut self) -> Option<Delta> {
        self.receiver.recv().await
    }

    /// Stop accepting deliveries and discard anything still queued. Returns the number discarded.
    pub fn drain(&mut self) -> usize {
        self.receiver.close();
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(&self.table, &self.signature, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CatalogConfig};
    use crate::query::QueryParams;
    use serde_json::json;

    fn catalog() -> Arc<Catalog> {
        let config: CatalogConfig = serde_json::from_value(json!({
            "tables": [{
                "name": "bonuses",
                "columns": [
                    { "key": "id", "type": "serial", "primary_key": true },
                    { "key": "name", "type": "text" },
                    { "key": "active", "type": "boolean" }
                ]
            }]
        }))
        .unwrap();
        Arc::new(resolve(&config).unwrap())
    }

    fn filter(catalog: &Catalog, pairs: &[(&str, &str)]) -> Filter {
        let params = QueryParams::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        Filter::compile(catalog, catalog.resolve("bonuses").unwrap(), &params).unwrap()
    }

    fn image(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn groups_are_created_and_removed_with_subscribers() {
        let catalog = catalog();
        let notifier = Arc::new(Notifier::new(catalog.clone()));
        let table = catalog.resolve("bonuses").unwrap();
        let a = notifier.subscribe(table, filter(&catalog, &[("name", "x")])).unwrap();
        let b = notifier.subscribe(table, filter(&catalog, &[("name", "X")])).unwrap();
        let c = notifier.subscribe(table, Filter::default()).unwrap();
        assert_eq!(a.signature(), b.signature());
        assert_eq!(
            notifier.stats(),
            NotifierStats {
                tables: 1,
                signatures: 2,
                subscribers: 3
            }
        );
        drop(a);
        drop(c);
        assert_eq!(notifier.stats().signatures, 1);
        drop(b);
        assert_eq!(notifier.stats(), NotifierStats::default());
    }

    #[tokio::test]
    async fn updates_match_on_either_image() {
        let catalog = catalog();
        let notifier = Arc::new(Notifier::new(catalog.clone()));
        let table = catalog.resolve("bonuses").unwrap();
        let mut active = notifier.subscribe(table, filter(&catalog, &[("active", "true")])).unwrap();
        let mut other = notifier.subscribe(table, filter(&catalog, &[("name", "y")])).unwrap();

        notifier.on_commit(
            "bonuses",
            &[ChangeEvent::update(
                "bonuses",
                image(json!({"id": 1, "name": "x", "active": true})),
                image(json!({"id": 1, "name": "x", "active": false})),
            )],
        );
        let delta = active.recv().await.unwrap();
        assert_eq!(delta.previous, vec![json!({"id": 1, "name": "x", "active": true})]);
        assert_eq!(delta.current, vec![json!({"id": 1, "name": "x", "active": false})]);
        assert!(other.receiver.try_recv().is_err());
        assert_eq!(other.drain(), 0);
    }

    #[test]
    fn dispatch_prunes_closed_receivers() {
        let catalog = catalog();
        let notifier = Arc::new(Notifier::new(catalog.clone()));
        let table = catalog.resolve("bonuses").unwrap();
        let mut sub = notifier.subscribe(table, Filter::default()).unwrap();
        sub.receiver.close();
        notifier.dispatch("bonuses", &[ChangeEvent::insert("bonuses", image(json!({"id": 1})))]);
        assert_eq!(notifier.stats().subscribers, 0);
        drop(sub);
        assert_eq!(notifier.stats(), NotifierStats::default());
    }

    #[test]
    fn relationship_filters_are_rejected() {
        let catalog = catalog();
        let notifier = Arc::new(Notifier::new(catalog.clone()));
        let table = catalog.resolve("bonuses").unwrap();
        let mut f = Filter::default();
        f.groups.push(crate::query::ColumnFilter {
            chain: vec!["owner".into()],
            column: "name".into(),
            predicates: vec![],
        });
        let err = notifier.subscribe(table, f).err().unwrap();
        assert_eq!(err.kind(), "not_implemented");
    }
}
