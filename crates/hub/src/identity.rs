//! Name -> entity id cache owned by one ingest service.
//!
//! Bounded; once full, the oldest inserted name is forgotten and will be
//! looked up in the store again on its next reading.

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::error::{IngestError, IngestResult};
use crate::store::{NewEntity, TelemetryStore};
use crate::telemetry::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedEntity {
    pub id: i64,
    pub last_log_ts: Option<i64>,
}

/// Outcome of [`IdentityCache::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: i64,
    /// The entity was created by this call with the signal's value, so no
    /// separate value update is needed.
    pub created: bool,
    pub last_log_ts: Option<i64>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CachedEntity>,
    order: VecDeque<String>,
}

pub struct IdentityCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl IdentityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn get(&self, name: &str) -> Option<CachedEntity> {
        self.inner.lock().await.entries.get(name).copied()
    }

    pub async fn insert(&self, name: &str, entry: CachedEntity) {
        let mut inner = self.inner.lock().await;
        if inner.entries.insert(name.to_string(), entry).is_some() {
            return;
        }
        inner.order.push_back(name.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Remember an admitted log. A name that was evicted meanwhile is not
    /// re-inserted.
    pub async fn mark_logged(&self, name: &str, ts: i64) {
        if let Some(e) = self.inner.lock().await.entries.get_mut(name) {
            e.last_log_ts = Some(e.last_log_ts.map_or(ts, |prev| prev.max(ts)));
        }
    }

    pub async fn forget(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(name).is_some() {
            inner.order.retain(|n| n != name);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Map a signal to its entity id, creating the entity on first sight.
    ///
    /// The lock is never held across a store call. Two pipelines resolving
    /// the same new name at once both reach `create_entity_if_absent`, which
    /// lets exactly one of them insert.
    pub async fn resolve(
        &self,
        store: &dyn TelemetryStore,
        signal: &Signal,
        now: i64,
    ) -> IngestResult<Resolved> {
        if let Some(hit) = self.get(&signal.name).await {
            return Ok(Resolved {
                id: hit.id,
                created: false,
                last_log_ts: hit.last_log_ts,
            });
        }

        let existing = store
            .find_entity_by_name(&signal.name)
            .await
            .map_err(IngestError::StoreUnavailable)?;

        let (entity, created) = match existing {
            Some(e) => (e, false),
            None => store
                .create_entity_if_absent(&NewEntity {
                    name: &signal.name,
                    kind: signal.kind,
                    value: &signal.value,
                    unit: &signal.unit,
                    now,
                })
                .await
                .map_err(IngestError::StoreUnavailable)?,
        };

        if created {
            tracing::info!(entity_id = entity.id, name = %entity.name, kind = entity.kind.as_str(), "entity created");
        }

        self.insert(
            &signal.name,
            CachedEntity {
                id: entity.id,
                last_log_ts: entity.last_log_ts,
            },
        )
        .await;

        Ok(Resolved {
            id: entity.id,
            created,
            last_log_ts: entity.last_log_ts,
        })
    }
}
