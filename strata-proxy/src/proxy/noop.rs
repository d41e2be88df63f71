//! Inert proxy for disabled or terminated particles.
//!
//! Every operation resolves immediately with an empty value. Nothing is
//! sent to the store and nothing is scheduled, so teardown leaves no
//! async work behind.

use strata_core::{Entity, ParticleId, StoreId};

use crate::error::ProxyError;
use crate::port::{CursorId, CursorPage};
use crate::proxy::big_collection::Cursor;
use crate::proxy::StoreKind;

#[derive(Debug, Clone)]
pub struct NoOpProxy {
    store: StoreId,
    kind: StoreKind,
}

impl NoOpProxy {
    pub fn new(store: StoreId, kind: StoreKind) -> Self {
        Self { store, kind }
    }

    pub fn id(&self) -> &StoreId {
        &self.store
    }

    /// Kind of the proxy this one replaced.
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub async fn to_list(&self) -> Result<Vec<Entity>, ProxyError> {
        Ok(Vec::new())
    }

    pub async fn fetch_all(&self, _id: &str) -> Result<Option<Entity>, ProxyError> {
        Ok(None)
    }

    pub async fn fetch(&self) -> Result<Option<Entity>, ProxyError> {
        Ok(None)
    }

    pub async fn store(
        &self,
        _value: Entity,
        _keys: Vec<String>,
        _particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    pub async fn remove(
        &self,
        _id: &str,
        _keys: Vec<String>,
        _particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    pub async fn set(
        &self,
        _entity: Entity,
        _particle: impl Into<ParticleId>,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    pub async fn clear(&self, _particle: impl Into<ParticleId>) -> Result<(), ProxyError> {
        Ok(())
    }

    pub async fn stream(&self, _page_size: usize, _forward: bool) -> Result<Cursor, ProxyError> {
        Ok(Cursor::inert())
    }

    pub async fn open_cursor(
        &self,
        _page_size: usize,
        _forward: bool,
    ) -> Result<CursorId, ProxyError> {
        Ok(0)
    }

    pub async fn cursor_next(&self, _cursor_id: CursorId) -> Result<CursorPage, ProxyError> {
        Ok(CursorPage {
            value: Vec::new(),
            done: true,
        })
    }

    pub fn cursor_close(&self, _cursor_id: CursorId) -> Result<(), ProxyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_operation_is_inert() {
        let proxy = NoOpProxy::new(StoreId::new("s"), StoreKind::Collection);
        assert!(proxy.to_list().await.unwrap().is_empty());
        assert_eq!(proxy.fetch_all("a").await.unwrap(), None);
        assert_eq!(proxy.fetch().await.unwrap(), None);
        proxy
            .store(Entity::with_id("a"), vec![], "p")
            .await
            .unwrap();
        proxy.remove("a", vec![], "p").await.unwrap();
        proxy.set(Entity::with_id("a"), "p").await.unwrap();
        proxy.clear("p").await.unwrap();

        assert_eq!(proxy.open_cursor(10, true).await.unwrap(), 0);
        assert!(proxy.cursor_next(0).await.unwrap().done);
        proxy.cursor_close(0).unwrap();

        let mut cursor = proxy.stream(10, true).await.unwrap();
        assert!(cursor.is_closed());
        assert!(cursor.next().await.unwrap().value.is_empty());
    }
}
