use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use agentmesh_core::{NoHandlerError, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::event::short_type_name;

/// A read request with a typed answer.
pub trait Query: Send + Sync + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: &Q) -> Result<Q::Output>;
}

/// Async query dispatch keyed by the query's concrete type.
#[derive(Default)]
pub struct QueryBus {
    // Each value is an `Arc<dyn QueryHandler<Q>>` for the `Q` of its key.
    handlers: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<Q, H>(&self, handler: H)
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let handler: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<Q>(), Box::new(handler));
        if replaced.is_some() {
            warn!(query_type = short_type_name::<Q>(), "Query handler replaced");
        }
    }

    pub async fn dispatch<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        let query_type = short_type_name::<Q>();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<Q>())
            .and_then(|h| h.downcast_ref::<Arc<dyn QueryHandler<Q>>>())
            .cloned()
            .ok_or_else(|| NoHandlerError(query_type.to_string()))?;

        debug!(query_type, "Dispatching query");
        handler.handle(query).await
    }
}
