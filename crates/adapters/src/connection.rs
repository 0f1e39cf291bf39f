use std::future::Future;
use tokio::sync::OnceCell;

use crate::DeliveryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Transport connection established on first use.
///
/// `Disconnected -> Connected` happens at most once: concurrent callers racing
/// the first connect wait on the same attempt and share its result. A failed
/// attempt leaves the state `Disconnected`, so the next caller tries again.
pub struct LazyConnection<C> {
    cell: OnceCell<C>,
}

impl<C> LazyConnection<C> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.cell.initialized() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn get(&self) -> Option<&C> {
        self.cell.get()
    }

    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> DeliveryResult<&C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DeliveryResult<C>>,
    {
        self.cell.get_or_try_init(connect).await
    }
}

impl<C> Default for LazyConnection<C> {
    fn default() -> Self {
        Self::new()
    }
}
