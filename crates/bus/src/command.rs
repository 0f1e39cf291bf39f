use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use agentmesh_core::{Error, Metrics, NoHandlerError, Result};
use tracing::{debug, warn};

use crate::event::short_type_name;

/// Handles one command type. Runs synchronously on the dispatching thread.
pub trait CommandHandler<C>: Send + Sync {
    fn handle(&self, command: &C) -> Result<()>;
}

impl<C, F> CommandHandler<C> for F
where
    F: Fn(&C) -> Result<()> + Send + Sync,
{
    fn handle(&self, command: &C) -> Result<()> {
        self(command)
    }
}

type ErasedHandler = Arc<dyn Fn(&dyn Any) -> Result<()> + Send + Sync>;

/// Synchronous command dispatch keyed by the command's concrete type.
pub struct CommandBus {
    handlers: RwLock<HashMap<TypeId, ErasedHandler>>,
    metrics: Arc<Metrics>,
}

impl CommandBus {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Register the handler for `C`. A later registration for the same type
    /// replaces the earlier one.
    pub fn register_handler<C, H>(&self, handler: H)
    where
        C: Send + Sync + 'static,
        H: CommandHandler<C> + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |command: &dyn Any| match command.downcast_ref::<C>() {
            Some(command) => handler.handle(command),
            None => Err(Error::Other(format!(
                "command is not a {}",
                short_type_name::<C>()
            ))),
        });
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<C>(), erased);
        if replaced.is_some() {
            warn!(command_type = short_type_name::<C>(), "Command handler replaced");
        }
    }

    pub fn has_handler<C: 'static>(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&TypeId::of::<C>())
    }

    /// Invoke the handler registered for `C`. Handler errors propagate.
    pub fn dispatch<C: Send + Sync + 'static>(&self, command: &C) -> Result<()> {
        let command_type = short_type_name::<C>();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<C>())
            .cloned()
            .ok_or_else(|| NoHandlerError(command_type.to_string()))?;

        handler(command as &dyn Any)?;
        self.metrics.commands_dispatched.inc(&[command_type]);
        debug!(command_type, "Command dispatched");
        Ok(())
    }
}
