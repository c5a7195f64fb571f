use super::{
    ControlEventFactory, Event, EventCategory, EventParams, ProcessEventFactory,
    SourceEventFactory,
};
use crate::error::EventError;
use crate::recorder::PipelineContext;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the concrete events of one category
pub trait EventFactory: Send + Sync {
    fn category(&self) -> EventCategory;

    /// Validate `params` and bind the event to `context`
    fn create(
        &self,
        context: &Arc<PipelineContext>,
        params: EventParams,
    ) -> Result<Box<dyn Event>, EventError>;
}

/// Category → factory registry owned by the recorder
pub struct EventFactoryManager {
    factories: RwLock<HashMap<EventCategory, Box<dyn EventFactory>>>,
}

impl EventFactoryManager {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Manager with the control, source and process factories registered
    pub fn with_defaults() -> Self {
        let manager = Self::new();
        manager.register(Box::new(ControlEventFactory));
        manager.register(Box::new(SourceEventFactory));
        manager.register(Box::new(ProcessEventFactory));
        manager
    }

    /// Register `factory`, replacing any factory of the same category
    pub fn register(&self, factory: Box<dyn EventFactory>) {
        let category = factory.category();
        if self.factories.write().insert(category, factory).is_some() {
            debug!("EventFactoryManager: replaced {} factory", category);
        }
    }

    pub fn unregister(&self, category: EventCategory) -> bool {
        self.factories.write().remove(&category).is_some()
    }

    pub fn has(&self, category: EventCategory) -> bool {
        self.factories.read().contains_key(&category)
    }

    pub fn create(
        &self,
        context: &Arc<PipelineContext>,
        params: EventParams,
    ) -> Result<Box<dyn Event>, EventError> {
        let category = params.category();
        let factories = self.factories.read();
        let factory = factories
            .get(&category)
            .ok_or(EventError::UnknownCategory(category))?;
        factory.create(context, params)
    }
}

impl Default for EventFactoryManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}
