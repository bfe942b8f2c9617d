use crate::clock::{Clock, RemainingTime};
use crate::events::Events;
use std::sync::Arc;

/// Ambient collaborators shared by both sync engines.
#[derive(Clone)]
pub struct SyncContext {
    pub clock: Arc<dyn Clock>,
    pub remaining: Arc<dyn RemainingTime>,
    pub events: Arc<dyn Events>,
}
