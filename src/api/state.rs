//! API shared state containing actor handles

use std::sync::Arc;

use crate::actors::{
    control::ControlHandle, forwarder::ForwarderHandle, retention::RetentionHandle,
};
use crate::buffer::BufferStore;
use crate::collector::Collector;
use crate::health::HealthReporter;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub gateway_id: String,
    pub collector: Collector,
    pub health: HealthReporter,
    pub buffer: Arc<dyn BufferStore>,
    pub forwarder: ForwarderHandle,
    pub retention: RetentionHandle,

    /// `None` when the control channel is disabled
    pub control: Option<ControlHandle>,
}

impl ApiState {
    pub fn new(
        gateway_id: impl Into<String>,
        collector: Collector,
        health: HealthReporter,
        buffer: Arc<dyn BufferStore>,
        forwarder: ForwarderHandle,
        retention: RetentionHandle,
        control: Option<ControlHandle>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            collector,
            health,
            buffer,
            forwarder,
            retention,
            control,
        }
    }
}
