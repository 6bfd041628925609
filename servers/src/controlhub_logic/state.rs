use std::sync::Arc;

use hub_common::{DeviceStateSource, Dispatcher, SignalingRoomRegistry, StateAggregator};
use tokio_util::sync::CancellationToken;

/// Everything the HTTP and WebSocket handlers share.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<StateAggregator>,
    pub rooms: Arc<SignalingRoomRegistry>,
    pub source: Arc<dyn DeviceStateSource>,
    // Socket loops end when this fires so graceful shutdown can finish.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        aggregator: Arc<StateAggregator>,
        source: Arc<dyn DeviceStateSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let rooms = Arc::new(SignalingRoomRegistry::new(dispatcher.clone()));
        Self {
            dispatcher,
            aggregator,
            rooms,
            source,
            shutdown,
        }
    }
}
