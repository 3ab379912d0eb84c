use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::endpoint::MediaEndpoint;
use crate::error::{Error, Result};
use crate::protocol::RtpCapabilities;
use crate::signaling::SignalingBridge;

#[derive(Default)]
pub struct CapabilityNegotiator {
    loaded: RwLock<Option<Arc<RtpCapabilities>>>,
    /// Serializes loads so concurrent callers share one round trip.
    load_gate: Mutex<()>,
    generation: AtomicU64,
}

impl CapabilityNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.read().is_some()
    }

    pub fn current(&self) -> Option<Arc<RtpCapabilities>> {
        self.loaded.read().clone()
    }

    /// Loads the local capabilities against the router's. A no-op when already loaded.
    pub async fn load(
        &self,
        signaling: &SignalingBridge,
        endpoint: &dyn MediaEndpoint,
    ) -> Result<Arc<RtpCapabilities>> {
        if let Some(caps) = self.current() {
            return Ok(caps);
        }

        let _gate = self.load_gate.lock().await;
        if let Some(caps) = self.current() {
            debug!("capabilities loaded by a concurrent caller");
            return Ok(caps);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let router = signaling
            .router_capabilities()
            .await
            .map_err(|e| Error::CapabilityLoad(format!("router capabilities unavailable: {}", e.reason())))?;
        let local = endpoint
            .load(&router)
            .await
            .map_err(|e| Error::CapabilityLoad(e.to_string()))?;
        if local.codecs.is_empty() {
            return Err(Error::CapabilityLoad(
                "no codec in common with the router".to_owned(),
            ));
        }

        let caps = Arc::new(local);
        let mut slot = self.loaded.write();
        if self.generation.load(Ordering::Acquire) != generation {
            warn!("capabilities invalidated while loading; discarding result");
            return Err(Error::CapabilitiesNotLoaded);
        }
        *slot = Some(Arc::clone(&caps));
        info!(codecs = caps.codecs.len(), "capabilities loaded");
        Ok(caps)
    }

    /// Forgets the loaded capabilities; the next [`CapabilityNegotiator::load`] reloads.
    pub fn invalidate(&self) {
        let mut slot = self.loaded.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if slot.take().is_some() {
            info!("capabilities invalidated");
        }
    }
}
