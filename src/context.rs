//! Per-thread gateway context
//!
//! Bundles the read-only process configuration with the request thread's
//! event loop and the components built from both. One context serves every
//! request on its thread; requests never share anything mutable through it.

use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::core::event_loop::{EventLoop, ShutdownSignal};
use crate::core::layout::LayoutTable;
use crate::core::ledger::TombstoneLedger;
use crate::core::oid::IdAllocator;
use crate::error::Result;
use crate::metadata::MetadataStore;
use std::rc::Rc;
use std::sync::Arc;

pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub backend: Arc<dyn Backend>,
    pub lp: Rc<EventLoop>,
    pub allocator: IdAllocator,
    pub layouts: Arc<LayoutTable>,
    pub ledger: TombstoneLedger,
    pub metadata: MetadataStore,
}

impl GatewayContext {
    /// Validate `config` and build every component from it
    pub fn new(
        config: GatewayConfig,
        backend: Arc<dyn Backend>,
        shutdown: ShutdownSignal,
    ) -> Result<Rc<Self>> {
        config.check()?;
        let layouts = Arc::new(LayoutTable::from_config(&config.layout)?);
        let allocator = IdAllocator::new(config.ids.mode, config.ids.max_collision_retries);
        let ledger = TombstoneLedger::new(backend.clone(), &config);
        let lp = Rc::new(EventLoop::new(&config, shutdown));

        tracing::info!(
            "Gateway context ready: instance {}, ledger index {}",
            config.instance.instance_id,
            config.ledger.index_id
        );

        Ok(Rc::new(GatewayContext {
            metadata: MetadataStore::new(backend.clone()),
            config: Arc::new(config),
            backend,
            lp,
            allocator,
            layouts,
            ledger,
        }))
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        self.lp.shutdown_signal()
    }

    /// Drive the event loop until every outstanding join has completed
    pub fn run_until_idle(&self) -> Result<usize> {
        self.lp.run_until_idle()
    }
}
