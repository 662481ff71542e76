//! Server component and its registered capabilities
//!
//! A component owns the inbound side of a link. Capabilities are registered
//! and unregistered at defined lifecycle points; the component calls their
//! `init`/`deinit` hooks and fans inbound frames out to every registered one.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::server::FtpServer;
use crate::transport::InboundSink;

/// A server-side capability driven by a [`ServerComponent`]
pub trait ServerCapability: InboundSink {
    /// Unique name used for registration
    fn name(&self) -> &'static str;

    /// Called once when registered
    fn init(&self) {}

    /// Called once when unregistered
    fn deinit(&self) {}
}

impl ServerCapability for FtpServer {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn init(&self) {
        debug!(root = ?self.root_dir(), "file server started");
    }

    fn deinit(&self) {
        self.reset();
        debug!("file server stopped");
    }
}

/// Registry of capabilities sharing one link
#[derive(Default)]
pub struct ServerComponent {
    capabilities: RwLock<Vec<Arc<dyn ServerCapability>>>,
}

impl ServerComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability; false if one with the same name exists
    pub fn register(&self, capability: Arc<dyn ServerCapability>) -> bool {
        let mut capabilities = self.capabilities.write();
        if capabilities.iter().any(|c| c.name() == capability.name()) {
            return false;
        }
        capability.init();
        info!("Registered capability {}", capability.name());
        capabilities.push(capability);
        true
    }

    /// Unregister a capability by name
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ServerCapability>> {
        let mut capabilities = self.capabilities.write();
        let index = capabilities.iter().position(|c| c.name() == name)?;
        let capability = capabilities.remove(index);
        capability.deinit();
        info!("Unregistered capability {}", name);
        Some(capability)
    }

    /// Names of registered capabilities
    pub fn names(&self) -> Vec<&'static str> {
        self.capabilities.read().iter().map(|c| c.name()).collect()
    }
}

impl InboundSink for ServerComponent {
    fn handle_inbound(&self, frame: &[u8]) {
        for capability in self.capabilities.read().iter() {
            capability.handle_inbound(frame);
        }
    }
}

impl Drop for ServerComponent {
    fn drop(&mut self) {
        for capability in self.capabilities.get_mut().drain(..) {
            capability.deinit();
        }
    }
}
