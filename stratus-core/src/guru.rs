//! Per-VM-type lifecycle callbacks
//!
//! The orchestrator invokes the registered guru at fixed points of start
//! and stop; what the callbacks do is up to the VM-type manager.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    error::{StratusError, StratusResult},
    types::{HostId, VirtualMachineInstance, VmType},
};

#[async_trait]
pub trait VmGuru: Send + Sync {
    /// Called after the host confirmed the start, before `Running` is written.
    /// An error turns the start into a failure.
    async fn finalize_start(&self, vm: &VirtualMachineInstance, host_id: HostId)
        -> StratusResult<()>;

    /// Called before `Stopping` is written.
    async fn prepare_stop(&self, vm: &VirtualMachineInstance) -> StratusResult<()>;

    /// Called after `Stopped` is written.
    async fn finalize_stop(&self, vm: &VirtualMachineInstance) -> StratusResult<()>;
}

#[derive(Default)]
pub struct GuruRegistry {
    gurus: HashMap<VmType, Arc<dyn VmGuru>>,
}

impl GuruRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, vm_type: VmType, guru: Arc<dyn VmGuru>) {
        self.gurus.insert(vm_type, guru);
    }

    /// Register one guru for every VM type.
    pub fn with_all(guru: Arc<dyn VmGuru>) -> Self {
        let mut registry = Self::new();
        for vm_type in VmType::ALL {
            registry.register(vm_type, guru.clone());
        }
        registry
    }

    pub fn guru_for(&self, vm_type: VmType) -> StratusResult<Arc<dyn VmGuru>> {
        self.gurus.get(&vm_type).cloned().ok_or_else(|| {
            StratusError::runtime_fault(format!("no guru registered for {:?}", vm_type))
        })
    }
}
