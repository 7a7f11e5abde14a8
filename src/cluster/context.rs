//! Per-slot hardware contexts and their completion pollers.

use super::connection::Connection;
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{
    CmId, CompletionDevice, CompletionStatus, Fabric, WorkCompletion, WrTag,
};
use crate::types::Slot;
use crate::wait::{Fault, StopSignal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Completion device of one slot plus the connections whose work requests
/// complete on it.
pub struct HardwareContext<F: Fabric> {
    slot: Slot,
    device_key: usize,
    device: F::Device,
    connections: RwLock<HashMap<u32, Arc<Connection<F>>>>,
}

impl<F: Fabric> HardwareContext<F> {
    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn device_key(&self) -> usize {
        self.device_key
    }

    pub(crate) fn device(&self) -> &F::Device {
        &self.device
    }

    pub(crate) fn attach(&self, conn: Arc<Connection<F>>) -> Result<()> {
        self.connections
            .write()
            .map_err(|_| RdsmError::LockPoisoned("context connections"))?
            .insert(conn.conn_id(), conn);
        Ok(())
    }

    pub(crate) fn detach(&self, conn_id: u32) -> Option<Arc<Connection<F>>> {
        self.connections.write().ok()?.remove(&conn_id)
    }

    fn lookup(&self, conn_id: u32) -> Result<Option<Arc<Connection<F>>>> {
        Ok(self
            .connections
            .read()
            .map_err(|_| RdsmError::LockPoisoned("context connections"))?
            .get(&conn_id)
            .cloned())
    }

    fn dispatch(&self, wc: &WorkCompletion) -> Result<()> {
        if let CompletionStatus::Failed(status) = &wc.status {
            return Err(RdsmError::Completion {
                wr_id: wc.wr_id,
                status: status.clone(),
            });
        }
        let Some(tag) = WrTag::unpack(wc.wr_id) else {
            return Err(RdsmError::device(format!(
                "completion with foreign wr_id {:#x}",
                wc.wr_id
            )));
        };
        match self.lookup(tag.conn_id)? {
            Some(conn) => conn.on_completion(tag.kind, wc),
            None => {
                // Link already torn down; its last completions are dropped.
                tracing::debug!(slot = self.slot, conn_id = tag.conn_id, "completion for detached connection");
                Ok(())
            }
        }
    }

    fn poll_loop(self: Arc<Self>, tick: Duration, stop: Arc<StopSignal>) {
        let mut batch = Vec::new();
        while !stop.is_stopped() {
            let result = self
                .device
                .wait_completions(tick, &mut batch)
                .and_then(|()| batch.drain(..).try_for_each(|wc| self.dispatch(&wc)));
            if let Err(e) = result {
                tracing::error!(slot = self.slot, error = %e, "completion poller stopped");
                stop.fail(Fault::from_error(&e));
                return;
            }
        }
        tracing::debug!(slot = self.slot, "completion poller exiting");
    }
}

/// Slot-indexed table of hardware contexts owned by one cluster.
pub(crate) struct ContextRegistry<F: Fabric> {
    slots: Mutex<Vec<Option<Arc<HardwareContext<F>>>>>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    cq_depth: u32,
    poll_tick: Duration,
    stop: Arc<StopSignal>,
}

impl<F: Fabric> ContextRegistry<F> {
    pub(crate) fn new(slots: usize, cq_depth: u32, poll_tick: Duration, stop: Arc<StopSignal>) -> Self {
        Self {
            slots: Mutex::new((0..slots).map(|_| None).collect()),
            pollers: Mutex::new(Vec::new()),
            cq_depth,
            poll_tick,
            stop,
        }
    }

    /// Context for `slot`, created with its poller on first use.
    ///
    /// A slot already bound to another device is a configuration error.
    pub(crate) fn get_or_create(
        &self,
        fabric: &F,
        slot: Slot,
        id: &F::Id,
    ) -> Result<Arc<HardwareContext<F>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("context slots"))?;
        let limit = slots.len();
        let entry = slots.get_mut(slot).ok_or(RdsmError::OutOfBounds {
            what: "context slot",
            offset: slot,
            len: 1,
            limit,
        })?;
        if let Some(ctx) = entry {
            if ctx.device_key != id.device_key() {
                return Err(RdsmError::ContextMismatch { slot });
            }
            return Ok(Arc::clone(ctx));
        }

        let ctx = Arc::new(HardwareContext {
            slot,
            device_key: id.device_key(),
            device: fabric.open_device(id, self.cq_depth)?,
            connections: RwLock::new(HashMap::new()),
        });
        let poller = {
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&self.stop);
            let tick = self.poll_tick;
            std::thread::Builder::new()
                .name(format!("rdsm-poller-{slot}"))
                .spawn(move || ctx.poll_loop(tick, stop))?
        };
        self.pollers
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("context pollers"))?
            .push(poller);
        tracing::debug!(slot, cq_depth = self.cq_depth, "created hardware context");
        *entry = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    pub(crate) fn get(&self, slot: Slot) -> Option<Arc<HardwareContext<F>>> {
        self.slots.lock().ok()?.get(slot)?.clone()
    }

    /// Number of slots holding a context.
    pub(crate) fn live(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().filter(|c| c.is_some()).count())
            .unwrap_or(0)
    }

    /// Join every poller. The stop signal must already be raised.
    pub(crate) fn shutdown(&self) {
        let handles = match self.pollers.lock() {
            Ok(mut p) => std::mem::take(&mut *p),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("completion poller panicked");
            }
        }
        if let Ok(mut slots) = self.slots.lock() {
            for ctx in slots.iter_mut().filter_map(Option::take) {
                if let Ok(mut conns) = ctx.connections.write() {
                    conns.clear();
                }
            }
        }
    }
}
