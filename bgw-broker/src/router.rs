use bgwp_node::DeviceAddress;
use futures::prelude::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cloud::{DeviceHandle, Telemetry};

#[derive(Debug, Default)]
struct RouterStats {
    forwarded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug)]
enum Outbound {
    Activate,
    Publish(Telemetry),
    Cleanup,
}

#[derive(Debug)]
struct DeviceStream {
    sender: UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// Forwards status telemetry to the device's cloud handle. Each device
/// gets its own publish stream so reports stay in order per device while
/// a slow cloud call for one device never holds up another, or the
/// coordinator.
///
/// Handle lifecycle calls travel the same stream, so a release is applied
/// only after every report queued before it has been published.
#[derive(Debug, Default)]
pub struct TelemetryRouter {
    streams: HashMap<DeviceAddress, DeviceStream>,
    // released streams still draining; the next stream for the address
    // starts only after its predecessor finished
    draining: HashMap<DeviceAddress, JoinHandle<()>>,
    stats: Arc<RouterStats>,
}

impl TelemetryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device is being served again
    pub fn activate(&mut self, handle: Arc<dyn DeviceHandle>) {
        self.push(handle, Outbound::Activate);
    }

    pub fn forward(&mut self, handle: Arc<dyn DeviceHandle>, telemetry: Telemetry) {
        self.push(handle, Outbound::Publish(telemetry));
    }

    /// Run `cleanup` on the handle once everything queued for the device
    /// has been published
    pub fn release(&mut self, handle: Arc<dyn DeviceHandle>) {
        let address = handle.address().clone();
        match self.streams.remove(&address) {
            Some(stream) => {
                if stream.sender.send(Outbound::Cleanup).is_err() {
                    log::warn!("{address:}: publish stream gone, cleaning up inline");
                    handle.cleanup();
                }
                self.draining.insert(address, stream.task);
            }
            None => handle.cleanup(),
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.stats.forwarded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    fn push(&mut self, handle: Arc<dyn DeviceHandle>, item: Outbound) {
        let address = handle.address().clone();
        let item = match self.streams.get(&address) {
            Some(stream) => match stream.sender.send(item) {
                Ok(()) => return,
                // publish task is gone, start a new one below
                Err(e) => e.0,
            },
            None => item,
        };

        let previous = self.draining.remove(&address);
        let stream = self.spawn_stream(handle, previous);
        if stream.sender.send(item).is_err() {
            log::error!("{address:}: unable to queue telemetry");
        }
        self.streams.insert(address, stream);
    }

    fn spawn_stream(
        &self,
        handle: Arc<dyn DeviceHandle>,
        previous: Option<JoinHandle<()>>,
    ) -> DeviceStream {
        let (sender, receiver) = unbounded_channel();
        let stats = self.stats.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await.ok();
            }
            log::trace!("Telemetry stream for {} started", handle.address());
            let mut stream = UnboundedReceiverStream::new(receiver);
            while let Some(item) = stream.next().await {
                match item {
                    Outbound::Activate => handle.activate(),
                    Outbound::Publish(telemetry) => match handle.publish(telemetry).await {
                        Ok(()) => {
                            stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Failure to publish telemetry for {}: {e:}",
                                handle.address()
                            );
                        }
                    },
                    Outbound::Cleanup => handle.cleanup(),
                }
            }
            log::trace!("Telemetry stream for {} closing", handle.address());
        });
        DeviceStream { sender, task }
    }
}
