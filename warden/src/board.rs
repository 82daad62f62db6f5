//! Simulated dual-core board
//!
//! [`Board::boot`] builds the secure image from a [`WardenConfig`] and starts
//! two tasks: the secure core, which services the mailbox doorbell and routes
//! completions, and the partition runtime. The image lives for the rest of
//! the process.

use std::sync::Arc;
use std::time::Duration;

use libnyx_spm::mailbox::NsMailbox;
use libnyx_spm::service::PartitionInfo;
use libnyx_spm::{MailboxAgent, NsMailboxQueue, Rpc, ServiceDescriptor, Spm, StaticDirectory};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::NsClient;
use crate::config::WardenConfig;
use crate::error::WardenError;
use crate::platform::{HostHal, HostMemory};
use crate::runtime::{Behaviours, Completed, HostBackend, PartitionRuntime};

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// A booted board
pub struct Board {
    spm: &'static Spm<'static>,
    rpc: &'static Rpc<'static>,
    hal: &'static HostHal,
    memory: &'static HostMemory,
    queue: &'static NsMailboxQueue,
    slots: usize,
    reply_timeout: Duration,
    doorbell: Arc<Notify>,
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Board {
    /// Build the image and start both cores
    ///
    /// Must be called from within a tokio runtime.
    pub fn boot(config: &WardenConfig) -> Result<Self, WardenError> {
        config.validate()?;

        let (services, partitions) = config.directory_tables();
        let services: &'static [ServiceDescriptor] = Box::leak(services.into_boxed_slice());
        let partitions: &'static [PartitionInfo] = Box::leak(partitions.into_boxed_slice());
        let directory = leak(StaticDirectory::new(services, partitions));

        let behaviours = Behaviours::from_config(config);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let backend = leak(HostBackend::new(req_tx, behaviours.clone()));
        let spm = leak(Spm::new(directory, backend));

        let hal = leak(HostHal::new(config.client_id_range()?));
        let memory = leak(HostMemory::new(config.mailbox.ns_memory));
        let queue: &'static NsMailboxQueue = leak(NsMailboxQueue::new());
        let slots = config.mailbox.slots;

        let rpc = leak(Rpc::new());
        let agent = leak(MailboxAgent::init(spm, hal, memory, queue, slots)?);
        agent.register(rpc)?;

        let doorbell = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());
        let runtime = PartitionRuntime::new(memory, behaviours, req_rx, done_tx);
        let tasks = vec![
            tokio::spawn(runtime.run()),
            tokio::spawn(secure_core(
                spm,
                rpc,
                Arc::clone(&doorbell),
                Arc::clone(&shutdown),
                done_rx,
            )),
        ];

        info!(
            "board up: {} services, {} partitions, {} mailbox slots",
            services.len(),
            partitions.len(),
            slots
        );
        Ok(Self {
            spm,
            rpc,
            hal,
            memory,
            queue,
            slots,
            reply_timeout: Duration::from_millis(config.mailbox.reply_timeout_ms),
            doorbell,
            shutdown,
            tasks,
        })
    }

    /// The secure core's SPM, for co-located secure callers
    pub fn spm(&self) -> &'static Spm<'static> {
        self.spm
    }

    /// Whether the mailbox transport is registered
    pub fn transport_registered(&self) -> bool {
        self.rpc.is_registered()
    }

    pub fn hal(&self) -> &'static HostHal {
        self.hal
    }

    pub fn memory(&self) -> &'static HostMemory {
        self.memory
    }

    /// A non-secure client talking to this board
    pub fn ns_client(&self) -> NsClient {
        NsClient::new(
            NsMailbox::new(self.queue, self.hal, self.slots),
            self.memory,
            Arc::clone(&self.doorbell),
            self.hal.peer(),
            self.reply_timeout,
        )
    }

    /// Stop both cores
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        info!("board down");
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Secure core loop
///
/// Every call into the core happens here, so mailbox passes and completion
/// routing never interleave.
async fn secure_core(
    spm: &'static Spm<'static>,
    rpc: &'static Rpc<'static>,
    doorbell: Arc<Notify>,
    shutdown: Arc<Notify>,
    mut completions: mpsc::UnboundedReceiver<Completed>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = doorbell.notified() => rpc.handle_req(),
            Some((msg, status)) = completions.recv() => {
                let reply = spm.complete(&msg, status);
                if !rpc.reply(&reply) {
                    debug!("completion for {:#x} stays local ({})", msg.handle, reply.status);
                }
            }
        }
    }
    debug!("secure core stopped");
}
