//! Partition runtime
//!
//! Messages the core dispatches are queued to a single partition task which
//! plays every configured service. Completions travel back to the secure
//! core task, which owns all calls into `Spm::complete`.

use std::collections::HashMap;

use libnyx_spm::service::Sid;
use libnyx_spm::{Completion, Message, MessageBackend, MessageType, PsaError, PsaStatus, PSA_SUCCESS};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{Behaviour, WardenConfig};
use crate::platform::HostMemory;

/// A served message and the status its service answered with
pub type Completed = (Message, PsaStatus);

/// Service behaviours keyed by SID
#[derive(Debug, Clone, Default)]
pub struct Behaviours {
    by_sid: HashMap<Sid, Behaviour>,
}

impl Behaviours {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            by_sid: config.services.iter().map(|s| (s.sid, s.behaviour)).collect(),
        }
    }

    pub fn get(&self, sid: Sid) -> Behaviour {
        self.by_sid.get(&sid).copied().unwrap_or_default()
    }
}

/// Dispatch backend handing messages to the partition task
///
/// Inline services answer inside `submit`; everything else is deferred.
pub struct HostBackend {
    requests: mpsc::UnboundedSender<Message>,
    behaviours: Behaviours,
}

impl HostBackend {
    pub fn new(requests: mpsc::UnboundedSender<Message>, behaviours: Behaviours) -> Self {
        Self { requests, behaviours }
    }
}

impl MessageBackend for HostBackend {
    fn submit(&self, msg: &mut Message) -> Result<Completion, PsaError> {
        if let Behaviour::Inline { status } = self.behaviours.get(msg.sid) {
            let result = match msg.ty {
                MessageType::Call(_) => {
                    for vec in msg.out_vecs_mut() {
                        vec.len = 0;
                    }
                    status
                }
                MessageType::Connect | MessageType::Disconnect => PSA_SUCCESS,
            };
            trace!("backend: {:#x} answered inline with {}", msg.sid, result);
            return Ok(Completion::Replied(result));
        }

        self.requests.send(*msg).map_err(|_| {
            warn!("backend: partition runtime is gone, dropping {:?} for {:#x}", msg.ty, msg.sid);
            PsaError::GenericError
        })?;
        Ok(Completion::Deferred)
    }
}

/// The task serving deferred messages
pub struct PartitionRuntime {
    memory: &'static HostMemory,
    behaviours: Behaviours,
    requests: mpsc::UnboundedReceiver<Message>,
    completions: mpsc::UnboundedSender<Completed>,
}

impl PartitionRuntime {
    pub fn new(
        memory: &'static HostMemory,
        behaviours: Behaviours,
        requests: mpsc::UnboundedReceiver<Message>,
        completions: mpsc::UnboundedSender<Completed>,
    ) -> Self {
        Self {
            memory,
            behaviours,
            requests,
            completions,
        }
    }

    /// Serve until the backend goes away
    pub async fn run(mut self) {
        while let Some(mut msg) = self.requests.recv().await {
            let status = self.serve(&mut msg);
            if self.completions.send((msg, status)).is_err() {
                break;
            }
        }
        debug!("partition runtime stopped");
    }

    /// Play the service `msg` is addressed to
    ///
    /// Connection setup and teardown are always accepted. Output vector
    /// lengths are updated in place to the bytes actually written.
    pub fn serve(&self, msg: &mut Message) -> PsaStatus {
        let MessageType::Call(ty) = msg.ty else {
            trace!("runtime: {:?} on {:#x} accepted", msg.ty, msg.handle);
            return PSA_SUCCESS;
        };

        match self.behaviours.get(msg.sid) {
            Behaviour::Echo => match self.echo(msg) {
                Ok(written) => {
                    trace!("runtime: echoed {} bytes for call type {}", written, ty);
                    PSA_SUCCESS
                }
                Err(err) => {
                    warn!("runtime: echo on {:#x} failed: {}", msg.sid, err);
                    err.status()
                }
            },
            Behaviour::Status { status } | Behaviour::Inline { status } => {
                for vec in msg.out_vecs_mut() {
                    vec.len = 0;
                }
                status
            }
        }
    }

    fn echo(&self, msg: &mut Message) -> Result<usize, PsaError> {
        let mut input = Vec::new();
        for vec in msg.in_vecs() {
            let bytes = self.memory.read_vec(vec).map_err(|_| PsaError::InvalidArgument)?;
            input.extend(bytes);
        }

        let mut rest = input.as_slice();
        let mut written = 0;
        for vec in msg.out_vecs_mut() {
            let n = rest.len().min(vec.len as usize);
            if n > 0 {
                self.memory
                    .write(vec.base, &rest[..n])
                    .map_err(|_| PsaError::InvalidArgument)?;
            }
            rest = &rest[n..];
            vec.len = n as u32;
            written += n;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use libnyx_spm::{IoVec, ReplyOwner};

    fn behaviours(behaviour: Behaviour) -> Behaviours {
        let mut config = WardenConfig::default();
        config.services.push(ServiceConfig {
            name: "svc".into(),
            sid: 0x40,
            version: 1,
            policy: Default::default(),
            stateless: false,
            ns_accessible: true,
            partition: 1,
            behaviour,
        });
        Behaviours::from_config(&config)
    }

    fn call(invecs: &[IoVec], outvecs: &[IoVec]) -> Message {
        let mut msg = Message::new(0x101, 0x40, MessageType::Call(0), -1, ReplyOwner::Local);
        msg.set_vectors(invecs, outvecs).unwrap();
        msg
    }

    fn runtime(
        memory: &'static HostMemory,
        behaviour: Behaviour,
    ) -> (PartitionRuntime, mpsc::UnboundedSender<Message>, mpsc::UnboundedReceiver<Completed>) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        (PartitionRuntime::new(memory, behaviours(behaviour), req_rx, done_tx), req_tx, done_rx)
    }

    #[test]
    fn test_echo_spreads_input_over_outputs() {
        let memory: &'static HostMemory = Box::leak(Box::new(HostMemory::new(1024)));
        let a = memory.place(b"hello ").unwrap();
        let b = memory.place(b"world").unwrap();
        let o1 = memory.alloc(4).unwrap();
        let o2 = memory.alloc(16).unwrap();

        let (rt, _tx, _rx) = runtime(memory, Behaviour::Echo);
        let mut msg = call(
            &[IoVec::new(a, 6), IoVec::new(b, 5)],
            &[IoVec::new(o1, 4), IoVec::new(o2, 16)],
        );
        assert_eq!(rt.serve(&mut msg), PSA_SUCCESS);
        assert_eq!(msg.out_vecs()[0].len, 4);
        assert_eq!(msg.out_vecs()[1].len, 7);

        let mut out = [0u8; 7];
        memory.read(o2, &mut out).unwrap();
        assert_eq!(&out, b"o world");
    }

    #[test]
    fn test_status_service_writes_nothing() {
        let memory: &'static HostMemory = Box::leak(Box::new(HostMemory::new(64)));
        let (rt, _tx, _rx) = runtime(memory, Behaviour::Status { status: -135 });
        let mut msg = call(&[], &[IoVec::new(0x20, 8)]);
        assert_eq!(rt.serve(&mut msg), -135);
        assert_eq!(msg.out_vecs()[0].len, 0);
    }

    #[test]
    fn test_inline_backend_answers_without_queueing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = HostBackend::new(tx, behaviours(Behaviour::Inline { status: 3 }));
        let mut msg = call(&[], &[IoVec::new(0x20, 8)]);
        assert_eq!(backend.submit(&mut msg), Ok(Completion::Replied(3)));
        assert_eq!(msg.out_vecs()[0].len, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deferred_messages_complete_through_the_runtime() {
        let memory: &'static HostMemory = Box::leak(Box::new(HostMemory::new(64)));
        let (rt, tx, mut done) = runtime(memory, Behaviour::Status { status: 9 });
        let backend = HostBackend::new(tx, behaviours(Behaviour::Status { status: 9 }));
        let task = tokio::spawn(rt.run());

        let mut msg = call(&[], &[]);
        assert_eq!(backend.submit(&mut msg), Ok(Completion::Deferred));
        let (served, status) = done.recv().await.unwrap();
        assert_eq!(served.handle, 0x101);
        assert_eq!(status, 9);

        drop(backend);
        task.await.unwrap();
    }
}
