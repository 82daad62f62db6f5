//! Non-secure client
//!
//! Plays the non-secure core: writes requests into the shared mailbox, rings
//! the secure doorbell and waits for the reply bit.

use std::sync::Arc;
use std::time::Duration;

use libnyx_spm::config::PSA_MAX_IOVEC;
use libnyx_spm::mailbox::layout::CallParams;
use libnyx_spm::mailbox::{ClientMemory, NsMailbox, Request};
use libnyx_spm::{ClientId, IoVec, PsaHandle, PsaStatus, Sid, PSA_SUCCESS};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::error::WardenError;
use crate::platform::HostMemory;

/// Upper bound on one wait for the peer doorbell before re-checking
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a `psa_call`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// Status returned by the service
    pub status: PsaStatus,
    /// Bytes written to each output vector (empty unless `status` is success)
    pub outputs: Vec<Vec<u8>>,
}

/// Client of one board's mailbox
pub struct NsClient {
    mailbox: NsMailbox<'static>,
    memory: &'static HostMemory,
    doorbell: Arc<Notify>,
    peer: Arc<Notify>,
    reply_timeout: Duration,
}

impl NsClient {
    pub fn new(
        mailbox: NsMailbox<'static>,
        memory: &'static HostMemory,
        doorbell: Arc<Notify>,
        peer: Arc<Notify>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            mailbox,
            memory,
            doorbell,
            peer,
            reply_timeout,
        }
    }

    /// Submit `request` and wait for its reply value
    pub async fn request(&self, request: &Request, client_id: ClientId) -> Result<i32, WardenError> {
        let idx = self.mailbox.submit(request, client_id)?;
        self.doorbell.notify_one();

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            if let Some(value) = self.mailbox.fetch_reply(idx) {
                trace!("ns client: slot {} replied {}", idx, value);
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WardenError::Timeout(self.reply_timeout));
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = timeout(wait, self.peer.notified()).await;
        }
    }

    /// `psa_framework_version`
    pub async fn framework_version(&self, client_id: ClientId) -> Result<u32, WardenError> {
        let value = self.request(&Request::FrameworkVersion, client_id).await?;
        Ok(value as u32)
    }

    /// `psa_version`
    pub async fn version(&self, sid: Sid, client_id: ClientId) -> Result<u32, WardenError> {
        let value = self.request(&Request::Version { sid }, client_id).await?;
        Ok(value as u32)
    }

    /// `psa_connect`; a positive value is the connection handle
    pub async fn connect(&self, sid: Sid, version: u32, client_id: ClientId) -> Result<PsaHandle, WardenError> {
        self.request(&Request::Connect { sid, version }, client_id).await
    }

    /// `psa_close`
    pub async fn close(&self, handle: PsaHandle, client_id: ClientId) -> Result<PsaStatus, WardenError> {
        self.request(&Request::Close { handle }, client_id).await
    }

    /// `psa_call` with `inputs` copied into non-secure memory and one output
    /// buffer of each length in `out_lens`
    pub async fn call(
        &self,
        handle: PsaHandle,
        ty: i32,
        inputs: &[&[u8]],
        out_lens: &[u32],
        client_id: ClientId,
    ) -> Result<CallOutcome, WardenError> {
        let mut invecs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let base = self.memory.place(input)?;
            invecs.push(IoVec::new(base, input.len() as u32));
        }
        let mut outvecs = Vec::with_capacity(out_lens.len());
        for &len in out_lens {
            outvecs.push(IoVec::new(self.memory.alloc(len as usize)?, len));
        }

        let params = CallParams {
            handle,
            ty,
            in_vec: self.place_array(&invecs)?,
            in_len: invecs.len() as u32,
            out_vec: self.place_array(&outvecs)?,
            out_len: outvecs.len() as u32,
        };
        let status = self.request(&Request::Call(params), client_id).await?;

        let mut outputs = Vec::new();
        if status == PSA_SUCCESS && !outvecs.is_empty() {
            let mut written = vec![IoVec::EMPTY; outvecs.len().min(PSA_MAX_IOVEC)];
            self.memory
                .read_iovecs(params.out_vec, &mut written)
                .map_err(|fault| WardenError::MemoryFault(fault.addr))?;
            for vec in &written {
                outputs.push(
                    self.memory
                        .read_vec(vec)
                        .map_err(|fault| WardenError::MemoryFault(fault.addr))?,
                );
            }
        }
        Ok(CallOutcome { status, outputs })
    }

    /// Arrays with no entries are passed as null
    fn place_array(&self, vecs: &[IoVec]) -> Result<u32, WardenError> {
        if vecs.is_empty() {
            return Ok(0);
        }
        self.memory.place_iovecs(vecs)
    }

    /// Release the non-secure memory used by earlier calls
    pub fn reset_memory(&self) {
        self.memory.reset();
    }

    /// Slots waiting for replies
    pub fn in_flight(&self) -> u32 {
        self.mailbox.in_flight()
    }
}
