//! Scenario scripts
//!
//! A scenario is a TOML list of steps a non-secure client runs in order.
//! Connections are named by label so later steps can call and close them.
//!
//! ```toml
//! client_id = 0
//!
//! [[step]]
//! op = "connect"
//! sid = 0x100
//! version = 1
//! label = "echo"
//!
//! [[step]]
//! op = "call"
//! connection = "echo"
//! input = ["ping"]
//! output = [16]
//! ```

use std::collections::HashMap;
use std::path::Path;

use libnyx_spm::handle::static_handle;
use libnyx_spm::{ClientId, PsaError, PsaHandle, PSA_NULL_HANDLE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::NsClient;
use crate::config::WardenConfig;
use crate::error::WardenError;

/// A scripted client session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    /// Non-secure client id the requests carry
    #[serde(default)]
    pub client_id: ClientId,

    /// Steps, run in order
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// One client operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    FrameworkVersion,
    Version {
        sid: u32,
    },
    Connect {
        sid: u32,
        #[serde(default = "default_version")]
        version: u32,
        /// Name the handle is stored under
        #[serde(default)]
        label: Option<String>,
    },
    Call {
        /// Labelled connection to call
        #[serde(default)]
        connection: Option<String>,
        /// Stateless service to call through its static handle
        #[serde(default)]
        stateless: Option<u32>,
        #[serde(default = "default_version")]
        version: u32,
        #[serde(default, rename = "type")]
        ty: i32,
        #[serde(default)]
        input: Vec<String>,
        #[serde(default)]
        output: Vec<u32>,
    },
    Close {
        /// Labelled connection; the null handle when absent
        #[serde(default)]
        connection: Option<String>,
    },
}

fn default_version() -> u32 {
    1
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Self::FrameworkVersion => "framework-version",
            Self::Version { .. } => "version",
            Self::Connect { .. } => "connect",
            Self::Call { .. } => "call",
            Self::Close { .. } => "close",
        }
    }
}

/// What one step returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub step: usize,
    pub op: &'static str,
    /// Raw value the mailbox replied with
    pub value: i32,
    /// Output buffers of a successful call, lossily decoded
    pub output: Vec<String>,
}

impl StepResult {
    /// The value as a PSA error, if it is one
    pub fn error(&self) -> Option<PsaError> {
        PsaError::from_status(self.value)
    }
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Run every step against `client`
    ///
    /// Service failures are results, not errors; only transport problems
    /// and unresolvable labels stop the run.
    pub async fn run(&self, client: &NsClient, config: &WardenConfig) -> Result<Vec<StepResult>, WardenError> {
        let mut handles: HashMap<String, PsaHandle> = HashMap::new();
        let mut results = Vec::with_capacity(self.steps.len());

        for (step, op) in self.steps.iter().enumerate() {
            client.reset_memory();
            let mut output = Vec::new();
            let value = match op {
                Step::FrameworkVersion => client.framework_version(self.client_id).await? as i32,
                Step::Version { sid } => client.version(*sid, self.client_id).await? as i32,
                Step::Connect { sid, version, label } => {
                    let handle = client.connect(*sid, *version, self.client_id).await?;
                    if let (Some(label), true) = (label, handle > 0) {
                        handles.insert(label.clone(), handle);
                    }
                    handle
                }
                Step::Call {
                    connection,
                    stateless,
                    version,
                    ty,
                    input,
                    output: out_lens,
                } => {
                    let handle = match (connection, stateless) {
                        (Some(label), None) => lookup(&handles, step, label)?,
                        (None, Some(sid)) => {
                            let index = config.stateless_index(*sid).ok_or_else(|| WardenError::Script {
                                step,
                                reason: format!("service {:#x} is not stateless", sid),
                            })?;
                            static_handle(index, *version as u8)
                        }
                        _ => {
                            return Err(WardenError::Script {
                                step,
                                reason: "call needs exactly one of `connection` or `stateless`".into(),
                            })
                        }
                    };
                    let inputs: Vec<&[u8]> = input.iter().map(|s| s.as_bytes()).collect();
                    let outcome = client.call(handle, *ty, &inputs, out_lens, self.client_id).await?;
                    output = outcome
                        .outputs
                        .iter()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .collect();
                    outcome.status
                }
                Step::Close { connection } => {
                    let handle = match connection {
                        Some(label) => lookup(&handles, step, label)?,
                        None => PSA_NULL_HANDLE,
                    };
                    let status = client.close(handle, self.client_id).await?;
                    if let Some(label) = connection {
                        handles.remove(label);
                    }
                    status
                }
            };

            debug!("step {} ({}) -> {}", step, op.op(), value);
            results.push(StepResult {
                step,
                op: op.op(),
                value,
                output,
            });
        }

        info!("scenario finished: {} steps", results.len());
        Ok(results)
    }
}

fn lookup(handles: &HashMap<String, PsaHandle>, step: usize, label: &str) -> Result<PsaHandle, WardenError> {
    handles.get(label).copied().ok_or_else(|| WardenError::Script {
        step,
        reason: format!("no open connection labelled `{}`", label),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_steps() {
        let scenario: Scenario = toml::from_str(
            r#"
            client_id = 3

            [[step]]
            op = "framework-version"

            [[step]]
            op = "connect"
            sid = 0x100
            label = "echo"

            [[step]]
            op = "call"
            stateless = 0x200
            version = 2
            type = 4
            input = ["abc"]
            output = [8, 8]

            [[step]]
            op = "close"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.client_id, 3);
        assert_eq!(scenario.steps[0], Step::FrameworkVersion);
        assert_eq!(
            scenario.steps[1],
            Step::Connect {
                sid: 0x100,
                version: 1,
                label: Some("echo".into())
            }
        );
        assert!(matches!(
            &scenario.steps[2],
            Step::Call { stateless: Some(0x200), version: 2, ty: 4, output, .. } if output == &[8, 8]
        ));
        assert_eq!(scenario.steps[3], Step::Close { connection: None });
        assert_eq!(scenario.steps[3].op(), "close");
    }

    #[test]
    fn test_unknown_op_rejected() {
        let parsed: Result<Scenario, _> = toml::from_str(
            r#"
            [[step]]
            op = "reboot"
            "#,
        );
        assert!(parsed.is_err());
    }
}
