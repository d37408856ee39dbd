use n0_error::{Result, StdResultExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// One message on an agent's control stream, line-delimited JSON.
///
/// The broker sends `keep-alive` and `conn-ready`; the agent answers a
/// failed pickup with `pickup-failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ControlMsg {
    pub command: Command,
    /// Pick-up path override. Unused by this broker, kept for wire compat.
    #[serde(rename = "connPath", default, skip_serializing_if = "Option::is_none")]
    pub conn_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Command {
    KeepAlive,
    ConnReady,
    PickupFailed,
    /// Anything newer than this implementation understands.
    #[serde(other)]
    Unknown,
}

impl ControlMsg {
    pub(crate) fn keep_alive() -> Self {
        Self {
            command: Command::KeepAlive,
            conn_path: None,
            err: None,
        }
    }

    pub(crate) fn conn_ready() -> Self {
        Self {
            command: Command::ConnReady,
            conn_path: None,
            err: None,
        }
    }

    pub(crate) fn pickup_failed(err: String) -> Self {
        Self {
            command: Command::PickupFailed,
            conn_path: None,
            err: Some(err),
        }
    }
}

/// Writes one message as a JSON line and flushes it onto the stream.
pub(crate) async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    msg: &ControlMsg,
) -> Result<()> {
    let mut line = serde_json::to_string(msg).anyerr()?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.anyerr()?;
    writer.flush().await.anyerr()?;
    Ok(())
}
