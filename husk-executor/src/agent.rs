//! In-guest agent credentials and readiness.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::TimeoutTarget;
use crate::unix_client::tcp_get;
use crate::ExecutorError;

/// Per-request bound on a health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fresh bearer token: 32 random bytes, base64url without padding.
///
/// # Errors
/// Fails if the OS random source is unavailable.
pub fn generate_token() -> Result<String, ExecutorError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).map_err(|e| ExecutorError::Io(std::io::Error::other(e.to_string())))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Polls `GET /health` on the agent until it answers 2xx.
///
/// # Errors
/// Returns [`ExecutorError::Timeout`] with [`TimeoutTarget::Agent`] once
/// `timeout` has elapsed without a healthy answer.
pub async fn wait_for_agent(ip: Ipv4Addr, port: u16, timeout: Duration, poll: Duration) -> Result<(), ExecutorError> {
    let addr = SocketAddr::from((ip, port));
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout(PROBE_TIMEOUT, tcp_get(addr, "/health")).await {
            Ok(Ok(resp)) if resp.is_success() => {
                tracing::info!(agent = %addr, "guest agent is ready");
                return Ok(());
            }
            Ok(Ok(resp)) => tracing::debug!(agent = %addr, status = resp.status, "agent not healthy yet"),
            Ok(Err(e)) => tracing::debug!(agent = %addr, error = %e, "agent unreachable"),
            Err(_) => tracing::debug!(agent = %addr, "agent probe timed out"),
        }
        if tokio::time::Instant::now() + poll > deadline {
            return Err(ExecutorError::timeout(TimeoutTarget::Agent, addr, timeout));
        }
        tokio::time::sleep(poll).await;
    }
}
