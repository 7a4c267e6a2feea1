use super::ConnectionChecker;
use crate::scenario::NamedHostAndPort;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// 제한 시간 안에 TCP 연결이 맺어지는지로 도달 여부를 판단한다.
#[derive(Debug, Clone)]
pub struct TcpConnectionChecker {
    timeout: Duration,
}

impl Default for TcpConnectionChecker {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl TcpConnectionChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionChecker for TcpConnectionChecker {
    async fn can_connect_to(&self, agent: &NamedHostAndPort) -> bool {
        let address = (agent.host.as_str(), agent.port);
        match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                warn!("Unable to connect to {agent} ({:?}: {err})", err.kind());
                false
            }
            Err(_) => {
                warn!(
                    "Unable to connect to {agent} (timed out after {}ms)",
                    self.timeout.as_millis()
                );
                false
            }
        }
    }
}
