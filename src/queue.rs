use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::env::{BEANSTALKD_HOST, BEANSTALKD_PORT, BEANSTALK_TUBE};

/// Message handed to the asynchronous worker when a mutating job is
/// submitted: once the job finishes, the worker drops the lock key and
/// flushes the listed cache keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobLockMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub cluster: String,
    pub instance: String,
    pub job_id: String,
    pub lock_key: String,
    pub flush_keys: Vec<String>,
}

impl JobLockMessage {
    pub fn new(cluster: &str, instance: &str, job_id: &str, lock_key: &str, flush_keys: Vec<String>) -> Self {
        JobLockMessage {
            kind: "JOB_LOCK".to_owned(),
            cluster: cluster.to_owned(),
            instance: instance.to_owned(),
            job_id: job_id.to_owned(),
            lock_key: lock_key.to_owned(),
            flush_keys,
        }
    }
}

/// Outcome of a fail-open publish. Abandoned deliveries are logged by the
/// caller and treated as non-fatal; the stale cache they leave behind is
/// the accepted cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Abandoned(String),
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &JobLockMessage) -> Delivery;
}

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Beanstalkd producer. Only the `use`/`put` half of the protocol is
/// spoken; consuming is the worker's business.
pub struct BeanstalkQueue {
    addr: String,
    tube: Option<String>,
}

impl BeanstalkQueue {
    pub fn new() -> Self {
        BeanstalkQueue {
            addr: format!("{}:{}", BEANSTALKD_HOST.as_str(), *BEANSTALKD_PORT),
            tube: BEANSTALK_TUBE.clone(),
        }
    }

    pub fn with_addr(addr: &str, tube: Option<String>) -> Self {
        BeanstalkQueue {
            addr: addr.to_owned(),
            tube,
        }
    }

    async fn connect(&self) -> Option<TcpStream> {
        for attempt in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!(
                        addr = self.addr.as_str(),
                        attempt,
                        error = e.to_string().as_str(),
                        "beanstalkd connect failed"
                    );
                    sleep(CONNECT_BACKOFF).await;
                }
            }
        }
        None
    }

    async fn put(&self, stream: TcpStream, payload: &[u8]) -> anyhow::Result<()> {
        let mut stream = BufReader::new(stream);
        if let Some(tube) = &self.tube {
            stream
                .get_mut()
                .write_all(format!("use {}\r\n", tube).as_bytes())
                .await?;
            let mut line = String::new();
            stream.read_line(&mut line).await?;
            if !line.starts_with("USING") {
                anyhow::bail!("unexpected use reply: {}", line.trim_end());
            }
        }
        let header = format!("put 0 0 120 {}\r\n", payload.len());
        stream.get_mut().write_all(header.as_bytes()).await?;
        stream.get_mut().write_all(payload).await?;
        stream.get_mut().write_all(b"\r\n").await?;
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        if !line.starts_with("INSERTED") {
            anyhow::bail!("unexpected put reply: {}", line.trim_end());
        }
        Ok(())
    }
}

impl Default for BeanstalkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for BeanstalkQueue {
    async fn publish(&self, message: &JobLockMessage) -> Delivery {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(e) => return Delivery::Abandoned(e.to_string()),
        };
        let stream = match self.connect().await {
            Some(s) => s,
            None => {
                return Delivery::Abandoned(format!(
                    "beanstalkd unreachable after {} attempts",
                    CONNECT_ATTEMPTS
                ))
            }
        };
        match self.put(stream, &payload).await {
            Ok(()) => Delivery::Delivered,
            Err(e) => Delivery::Abandoned(e.to_string()),
        }
    }
}
