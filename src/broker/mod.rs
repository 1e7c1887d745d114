//! Work-queue broker seam.
//!
//! The pipeline only needs the six beanstalkd primitives below. Production
//! code talks to a real server through [`BeanstalkClient`]; tests use the
//! in-memory broker.

pub mod beanstalk;
#[cfg(test)]
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use beanstalk::BeanstalkClient;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("job {0} not found")]
    NotFound(u64),

    #[error("job was buried by the server: {0}")]
    Buried(u64),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response to {command}: {response}")]
    Unexpected { command: &'static str, response: String },

    #[error("no answer to reserve within {0:?}")]
    Hung(Duration),
}

impl BrokerError {
    /// True when the underlying connection is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Io(_) | BrokerError::Closed | BrokerError::Hung(_))
    }

    /// True when the stream may be out of step with the server and must be
    /// replaced before the next command.
    pub fn needs_reconnect(&self) -> bool {
        self.is_connection() || matches!(self, BrokerError::Unexpected { .. })
    }
}

/// A job handed out by `reserve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Job(Job),
    /// Nothing became ready within the timeout. Normal end of a drain.
    TimedOut,
    /// A job reserved by this connection is about to hit its TTR.
    DeadlineSoon,
}

/// Priority/delay/time-to-run applied to every put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub priority: u32,
    pub delay: Duration,
    pub ttr: Duration,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Adds `tube` to the reserve watch list. Returns the number of watched tubes.
    async fn watch(&self, tube: &str) -> Result<u32, BrokerError>;

    /// Removes `tube` from the watch list. Returns the number of watched tubes.
    async fn ignore(&self, tube: &str) -> Result<u32, BrokerError>;

    /// Selects the tube subsequent puts go to.
    async fn use_tube(&self, tube: &str) -> Result<(), BrokerError>;

    async fn put(&self, opts: PutOptions, body: &[u8]) -> Result<u64, BrokerError>;

    async fn reserve_with_timeout(&self, timeout: Duration) -> Result<Reservation, BrokerError>;

    async fn delete(&self, id: u64) -> Result<(), BrokerError>;
}

/// `use` + `put` as one step. Callers serialize through the single pipeline loop.
pub async fn put_on(
    broker: &dyn Broker,
    tube: &str,
    opts: PutOptions,
    body: &[u8],
) -> Result<u64, BrokerError> {
    broker.use_tube(tube).await?;
    broker.put(opts, body).await
}
