use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Broker, BrokerError, Job, PutOptions, Reservation};
use crate::config::DEFAULT_TUBE;

/// In-process broker with beanstalkd tube semantics. Reserve never blocks.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: u64,
    using: String,
    watching: Vec<String>,
    ready: HashMap<String, VecDeque<Job>>,
    reserved: HashMap<u64, (String, Vec<u8>)>,
    puts: Vec<(String, Vec<u8>)>,
    deleted: Vec<u64>,
    calls: usize,
    fail_reserve: Option<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                using: DEFAULT_TUBE.to_string(),
                watching: vec![DEFAULT_TUBE.to_string()],
                ready: HashMap::new(),
                reserved: HashMap::new(),
                puts: Vec::new(),
                deleted: Vec::new(),
                calls: 0,
                fail_reserve: None,
            }),
        }
    }

    /// Enqueues a job directly, as an external producer would.
    pub fn push(&self, tube: &str, body: &[u8]) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .ready
            .entry(tube.to_string())
            .or_default()
            .push_back(Job { id, body: body.to_vec() });
        id
    }

    /// Bodies put on `tube` through the trait, in order.
    pub fn put_bodies(&self, tube: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .puts
            .iter()
            .filter(|(t, _)| t == tube)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn ready_count(&self, tube: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.get(tube).map_or(0, VecDeque::len)
    }

    pub fn is_reserved(&self, id: u64) -> bool {
        self.inner.lock().unwrap().reserved.contains_key(&id)
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.inner.lock().unwrap().deleted.clone()
    }

    /// Number of trait calls made so far.
    pub fn calls(&self) -> usize {
        self.inner.lock().unwrap().calls
    }

    pub fn fail_next_reserve(&self, msg: &str) {
        self.inner.lock().unwrap().fail_reserve = Some(msg.to_string());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn watch(&self, tube: &str) -> Result<u32, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        if !inner.watching.iter().any(|t| t == tube) {
            inner.watching.push(tube.to_string());
        }
        Ok(inner.watching.len() as u32)
    }

    async fn ignore(&self, tube: &str) -> Result<u32, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        if inner.watching.len() > 1 {
            inner.watching.retain(|t| t != tube);
        }
        Ok(inner.watching.len() as u32)
    }

    async fn use_tube(&self, tube: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        inner.using = tube.to_string();
        Ok(())
    }

    async fn put(&self, _opts: PutOptions, body: &[u8]) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        let id = inner.next_id;
        inner.next_id += 1;
        let tube = inner.using.clone();
        inner.puts.push((tube.clone(), body.to_vec()));
        inner
            .ready
            .entry(tube)
            .or_default()
            .push_back(Job { id, body: body.to_vec() });
        Ok(id)
    }

    async fn reserve_with_timeout(&self, _timeout: Duration) -> Result<Reservation, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        if let Some(msg) = inner.fail_reserve.take() {
            return Err(BrokerError::Server(msg));
        }
        let watching = inner.watching.clone();
        for tube in watching {
            let job = inner.ready.get_mut(&tube).and_then(VecDeque::pop_front);
            if let Some(job) = job {
                inner.reserved.insert(job.id, (tube, job.body.clone()));
                return Ok(Reservation::Job(job));
            }
        }
        Ok(Reservation::TimedOut)
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls += 1;
        match inner.reserved.remove(&id) {
            Some(_) => {
                inner.deleted.push(id);
                Ok(())
            }
            None => Err(BrokerError::NotFound(id)),
        }
    }
}
