//! In-memory broker for tests.
//!
//! Implements both `BrokerSession` and `ManagementApi` over shared state, so
//! a `QueueGateway` built from it behaves like one bound to a real virtual
//! host: fetched messages stay unacked until settled, reconnecting
//! redelivers them, and the management view reflects the queues.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::queue::{
    BrokerError, BrokerSession, ManagementApi, ManagementError, QueueArguments, QueueGateway,
    QueueInfo, RawDelivery,
};

#[derive(Default)]
struct State {
    queues: BTreeMap<String, VecDeque<Vec<u8>>>,
    arguments: HashMap<String, QueueArguments>,
    unacked: BTreeMap<u64, (String, Vec<u8>)>,
    phantom_ready: HashMap<String, u64>,
    next_tag: u64,
    generation: u64,
    connects: u32,
    published: Vec<(String, Value)>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        let broker = Self::default();
        broker.lock().generation = 1;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn gateway(&self, vhost: &str) -> QueueGateway {
        QueueGateway::new(vhost, Arc::new(self.clone()), Arc::new(self.clone()))
    }

    pub(crate) fn declare(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    pub(crate) fn push(&self, queue: &str, body: Value) {
        self.push_raw(queue, serde_json::to_vec(&body).unwrap());
    }

    pub(crate) fn push_raw(&self, queue: &str, body: Vec<u8>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body);
    }

    /// Make the management API over-report ready messages for `queue`.
    pub(crate) fn set_phantom_ready(&self, queue: &str, count: u64) {
        self.lock().phantom_ready.insert(queue.to_string(), count);
    }

    pub(crate) fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub(crate) fn published(&self) -> Vec<(String, Value)> {
        self.lock().published.clone()
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub(crate) fn rejected(&self) -> Vec<(u64, bool)> {
        self.lock().rejected.clone()
    }

    pub(crate) fn connects(&self) -> u32 {
        self.lock().connects
    }

    fn info(state: &State, name: &str, messages: &VecDeque<Vec<u8>>) -> QueueInfo {
        let ready = messages.len() as u64 + state.phantom_ready.get(name).copied().unwrap_or(0);
        let unacked = state.unacked.values().filter(|(q, _)| q == name).count() as u64;
        QueueInfo {
            name: name.to_string(),
            vhost: None,
            messages_ready: ready,
            messages_unacknowledged: unacked,
            messages: ready + unacked,
            arguments: state.arguments.get(name).cloned().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl BrokerSession for FakeBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.generation += 1;
        state.connects += 1;

        // Channel loss hands unacked messages back to their queues
        let unacked = std::mem::take(&mut state.unacked);
        for (_, (queue, body)) in unacked.into_iter().rev() {
            state.queues.entry(queue).or_default().push_front(body);
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    async fn declare_queue(
        &self,
        queue: &str,
        arguments: &QueueArguments,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_default();
        state
            .arguments
            .insert(queue.to_string(), arguments.clone());
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.queues.remove(queue);
        state.arguments.remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let value = serde_json::from_slice(body).unwrap_or(Value::Null);
        state.published.push((queue.to_string(), value));
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.to_vec());
        Ok(())
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>, BrokerError> {
        let mut state = self.lock();
        let Some(body) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        if !auto_ack {
            state.unacked.insert(tag, (queue.to_string(), body.clone()));
        }
        Ok(Some(RawDelivery { tag, body }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        // Unknown tags close the channel on a real broker
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::NotConnected)?;
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let (queue, body) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::NotConnected)?;
        state.rejected.push((delivery_tag, requeue));
        if requeue {
            state.queues.entry(queue).or_default().push_front(body);
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for FakeBroker {
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, ManagementError> {
        let state = self.lock();
        Ok(state
            .queues
            .iter()
            .map(|(name, messages)| Self::info(&state, name, messages))
            .collect())
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, ManagementError> {
        let state = self.lock();
        let messages = state
            .queues
            .get(queue)
            .ok_or_else(|| ManagementError::InvalidUrl(format!("no queue {queue}")))?;
        Ok(Self::info(&state, queue, messages))
    }
}
