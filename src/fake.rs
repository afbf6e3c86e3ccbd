//! An in-memory queue daemon for tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::connection::{Connection, Connector};
use crate::error::TransportError;
use crate::hooks::{Flow, HookDetail, HookEvent, Hooks};
use crate::registry::Performable;
use crate::types::message::RawMessage;
use crate::types::protocol::JobStats;
use crate::types::states::JobState;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Call {
    Reserve,
    Put { tube: String, body: String, pri: u32, delay: u32, ttr: u32 },
    Delete(u64),
    Release { id: u64, pri: u32, delay: u32 },
    Bury { id: u64, pri: u32 },
    Stats(u64),
    ListTubes,
    Watch(Vec<String>),
}

#[derive(Default)]
struct Daemon {
    ready: VecDeque<u64>,
    bodies: HashMap<u64, Bytes>,
    stats: HashMap<u64, JobStats>,
    tubes: Vec<String>,
    calls: Vec<(String, Call)>,
    connects: Vec<String>,
    /// Addresses refusing connections.
    down: HashSet<String>,
    /// Addresses whose connections fail every operation.
    broken: HashSet<String>,
    next_id: u64,
}

/// Shared handle to the daemon state; clones see the same daemon.
#[derive(Clone, Default)]
pub(crate) struct FakeDaemon(Arc<Mutex<Daemon>>);

impl FakeDaemon {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Daemon) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }

    /// Queues a ready message, returning its ID.
    pub(crate) fn push(&self, body: &str, ttr: u32) -> u64 {
        self.with(|d| {
            d.next_id += 1;
            let id = d.next_id;
            d.ready.push_back(id);
            d.bodies.insert(id, Bytes::copy_from_slice(body.as_bytes()));
            d.stats.insert(
                id,
                JobStats {
                    id,
                    tube: "enchanted.worker.jobs".to_owned(),
                    state: JobState::Ready,
                    pri: 100,
                    ttr,
                    ..Default::default()
                },
            );
            id
        })
    }

    /// Removes a message as if another client deleted it.
    pub(crate) fn vanish(&self, id: u64) {
        self.with(|d| {
            d.stats.remove(&id);
            d.bodies.remove(&id);
            d.ready.retain(|&r| r != id);
        });
    }

    pub(crate) fn set_buries(&self, id: u64, buries: u64) {
        self.with(|d| {
            if let Some(stats) = d.stats.get_mut(&id) {
                stats.buries = buries;
            }
        });
    }

    pub(crate) fn stats(&self, id: u64) -> Option<JobStats> {
        self.with(|d| d.stats.get(&id).cloned())
    }

    pub(crate) fn set_tubes(&self, tubes: &[&str]) {
        self.with(|d| {
            d.tubes = tubes.iter().map(|t| t.to_string()).collect();
        });
    }

    pub(crate) fn take_down(&self, address: &str) {
        self.with(|d| d.down.insert(address.to_owned()));
    }

    pub(crate) fn bring_up(&self, address: &str) {
        self.with(|d| d.down.remove(address));
    }

    pub(crate) fn break_ops(&self, address: &str) {
        self.with(|d| d.broken.insert(address.to_owned()));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.with(|d| d.calls.iter().map(|(_, c)| c.clone()).collect())
    }

    pub(crate) fn calls_to(&self, address: &str) -> Vec<Call> {
        self.with(|d| {
            d.calls
                .iter()
                .filter(|(a, _)| a == address)
                .map(|(_, c)| c.clone())
                .collect()
        })
    }

    /// Calls other than reserves and stats lookups.
    pub(crate) fn dispositions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Reserve | Call::Stats(_)))
            .collect()
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.with(|d| d.connects.clone())
    }

    pub(crate) fn connection(&self, address: &str) -> FakeConnection {
        FakeConnection {
            url: address.to_owned(),
            daemon: self.clone(),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector(self.clone()))
    }

    /// Records `call` against `url`, failing if the address is broken.
    fn op<T>(
        &self,
        url: &str,
        call: Call,
        f: impl FnOnce(&mut Daemon) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        self.with(|d| {
            d.calls.push((url.to_owned(), call));
            if d.broken.contains(url) {
                return Err(TransportError::NotConnected);
            }
            f(d)
        })
    }
}

pub(crate) struct FakeConnection {
    url: String,
    daemon: FakeDaemon,
}

#[async_trait]
impl Connection for FakeConnection {
    fn url(&self) -> &str {
        &self.url
    }

    async fn reserve(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, TransportError> {
        let message = self.daemon.op(&self.url, Call::Reserve, |d| {
            let Some(id) = d.ready.pop_front() else {
                return Ok(None);
            };
            if let Some(stats) = d.stats.get_mut(&id) {
                stats.state = JobState::Reserved;
                stats.reserves += 1;
            }
            let body = d.bodies.get(&id).cloned().unwrap_or_default();
            Ok(Some(RawMessage { id, body }))
        })?;

        // An empty daemon holds the reserve for the whole timeout.
        if message.is_none() {
            tokio::time::sleep(timeout).await;
        }

        Ok(message)
    }

    async fn put(
        &mut self,
        tube: &str,
        body: Bytes,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<u64, TransportError> {
        let call = Call::Put {
            tube: tube.to_owned(),
            body: String::from_utf8_lossy(&body).into_owned(),
            pri,
            delay,
            ttr,
        };
        self.daemon.op(&self.url, call, |d| {
            d.next_id += 1;
            Ok(d.next_id)
        })
    }

    async fn delete(&mut self, id: u64) -> Result<(), TransportError> {
        self.daemon.op(&self.url, Call::Delete(id), |d| {
            d.bodies.remove(&id);
            d.stats.remove(&id).map(drop).ok_or(TransportError::NotFound)
        })
    }

    async fn release(
        &mut self,
        id: u64,
        pri: u32,
        delay: u32,
    ) -> Result<(), TransportError> {
        let call = Call::Release { id, pri, delay };
        self.daemon.op(&self.url, call, |d| {
            let stats = d.stats.get_mut(&id).ok_or(TransportError::NotFound)?;
            stats.releases += 1;
            stats.pri = pri;
            stats.state = JobState::Ready;
            // Delays are not simulated.
            d.ready.push_back(id);
            Ok(())
        })
    }

    async fn bury(&mut self, id: u64, pri: u32) -> Result<(), TransportError> {
        self.daemon.op(&self.url, Call::Bury { id, pri }, |d| {
            let stats = d.stats.get_mut(&id).ok_or(TransportError::NotFound)?;
            stats.buries += 1;
            stats.pri = pri;
            stats.state = JobState::Buried;
            Ok(())
        })
    }

    async fn stats(&mut self, id: u64) -> Result<JobStats, TransportError> {
        self.daemon.op(&self.url, Call::Stats(id), |d| {
            d.stats.get(&id).cloned().ok_or(TransportError::NotFound)
        })
    }

    async fn list_tubes(&mut self) -> Result<Vec<String>, TransportError> {
        self.daemon
            .op(&self.url, Call::ListTubes, |d| Ok(d.tubes.clone()))
    }

    async fn watch(&mut self, tubes: &[String]) -> Result<(), TransportError> {
        if tubes.is_empty() {
            return Ok(());
        }
        self.daemon
            .op(&self.url, Call::Watch(tubes.to_vec()), |_| Ok(()))
    }
}

pub(crate) struct FakeConnector(FakeDaemon);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.0.with(|d| {
            if d.down.contains(address) {
                return Err(TransportError::NotConnected);
            }
            d.connects.push(address.to_owned());
            Ok(())
        })?;

        Ok(Box::new(self.0.connection(address)))
    }
}

/// Records the arguments of every job it performs.
#[derive(Clone, Default)]
pub(crate) struct Echo(pub(crate) Arc<Mutex<Vec<Vec<Value>>>>);

impl Echo {
    pub(crate) fn performed(&self) -> Vec<Vec<Value>> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl Performable for Echo {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(args.to_vec());
        Ok(())
    }
}

pub(crate) struct Failing;

#[async_trait]
impl Performable for Failing {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        Err(anyhow!("boom"))
    }
}

pub(crate) struct Panicky;

#[async_trait]
impl Performable for Panicky {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        panic!("kaboom")
    }
}

/// Sleeps for the given time before succeeding.
pub(crate) struct Sleepy(pub(crate) Duration);

#[async_trait]
impl Performable for Sleepy {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Hooks logging `event:handler` for every event, plus retry and error
/// details where present.
pub(crate) fn recording_hooks(log: Arc<Mutex<Vec<String>>>) -> Hooks {
    use HookEvent::*;

    let mut hooks = Hooks::new();

    for event in [
        BeforeEnqueue,
        AfterEnqueue,
        BeforePerform,
        AfterPerform,
        OnFailure,
        OnRetry,
        OnBury,
        OnDrop,
        OnReconnect,
    ] {
        let log = log.clone();
        hooks.on(event, move |ctx| {
            let entry = match ctx.detail {
                HookDetail::None => format!("{:?}:{}", ctx.event, ctx.handler),
                HookDetail::Error(e) => {
                    format!("{:?}:{}:{e}", ctx.event, ctx.handler)
                },
                HookDetail::Retry { attempt, delay } => {
                    format!("{:?}:{}:{attempt}:{delay}", ctx.event, ctx.handler)
                },
                HookDetail::Endpoint(url) => format!("{:?}:{url}", ctx.event),
            };
            log.lock().unwrap().push(entry);
            Ok(Flow::Continue)
        });
    }

    hooks
}
