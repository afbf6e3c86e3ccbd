//! Connections to several queue daemons, with per-endpoint circuit breaking.
//!
//! Each endpoint counts consecutive failures. Reaching the configured
//! threshold opens its circuit, taking it out of rotation until the reset
//! window passes or a connection to it succeeds again. A pool is owned by a
//! single worker task and is not shared.
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Connection, Connector};
use crate::error::{PoolError, TransportError};

/// Index of an endpoint within its pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EndpointId(usize);

impl EndpointId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
}

pub struct Endpoint {
    address: String,
    conn: Option<Box<dyn Connection>>,
    failures: u32,
    circuit: CircuitState,
    last_failure: Option<Instant>,
}

impl Endpoint {
    fn new(address: String) -> Self {
        Self {
            address,
            conn: None,
            failures: 0,
            circuit: CircuitState::Closed,
            last_failure: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the endpoint holds an open connection.
    pub fn is_alive(&self) -> bool {
        self.conn.is_some()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn circuit(&self) -> CircuitState {
        self.circuit
    }

    /// Closed circuits always allow requests; open ones once the reset
    /// window since the last failure has passed.
    fn allows_request(&self, now: Instant, reset: Duration) -> bool {
        match (self.circuit, self.last_failure) {
            (CircuitState::Closed, _) | (CircuitState::Open, None) => true,
            (CircuitState::Open, Some(at)) => now.duration_since(at) >= reset,
        }
    }

    fn trip(&mut self) {
        self.circuit = CircuitState::Open;
        self.conn = None;
    }
}

type ReconnectCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct ConnectionPool {
    endpoints: Vec<Endpoint>,
    /// Index of the endpoint most recently picked.
    cursor: Option<usize>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    /// Watchlist applied to every connection the pool opens.
    tubes: Vec<String>,
    on_reconnect: Option<ReconnectCallback>,
}

impl ConnectionPool {
    pub fn new<I, S>(
        addresses: I,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<Endpoint> =
            addresses.into_iter().map(|a| Endpoint::new(a.into())).collect();

        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoints);
        }

        Ok(Self {
            endpoints,
            cursor: None,
            connector,
            config,
            tubes: Vec::new(),
            on_reconnect: None,
        })
    }

    /// Sets a callback run with the endpoint address after every successful
    /// reconnect.
    pub fn set_on_reconnect(
        &mut self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) {
        self.on_reconnect = Some(Box::new(callback));
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, id: EndpointId) -> &Endpoint {
        &self.endpoints[id.0]
    }

    /// The endpoint most recently picked.
    pub fn current(&self) -> Option<EndpointId> {
        self.cursor.map(EndpointId)
    }

    /// Chooses the next endpoint whose circuit allows a request, rotating
    /// from the last pick. When every circuit is open the next endpoint in
    /// rotation is returned anyway; callers still have to try it.
    pub fn pick(&mut self) -> EndpointId {
        let now = Instant::now();
        let reset = self.config.circuit_reset();
        let len = self.endpoints.len();
        let start = self.cursor.map_or(0, |c| (c + 1) % len);

        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| self.endpoints[i].allows_request(now, reset))
            .unwrap_or(start);

        self.cursor = Some(index);
        EndpointId(index)
    }

    /// The connection for `id`, opened on demand. A failed open counts
    /// against the endpoint. Once no endpoint is alive or allowed to try,
    /// this fails with [`PoolError::NoActiveConnection`] without opening
    /// anything, leaving recovery to [`Self::reconnect_with_backoff`].
    pub async fn connection(
        &mut self,
        id: EndpointId,
    ) -> Result<&mut (dyn Connection + 'static), PoolError> {
        if !self.endpoints[id.0].is_alive() {
            if !self.has_usable_endpoint() {
                return Err(PoolError::NoActiveConnection);
            }

            if let Err(error) = self.open(id.0).await {
                warn!(
                    address = %self.endpoints[id.0].address,
                    %error,
                    "connect failed"
                );
                self.fail(id);

                if !self.has_usable_endpoint() {
                    return Err(PoolError::NoActiveConnection);
                }
                return Err(error.into());
            }
        }

        self.endpoints[id.0]
            .conn
            .as_deref_mut()
            .ok_or(PoolError::NoActiveConnection)
    }

    async fn open(&mut self, index: usize) -> Result<(), TransportError> {
        let endpoint = &mut self.endpoints[index];

        let mut conn = self.connector.connect(&endpoint.address).await?;
        conn.watch(&self.tubes).await?;

        debug!(address = %endpoint.address, "endpoint connected");
        endpoint.conn = Some(conn);

        Ok(())
    }

    fn has_usable_endpoint(&self) -> bool {
        let now = Instant::now();
        let reset = self.config.circuit_reset();

        self.endpoints
            .iter()
            .any(|e| e.is_alive() || e.allows_request(now, reset))
    }

    /// Records a successful request, closing the endpoint's circuit.
    pub fn success(&mut self, id: EndpointId) {
        let endpoint = &mut self.endpoints[id.0];

        if endpoint.circuit == CircuitState::Open {
            info!(address = %endpoint.address, "circuit closed");
        }

        endpoint.failures = 0;
        endpoint.circuit = CircuitState::Closed;
    }

    /// Records a failed request, opening the circuit at the threshold.
    pub fn fail(&mut self, id: EndpointId) {
        let threshold = self.config.failure_threshold;
        let endpoint = &mut self.endpoints[id.0];

        endpoint.failures += 1;
        endpoint.last_failure = Some(Instant::now());

        if endpoint.failures >= threshold
            && endpoint.circuit == CircuitState::Closed
        {
            warn!(
                address = %endpoint.address,
                failures = endpoint.failures,
                "circuit opened"
            );
            endpoint.trip();
        }
    }

    /// Takes an endpoint out of rotation at once, dropping its connection.
    pub fn deactivate(&mut self, id: EndpointId) {
        let endpoint = &mut self.endpoints[id.0];

        endpoint.failures += 1;
        endpoint.last_failure = Some(Instant::now());
        endpoint.trip();

        warn!(address = %endpoint.address, "endpoint deactivated");
    }

    /// Runs `body` against a picked connection, moving to another endpoint
    /// on transient failures. Gives up with [`PoolError::CircuitOpen`] after
    /// the configured number of attempts; other errors are returned as is.
    pub async fn retryable<T, F>(&mut self, mut body: F) -> Result<T, PoolError>
    where
        F: for<'c> FnMut(
            &'c mut (dyn Connection + 'static),
        ) -> BoxFuture<'c, Result<T, TransportError>>,
    {
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let id = self.pick();

            let conn = match self.connection(id).await {
                Ok(conn) => conn,
                Err(PoolError::NoActiveConnection) => {
                    self.reconnect_with_backoff().await?;
                    continue;
                },
                Err(error) => {
                    debug!(attempt, %error, "endpoint unavailable");
                    continue;
                },
            };

            match body(conn).await {
                Ok(value) => {
                    self.success(id);
                    return Ok(value);
                },
                Err(error) if error.is_transient() => {
                    warn!(attempt, %error, "request failed; trying again");
                    self.deactivate(id);
                },
                Err(error) => return Err(error.into()),
            }
        }

        Err(PoolError::CircuitOpen { attempts })
    }

    /// Reopens a connection after every endpoint has gone away. Each round
    /// pauses, then sweeps all endpoints; the pause starts at the base delay
    /// and doubles up to the configured cap.
    pub async fn reconnect_with_backoff(
        &mut self,
    ) -> Result<EndpointId, PoolError> {
        if let Some(index) = self.endpoints.iter().position(Endpoint::is_alive)
        {
            return Ok(EndpointId(index));
        }

        let rounds = self.config.reconnect_attempts.max(1);
        let max_delay = self.config.reconnect_max_delay();
        let mut delay = self.config.reconnect_base_delay();
        let len = self.endpoints.len();

        for round in 1..=rounds {
            warn!(round, ?delay, "no endpoint reachable; backing off");
            sleep(delay).await;
            delay = (delay * 2).min(max_delay);

            let start = self.cursor.map_or(0, |c| (c + 1) % len);

            for offset in 0..len {
                let index = (start + offset) % len;
                let id = EndpointId(index);

                match self.open(index).await {
                    Ok(()) => {
                        self.success(id);
                        self.cursor = Some(index);

                        let address = self.endpoints[index].address.as_str();
                        info!(%address, round, "reconnected");
                        if let Some(callback) = &self.on_reconnect {
                            callback(address);
                        }

                        return Ok(id);
                    },
                    Err(error) => {
                        debug!(
                            address = %self.endpoints[index].address,
                            %error,
                            "reconnect attempt failed"
                        );
                        self.fail(id);
                    },
                }
            }
        }

        Err(PoolError::NoActiveConnection)
    }

    /// Sets the watchlist of every current and future connection. Endpoints
    /// that fail to apply it are deactivated.
    pub async fn watch(&mut self, tubes: Vec<String>) {
        self.tubes = tubes;

        for index in 0..self.endpoints.len() {
            let result = match self.endpoints[index].conn.as_mut() {
                Some(conn) => conn.watch(&self.tubes).await,
                None => continue,
            };

            if let Err(error) = result {
                warn!(
                    address = %self.endpoints[index].address,
                    %error,
                    "applying watchlist failed"
                );
                self.deactivate(EndpointId(index));
            }
        }
    }
}
