use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::client::websocket::{TungsteniteConnector, WsClient, WsConnector};
use crate::client::{Executor, Statement};
use crate::config::NeonConfig;
use crate::error::{NeonError, Result};
use crate::options::{QueryOptions, TransactionOptions};
use crate::result::QueryResult;
use crate::types::{TextConverter, TypeConverter};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Clients that exist, idle or leased.
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: bool,
}

#[derive(Default)]
struct PoolState {
    /// Most recently released last.
    idle: Vec<Arc<WsClient>>,
    live: usize,
    leased: usize,
    closed: bool,
}

struct PoolInner {
    config: Arc<NeonConfig>,
    connector: Arc<dyn WsConnector>,
    converter: Arc<dyn TypeConverter>,
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a leased client back. Returns it when it has to be discarded
    /// instead.
    fn check_in(&self, client: Arc<WsClient>) -> Option<Arc<WsClient>> {
        let mut st = self.state();
        st.leased -= 1;
        if st.closed || client.is_broken() {
            st.live -= 1;
            if client.is_broken() {
                tracing::warn!(url = client.url(), "dropping broken websocket client");
            }
            return Some(client);
        }
        st.idle.push(client);
        None
    }
}

/// Bounded pool of [`WsClient`]s.
///
/// At most `capacity` clients exist at once. `acquire` reuses the most
/// recently released idle client, creates one while under capacity, and
/// otherwise waits for a release.
#[derive(Clone)]
pub struct WsPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WsPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsPool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn pool_closed() -> NeonError {
    NeonError::Connection("pool is closed".into())
}

impl WsPool {
    /// Pool of `config.pool_size` clients using the default connector.
    pub fn new(config: impl Into<Arc<NeonConfig>>) -> Result<Self> {
        let config = config.into();
        let connector = Arc::new(TungsteniteConnector::new(&config)?);
        Self::with_connector(config, connector)
    }

    pub fn with_connector(
        config: impl Into<Arc<NeonConfig>>,
        connector: Arc<dyn WsConnector>,
    ) -> Result<Self> {
        let config = config.into();
        let capacity = config.pool_size;
        if capacity < 1 {
            return Err(NeonError::Config(format!(
                "pool size must be at least 1, got {capacity}"
            )));
        }

        tracing::debug!(capacity, url = %config.ws_url(), "websocket pool created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                converter: Arc::new(TextConverter),
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    /// Converter handed to clients created from now on.
    pub fn with_converter(self, converter: Arc<dyn TypeConverter>) -> Result<Self> {
        let inner = Arc::try_unwrap(self.inner).map_err(|_| {
            NeonError::Config("converter must be set before the pool is shared".into())
        })?;
        Ok(Self {
            inner: Arc::new(PoolInner { converter, ..inner }),
        })
    }

    pub async fn acquire(&self) -> Result<PooledClient> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| pool_closed())?;

        let client = {
            let mut st = self.inner.state();
            if st.closed {
                return Err(pool_closed());
            }
            st.leased += 1;
            match st.idle.pop() {
                Some(client) => client,
                None => {
                    st.live += 1;
                    let client = WsClient::with_connector(
                        self.inner.config.clone(),
                        self.inner.connector.clone(),
                    )
                    .with_converter(self.inner.converter.clone());
                    Arc::new(client)
                }
            }
        };

        Ok(PooledClient {
            client,
            pool: self.inner.clone(),
            returned: false,
            _permit: permit,
        })
    }

    /// Return a leased client. Broken clients, and any client once the pool
    /// is closed, are closed instead of re-queued.
    pub async fn release(&self, lease: PooledClient) {
        lease.release().await;
    }

    /// Close every idle client gracefully and refuse further acquires.
    /// Leased clients are closed as they come back.
    pub async fn close(&self) {
        let idle = self.shut();
        join_all(idle.iter().map(|c| c.close())).await;
    }

    /// Like [`close`](Self::close) without the Terminate handshake.
    pub async fn force_close(&self) {
        let idle = self.shut();
        join_all(idle.iter().map(|c| c.force_close())).await;
    }

    fn shut(&self) -> Vec<Arc<WsClient>> {
        let idle = {
            let mut st = self.inner.state();
            st.closed = true;
            let idle = std::mem::take(&mut st.idle);
            st.live -= idle.len();
            idle
        };
        self.inner.permits.close();
        tracing::debug!(closing = idle.len(), "websocket pool closed");
        idle
    }

    pub fn status(&self) -> PoolStatus {
        let st = self.inner.state();
        PoolStatus {
            capacity: self.inner.capacity,
            live: st.live,
            idle: st.idle.len(),
            leased: st.leased,
            closed: st.closed,
        }
    }
}

/// A client leased from a [`WsPool`].
///
/// Dropping the lease returns the client like [`WsPool::release`], except
/// that a discarded client is closed in the background.
pub struct PooledClient {
    client: Arc<WsClient>,
    pool: Arc<PoolInner>,
    returned: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledClient").field(&self.client).finish()
    }
}

impl PooledClient {
    pub async fn release(mut self) {
        self.returned = true;
        if let Some(discard) = self.pool.check_in(self.client.clone()) {
            discard.force_close().await;
        }
    }
}

impl Deref for PooledClient {
    type Target = WsClient;

    fn deref(&self) -> &WsClient {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let Some(discard) = self.pool.check_in(self.client.clone()) else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { discard.force_close().await });
        }
    }
}

#[async_trait]
impl Executor for WsPool {
    async fn query(&self, sql: &str, params: &[Value], opts: &QueryOptions) -> Result<QueryResult> {
        let lease = self.acquire().await?;
        let result = lease.query(sql, params, opts).await;
        lease.release().await;
        result
    }

    async fn transaction(
        &self,
        statements: &[Statement],
        opts: &TransactionOptions,
    ) -> Result<Vec<QueryResult>> {
        let lease = self.acquire().await?;
        let result = lease.transaction(statements, opts).await;
        lease.release().await;
        result
    }

    async fn close(&self) -> Result<()> {
        WsPool::close(self).await;
        Ok(())
    }
}
