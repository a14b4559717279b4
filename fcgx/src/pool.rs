//! Pre-stocked client pool with per-client TTL.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::warn;

use crate::client::{ClientFactory, ClientHandle, FcgiRequest};
use crate::error::{Error, Result};
use crate::pipe::ResponsePipe;

/// How long the stocker waits before retrying a failing client factory.
const FACTORY_BACKOFF: Duration = Duration::from_secs(1);

/// A pool-owned client: recycled on release while fresh, destroyed once its
/// TTL has passed.
///
/// Carries its pool slot as a semaphore permit, so in-flight plus stocked
/// clients can never exceed the pool's scale, and a send-only handle to the
/// stock channel for the return path. The pool itself holds only the receive
/// ends; there is no cycle.
pub struct PooledClient {
    client: Box<dyn ClientHandle>,
    expires_at: Instant,
    stock_tx: mpsc::Sender<PooledClient>,
    _slot: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

#[async_trait]
impl ClientHandle for PooledClient {
    async fn send(&self, req: FcgiRequest) -> Result<ResponsePipe> {
        self.client.send(req).await
    }

    async fn connect(&self) -> Result<()> {
        self.client.connect().await
    }

    async fn close_conn(&self) -> Result<()> {
        self.client.close_conn().await
    }

    /// Destroys the client when expired; otherwise a detached task drops its
    /// socket and re-stocks it, so the releaser never waits on the pool.
    async fn close(self: Box<Self>) -> Result<()> {
        if self.expired() {
            let this = *self;
            return this.client.close().await;
        }
        tokio::spawn(async move {
            if let Err(err) = self.client.close_conn().await {
                warn!(error = %err, "failed to drop pooled connection");
            }
            let stock_tx = self.stock_tx.clone();
            // The permit rides along; the slot stays taken while stocked.
            let _ = stock_tx.send(*self).await;
        });
        Ok(())
    }
}

/// Client pool: a stocker task keeps up to `scale` clients on hand, each
/// stamped with an expiry `now + expires` at build time.
pub struct ClientPool {
    stock_rx: Mutex<mpsc::Receiver<PooledClient>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, scale: usize, expires: Duration) -> Self {
        let scale = scale.max(1);
        let (stock_tx, stock_rx) = mpsc::channel(scale);
        let slots = Arc::new(Semaphore::new(scale));
        tokio::spawn(stock_loop(factory, stock_tx, slots, expires));
        ClientPool {
            stock_rx: Mutex::new(stock_rx),
        }
    }

    /// Takes a stocked client and dials its connection. Blocks while the
    /// stock is empty. Dial failures destroy the client (freeing its slot)
    /// and surface to the caller.
    pub async fn acquire(&self) -> Result<Box<dyn ClientHandle>> {
        let pooled = self
            .stock_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        if let Err(err) = pooled.connect().await {
            let _ = pooled.client.close().await;
            return Err(err);
        }
        Ok(Box::new(pooled))
    }
}

#[async_trait]
impl ClientFactory for ClientPool {
    async fn create(&self) -> Result<Box<dyn ClientHandle>> {
        self.acquire().await
    }
}

async fn stock_loop(
    factory: Arc<dyn ClientFactory>,
    stock_tx: mpsc::Sender<PooledClient>,
    slots: Arc<Semaphore>,
    expires: Duration,
) {
    loop {
        let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
            return;
        };
        let client = loop {
            match factory.create().await {
                Ok(client) => break client,
                Err(err) => {
                    warn!(error = %err, "client factory failed, backing off");
                    sleep(FACTORY_BACKOFF).await;
                }
            }
        };
        let pooled = PooledClient {
            client,
            expires_at: Instant::now() + expires,
            stock_tx: stock_tx.clone(),
            _slot: slot,
        };
        if stock_tx.send(pooled).await.is_err() {
            return;
        }
    }
}
