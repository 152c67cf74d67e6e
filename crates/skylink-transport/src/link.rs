//! Connection slot shared by the transport variants.
//!
//! A [`Link`] owns one established socket or stream behind a mutex, which is
//! what keeps exchanges strictly request-then-response. Disconnecting removes
//! the link from its [`LinkSlot`] and wakes any exchange still waiting on it
//! so the caller fails fast instead of sitting out its deadline.
//!
//! Exchanges take the io lock inside [`Link::bounded`], so the deadline and the
//! teardown signal also cover the wait behind an earlier exchange.

use crate::transport::{TransportError, TransportResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

pub(crate) struct Link<S> {
    pub io: Mutex<S>,
    pub peer: SocketAddr,
    pub established: Instant,
    closed: Notify,
}

impl<S> Link<S> {
    pub fn new(io: S, peer: SocketAddr) -> Self {
        Self {
            io: Mutex::new(io),
            peer,
            established: Instant::now(),
            closed: Notify::new(),
        }
    }

    /// Run `fut` bounded by `deadline` and by this link being torn down
    pub async fn bounded<T>(
        &self,
        operation: &'static str,
        deadline: Duration,
        fut: impl Future<Output = TransportResult<T>>,
    ) -> TransportResult<T> {
        let closed = self.closed.notified();
        tokio::select! {
            res = tokio::time::timeout(deadline, fut) => {
                res.map_err(|_| TransportError::Timeout { operation, deadline })?
            }
            _ = closed => Err(TransportError::NotConnected),
        }
    }
}

pub(crate) struct LinkSlot<S> {
    slot: RwLock<Option<Arc<Link<S>>>>,
    connected: AtomicBool,
}

impl<S> Default for LinkSlot<S> {
    fn default() -> Self {
        Self {
            slot: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

impl<S> LinkSlot<S> {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn ensure_disconnected(&self) -> TransportResult<()> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        Ok(())
    }

    pub async fn install(&self, link: Link<S>) -> TransportResult<Arc<Link<S>>> {
        let mut slot = self.slot.write().await;
        if slot.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let link = Arc::new(link);
        *slot = Some(Arc::clone(&link));
        self.connected.store(true, Ordering::SeqCst);
        Ok(link)
    }

    pub async fn current(&self) -> TransportResult<Arc<Link<S>>> {
        self.slot
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Remove `link` if it is still the installed one and wake its waiters.
    ///
    /// Used when an exchange died partway through and the stream may still
    /// hold the reply it never read.
    pub async fn retire(&self, link: &Arc<Link<S>>) -> bool {
        let mut slot = self.slot.write().await;
        if !slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, link)) {
            return false;
        }
        slot.take();
        self.connected.store(false, Ordering::SeqCst);
        link.closed.notify_waiters();
        true
    }

    /// Remove the link and wake its waiters. `None` if already empty.
    pub async fn take(&self) -> Option<Arc<Link<S>>> {
        let link = self.slot.write().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(link) = &link {
            link.closed.notify_waiters();
        }
        link
    }
}
