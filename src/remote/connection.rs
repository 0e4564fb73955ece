//! Client side of the wire protocol.
//!
//! A [`Connection`] multiplexes request/reply calls, attribute push subscriptions and
//! mirrored remote actions over one TCP stream. A supervisor task owns the stream: when
//! it drops, in-flight calls and remote actions fail with
//! [`DaqError::RemoteCommunication`], every subscription sink receives
//! [`PushEvent::ConnectionLost`] once, and the supervisor reconnects with the configured
//! [`BackoffPolicy`](crate::config::BackoffPolicy), re-opening every live subscription.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::protocol::{
    read_frame, write_frame, ClientFrame, Reply, Request, RequestId, ServerFrame, SubscriptionId,
};
use crate::action::{ActionFuture, CancelHook};
use crate::config::RemoteConfig;
use crate::error::{DaqError, DaqResult};

/// Link state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Calls and pushes flow.
    Connected,
    /// The stream dropped; the supervisor is trying to reconnect.
    Reconnecting,
    /// Closed by the owner or reconnection gave up. Final.
    Closed,
}

/// Event handed to a subscription sink.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PushEvent {
    /// Pushed value. `initial` marks the value sent in response to (re)subscribing.
    Value { value: Value, initial: bool },
    /// The stream dropped.
    ConnectionLost,
}

pub(crate) type PushSink = Arc<dyn Fn(&PushEvent) + Send + Sync>;

struct SubscriptionEntry {
    component: String,
    attribute: String,
    sink: PushSink,
}

struct Shared {
    address: String,
    config: RemoteConfig,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<DaqResult<Reply>>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
    actions: Mutex<HashMap<RequestId, ActionFuture<Value>>>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<bool>,
}

/// Shared client connection to a backend.
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

fn disconnected(address: &str) -> DaqError {
    DaqError::RemoteCommunication(format!("not connected to {address}"))
}

/// Error for a reply of the wrong kind.
pub(crate) fn unexpected(op: &str, reply: &Reply) -> DaqError {
    DaqError::RemoteCommunication(format!("unexpected reply to {op}: {reply:?}"))
}

async fn connect_stream(address: &str, timeout: Duration) -> DaqResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            DaqError::RemoteCommunication(format!("connecting to {address} timed out"))
        })?
        .map_err(|e| DaqError::RemoteCommunication(format!("cannot connect to {address}: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(address, error = %e, "Cannot disable Nagle");
    }
    Ok(stream)
}

impl Connection {
    /// Connect to a backend.
    ///
    /// # Errors
    /// [`DaqError::RemoteCommunication`] if the backend cannot be reached within the
    /// connect timeout.
    pub async fn open(address: &str, config: RemoteConfig) -> DaqResult<Self> {
        let stream = connect_stream(address, config.connect_timeout()).await?;
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            address: address.to_string(),
            config,
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            actions: Mutex::new(HashMap::new()),
            state,
            closed,
        });

        // the session is live before `open` returns so the first call cannot miss it
        let (read_half, writer) = shared.start_writer(stream);
        info!(address, "Connected to backend");
        tokio::spawn(supervise(Arc::clone(&shared), read_half, writer));
        Ok(Self { shared })
    }

    /// Backend address.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Remote settings in use.
    pub fn config(&self) -> &RemoteConfig {
        &self.shared.config
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver observing link state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of live push subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Close the connection. Pending calls fail; no reconnection is attempted.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
    }

    /// One request/reply round trip with the configured call timeout.
    ///
    /// # Errors
    /// The error returned by the backend, or [`DaqError::RemoteCommunication`] on
    /// timeout or disconnect.
    pub async fn call(&self, request: Request) -> DaqResult<Reply> {
        self.call_with_timeout(request, self.shared.config.call_timeout())
            .await
    }

    /// Like [`Connection::call`] with an explicit timeout.
    pub async fn call_with_timeout(&self, request: Request, timeout: Duration) -> DaqResult<Reply> {
        let id = self.shared.next_id();
        self.shared.send(id, request, timeout).await
    }

    /// Open a push subscription. The sink is registered before the request goes out, so
    /// it receives the initial value pushed ahead of the reply.
    pub(crate) async fn subscribe(
        &self,
        component: &str,
        attribute: &str,
        sink: PushSink,
    ) -> DaqResult<SubscriptionId> {
        let id = self.shared.next_id();
        self.shared.subscriptions.lock().insert(
            id,
            SubscriptionEntry {
                component: component.to_string(),
                attribute: attribute.to_string(),
                sink,
            },
        );
        let request = Request::Subscribe {
            component: component.to_string(),
            attribute: attribute.to_string(),
            subscription: id,
        };
        let timeout = self.shared.config.call_timeout();
        match self.shared.send(id, request, timeout).await {
            Ok(Reply::Subscribed) => Ok(id),
            other => {
                self.shared.subscriptions.lock().remove(&id);
                Err(match other {
                    Ok(reply) => unexpected("subscribe", &reply),
                    Err(e) => e,
                })
            }
        }
    }

    /// Close a push subscription. Local delivery stops at once.
    pub(crate) async fn unsubscribe(&self, subscription: SubscriptionId) {
        if self.shared.subscriptions.lock().remove(&subscription).is_none() {
            return;
        }
        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.call(Request::Unsubscribe { subscription }).await {
                debug!(subscription, error = %e, "Remote unsubscribe failed");
            }
        }
    }

    /// Start a remote action and return its mirrored future.
    pub(crate) async fn execute(
        &self,
        component: &str,
        action: &str,
        args: Value,
    ) -> DaqResult<ActionFuture<Value>> {
        let id = self.shared.next_id();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let hook: CancelHook = Arc::new(move |_token| {
            let weak = weak.clone();
            async move {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                let timeout = shared.config.call_timeout();
                let reply = shared
                    .send(shared.next_id(), Request::CancelAction { action: id }, timeout)
                    .await;
                match reply {
                    Ok(Reply::Cancelled { accepted }) => accepted,
                    Ok(other) => {
                        warn!(action = id, "{}", unexpected("cancel_action", &other));
                        false
                    }
                    Err(e) => {
                        warn!(action = id, error = %e, "Remote cancel failed");
                        false
                    }
                }
            }
            .boxed()
        });

        let future = ActionFuture::mirrored(action.to_string(), hook);
        // registered first: updates may arrive before the reply
        self.shared.actions.lock().insert(id, future.clone());

        let request = Request::Execute {
            component: component.to_string(),
            action: action.to_string(),
            args,
        };
        let timeout = self.shared.config.call_timeout();
        match self.shared.send(id, request, timeout).await {
            Ok(Reply::ActionAccepted { .. }) => Ok(future),
            other => {
                self.shared.actions.lock().remove(&id);
                Err(match other {
                    Ok(reply) => unexpected("execute", &reply),
                    Err(e) => e,
                })
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, id: RequestId, request: Request, timeout: Duration) -> DaqResult<Reply> {
        let op = request.op();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let exchange = async {
            let outbound = self
                .outbound
                .lock()
                .clone()
                .ok_or_else(|| disconnected(&self.address))?;
            outbound
                .send(ClientFrame { id, request })
                .await
                .map_err(|_| disconnected(&self.address))?;
            rx.await.map_err(|_| disconnected(&self.address))?
        };
        let result = tokio::time::timeout(timeout, exchange).await;
        self.pending.lock().remove(&id);

        match result {
            Ok(Err(DaqError::RemoteCommunication(reason))) => {
                warn!(op, id, %reason, "Remote call failed");
                Err(DaqError::RemoteCommunication(reason))
            }
            Ok(result) => result,
            Err(_) => {
                warn!(op, id, ?timeout, "Remote call timed out");
                Err(DaqError::RemoteCommunication(format!(
                    "{op} to {} timed out after {timeout:?}",
                    self.address
                )))
            }
        }
    }

    /// Install a fresh outbound queue and spawn the writer owning `stream`'s write half.
    fn start_writer(&self, stream: TcpStream) -> (OwnedReadHalf, tokio::task::JoinHandle<()>) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.push_buffer);
        *self.outbound.lock() = Some(tx);
        let address = self.address.clone();
        let writer = tokio::spawn(write_loop(address, write_half, rx));
        (read_half, writer)
    }

    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply { id, result } => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!(id, "Reply for an abandoned call"),
                }
            }
            ServerFrame::AttributeChanged {
                subscription,
                value,
                initial,
            } => {
                let sink = self
                    .subscriptions
                    .lock()
                    .get(&subscription)
                    .map(|entry| Arc::clone(&entry.sink));
                if let Some(sink) = sink {
                    sink(&PushEvent::Value { value, initial });
                }
            }
            ServerFrame::ActionUpdate { action, update } => {
                let future = self.actions.lock().get(&action).cloned();
                if let Some(future) = future {
                    future.apply_update(update);
                }
            }
            ServerFrame::ActionFinished { action, outcome } => {
                let future = self.actions.lock().remove(&action);
                if let Some(future) = future {
                    future.complete(outcome);
                }
            }
        }
    }

    /// Fail everything bound to the dropped stream.
    fn teardown(&self) {
        self.outbound.lock().take();
        // dropping the waiters wakes every pending call with a disconnect error
        let pending = std::mem::take(&mut *self.pending.lock());
        let actions = std::mem::take(&mut *self.actions.lock());
        drop(pending);
        for (id, future) in actions {
            debug!(action = id, "Failing remote action after disconnect");
            future.complete(Err(DaqError::RemoteCommunication(format!(
                "connection to {} lost while action '{}' was in flight",
                self.address,
                future.name()
            ))));
        }
    }

    fn notify_lost(&self) {
        let sinks: Vec<PushSink> = self
            .subscriptions
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.sink))
            .collect();
        warn!(address = %self.address, subscriptions = sinks.len(), "Connection lost");
        for sink in sinks {
            sink(&PushEvent::ConnectionLost);
        }
    }

    async fn reconnect(&self, closed: &mut watch::Receiver<bool>) -> Option<TcpStream> {
        let policy = &self.config.backoff;
        let mut attempt = 0;
        while policy.allows(attempt) {
            let delay = policy.delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed.wait_for(|c| *c) => return None,
            }
            attempt += 1;
            match connect_stream(&self.address, self.config.connect_timeout()).await {
                Ok(stream) => {
                    info!(address = %self.address, attempt, "Reconnected to backend");
                    return Some(stream);
                }
                Err(e) => debug!(address = %self.address, attempt, error = %e, "Reconnect failed"),
            }
        }
        error!(address = %self.address, attempts = attempt, "Giving up reconnecting");
        None
    }
}

async fn write_loop(address: String, write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<ClientFrame>) {
    let mut writer = BufWriter::new(write_half);
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(%address, error = %e, "Failed to write frame");
            break;
        }
    }
}

async fn read_loop(shared: &Shared, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => shared.route(frame),
            Ok(None) => {
                debug!(address = %shared.address, "Backend closed the stream");
                return;
            }
            Err(e) => {
                warn!(address = %shared.address, error = %e, "Dropping stream after bad frame");
                return;
            }
        }
    }
}

/// Re-open every live subscription on a fresh stream, keeping their ids.
async fn resubscribe(shared: Arc<Shared>) {
    let entries: Vec<(SubscriptionId, String, String)> = shared
        .subscriptions
        .lock()
        .iter()
        .map(|(id, e)| (*id, e.component.clone(), e.attribute.clone()))
        .collect();
    for (subscription, component, attribute) in entries {
        let request = Request::Subscribe {
            component: component.clone(),
            attribute: attribute.clone(),
            subscription,
        };
        let timeout = shared.config.call_timeout();
        match shared.send(shared.next_id(), request, timeout).await {
            Ok(_) => debug!(%component, %attribute, subscription, "Resubscribed"),
            Err(e) => warn!(%component, %attribute, error = %e, "Resubscribe failed"),
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    mut writer: tokio::task::JoinHandle<()>,
) {
    let mut closed = shared.closed.subscribe();
    loop {
        tokio::select! {
            _ = read_loop(&shared, read_half) => {}
            _ = closed.wait_for(|c| *c) => {}
        }
        writer.abort();
        shared.teardown();
        if *closed.borrow() {
            break;
        }

        shared.state.send_replace(ConnectionState::Reconnecting);
        shared.notify_lost();

        let Some(stream) = shared.reconnect(&mut closed).await else {
            break;
        };
        let (next_read, next_writer) = shared.start_writer(stream);
        read_half = next_read;
        writer = next_writer;
        shared.state.send_replace(ConnectionState::Connected);
        tokio::spawn(resubscribe(Arc::clone(&shared)));
    }
    shared.state.send_replace(ConnectionState::Closed);
    info!(address = %shared.address, "Connection closed");
}
