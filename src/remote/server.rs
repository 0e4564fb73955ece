//! Backend endpoint exposing a [`ComponentRegistry`] to remote clients.
//!
//! One task accepts connections; each connection gets a reader task that handles requests
//! in arrival order and a writer task that owns the socket's write half. Replies, attribute
//! pushes and action pushes all go through the writer's queue.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::protocol::{
    read_frame, write_frame, ClientFrame, Reply, Request, RequestId, ServerFrame, SubscriptionId,
};
use crate::action::{ActionFuture, ActionUpdate};
use crate::attribute::{AttributeEvent, EventListener, Subscription};
use crate::error::{DaqError, DaqResult};
use crate::limits::MAX_SUBSCRIPTIONS_PER_CONNECTION;
use crate::metadata::VOCABULARY_VERSION;
use crate::registry::ComponentRegistry;

/// TCP server for the components of one registry.
///
/// Dropping the server closes the listener and every connection; actions already started
/// on behalf of a client keep running.
pub struct ComponentServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ComponentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ComponentServer {
    /// Bind `address` and start accepting clients. Use port 0 for an ephemeral port.
    ///
    /// # Errors
    /// [`DaqError::Io`] if the address cannot be bound.
    pub async fn bind(registry: Arc<ComponentRegistry>, address: &str) -> DaqResult<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = Arc::new(AtomicUsize::new(0));

        info!(%local_addr, components = registry.len(), "Component server listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry,
            shutdown_rx,
            Arc::clone(&connections),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            connections,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stop accepting, close every connection and wait for their tasks.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept task ended abnormally");
            }
        }
        info!(local_addr = %self.local_addr, "Component server stopped");
    }
}

impl Drop for ComponentServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ComponentRegistry>,
    mut shutdown: watch::Receiver<bool>,
    count: Arc<AtomicUsize>,
) {
    let mut connections = JoinSet::new();
    loop {
        let conn_shutdown = shutdown.clone();
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    let shutdown = conn_shutdown;
                    let count = Arc::clone(&count);
                    connections.spawn(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        serve_connection(stream, peer, registry, shutdown).await;
                        count.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ComponentRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%peer, "Client connected");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Cannot disable Nagle");
    }
    let (read_half, write_half) = stream.into_split();
    let (out, mut queue) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(%peer, error = %e, "Failed to write frame");
                break;
            }
        }
    });

    let mut session = Session {
        registry,
        out,
        subscriptions: HashMap::new(),
        actions: Arc::new(Mutex::new(HashMap::new())),
    };
    let mut reader = BufReader::new(read_half);
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            frame = read_frame::<_, ClientFrame>(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => session.dispatch(frame).await,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Closing connection after bad frame");
                break;
            }
        }
    }

    let subscriptions = session.subscriptions.len();
    drop(session);
    writer.abort();
    info!(%peer, subscriptions, "Client disconnected");
}

/// Per-connection request handler.
struct Session {
    registry: Arc<ComponentRegistry>,
    out: mpsc::UnboundedSender<ServerFrame>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    actions: Arc<Mutex<HashMap<RequestId, ActionFuture<Value>>>>,
}

impl Session {
    async fn dispatch(&mut self, frame: ClientFrame) {
        let op = frame.request.op();
        debug!(id = frame.id, op, "Request");
        let result = self.handle(frame.id, frame.request).await;
        if let Err(e) = &result {
            debug!(id = frame.id, op, error = %e, "Request failed");
        }
        // a closed queue means the connection is going away
        let _ = self.out.send(ServerFrame::Reply {
            id: frame.id,
            result,
        });
    }

    async fn handle(&mut self, id: RequestId, request: Request) -> DaqResult<Reply> {
        match request {
            Request::Ping => Ok(Reply::Pong {
                vocabulary_version: VOCABULARY_VERSION,
            }),
            Request::ListComponents => Ok(Reply::Components {
                descriptors: self.registry.list().iter().map(|c| c.describe()).collect(),
            }),
            Request::Describe { component } => Ok(Reply::Descriptor {
                descriptor: self.registry.get(&component)?.describe(),
            }),
            Request::GetAttribute {
                component,
                attribute,
            } => {
                let handle = self.registry.get(&component)?.attribute(&attribute)?;
                Ok(Reply::Value {
                    value: handle.get_value().await?,
                })
            }
            Request::SetAttribute {
                component,
                attribute,
                value,
            } => {
                let handle = self.registry.get(&component)?.attribute(&attribute)?;
                handle.set_value(value).await?;
                Ok(Reply::Ok)
            }
            Request::Subscribe {
                component,
                attribute,
                subscription,
            } => {
                self.subscribe(&component, &attribute, subscription)
                    .await?;
                Ok(Reply::Subscribed)
            }
            Request::Unsubscribe { subscription } => {
                if let Some(sub) = self.subscriptions.remove(&subscription) {
                    sub.unsubscribe();
                }
                Ok(Reply::Ok)
            }
            Request::GetMetadata { component } => Ok(Reply::Metadata {
                metadata: self.registry.get(&component)?.metadata().await?.to_raw(),
            }),
            Request::UpdateMetadata {
                component,
                metadata,
            } => {
                self.registry
                    .get(&component)?
                    .update_metadata_raw(metadata)
                    .await?;
                Ok(Reply::Ok)
            }
            Request::Execute {
                component,
                action,
                args,
            } => {
                let future = self.registry.get(&component)?.execute(&action, args).await?;
                self.track_action(id, future);
                Ok(Reply::ActionAccepted { action: id })
            }
            Request::CancelAction { action } => {
                let future = self.actions.lock().get(&action).cloned();
                let accepted = match future {
                    Some(future) => future.cancel().await,
                    None => false,
                };
                Ok(Reply::Cancelled { accepted })
            }
            Request::Terminate { component } => {
                self.registry.get(&component)?.terminate().await?;
                Ok(Reply::Ok)
            }
        }
    }

    async fn subscribe(
        &mut self,
        component: &str,
        attribute: &str,
        subscription: SubscriptionId,
    ) -> DaqResult<()> {
        if self.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION
            && !self.subscriptions.contains_key(&subscription)
        {
            return Err(DaqError::RemoteCommunication(format!(
                "connection holds {MAX_SUBSCRIPTIONS_PER_CONNECTION} subscriptions already"
            )));
        }
        let handle = self.registry.get(component)?.attribute(attribute)?;

        let out = self.out.clone();
        let initial = AtomicBool::new(true);
        let listener: EventListener = Arc::new(move |event: &AttributeEvent| {
            if let AttributeEvent::Changed(value) = event {
                let _ = out.send(ServerFrame::AttributeChanged {
                    subscription,
                    value: value.clone(),
                    initial: initial.swap(false, Ordering::SeqCst),
                });
            }
        });
        let sub = handle.subscribe_events(listener, true).await?;
        debug!(component, attribute, subscription, "Subscribed");
        // replacing an id drops the previous subscription
        self.subscriptions.insert(subscription, sub);
        Ok(())
    }

    fn track_action(&self, id: RequestId, future: ActionFuture<Value>) {
        self.actions.lock().insert(id, future.clone());

        let out = self.out.clone();
        future.add_update_callback(move |update: &ActionUpdate| {
            if !update.state.is_terminal() {
                let _ = out.send(ServerFrame::ActionUpdate {
                    action: id,
                    update: *update,
                });
            }
        });
        // the action may have started before the callback was attached
        if future.state() == crate::action::ActionState::Running {
            let _ = self.out.send(ServerFrame::ActionUpdate {
                action: id,
                update: ActionUpdate {
                    state: future.state(),
                    progress: future.progress(),
                },
            });
        }

        let out = self.out.clone();
        let actions = Arc::clone(&self.actions);
        future.add_done_callback(move |finished: &ActionFuture<Value>| {
            actions.lock().remove(&id);
            let outcome = finished.try_result().unwrap_or_else(|| {
                Err(DaqError::Hardware("action finished without outcome".into()))
            });
            let _ = out.send(ServerFrame::ActionFinished {
                action: id,
                outcome,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::component::LocalComponent;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    async fn backend() -> (ComponentServer, Attribute<f64>) {
        let exposure = Attribute::builder("exposureTime", 0.1)
            .range(0.001, 10.0)
            .build();
        let sensor = LocalComponent::builder("sensor", "ccd")
            .attribute(&exposure)
            .build()
            .unwrap();
        let registry = Arc::new(ComponentRegistry::new());
        registry.register(Arc::new(sensor)).unwrap();
        let server = ComponentServer::bind(registry, "127.0.0.1:0").await.unwrap();
        (server, exposure)
    }

    async fn call(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        id: RequestId,
        request: Request,
    ) -> Vec<ServerFrame> {
        write_frame(writer, &ClientFrame { id, request }).await.unwrap();
        let mut frames = Vec::new();
        loop {
            let frame: ServerFrame = read_frame(reader).await.unwrap().unwrap();
            let done = matches!(&frame, ServerFrame::Reply { id: reply, .. } if *reply == id);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_raw_protocol_session() {
        let (server, exposure) = backend().await;
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let frames = call(&mut reader, &mut writer, 1, Request::Ping).await;
        assert_eq!(
            frames,
            vec![ServerFrame::Reply {
                id: 1,
                result: Ok(Reply::Pong {
                    vocabulary_version: VOCABULARY_VERSION
                })
            }]
        );

        let subscribe = Request::Subscribe {
            component: "sensor".into(),
            attribute: "exposureTime".into(),
            subscription: 9,
        };
        let frames = call(&mut reader, &mut writer, 2, subscribe).await;
        assert_eq!(
            frames[0],
            ServerFrame::AttributeChanged {
                subscription: 9,
                value: json!(0.1),
                initial: true
            }
        );

        let set = Request::SetAttribute {
            component: "sensor".into(),
            attribute: "exposureTime".into(),
            value: json!(50.0),
        };
        let frames = call(&mut reader, &mut writer, 3, set).await;
        assert!(matches!(
            &frames[0],
            ServerFrame::Reply { result: Err(DaqError::Validation { .. }), .. }
        ));

        exposure.set(0.5).unwrap();
        let frame: ServerFrame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            frame,
            ServerFrame::AttributeChanged {
                subscription: 9,
                value: json!(0.5),
                initial: false
            }
        );
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_frame_closes_connection() {
        let (server, _exposure) = backend().await;
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        writer.write_all(b"not json\n").await.unwrap();
        let end: Option<ServerFrame> = read_frame(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, _exposure) = backend().await;
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        call(&mut reader, &mut writer, 1, Request::Ping).await;

        server.shutdown().await;
        let end: Option<ServerFrame> = read_frame(&mut reader).await.unwrap();
        assert!(end.is_none());
        assert_eq!(server.connection_count(), 0);
    }
}
