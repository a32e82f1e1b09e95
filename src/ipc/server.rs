//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! state events to subscribed clients. Every request goes through a
//! `ControllerHandle`, so the server never touches controller state.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::events::{StateEvent, Subscription};
use crate::state::{ControllerHandle, HandleError};

use super::protocol::{DaemonStatus, Notification, Request, Response, MAX_MESSAGE_LEN};

/// Notifications queued per client before events are dropped
const NOTIFICATION_BUFFER: usize = 64;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    handle: ControllerHandle,
    start_time: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new IPC server bound to `socket_path`
    pub fn new(socket_path: &Path, handle: ControllerHandle) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            handle,
            start_time: Instant::now(),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let handle = self.handle.clone();
                    let start_time = self.start_time;
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, handle, start_time) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Frames are read on a separate task so that a partially read frame is
    /// never lost when a notification is written in between.
    async fn handle_client(
        stream: UnixStream,
        handle: ControllerHandle,
        start_time: Instant,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (request_tx, mut request_rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));

        let mut session = ClientSession::default();

        let result = loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("client disconnected");
                        break Ok(());
                    };

                    let response = match request {
                        Ok(request) => {
                            debug!(?request, "received request");
                            Self::process_request(request, &handle, &mut session, start_time).await
                        }
                        Err(e) => Response::Error {
                            code: "bad_request".to_string(),
                            message: e,
                        },
                    };

                    if let Err(e) = Self::send_message(&mut writer, &response).await {
                        break Err(e);
                    }
                }

                event = session.next_event() => {
                    match event {
                        Some(event) => {
                            let note = Notification::StateEvent { event };
                            if let Err(e) = Self::send_message(&mut writer, &note).await {
                                break Err(e);
                            }
                        }
                        None => {
                            debug!("event stream closed");
                            session.events = None;
                        }
                    }
                }
            }
        };

        reader_task.abort();
        session.unsubscribe(&handle).await;
        result
    }

    /// Read length-prefixed requests until the client disconnects
    async fn read_requests<R>(mut reader: R, request_tx: mpsc::Sender<Result<Request, String>>)
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    warn!(?e, "failed to read from client");
                    return;
                }
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_LEN {
                warn!(len, "message too large, disconnecting");
                return;
            }

            // Read message body
            let mut msg_buf = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut msg_buf).await {
                warn!(?e, "client closed mid-message");
                return;
            }

            let parsed = serde_json::from_slice::<Request>(&msg_buf).map_err(|e| e.to_string());
            if request_tx.send(parsed).await.is_err() {
                return;
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<W, T>(stream: &mut W, msg: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        stream.write_all(&msg_len).await?;
        stream.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(
        request: Request,
        handle: &ControllerHandle,
        session: &mut ClientSession,
        start_time: Instant,
    ) -> Response {
        let result = match request {
            Request::Ping => return Response::Pong,

            Request::Subscribe => session.subscribe(handle).await.map(|()| Response::Subscribed),

            Request::Unsubscribe => {
                session.unsubscribe(handle).await;
                Ok(Response::Ok)
            }

            Request::GetStatus => handle.status().await.map(|status| {
                Response::Status(DaemonStatus::new(status, start_time.elapsed().as_secs()))
            }),

            Request::GetHistory => handle
                .history()
                .await
                .map(|entries| Response::History { entries }),

            Request::Transition {
                to,
                trigger,
                context,
            } => {
                info!(%to, %trigger, "transition requested via IPC");
                handle
                    .transition(to, trigger, context)
                    .await
                    .map(|transition| Response::Transitioned { transition })
            }

            Request::Dispatch { event, context } => {
                info!(%event, "event dispatched via IPC");
                handle
                    .dispatch(event, context)
                    .await
                    .map(|transition| Response::Transitioned { transition })
            }

            Request::Pause => handle.pause().await.map(|()| Response::Ok),

            Request::Resume => handle.resume().await.map(|()| Response::Ok),

            Request::SetContext { context } => {
                handle.set_context(context).await.map(|()| Response::Ok)
            }

            Request::ClearContext => handle.clear_context().await.map(|()| Response::Ok),
        };

        result.unwrap_or_else(|e| match e {
            HandleError::Rejected(err) => Response::Rejected {
                code: err.code().to_string(),
                message: err.to_string(),
            },
            HandleError::Closed => Response::Error {
                code: "unavailable".to_string(),
                message: HandleError::Closed.to_string(),
            },
        })
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Per-connection notification state
#[derive(Default)]
struct ClientSession {
    subscription: Option<Subscription>,
    events: Option<mpsc::Receiver<StateEvent>>,
}

impl ClientSession {
    /// Register a controller listener feeding this client; idempotent
    async fn subscribe(&mut self, handle: &ControllerHandle) -> Result<(), HandleError> {
        if self.subscription.is_some() {
            return Ok(());
        }

        let (event_tx, event_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let subscription = handle
            .subscribe(Box::new(move |event: &StateEvent| {
                match event_tx.try_send(event.clone()) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("subscriber lagged, event dropped");
                    }
                }
            }))
            .await?;

        debug!(?subscription, "client subscribed to notifications");
        self.subscription = Some(subscription);
        self.events = Some(event_rx);
        Ok(())
    }

    async fn unsubscribe(&mut self, handle: &ControllerHandle) {
        self.events = None;
        if let Some(subscription) = self.subscription.take() {
            // A stopped controller has already dropped the listener
            let _ = handle.unsubscribe(subscription).await;
            debug!(?subscription, "client unsubscribed");
        }
    }

    /// Next event for a subscribed client; pends forever otherwise
    async fn next_event(&mut self) -> Option<StateEvent> {
        match &mut self.events {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}
