//! Impure I/O driver for one MQTT session
//!
//! [`MqttSession`] is a cheap handle over a driver task. The task owns the
//! sans-I/O [`Session`] and the [`Transport`] and serialises every command
//! and every transport event through them, so no two state transitions ever
//! race. The connection state is mirrored into a `watch` channel for
//! synchronous queries.

use super::connection::ConnectionState;
use super::core::{Action, PublishReceipt, Session, SessionOptions};
use super::delivery::PendingPublish;
use super::subscriptions::Subscription;
use crate::error::{SessionError, SessionResult};
use crate::events::EventSink;
use crate::session_span;
use crate::transport::{ConnAck, QoS, Transport, TransportError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

const COMMAND_BUFFER: usize = 64;

/// Far enough away to never fire; used when no timer is pending
const IDLE_WAIT: Duration = Duration::from_secs(86_400);

enum Command {
    Connect(oneshot::Sender<SessionResult<()>>),
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<SessionResult<()>>),
    Subscribe {
        topic: String,
        qos: QoS,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        reply: oneshot::Sender<SessionResult<PublishReceipt>>,
    },
    IsSubscribed {
        topic: String,
        reply: oneshot::Sender<bool>,
    },
    Topics(oneshot::Sender<Vec<String>>),
    Subscription {
        topic: String,
        reply: oneshot::Sender<Option<Subscription>>,
    },
    InFlight(oneshot::Sender<Vec<PendingPublish>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one MQTT session
pub struct MqttSession {
    client_ref: String,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    driver_handle: Option<JoinHandle<()>>,
}

impl MqttSession {
    /// Spawn the driver task for a new session. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        client_ref: impl Into<String>,
        options: SessionOptions,
        transport: Box<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let client_ref = client_ref.into();
        let client_keep_alive = !transport.manages_keep_alive();
        let session = Session::new(client_ref.clone(), options, sink, client_keep_alive);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            session,
            transport,
            commands: commands_rx,
            state_tx,
            link_open: false,
            pending_open: false,
        };
        let span = session_span!(client_ref = %client_ref);
        let driver_handle = tokio::spawn(driver.run().instrument(span));

        Self {
            client_ref,
            commands: commands_tx,
            state_rx,
            driver_handle: Some(driver_handle),
        }
    }

    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Start connecting; the outcome arrives as a `connect` or `error` event
    pub async fn connect(&self) -> SessionResult<()> {
        self.request(Command::Connect).await?
    }

    /// Disconnect, aborting a connect or reconnect in progress
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.request(Command::Disconnect).await
    }

    /// Drop whatever link or attempt exists and connect again
    pub async fn reconnect(&self) -> SessionResult<()> {
        self.request(Command::Reconnect).await?
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> SessionResult<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, qos, reply })
            .await?
    }

    pub async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Unsubscribe { topic, reply })
            .await?
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<PublishReceipt> {
        let topic = topic.to_string();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            reply,
        })
        .await?
    }

    pub async fn is_subscribed(&self, topic: &str) -> SessionResult<bool> {
        let topic = topic.to_string();
        self.request(|reply| Command::IsSubscribed { topic, reply })
            .await
    }

    /// Confirmed topic filters, ordered
    pub async fn topics(&self) -> SessionResult<Vec<String>> {
        self.request(Command::Topics).await
    }

    pub async fn subscription(&self, topic: &str) -> SessionResult<Option<Subscription>> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscription { topic, reply })
            .await
    }

    /// Outbound QoS 1/2 publishes awaiting acknowledgement, in send order
    pub async fn in_flight(&self) -> SessionResult<Vec<PendingPublish>> {
        self.request(Command::InFlight).await
    }

    /// Wait until the connection state satisfies `predicate`
    pub async fn wait_for_state<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> SessionResult<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        Self::wait_for_state_change(self.state_rx.clone(), predicate, timeout).await
    }

    /// Wait for Connected; fails early once the session reaches Failed
    pub async fn wait_connected(&self, timeout: Duration) -> SessionResult<()> {
        let state = self
            .wait_for_state(
                |state| matches!(state, ConnectionState::Connected | ConnectionState::Failed),
                timeout,
            )
            .await?;
        match state {
            ConnectionState::Connected => Ok(()),
            state => Err(SessionError::NotConnected { state }),
        }
    }

    /// Tear the session down without waiting for the driver task to exit.
    /// No further events are emitted.
    pub async fn close(&self) -> SessionResult<()> {
        match self.request(Command::Shutdown).await {
            Err(SessionError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    /// Tear the session down and wait for the driver task to stop
    pub async fn shutdown(&mut self) -> SessionResult<()> {
        let result = self.close().await;
        if let Some(handle) = self.driver_handle.take() {
            // Give the driver time to close the transport
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!(client_ref = %self.client_ref, "Driver task stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(client_ref = %self.client_ref, "Driver task ended with error: {}", e)
                }
                Err(_) => warn!(client_ref = %self.client_ref, "Driver task did not stop in time"),
                _ => {}
            }
        }
        result
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SessionResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        reply_rx.await.map_err(|_| SessionError::SessionClosed)
    }

    async fn wait_for_state_change<F>(
        mut state_rx: watch::Receiver<ConnectionState>,
        predicate: F,
        timeout: Duration,
    ) -> SessionResult<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                if predicate(state) {
                    return Ok(state);
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::SessionClosed);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                waited: timeout,
                state: *state_rx.borrow(),
            }),
        }
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("client_ref", &self.client_ref)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Can't do async work in Drop; call shutdown() for a graceful close
        if let Some(handle) = self.driver_handle.take() {
            handle.abort();
        }
    }
}

/// How a handshake wait ended
enum HandshakeExit {
    Opened(Result<ConnAck, TransportError>),
    Interrupted(Command),
    TimerFired,
    CommandsClosed,
}

struct Driver {
    session: Session,
    transport: Box<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    link_open: bool,
    pending_open: bool,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn sleep_target(deadline: Option<std::time::Instant>) -> Instant {
    deadline.map_or_else(|| Instant::now() + IDLE_WAIT, Instant::from_std)
}

impl Driver {
    async fn run(mut self) {
        info!("Session driver started");
        loop {
            if self.pending_open {
                self.pending_open = false;
                if !self.handshake().await {
                    break;
                }
                self.mirror_state();
                continue;
            }

            let deadline = self.session.next_deadline();
            let keep_running = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        false
                    }
                },
                event = self.transport.recv(), if self.link_open => {
                    let actions = self.session.handle_event(now(), event);
                    self.execute(actions).await;
                    true
                }
                _ = tokio::time::sleep_until(sleep_target(deadline)), if deadline.is_some() => {
                    let actions = self.session.handle_timeout(now());
                    self.execute(actions).await;
                    true
                }
            };

            self.mirror_state();
            if !keep_running {
                break;
            }
        }
        info!("Session driver stopped");
    }

    /// Run one transport open while still serving commands. Returns false
    /// once the session has been shut down.
    async fn handshake(&mut self) -> bool {
        self.mirror_state();
        let options = self.session.connect_options().clone();
        let mut deferred = Vec::new();

        let exit = {
            let open = self.transport.open(&options);
            tokio::pin!(open);

            loop {
                let deadline = self.session.next_deadline();
                tokio::select! {
                    result = &mut open => break HandshakeExit::Opened(result),
                    command = self.commands.recv() => match command {
                        None => break HandshakeExit::CommandsClosed,
                        Some(command) => {
                            if let Some(command) =
                                Self::serve_during_handshake(&mut self.session, command, &mut deferred)
                            {
                                break HandshakeExit::Interrupted(command);
                            }
                        }
                    },
                    _ = tokio::time::sleep_until(sleep_target(deadline)), if deadline.is_some() => {
                        let actions = self.session.handle_timeout(now());
                        if !actions.is_empty() {
                            deferred.extend(actions);
                            break HandshakeExit::TimerFired;
                        }
                    }
                }
                Self::publish_state(&self.state_tx, &self.session);
            }
        };

        match exit {
            HandshakeExit::Opened(Ok(ack)) => {
                self.link_open = true;
                let actions = self.session.handshake_succeeded(now(), ack);
                self.execute(actions).await;
            }
            HandshakeExit::Opened(Err(error)) => {
                debug!(error = %error, "Transport open failed");
                let actions = self.session.handshake_failed(now(), &error);
                self.execute(actions).await;
            }
            HandshakeExit::Interrupted(command) => {
                debug!("Handshake aborted by command");
                self.execute(deferred).await;
                return self.handle_command(command).await;
            }
            HandshakeExit::TimerFired => {}
            HandshakeExit::CommandsClosed => {
                self.shutdown().await;
                return false;
            }
        }
        self.execute(deferred).await;
        true
    }

    /// Serve a command that only touches session state while the transport
    /// is busy opening. Commands that tear the link down are handed back.
    fn serve_during_handshake(
        session: &mut Session,
        command: Command,
        deferred: &mut Vec<Action>,
    ) -> Option<Command> {
        let now = now();
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(Err(SessionError::InvalidState {
                    operation: "connect",
                    state: session.state(),
                }));
            }
            Command::Subscribe { topic, qos, reply } => {
                let result = session.subscribe(now, &topic, qos).map(|actions| {
                    deferred.extend(actions);
                });
                let _ = reply.send(result);
            }
            Command::Unsubscribe { topic, reply } => {
                let result = session.unsubscribe(now, &topic).map(|actions| {
                    deferred.extend(actions);
                });
                let _ = reply.send(result);
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let result = session
                    .publish(now, &topic, payload, qos, retain)
                    .map(|(receipt, actions)| {
                        deferred.extend(actions);
                        receipt
                    });
                let _ = reply.send(result);
            }
            Command::IsSubscribed { topic, reply } => {
                let _ = reply.send(session.is_subscribed(&topic));
            }
            Command::Topics(reply) => {
                let _ = reply.send(session.topics());
            }
            Command::Subscription { topic, reply } => {
                let _ = reply.send(session.subscription(&topic));
            }
            Command::InFlight(reply) => {
                let _ = reply.send(session.in_flight());
            }
            command @ (Command::Disconnect(_) | Command::Reconnect(_) | Command::Shutdown(_)) => {
                return Some(command);
            }
        }
        None
    }

    /// Returns false once the driver should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        let now = now();
        match command {
            Command::Connect(reply) => {
                let result = match self.session.connect(now) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                // Callers observe the new state as soon as the reply lands
                self.mirror_state();
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                let actions = self.session.disconnect(now);
                self.execute(actions).await;
                self.mirror_state();
                let _ = reply.send(());
            }
            Command::Reconnect(reply) => {
                let result = match self.session.reconnect(now) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                self.mirror_state();
                let _ = reply.send(result);
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
            other => {
                let mut actions = Vec::new();
                if Self::serve_during_handshake(&mut self.session, other, &mut actions).is_some() {
                    debug!("Link command left unserved");
                }
                self.execute(actions).await;
            }
        }
        true
    }

    async fn shutdown(&mut self) {
        let actions = self.session.teardown(now());
        self.execute(actions).await;
        if self.link_open {
            self.transport.close().await;
            self.link_open = false;
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Open => self.pending_open = true,
                Action::Send(packet) => {
                    if !self.link_open {
                        debug!(packet = packet.kind(), "Dropping packet without a link");
                        continue;
                    }
                    let kind = packet.kind();
                    if let Err(error) = self.transport.send(packet).await {
                        warn!(packet = kind, error = %error, "Transport write failed");
                        queue.retain(|pending| !matches!(pending, Action::Send(_)));
                        queue.extend(self.session.send_failed(now(), &error));
                    }
                }
                Action::Close => {
                    self.transport.close().await;
                    self.link_open = false;
                }
            }
        }
    }

    fn mirror_state(&self) {
        Self::publish_state(&self.state_tx, &self.session);
    }

    fn publish_state(state_tx: &watch::Sender<ConnectionState>, session: &Session) {
        let state = session.state();
        state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_state_change_success() {
        // Arrange
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        // Act
        let result = MqttSession::wait_for_state_change(
            state_rx,
            |state| state == ConnectionState::Connected,
            Duration::from_millis(500),
        )
        .await;

        // Assert
        assert_eq!(result.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wait_for_state_change_timeout() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let result = MqttSession::wait_for_state_change(
            state_rx,
            |state| state == ConnectionState::Connected,
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(
            result,
            Err(SessionError::Timeout {
                state: ConnectionState::Connecting,
                ..
            })
        ));
        drop(state_tx);
    }

    #[tokio::test]
    async fn test_wait_for_state_change_channel_closed() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        drop(state_tx);

        let result = MqttSession::wait_for_state_change(
            state_rx,
            |state| state == ConnectionState::Connected,
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(SessionError::SessionClosed)));
    }
}
