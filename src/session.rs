//! Protocol lifecycle against one heat pump.
//!
//! A [Session] owns the port and the [DeviceState] and runs on a single task:
//! read frames, poll on a fixed interval, and send at most one set command per
//! poll. Everything else talks to it through a [SessionHandle].
//!
//! ```text
//! Disconnected -> Connecting -> Connected (valid = false) -> Connected (valid = true)
//!      ^               |               |                            |
//!      +---------------+---------------+--- i/o error, timeout, shutdown
//! ```

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::PortStream,
    protocol::{commands::InfoType, packets::{Packet, SetRequest}},
    state::{DeviceState, InvalidField, PendingChange},
};


/// Alternating poll requests.
const POLL_SEQUENCE: [InfoType; 2] = [InfoType::Settings, InfoType::RoomTemperature];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What observers of a session see.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub link: LinkState,
    pub device: DeviceState,
}

impl SessionStatus {
    pub fn connected(&self) -> bool {
        self.link == LinkState::Connected
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,

    /// The session fails if nothing at all is received for this long, or if
    /// a single frame can't be written for this long.
    pub read_timeout: Duration,

    /// Polls sent without a connect ack before treating the link as connected anyway.
    pub handshake_polls: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(10),
            handshake_polls: 3,
        }
    }
}


#[derive(Error, Debug)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("port closed")]
    Closed,
    #[error("heat pump port timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] packed_struct::PackingError),
    #[error(transparent)]
    InvalidField(#[from] InvalidField),
    #[error("heat pump did not report the requested settings within {0:?}")]
    ConvergeTimeout(Duration),
    #[error("session has ended")]
    SessionGone,
}


#[derive(Debug)]
pub enum Request {
    Stage(PendingChange),
    Shutdown,
}


pub struct Session<P> {
    port: P,
    config: SessionConfig,

    link: LinkState,
    device: DeviceState,
    status: watch::Sender<SessionStatus>,

    /// At most one, merged across stage requests.
    pending: Option<PendingChange>,

    next_poll: usize,
    polls_while_connecting: u32,
    last_rx: Instant,
}

impl<P> Session<P> where
    P: PortStream
{
    pub fn new(port: P, config: SessionConfig, status: watch::Sender<SessionStatus>) -> Self {
        Self {
            port,
            config,
            link: LinkState::Disconnected,
            device: DeviceState::new(),
            status,
            pending: None,
            next_poll: 0,
            polls_while_connecting: 0,
            last_rx: Instant::now(),
        }
    }

    /// Drive the session until the port fails or a shutdown is requested.
    ///
    /// The link always ends up `Disconnected`.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> Result<(), SessionError> {
        let result = self.drive(&mut requests).await;

        self.set_link(LinkState::Disconnected);

        match &result {
            Ok(()) => info!("session closed"),
            Err(err) => warn!(%err, "session failed"),
        }

        result
    }

    async fn drive(&mut self, requests: &mut mpsc::Receiver<Request>) -> Result<(), SessionError> {
        self.set_link(LinkState::Connecting);
        self.send(Packet::ConnectRequest).await?;

        let period = self.config.poll_interval;
        let mut poll = time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.last_rx = Instant::now();

        loop {
            tokio::select! {
                frame = self.port.next() => match frame {
                    Some(Ok(frame)) => {
                        self.last_rx = Instant::now();
                        self.receive(Packet::interpret(&frame));
                    },
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(SessionError::Closed),
                },

                _ = poll.tick() => self.tick().await?,

                request = requests.recv() => match request {
                    Some(Request::Stage(change)) => self.stage(change),
                    Some(Request::Shutdown) | None => {
                        // a stalled peer can't hold up shutdown; the port is dropped either way
                        match time::timeout(self.config.poll_interval, self.port.close()).await {
                            Ok(Err(err)) => debug!(%err, "error closing port"),
                            Err(_) => debug!("port close timed out"),
                            Ok(Ok(())) => {},
                        }
                        return Ok(())
                    }
                },
            }
        }
    }

    async fn tick(&mut self) -> Result<(), SessionError> {
        if self.last_rx.elapsed() >= self.config.read_timeout {
            return Err(SessionError::Timeout(self.config.read_timeout))
        }

        if self.link == LinkState::Connecting && self.polls_while_connecting >= self.config.handshake_polls {
            info!(polls = self.polls_while_connecting, "no connect ack, continuing without one");
            self.set_link(LinkState::Connected);
        }

        // one frame per tick; a command replaces this tick's poll
        if let Some(request) = self.take_command() {
            info!(changed = request.changed.bits(), settings = ?request.settings, "sending set request");
            return self.send(Packet::SetRequest(request)).await
        }

        let info_type = POLL_SEQUENCE[self.next_poll];
        self.next_poll = (self.next_poll + 1) % POLL_SEQUENCE.len();

        self.send(Packet::InfoRequest(info_type)).await?;

        if self.link == LinkState::Connecting {
            self.polls_while_connecting += 1;
        }

        Ok(())
    }

    /// Turn the pending change into a command, clearing it.
    ///
    /// Held back until the current settings are known, since the command
    /// carries every field.
    fn take_command(&mut self) -> Option<SetRequest> {
        let change = self.pending?;

        let Some(current) = self.device.settings() else {
            debug!("settings not known yet, holding pending change");
            return None
        };

        self.pending = None;

        let command = change.command(&current);
        if command.is_none() {
            debug!(?change, "pending change already satisfied");
        }

        command
    }

    fn receive(&mut self, packet: Packet) {
        match &packet {
            Packet::ConnectAck => {
                if self.link == LinkState::Connecting {
                    info!("connect acknowledged");
                    self.set_link(LinkState::Connected);
                }
            },
            Packet::SetAck => debug!("set request acknowledged"),
            Packet::StatusReport(_) | Packet::TemperatureReport { .. } => {
                let was_valid = self.device.valid();

                if self.device.apply(&packet) {
                    debug!(?packet, "device state changed");

                    if !was_valid && self.device.valid() {
                        info!("device state complete");
                    }

                    self.publish();
                }
            },
            Packet::Unknown { packet_type, payload } => {
                debug!(packet_type, payload = ?&payload[..], "ignoring unknown packet");
            },
            other => debug!(packet = ?other, "ignoring unexpected packet"),
        }
    }

    fn stage(&mut self, change: PendingChange) {
        match &mut self.pending {
            Some(pending) => pending.merge(change),
            None => self.pending = Some(change),
        }

        debug!(pending = ?self.pending, "change staged");
    }

    async fn send(&mut self, packet: Packet) -> Result<(), SessionError> {
        let frame = packet.to_frame()?;

        // a peer that stops reading fills the buffer and blocks the send
        time::timeout(self.config.read_timeout, self.port.send(frame)).await
            .map_err(|_| SessionError::Timeout(self.config.read_timeout))??;

        Ok(())
    }

    fn set_link(&mut self, link: LinkState) {
        if self.link != link {
            info!(?link, "link state");
            self.link = link;
            self.publish();
        }
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            link: self.link,
            device: self.device.clone(),
        });
    }
}


/// Cross-task access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<SessionStatus>,
}

/// Start a session on its own task.
pub fn spawn<P>(port: P, config: SessionConfig) -> (SessionHandle, JoinHandle<Result<(), SessionError>>) where
    P: PortStream + 'static
{
    let (requests_send, requests_recv) = mpsc::channel(8);
    let (status_send, status_recv) = watch::channel(SessionStatus::default());

    let session = Session::new(port, config, status_send);
    let task = tokio::spawn(session.run(requests_recv));

    let handle = SessionHandle {
        requests: requests_send,
        status: status_recv,
    };

    (handle, task)
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Validate and queue a change. Invalid input is rejected before
    /// anything is sent.
    pub async fn stage<I, K, V>(&self, changes: I) -> Result<PendingChange, SessionError> where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let change = self.status.borrow().device.stage(changes)?;

        self.requests.send(Request::Stage(change)).await
            .map_err(|_| SessionError::SessionGone)?;

        Ok(change)
    }

    /// Wait until a settings report shows `change` applied.
    pub async fn converge(&self, change: &PendingChange, timeout: Duration) -> Result<DeviceState, SessionError> {
        let mut status = self.status.clone();

        time::timeout(timeout, wait_for_settings(&mut status, change)).await
            .map_err(|_| SessionError::ConvergeTimeout(timeout))?
    }

    pub async fn shutdown(&self) {
        // an error means the session is already gone
        let _ = self.requests.send(Request::Shutdown).await;
    }
}

async fn wait_for_settings(status: &mut watch::Receiver<SessionStatus>, change: &PendingChange) -> Result<DeviceState, SessionError> {
    loop {
        {
            let current = status.borrow_and_update();

            if let Some(settings) = current.device.settings() {
                if change.is_satisfied_by(&settings) {
                    return Ok(current.device.clone())
                }
            }
        }

        status.changed().await
            .map_err(|_| SessionError::SessionGone)?;
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::protocol::codec::FrameCodec;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(200),
            handshake_polls: 2,
        }
    }

    async fn wait_for_link(handle: &SessionHandle, link: LinkState) {
        let mut status = handle.subscribe();
        time::timeout(Duration::from_secs(5), status.wait_for(|status| status.link == link)).await
            .expect("timed out waiting for link state")
            .expect("session ended");
    }

    #[tokio::test]
    async fn handshake_starts_with_connect_request() {
        let (ours, theirs) = duplex(1024);
        let mut device = Framed::new(theirs, FrameCodec::new());

        let (handle, _task) = spawn(Framed::new(ours, FrameCodec::new()), SessionConfig::default());

        let frame = device.next().await.unwrap().unwrap();
        assert_eq!(Packet::interpret(&frame), Packet::ConnectRequest);
        assert_eq!(handle.status().link, LinkState::Connecting);

        device.send(Packet::ConnectAck.to_frame().unwrap()).await.unwrap();
        wait_for_link(&handle, LinkState::Connected).await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn silent_device_connects_after_polls_then_times_out() {
        let (ours, theirs) = duplex(4096);
        let mut device = Framed::new(theirs, FrameCodec::new());

        let (handle, task) = spawn(Framed::new(ours, FrameCodec::new()), fast_config());

        // drain whatever the session sends without ever answering
        let drain = tokio::spawn(async move {
            let mut polls = Vec::new();
            while let Some(Ok(frame)) = device.next().await {
                polls.push(Packet::interpret(&frame));
            }
            polls
        });

        wait_for_link(&handle, LinkState::Connected).await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Timeout(_))), "{result:?}");
        assert_eq!(handle.status().link, LinkState::Disconnected);

        let sent = drain.await.unwrap();
        assert_eq!(sent[0], Packet::ConnectRequest);
        assert_eq!(sent[1], Packet::InfoRequest(InfoType::Settings));
        assert_eq!(sent[2], Packet::InfoRequest(InfoType::RoomTemperature));
    }

    #[tokio::test]
    async fn unread_peer_times_out_instead_of_blocking() {
        // room for the connect request and one poll, then writes block
        let (ours, _theirs) = duplex(32);

        let config = SessionConfig {
            poll_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(100),
            handshake_polls: 3,
        };
        let (handle, task) = spawn(Framed::new(ours, FrameCodec::new()), config);

        time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        let result = time::timeout(Duration::from_secs(2), task).await
            .expect("session blocked on a full port")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Timeout(_))), "{result:?}");
        assert_eq!(handle.status().link, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn closed_port_disconnects() {
        let (ours, theirs) = duplex(1024);

        let (handle, task) = spawn(Framed::new(ours, FrameCodec::new()), fast_config());
        drop(theirs);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::Closed) | Err(SessionError::Io(_))), "{result:?}");
        assert_eq!(handle.status().link, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_ends_session() {
        let (ours, _theirs) = duplex(1024);

        let (handle, task) = spawn(Framed::new(ours, FrameCodec::new()), SessionConfig::default());
        handle.shutdown().await;

        assert!(task.await.unwrap().is_ok());
        assert!(!handle.status().connected());
        assert!(matches!(
            handle.stage([("power", "ON")]).await,
            Err(SessionError::SessionGone)
        ));
    }

    #[tokio::test]
    async fn invalid_stage_is_rejected_before_sending() {
        let (ours, _theirs) = duplex(1024);

        let (handle, _task) = spawn(Framed::new(ours, FrameCodec::new()), SessionConfig::default());

        assert!(matches!(
            handle.stage([("temp", "35")]).await,
            Err(SessionError::InvalidField(_))
        ));

        handle.shutdown().await;
    }
}
