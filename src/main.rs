use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use mitsubishi2mqtt::{
    config::Port,
    init_tracing,
    mqtt::{connected_payload, discard_sets, forward_set, parse_set_payload, state_payload, MqttConfig, Topics},
    session::{self, SessionConfig, SessionError, SessionHandle, SessionStatus},
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use tokio::{signal, sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};
use url::Url;


/// Bridge a Mitsubishi heat pump's CN105 port to MQTT
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the port to connect to
    ///
    /// either serial:///device/path[?baud=N] or tcp+raw://host:port URLs supported
    port: Url,

    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    mqtt_host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    #[arg(long, default_value = "mitsubishi2mqtt")]
    client_id: String,

    /// Prefix of the state, connected and set topics
    #[arg(long, env = "TOPIC_PREFIX", default_value = "heatpump")]
    topic_prefix: String,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Give up on the port after this long without receiving anything
    #[arg(long, default_value_t = 10)]
    read_timeout_secs: u64,

    /// Wait before reopening the port after a session ends
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    /// Log filter used when RUST_LOG isn't set
    #[arg(long, default_value = "info")]
    log_level: String,
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args.log_level);

    let topics = Topics::new(&args.topic_prefix);

    let mqtt_config = MqttConfig {
        host: args.mqtt_host.clone(),
        port: args.mqtt_port,
        client_id: args.client_id.clone(),
        username: args.mqtt_username.clone(),
        password: args.mqtt_password.clone(),
        keep_alive: Duration::from_secs(5),
    };

    let (client, eventloop) = AsyncClient::new(mqtt_config.options(&topics), 16);
    let (set_send, mut set_recv) = mpsc::channel(8);

    tokio::spawn(mqtt_events(client.clone(), eventloop, topics.clone(), set_send));

    let session_config = SessionConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        read_timeout: Duration::from_secs(args.read_timeout_secs),
        ..Default::default()
    };

    let reconnect_delay = Duration::from_secs(args.reconnect_delay_secs);

    loop {
        match Port::open(&args.port).await {
            Ok(port) => {
                let (handle, task) = session::spawn(port.framed(), session_config.clone());

                let keep_running = bridge(&handle, task, &client, &topics, &mut set_recv).await;

                publish_connected(&client, &topics, false).await;

                if !keep_running {
                    break
                }
            },
            Err(err) => error!("{err:#}"),
        }

        info!(delay = ?reconnect_delay, "reopening port");

        tokio::select! {
            _ = sleep(reconnect_delay) => {},
            _ = signal::ctrl_c() => break,
        }

        // don't replay stale changes into the next session
        discard_sets(&mut set_recv);
    }

    if let Err(err) = client.disconnect().await {
        debug!(%err, "mqtt disconnect");
    }

    Ok(())
}


/// Forward one session's status to MQTT and `set` messages to the session.
///
/// Returns false if the process should exit.
async fn bridge(
    handle: &SessionHandle,
    mut task: JoinHandle<Result<(), SessionError>>,
    client: &AsyncClient,
    topics: &Topics,
    set_recv: &mut mpsc::Receiver<Bytes>,
) -> bool {
    let mut status = handle.subscribe();
    let mut published = Published::default();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    // session is gone, pick up its result below
                    log_session_end((&mut task).await);
                    return true
                }

                let current = status.borrow_and_update().clone();
                published.update(&current, client, topics).await;
            },

            Some(payload) = set_recv.recv() => {
                let fields = match parse_set_payload(&payload) {
                    Ok(fields) => fields,
                    Err(err) => {
                        warn!(%err, "ignoring set message");
                        continue
                    }
                };

                match handle.stage(fields).await {
                    Ok(change) => info!(?change, "change staged"),
                    Err(err) => warn!(%err, "change rejected"),
                }
            },

            result = &mut task => {
                log_session_end(result);
                return true
            },

            _ = signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown().await;
                log_session_end(task.await);
                return false
            },
        }
    }
}

fn log_session_end(result: Result<Result<(), SessionError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("session ended"),
        Ok(Err(err)) => warn!(%err, "session ended"),
        Err(err) => error!(%err, "session task failed"),
    }
}


/// What's been published so far, to only publish changes.
#[derive(Default)]
struct Published {
    connected: Option<bool>,
    state: Option<Vec<u8>>,
}

impl Published {
    async fn update(&mut self, status: &SessionStatus, client: &AsyncClient, topics: &Topics) {
        let connected = status.connected();
        if self.connected != Some(connected) {
            publish_connected(client, topics, connected).await;
            self.connected = Some(connected);
        }

        if let Some(state) = state_payload(status) {
            if self.state.as_ref() != Some(&state) {
                publish(client, &topics.state, state.clone()).await;
                self.state = Some(state);
            }
        }
    }
}

async fn publish_connected(client: &AsyncClient, topics: &Topics, connected: bool) {
    publish(client, &topics.connected, connected_payload(connected)).await;
}

async fn publish(client: &AsyncClient, topic: &str, payload: impl Into<Vec<u8>>) {
    if let Err(err) = client.publish(topic, QoS::AtLeastOnce, true, payload).await {
        warn!(%err, topic, "publish failed");
    }
}


/// Drive the MQTT connection, (re)subscribing to the set topic on every connect.
async fn mqtt_events(client: AsyncClient, mut eventloop: EventLoop, topics: Topics, set_send: mpsc::Sender<Bytes>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("connected to mqtt broker");

                if let Err(err) = client.try_subscribe(&topics.set, QoS::AtLeastOnce) {
                    warn!(%err, "failed to subscribe to {}", topics.set);
                }
            },
            Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == topics.set => {
                debug!(payload = ?publish.payload, "set message");

                if !forward_set(&set_send, publish.payload) {
                    return
                }
            },
            Ok(_) => {},
            Err(err) => {
                warn!(%err, "mqtt connection error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
