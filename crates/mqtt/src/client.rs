//! Broker connection shared by the controller and the HTTP surface.
//!
//! The event loop runs in its own task for the life of the service. On a
//! transport error the client is rebuilt and reconnected with exponential
//! backoff, and every tracked subscription is restored after each ConnAck,
//! so status delivery resumes without the controller having to reset any
//! state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use pumplab_core::topics::command_topic;
use pumplab_core::{PumpCommand, PumpId};

use crate::config::MqttConfig;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt client error: {0}")]
    Client(#[from] ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Publish { topic: String, payload: Vec<u8> },
}

#[derive(Clone)]
pub struct MqttService {
    client: Arc<Mutex<AsyncClient>>,
    ready: Arc<AtomicBool>,
    events_tx: broadcast::Sender<MqttEvent>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    // Holding the handle keeps the event loop task from being dropped.
    _loop_handle: Arc<JoinHandle<()>>,
}

impl MqttService {
    pub async fn connect(config: MqttConfig) -> Result<Self, MqttError> {
        let (client, eventloop) = build_client(&config)?;
        let client = Arc::new(Mutex::new(client));
        let ready = Arc::new(AtomicBool::new(false));
        let (events_tx, _) = broadcast::channel(256);
        let subscriptions = Arc::new(RwLock::new(HashMap::new()));

        let loop_handle = tokio::spawn(run_eventloop(
            eventloop,
            client.clone(),
            ready.clone(),
            events_tx.clone(),
            subscriptions.clone(),
            config,
        ));

        Ok(Self {
            client,
            ready,
            events_tx,
            subscriptions,
            _loop_handle: Arc::new(loop_handle),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> broadcast::Receiver<MqttEvent> {
        self.events_tx.subscribe()
    }

    pub async fn publish<T: Into<Vec<u8>>>(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: T,
    ) -> Result<(), MqttError> {
        let client = self.client.lock().await;
        client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Encode a partial pump command as JSON and publish it to the pump's
    /// command topic at QoS 1.
    pub async fn publish_command(
        &self,
        pump_id: PumpId,
        command: &PumpCommand,
    ) -> Result<(), MqttError> {
        let payload = serde_json::to_vec(command)?;
        self.publish(&command_topic(pump_id), QoS::AtLeastOnce, false, payload)
            .await
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        {
            let client = self.client.lock().await;
            client.subscribe(topic, qos).await?;
        }
        self.subscriptions.write().await.insert(topic.to_string(), qos);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.ready.store(false, Ordering::Relaxed);
        let client = self.client.lock().await;
        client.disconnect().await?;
        Ok(())
    }
}

fn build_client(config: &MqttConfig) -> Result<(AsyncClient, EventLoop), MqttError> {
    let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs as u64));
    opts.set_clean_session(config.clean_session);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }
    opts.set_request_channel_capacity(64);
    Ok(AsyncClient::new(opts, 64))
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    client_shared: Arc<Mutex<AsyncClient>>,
    ready: Arc<AtomicBool>,
    events_tx: broadcast::Sender<MqttEvent>,
    subscriptions: Arc<RwLock<HashMap<String, QoS>>>,
    config: MqttConfig,
) {
    let mut backoff_secs = 1u64;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("MQTT connected");
                ready.store(true, Ordering::Relaxed);
                let _ = events_tx.send(MqttEvent::Connected);

                // Restore tracked subscriptions after every (re)connect.
                let subs = subscriptions.read().await;
                let client = client_shared.lock().await;
                for (topic, qos) in subs.iter() {
                    debug!(topic, "restoring subscription");
                    if let Err(err) = client.subscribe(topic, *qos).await {
                        warn!(?err, topic, "failed to restore subscription");
                    }
                }
                drop(client);
                drop(subs);

                backoff_secs = 1;
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let _ = events_tx.send(MqttEvent::Publish {
                    topic: publish.topic.to_string(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                warn!("MQTT disconnect requested");
                ready.store(false, Ordering::Relaxed);
                let _ = events_tx.send(MqttEvent::Disconnected);
            }
            Ok(other) => {
                debug!(?other, "MQTT event");
            }
            Err(err) => {
                error!(?err, "MQTT error; reconnecting");
                ready.store(false, Ordering::Relaxed);
                let _ = events_tx.send(MqttEvent::Disconnected);

                sleep(Duration::from_secs(backoff_secs.min(30))).await;
                backoff_secs = (backoff_secs * 2).min(60);

                match build_client(&config) {
                    Ok((new_client, new_eventloop)) => {
                        eventloop = new_eventloop;
                        *client_shared.lock().await = new_client;
                        info!("MQTT client rebuilt, attempting reconnection");
                    }
                    Err(err) => {
                        error!(?err, "failed to rebuild MQTT client; retrying");
                    }
                }
            }
        }
    }
}
