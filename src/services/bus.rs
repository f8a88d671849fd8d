//! Message bus client
//!
//! One consumer task drains a bounded FIFO of inbound (topic, payload)
//! messages. The transport delivers into the FIFO through an
//! [`InboundSender`]; when the FIFO is full the delivery waits up to the
//! configured enqueue timeout and is then dropped.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::*;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::command::{Command, CommandError, CommandSink, COMMAND_TOPICS, DEFAULT_STATE};
use crate::config::MessageBusConfig;

/// Longest topic the inbound queue accepts
pub const MAX_TOPIC_LEN: usize = 30;
/// Longest payload the inbound queue accepts
pub const MAX_PAYLOAD_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliverError {
    #[error("inbound queue full, dropped message on {topic}")]
    QueueFull { topic: String },
    #[error("bus client stopped, dropped message on {topic}")]
    Closed { topic: String },
    #[error("message on {topic} exceeds {max} bytes")]
    TooLong { topic: String, max: usize },
}

/// Producer side of the inbound queue, handed to the transport on connect
#[derive(Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<InboundMessage>,
    enqueue_timeout: Duration,
}

impl InboundSender {
    /// Queue one inbound message. A topic or payload over its limit is
    /// rejected outright with an error log rather than truncated, so a
    /// clipped value is never executed as a command.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> Result<(), DeliverError> {
        let limit = if topic.len() > MAX_TOPIC_LEN {
            Some(MAX_TOPIC_LEN)
        } else if payload.len() > MAX_PAYLOAD_LEN {
            Some(MAX_PAYLOAD_LEN)
        } else {
            None
        };
        if let Some(max) = limit {
            error!(
                "bus: discarding oversized message on {} ({} byte payload)",
                topic,
                payload.len()
            );
            return Err(DeliverError::TooLong {
                topic: topic.to_string(),
                max,
            });
        }

        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };

        match self.tx.send_timeout(message, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                error!(
                    "bus: inbound queue full for {:?}, dropped command on {}",
                    self.enqueue_timeout, topic
                );
                Err(DeliverError::QueueFull {
                    topic: topic.to_string(),
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!("bus: client stopped, dropped command on {}", topic);
                Err(DeliverError::Closed {
                    topic: topic.to_string(),
                })
            }
        }
    }
}

#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&self, broker_uri: &str, inbound: InboundSender)
        -> Result<Box<dyn BusSession>>;
}

#[async_trait]
pub trait BusSession: Send + Sync {
    async fn subscribe(&mut self, topic: &str, qos: u8) -> Result<()>;

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: u8) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

struct RunningBus {
    session: Box<dyn BusSession>,
    shutdown: oneshot::Sender<()>,
    consumer: JoinHandle<usize>,
}

pub struct MessageBusClient {
    settings: MessageBusConfig,
    transport: Arc<dyn BusTransport>,
    sink: Arc<dyn CommandSink>,
    running: Option<RunningBus>,
}

impl MessageBusClient {
    pub fn new(
        settings: MessageBusConfig,
        transport: Arc<dyn BusTransport>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            settings,
            transport,
            sink,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Create the inbound queue and its consumer, connect, subscribe to the
    /// command topics and publish the default state. Does nothing if already
    /// running. The whole session setup is bounded by the connect timeout;
    /// on any failure the queue and consumer are torn down again.
    pub async fn start(&mut self) -> Result<bool> {
        if self.running.is_some() {
            return Ok(false);
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_depth);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = tokio::spawn(consume(rx, shutdown_rx, self.sink.clone()));

        let inbound = InboundSender {
            tx,
            enqueue_timeout: self.settings.enqueue_timeout(),
        };

        let limit = self.settings.connect_timeout();
        let opened = match tokio::time::timeout(limit, self.open_session(inbound)).await {
            Ok(opened) => opened,
            Err(_) => Err(anyhow!(
                "broker {} stalled for {:?} during session setup",
                self.settings.broker_uri,
                limit
            )),
        };

        match opened {
            Ok(session) => {
                info!("bus: connected to {}", self.settings.broker_uri);
                self.running = Some(RunningBus {
                    session,
                    shutdown: shutdown_tx,
                    consumer,
                });
                Ok(true)
            }
            Err(e) => {
                let _ = shutdown_tx.send(());
                let _ = consumer.await;
                Err(e)
            }
        }
    }

    async fn open_session(&self, inbound: InboundSender) -> Result<Box<dyn BusSession>> {
        let uri = &self.settings.broker_uri;
        let mut session = self
            .transport
            .connect(uri, inbound)
            .await
            .with_context(|| format!("failed to connect to {}", uri))?;

        let qos = self.settings.qos;
        for topic in COMMAND_TOPICS {
            session
                .subscribe(topic, qos)
                .await
                .with_context(|| format!("failed to subscribe to {}", topic))?;
        }
        for (topic, value) in DEFAULT_STATE {
            session
                .publish(topic, value.as_bytes(), qos)
                .await
                .with_context(|| format!("failed to publish {}", topic))?;
        }
        Ok(session)
    }

    /// Stop acting on commands, discard whatever is still queued and close
    /// the session. Safe when not running.
    pub async fn stop(&mut self) -> bool {
        let Some(mut running) = self.running.take() else {
            return false;
        };

        let _ = running.shutdown.send(());
        match running.consumer.await {
            Ok(0) => {}
            Ok(discarded) => warn!(
                "bus: link lost, discarded {} pending command(s)",
                discarded
            ),
            Err(e) => error!("bus: consumer task failed: {}", e),
        }

        let limit = self.settings.connect_timeout();
        match tokio::time::timeout(limit, running.session.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("bus: disconnect failed: {:#}", e),
            Err(_) => warn!("bus: broker did not acknowledge disconnect within {:?}", limit),
        }
        info!("bus: stopped");
        true
    }
}

// Single consumer. Shutdown wins over pending messages so nothing queued
// before a link loss is executed after it.
async fn consume(
    mut rx: mpsc::Receiver<InboundMessage>,
    mut shutdown: oneshot::Receiver<()>,
    sink: Arc<dyn CommandSink>,
) -> usize {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            message = rx.recv() => match message {
                Some(message) => dispatch(sink.as_ref(), message),
                None => break,
            },
        }
    }

    rx.close();
    let mut discarded = 0;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

fn dispatch(sink: &dyn CommandSink, message: InboundMessage) {
    match Command::decode(&message.topic, &message.payload) {
        Ok(command) => {
            debug!("bus: {} -> {:?}", message.topic, command);
            if let Err(e) = sink.execute(command) {
                warn!("bus: command on {} failed: {:#}", message.topic, e);
            }
        }
        Err(e @ CommandError::UnknownTopic(_)) => warn!("bus: {}", e),
        Err(e) => warn!("bus: discarding command: {}", e),
    }
}
