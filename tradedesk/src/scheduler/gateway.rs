//! Subscription gateway: the bridge between client connections and the bus.
//!
//! A [`Session`] serves one connection. The transport layer (whatever
//! framework terminates the socket) decodes client frames into
//! [`ClientMessage`] values and encodes [`ServerMessage`] values back out;
//! the session itself never touches bytes.
//!
//! A session follows at most one job at a time. Subscribing replays retained
//! events from the requested cursor, sends a state snapshot, then forwards
//! live events until the terminal event has been delivered, after which the
//! stream is closed and the session is free to subscribe again.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::bus::EventListener;
use super::event::Event;
use super::job::{JobId, JobSnapshot};
use super::manager::Scheduler;

/// Frame from the client.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow a job's event stream. `from_seq` is the last sequence number
    /// the client already holds; replay starts just after it (default 0,
    /// meaning everything retained).
    Subscribe {
        job_id: JobId,
        #[serde(default)]
        from_seq: Option<u64>,
    },

    /// Stop following the current job.
    Unsubscribe,

    /// Keepalive.
    Ping,
}

/// Frame to the client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription accepted; the job's state as of the replay point.
    Subscribed { snapshot: JobSnapshot },

    /// One replayed or live event.
    Event { event: Event },

    /// The job's stream ended (terminal event delivered or buffer released).
    Closed { job_id: JobId },

    /// Keepalive answer.
    Pong,

    /// The request could not be served; the session stays open.
    Error { message: String },
}

/// Creates sessions bound to one scheduler.
#[derive(Clone)]
pub struct SubscriptionGateway {
    scheduler: Scheduler,
}

impl SubscriptionGateway {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Serves one connection until the inbound channel closes or the client
    /// stops reading.
    pub async fn serve(
        &self,
        inbound: mpsc::Receiver<ClientMessage>,
        outbound: mpsc::Sender<ServerMessage>,
    ) {
        Session {
            scheduler: self.scheduler.clone(),
            inbound,
            outbound,
            active: None,
        }
        .run()
        .await;
    }
}

struct ActiveSubscription {
    job_id: JobId,
    listener: EventListener,
}

enum Step {
    Inbound(Option<ClientMessage>),
    Stream(Option<Event>),
}

struct Session {
    scheduler: Scheduler,
    inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    active: Option<ActiveSubscription>,
}

impl Session {
    async fn run(mut self) {
        loop {
            let step = match self.active.take() {
                Some(sub) => {
                    let step = tokio::select! {
                        message = self.inbound.recv() => Step::Inbound(message),
                        event = sub.listener.recv() => Step::Stream(event),
                    };
                    self.active = Some(sub);
                    step
                }
                None => Step::Inbound(self.inbound.recv().await),
            };

            let open = match step {
                Step::Inbound(Some(message)) => self.handle_message(message).await,
                Step::Inbound(None) => false,
                Step::Stream(event) => self.forward(event).await,
            };
            if !open {
                break;
            }
        }
        debug!("session ended");
    }

    /// Returns false when the session should end.
    async fn handle_message(&mut self, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Subscribe { job_id, from_seq } => {
                let from_seq = from_seq.unwrap_or(0);
                match self.scheduler.subscribe(&job_id, from_seq) {
                    Some((replay, listener)) => {
                        // subscribe succeeded, so the snapshot exists
                        let snapshot = match self.scheduler.get(&job_id) {
                            Some(snapshot) => snapshot,
                            None => {
                                return self
                                    .send(ServerMessage::Error {
                                        message: format!("unknown job: {job_id}"),
                                    })
                                    .await
                            }
                        };
                        debug!(%job_id, from_seq, replayed = replay.len(), "subscribed");
                        if !self.send(ServerMessage::Subscribed { snapshot }).await {
                            return false;
                        }
                        let mut terminal_delivered = false;
                        for event in replay {
                            let terminal = event.kind.is_terminal();
                            if !self.send(ServerMessage::Event { event }).await {
                                return false;
                            }
                            if terminal {
                                terminal_delivered = true;
                            }
                        }
                        if terminal_delivered {
                            // Replay already ended the story; no live tail.
                            return self.send(ServerMessage::Closed { job_id }).await;
                        }
                        self.active = Some(ActiveSubscription { job_id, listener });
                        true
                    }
                    None => {
                        self.send(ServerMessage::Error {
                            message: format!("unknown job: {job_id}"),
                        })
                        .await
                    }
                }
            }
            ClientMessage::Unsubscribe => {
                self.active = None;
                true
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    /// Forwards one live event; closes the stream on a terminal event or
    /// when the bus releases the job's channel.
    async fn forward(&mut self, event: Option<Event>) -> bool {
        let sub = match self.active.take() {
            Some(sub) => sub,
            None => return true,
        };
        match event {
            Some(event) => {
                let terminal = event.kind.is_terminal();
                if !self.send(ServerMessage::Event { event }).await {
                    return false;
                }
                if terminal {
                    return self
                        .send(ServerMessage::Closed {
                            job_id: sub.job_id,
                        })
                        .await;
                }
                self.active = Some(sub);
                true
            }
            None => {
                self.send(ServerMessage::Closed {
                    job_id: sub.job_id,
                })
                .await
            }
        }
    }

    /// Returns false if the client is gone.
    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }
}
