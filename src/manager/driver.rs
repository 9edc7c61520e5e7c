//! Async driver for a coordinator
//!
//! Owns the coordinator behind a mutex, ticks it on a fixed interval and
//! feeds it the messages decoded by the network layer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::core::{Result, Timestamp};
use crate::protocol::message::{
    AnnounceMessage, FollowUpMessage, PdelayReqMessage, PdelayRespFollowUpMessage,
    PdelayRespMessage, SyncMessage,
};
use crate::protocol::transport::{Outbound, OutboundSink};

/// A decoded message with its receive timestamp where one is needed
///
/// Event messages carry the timestamp the network layer captured; `None`
/// makes the driver fetch it with `capture_rx_timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Announce(AnnounceMessage),
    Sync {
        msg: SyncMessage,
        rx_timestamp: Option<Timestamp>,
    },
    FollowUp(FollowUpMessage),
    PdelayReq {
        msg: PdelayReqMessage,
        rx_timestamp: Option<Timestamp>,
    },
    PdelayResp {
        msg: PdelayRespMessage,
        rx_timestamp: Option<Timestamp>,
    },
    PdelayRespFollowUp(PdelayRespFollowUpMessage),
}

/// Transmitter that queues outbound messages on a bounded channel
///
/// A full queue counts as a transmit failure; the state machines never wait
/// for the network layer.
#[derive(Debug, Clone)]
pub struct ChannelTransmitter {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelTransmitter {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        ChannelTransmitter { tx }
    }

    /// Creates a transmitter and the receiver the network layer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelTransmitter { tx }, rx)
    }
}

impl OutboundSink for ChannelTransmitter {
    fn push(&self, msg: Outbound) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Outbound queue rejected message");
                false
            }
        }
    }
}

pub struct Driver {
    coordinator: Arc<Mutex<Coordinator>>,
    tick_interval: Duration,
}

impl Driver {
    pub fn new(coordinator: Coordinator) -> Self {
        let tick_interval = coordinator.config().tick_interval;
        Driver {
            coordinator: Arc::new(Mutex::new(coordinator)),
            tick_interval,
        }
    }

    /// Shared handle for status queries and administrative calls
    pub fn coordinator(&self) -> Arc<Mutex<Coordinator>> {
        self.coordinator.clone()
    }

    /// Starts the coordinator and runs until `shutdown` becomes true or the
    /// inbound channel closes; the coordinator is stopped on exit
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.coordinator.lock().await.start()?;
        info!(tick_ms = self.tick_interval.as_millis() as u64, "gPTP driver running");

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.coordinator.lock().await.tick();
                }

                msg = inbound.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => {
                        warn!("Inbound channel closed");
                        break;
                    }
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.coordinator.lock().await.stop();
        info!("gPTP driver stopped");
        Ok(())
    }

    async fn dispatch(&self, msg: Inbound) {
        let mut coordinator = self.coordinator.lock().await;
        match msg {
            Inbound::Announce(msg) => coordinator.process_announce(&msg),
            Inbound::Sync { msg, rx_timestamp } => {
                if let Some(rx) = receive_time(&coordinator, rx_timestamp, msg.header.sequence_id) {
                    coordinator.process_sync(&msg, rx);
                }
            }
            Inbound::FollowUp(msg) => coordinator.process_follow_up(&msg),
            Inbound::PdelayReq { msg, rx_timestamp } => {
                if let Some(rx) = receive_time(&coordinator, rx_timestamp, msg.header.sequence_id) {
                    coordinator.process_pdelay_request(&msg, rx);
                }
            }
            Inbound::PdelayResp { msg, rx_timestamp } => {
                if let Some(rx) = receive_time(&coordinator, rx_timestamp, msg.header.sequence_id) {
                    coordinator.process_pdelay_response(&msg, rx);
                }
            }
            Inbound::PdelayRespFollowUp(msg) => coordinator.process_pdelay_response_follow_up(&msg),
        }
    }
}

/// The captured receive timestamp, or the hardware's; `None` drops the message
fn receive_time(
    coordinator: &Coordinator,
    captured: Option<Timestamp>,
    sequence_id: u16,
) -> Option<Timestamp> {
    if captured.is_some() {
        return captured;
    }
    match coordinator.hardware().capture_rx_timestamp(sequence_id) {
        Ok(ts) => Some(ts),
        Err(e) => {
            warn!(seq = sequence_id, error = %e, "No receive timestamp, message dropped");
            None
        }
    }
}
