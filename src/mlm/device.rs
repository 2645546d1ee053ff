//! Control-plane adapters
//!
//! [`ChannelControlPlane`] is the outbound side: a bounded queue that never
//! blocks the management loop. [`SimulatedDevice`] drains that queue and
//! answers every request after a fixed latency, standing in for firmware.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::MlmEvent;
use crate::keys::hal::{ControlPlane, CtrlMsg, HalResponse, TransportError};

/// Queue full, the device is not keeping up
pub const STATUS_QUEUE_FULL: u32 = 0x0001_0001;
/// Device side of the queue is gone
pub const STATUS_CHANNEL_CLOSED: u32 = 0x0001_0002;

/// Outbound channel backed by a bounded tokio mpsc queue
#[derive(Debug, Clone)]
pub struct ChannelControlPlane {
    tx: mpsc::Sender<CtrlMsg>,
}

impl ChannelControlPlane {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<CtrlMsg>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }
}

impl ControlPlane for ChannelControlPlane {
    fn post(&mut self, msg: CtrlMsg) -> Result<(), TransportError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                warn!("Control-plane queue full, dropping {}", msg);
                Err(TransportError {
                    status: STATUS_QUEUE_FULL,
                })
            }
            Err(TrySendError::Closed(msg)) => {
                warn!("Control-plane channel closed, dropping {}", msg);
                Err(TransportError {
                    status: STATUS_CHANNEL_CLOSED,
                })
            }
        }
    }
}

/// Firmware stand-in answering key requests
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    latency: Duration,
    status: u32,
}

impl SimulatedDevice {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            status: HalResponse::SUCCESS,
        }
    }

    /// Answer every request with `status` instead of success
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    /// Serve requests from `rx` until either channel closes
    pub fn spawn(
        self,
        mut rx: mpsc::Receiver<CtrlMsg>,
        events: mpsc::Sender<MlmEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Simulated device up (latency {:?})", self.latency);
            while let Some(msg) = rx.recv().await {
                debug!("Device received {}", msg);
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let rsp = HalResponse {
                    dialog_token: msg.dialog_token,
                    status: self.status,
                };
                if events.send(MlmEvent::HalRsp(rsp)).await.is_err() {
                    debug!("Management loop gone, device stopping");
                    break;
                }
            }
            info!("Simulated device down");
        })
    }
}
