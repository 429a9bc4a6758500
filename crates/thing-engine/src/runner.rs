// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-task runtime around an [`Engine`].
//!
//! ```text
//!   transport <-> [net thread] --inbound queue--> [protocol thread] -> Engine::run
//!                              <-outbound queue--
//! ```
//!
//! The net thread owns the transport and may block on it without stalling
//! the protocol. The protocol thread never blocks: an empty inbound queue
//! means `run` gets an empty buffer, a full outbound queue drops the frame
//! and the engine's resend timer takes over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::engine::{Engine, LinkStatus};
use crate::error::{ThingError, TransportError};
use crate::storage::IdentityStore;
use crate::transport::Transport;

/// Application hook called once per protocol tick (the firmware `loop()`).
pub type TickHook = Box<dyn FnMut() + Send>;

/// User-visible link indicator, typically a blinking LED.
pub trait StatusIndicator: Send {
    /// Blink with `period`, or stay solid on `None`.
    fn set_status_period(&mut self, period: Option<Duration>);
}

/// Blink period for a link status.
pub fn blink_period(status: LinkStatus) -> Option<Duration> {
    match status {
        LinkStatus::Disconnected => Some(Duration::from_millis(1000)),
        LinkStatus::Connected => None,
        LinkStatus::Error => Some(Duration::from_millis(100)),
    }
}

/// Running engine plus its transport.
pub struct ThingRunner<S: IdentityStore + 'static, const N: usize> {
    running: Arc<AtomicBool>,
    status: Arc<Mutex<LinkStatus>>,
    net: Option<JoinHandle<()>>,
    protocol: Option<JoinHandle<Engine<S, N>>>,
}

impl<S: IdentityStore + 'static, const N: usize> ThingRunner<S, N> {
    /// Start the net and protocol threads.
    pub fn spawn<T: Transport + 'static>(
        engine: Engine<S, N>,
        transport: T,
        tick: Option<TickHook>,
        indicator: Option<Box<dyn StatusIndicator>>,
    ) -> Result<Self, ThingError> {
        let depth = engine.config().queue_depth;
        let mtu = engine.config().mtu;
        let tick_interval = Duration::from_millis(engine.config().tick_interval_ms);

        let (inbound_tx, inbound_rx) = channel::bounded::<Vec<u8>>(depth);
        let (outbound_tx, outbound_rx) = channel::bounded::<Vec<u8>>(depth);
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(engine.link_status()));

        let net = {
            let net_running = running.clone();
            std::thread::Builder::new()
                .name("thing-net".into())
                .spawn(move || {
                    net_loop(
                        transport,
                        inbound_tx,
                        outbound_rx,
                        &net_running,
                        mtu,
                        tick_interval,
                    )
                })
                .map_err(TransportError::from)?
        };

        let protocol = {
            let worker_running = running.clone();
            let status = status.clone();
            let spawned = std::thread::Builder::new()
                .name("thing-protocol".into())
                .spawn(move || {
                    let mut worker = ProtocolWorker {
                        engine,
                        tick,
                        indicator,
                        status,
                        last_status: None,
                    };
                    worker.run(inbound_rx, outbound_tx, &worker_running, mtu, tick_interval);
                    worker.engine
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    let _ = net.join();
                    return Err(TransportError::from(e).into());
                }
            }
        };

        log::info!("Thing runner started (mtu={}, queue_depth={})", mtu, depth);
        Ok(Self {
            running,
            status,
            net: Some(net),
            protocol: Some(protocol),
        })
    }

    /// Link status as last seen by the protocol thread.
    pub fn link_status(&self) -> LinkStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop both threads and hand the (stopped) engine back.
    pub fn shutdown(mut self) -> Result<Engine<S, N>, ThingError> {
        self.running.store(false, Ordering::SeqCst);
        let net = self.net.take();
        let protocol = self.protocol.take();

        if let Some(handle) = net {
            handle.join().map_err(|_| ThingError::Worker("thing-net"))?;
        }
        let engine = protocol
            .ok_or(ThingError::Worker("thing-protocol"))?
            .join()
            .map_err(|_| ThingError::Worker("thing-protocol"))?;
        log::info!("Thing runner stopped");
        Ok(engine)
    }
}

impl<S: IdentityStore + 'static, const N: usize> Drop for ThingRunner<S, N> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.net.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.protocol.take() {
            let _ = handle.join();
        }
    }
}

fn net_loop<T: Transport>(
    mut transport: T,
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
    running: &AtomicBool,
    mtu: usize,
    idle: Duration,
) {
    let mut buf = vec![0u8; mtu];
    while running.load(Ordering::SeqCst) {
        let mut busy = false;

        match transport.try_recv(&mut buf) {
            Ok(Some(n)) => {
                busy = true;
                match inbound.try_send(buf[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Inbound queue full, dropping {} bytes", n)
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::error!("Protocol thread gone, stopping");
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(TransportError::Closed) => {
                log::error!("Transport closed by peer");
                break;
            }
            Err(e) => log::warn!("Receive failed: {}", e),
        }

        while let Ok(frame) = outbound.try_recv() {
            busy = true;
            if let Err(e) = transport.send(&frame) {
                log::warn!("Send failed: {}", e);
            }
        }

        if !busy {
            std::thread::sleep(idle);
        }
    }
    // Also stops the protocol thread when the link went away on its own.
    running.store(false, Ordering::SeqCst);
    log::debug!("Net thread exiting");
}

struct ProtocolWorker<S: IdentityStore, const N: usize> {
    engine: Engine<S, N>,
    tick: Option<TickHook>,
    indicator: Option<Box<dyn StatusIndicator>>,
    status: Arc<Mutex<LinkStatus>>,
    last_status: Option<LinkStatus>,
}

impl<S: IdentityStore, const N: usize> ProtocolWorker<S, N> {
    fn run(
        &mut self,
        inbound: Receiver<Vec<u8>>,
        outbound: Sender<Vec<u8>>,
        running: &AtomicBool,
        mtu: usize,
        idle: Duration,
    ) {
        let mut out = vec![0u8; mtu];
        self.publish_status();

        while running.load(Ordering::SeqCst) {
            if let Some(tick) = self.tick.as_mut() {
                tick();
            }

            let frame = match inbound.try_recv() {
                Ok(frame) => Some(frame),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    log::error!("Net thread gone, stopping");
                    break;
                }
            };
            match self.engine.run(frame.as_deref().unwrap_or(&[]), &mut out) {
                Ok(0) => {}
                Ok(n) => match outbound.try_send(out[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Outbound queue full, message dropped")
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::error!("Net thread gone, stopping");
                        break;
                    }
                },
                Err(e) => log::error!("Engine step failed: {}", e),
            }
            self.publish_status();

            // Drain a backlog without sleeping.
            if frame.is_none() {
                std::thread::sleep(idle);
            }
        }

        running.store(false, Ordering::SeqCst);
        self.engine.stop();
        self.publish_status();
        log::debug!("Protocol thread exiting");
    }

    fn publish_status(&mut self) {
        let status = self.engine.link_status();
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        *self.status.lock() = status;
        if let Some(indicator) = self.indicator.as_mut() {
            indicator.set_status_period(blink_period(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blink_periods() {
        assert_eq!(
            blink_period(LinkStatus::Disconnected),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(blink_period(LinkStatus::Connected), None);
        assert_eq!(
            blink_period(LinkStatus::Error),
            Some(Duration::from_millis(100))
        );
    }
}
