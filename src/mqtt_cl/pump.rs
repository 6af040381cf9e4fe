// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! The comms pump: per-connection reader, writer, keepalive and outbound
//! gateway tasks plus the teardown choreography tying them together.
//!
//! Shutdown order is load-bearing. `stop_comms_workers` signals the stop
//! watch, which makes the gateway, keepalive and router tasks exit; the reader
//! also observes it and drops out of its blocking read. Only after those
//! workers have joined are the pump-internal outbound channels closed, at
//! which point the writer drains to end-of-input and exits, and the "comms
//! stopped" latch flips. Closing the channels any earlier could leave the
//! router blocked emitting an acknowledgement into a channel nobody drains.

use crate::mqtt_cl::client::{ClientCore, ConnectionState};
use crate::mqtt_cl::client_error::ClientError;
use crate::mqtt_cl::packet::{Packet, Publish, QoS};
use crate::mqtt_cl::router::AckEmitter;
use crate::mqtt_cl::store::{inbound_key, outbound_key, persist_inbound, persist_outbound};
use crate::mqtt_cl::token::Token;
use crate::mqtt_cl::transport::{TransportError, TransportOps, TransportRead, TransportWrite};
use bytes::BytesMut;
use std::io::IoSlice;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Read chunk size for the transport reader.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the pump-internal priority channel; acknowledgements from the
/// reader and router queue here briefly while the writer works.
const PRIORITY_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the inbound-publish channel feeding the router.
const INBOUND_CHANNEL_CAPACITY: usize = 8;

/// Grace period for flushing the write direction when a connection ends.
const WRITE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// An outbound control packet paired with the token its completion resolves.
pub(crate) struct PacketAndToken {
    pub packet: Packet,
    pub token: Option<Token>,
}

/// Handle to a running comms pump, owned by the lifecycle controller under
/// its pump mutex. Present iff the pump is running, which doubles as the
/// idempotence check for teardown.
pub(crate) struct PumpHandle {
    stop_tx: watch::Sender<bool>,
    /// Gateway, keepalive and router-dispatch tasks.
    workers: JoinSet<()>,
    /// Latch flipped by the comms joiner once reader and writer have exited.
    comms_done_rx: watch::Receiver<bool>,
    /// Pump-internal outbound senders. Dropped during teardown after the
    /// workers have joined, which lets the writer observe end-of-input.
    pump_obound_tx: mpsc::Sender<PacketAndToken>,
    pump_oboundp_tx: mpsc::Sender<PacketAndToken>,
}

/// What woke the reader loop.
enum ReaderEvent {
    Stop,
    FromStore(Option<Packet>),
    Read(Result<usize, TransportError>),
}

/// Sends `value`, bailing out when the stop watch fires first. Returns false
/// when the value was not delivered.
async fn send_or_stop<T: Send>(
    tx: &mpsc::Sender<T>,
    stop_rx: &mut watch::Receiver<bool>,
    value: T,
) -> bool {
    tokio::select! {
        _ = stop_rx.changed() => false,
        result = tx.send(value) => result.is_ok(),
    }
}

impl ClientCore {
    /// Milliseconds since the client was created; the monotonic base for the
    /// keepalive arithmetic.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn mark_last_sent(&self) {
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn mark_last_received(&self) {
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Starts the comms workers over a freshly connected transport. Returns
    /// false (discarding the transport) when a pump is already running, which
    /// can happen when a connect worker races a reconnect worker.
    pub(crate) fn start_comms_workers(
        self: Arc<Self>,
        transport: Box<dyn TransportOps + Send>,
        inbound_from_store: mpsc::Receiver<Packet>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>> {
        Box::pin(self.start_comms_workers_inner(transport, inbound_from_store))
    }

    async fn start_comms_workers_inner(
        self: Arc<Self>,
        transport: Box<dyn TransportOps + Send>,
        inbound_from_store: mpsc::Receiver<Packet>,
    ) -> bool {
        let mut pump_guard = self.pump.lock().await;
        if pump_guard.is_some() {
            warn!("comms workers already running, discarding new connection");
            let mut transport = transport;
            transport.shutdown(WRITE_SHUTDOWN_TIMEOUT).await;
            return false;
        }

        let obound_rx = self
            .obound_rx_slot
            .lock()
            .expect("outbound slot mutex poisoned")
            .take();
        let oboundp_rx = self
            .oboundp_rx_slot
            .lock()
            .expect("outbound slot mutex poisoned")
            .take();
        let (obound_rx, oboundp_rx) = match (obound_rx, oboundp_rx) {
            (Some(obound_rx), Some(oboundp_rx)) => (obound_rx, oboundp_rx),
            (obound_rx, oboundp_rx) => {
                error!("client outbound channels unavailable, cannot start comms");
                *self
                    .obound_rx_slot
                    .lock()
                    .expect("outbound slot mutex poisoned") = obound_rx;
                *self
                    .oboundp_rx_slot
                    .lock()
                    .expect("outbound slot mutex poisoned") = oboundp_rx;
                let mut transport = transport;
                transport.shutdown(WRITE_SHUTDOWN_TIMEOUT).await;
                return false;
            }
        };

        self.ping_outstanding.store(false, Ordering::SeqCst);
        self.mark_last_sent();
        self.mark_last_received();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (pump_obound_tx, pump_obound_rx) = mpsc::channel::<PacketAndToken>(1);
        let (pump_oboundp_tx, pump_oboundp_rx) =
            mpsc::channel::<PacketAndToken>(PRIORITY_CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Publish>(INBOUND_CHANNEL_CAPACITY);

        let mut workers = JoinSet::new();

        if !self.options.keep_alive().is_zero() {
            workers.spawn(
                self.clone()
                    .run_keepalive(stop_rx.clone(), pump_oboundp_tx.clone()),
            );
        }

        let acks = AckEmitter::new(
            self.store.clone(),
            pump_oboundp_tx.clone(),
            stop_rx.clone(),
        );
        workers.spawn(self.router.clone().match_and_dispatch(
            incoming_rx,
            self.options.ordered(),
            acks,
        ));

        workers.spawn(self.clone().run_gateway(
            obound_rx,
            oboundp_rx,
            pump_obound_tx.clone(),
            pump_oboundp_tx.clone(),
            stop_rx.clone(),
        ));

        let (read_half, write_half) = transport.into_split();
        let reader_handle = tokio::spawn(self.clone().run_reader(
            read_half,
            stop_rx.clone(),
            inbound_from_store,
            incoming_tx,
            pump_oboundp_tx.clone(),
        ));
        let writer_handle =
            tokio::spawn(
                self.clone()
                    .run_writer(write_half, pump_obound_rx, pump_oboundp_rx),
            );

        let (comms_done_tx, comms_done_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = reader_handle.await;
            let _ = writer_handle.await;
            debug!("comms tasks finished");
            let _ = comms_done_tx.send(true);
        });

        *pump_guard = Some(PumpHandle {
            stop_tx,
            workers,
            comms_done_rx,
            pump_obound_tx,
            pump_oboundp_tx,
        });
        drop(pump_guard);

        self.set_status(ConnectionState::Connected);
        info!("client is connected");
        if let Some(on_connect) = self.options.on_connect() {
            let on_connect = on_connect.clone();
            tokio::spawn(async move { on_connect() });
        }
        true
    }

    /// Tears the comms pump down in the order documented at module level.
    /// Idempotent: returns false when no pump was running.
    pub(crate) async fn stop_comms_workers(&self) -> bool {
        let mut pump_guard = self.pump.lock().await;
        let Some(mut handle) = pump_guard.take() else {
            debug!("stop requested but comms workers not running");
            return false;
        };

        let _ = handle.stop_tx.send(true);

        debug!("waiting for comms workers");
        while handle.workers.join_next().await.is_some() {}

        // Every worker-held sender clone is gone now; dropping ours closes the
        // pump channels so the writer runs out of input.
        drop(handle.pump_obound_tx);
        drop(handle.pump_oboundp_tx);

        debug!("waiting for comms tasks");
        let mut comms_done_rx = handle.comms_done_rx;
        while !*comms_done_rx.borrow() {
            if comms_done_rx.changed().await.is_err() {
                break;
            }
        }

        debug!("comms workers stopped");
        true
    }

    /// Forwards the client-level outbound channels into the pump-internal
    /// ones. The client-level channels outlive connections (publishes may be
    /// enqueued while disconnected), so their receivers are parked back into
    /// the controller's slots when this task exits.
    async fn run_gateway(
        self: Arc<Self>,
        mut obound_rx: mpsc::Receiver<PacketAndToken>,
        mut oboundp_rx: mpsc::Receiver<PacketAndToken>,
        pump_obound_tx: mpsc::Sender<PacketAndToken>,
        pump_oboundp_tx: mpsc::Sender<PacketAndToken>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            let forward = tokio::select! {
                _ = stop_rx.changed() => None,
                msg = oboundp_rx.recv() => msg.map(|pt| (true, pt)),
                msg = obound_rx.recv() => msg.map(|pt| (false, pt)),
            };
            let Some((priority, pt)) = forward else { break };
            let pump_tx = if priority {
                &pump_oboundp_tx
            } else {
                &pump_obound_tx
            };
            if !send_or_stop(pump_tx, &mut stop_rx, pt).await {
                break;
            }
        }
        *self
            .obound_rx_slot
            .lock()
            .expect("outbound slot mutex poisoned") = Some(obound_rx);
        *self
            .oboundp_rx_slot
            .lock()
            .expect("outbound slot mutex poisoned") = Some(oboundp_rx);
        debug!("outbound gateway finished");
    }

    /// Parses control packets off the transport and dispatches them:
    /// acknowledgements resolve tokens through the identifier registry, QoS 2
    /// handshake steps are answered and persisted, PUBLISHes flow to the
    /// router. Packets replayed from the store arrive on `inbound_from_store`
    /// and take the same path as network input.
    async fn run_reader(
        self: Arc<Self>,
        mut read_half: Box<dyn TransportRead>,
        mut stop_rx: watch::Receiver<bool>,
        mut inbound_from_store: mpsc::Receiver<Packet>,
        incoming_tx: mpsc::Sender<Publish>,
        priority_tx: mpsc::Sender<PacketAndToken>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut chunk = vec![0u8; READ_BUFFER_SIZE];
        let mut store_open = true;

        let err: Arc<ClientError> = 'comms: loop {
            loop {
                match Packet::decode(&mut buf) {
                    Ok(Some(packet)) => {
                        if !self
                            .handle_inbound(packet, &incoming_tx, &priority_tx, &mut stop_rx)
                            .await
                        {
                            debug!("reader finished (stopping)");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'comms Arc::new(ClientError::Protocol(e)),
                }
            }

            let event = tokio::select! {
                _ = stop_rx.changed() => ReaderEvent::Stop,
                packet = inbound_from_store.recv(), if store_open => ReaderEvent::FromStore(packet),
                result = read_half.recv(&mut chunk) => ReaderEvent::Read(result),
            };
            match event {
                ReaderEvent::Stop => {
                    debug!("reader finished (stopping)");
                    return;
                }
                ReaderEvent::FromStore(Some(packet)) => {
                    if !self
                        .handle_inbound(packet, &incoming_tx, &priority_tx, &mut stop_rx)
                        .await
                    {
                        debug!("reader finished (stopping)");
                        return;
                    }
                }
                ReaderEvent::FromStore(None) => store_open = false,
                ReaderEvent::Read(Ok(0)) => {
                    break 'comms Arc::new(ClientError::Network(TransportError::Io(
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        ),
                    )))
                }
                ReaderEvent::Read(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                ReaderEvent::Read(Err(e)) => break 'comms Arc::new(ClientError::Network(e)),
            }
        };

        debug!(error = %err, "reader finished with error");
        let core = self.clone();
        tokio::spawn(async move { core.on_comms_error(err).await });
    }

    /// Routes one inbound control packet. Returns false when a downstream
    /// channel closed or the stop watch fired, which ends the reader.
    async fn handle_inbound(
        &self,
        packet: Packet,
        incoming_tx: &mpsc::Sender<Publish>,
        priority_tx: &mpsc::Sender<PacketAndToken>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        if !self.options.keep_alive().is_zero() {
            self.mark_last_received();
        }
        match packet {
            Packet::Publish(publish) => {
                trace!(topic = %publish.topic, qos = ?publish.qos, "inbound publish");
                return send_or_stop(incoming_tx, stop_rx, publish).await;
            }
            Packet::Puback { packet_id } => {
                self.store.del(&outbound_key(packet_id));
                if let Some(token) = self.registry.get_and_release(packet_id) {
                    token.complete();
                }
            }
            Packet::Pubrec { packet_id } => {
                // Exactly-once outbound: the PUBREL replaces the PUBLISH in
                // the store before it is handed to the writer.
                let pubrel = Packet::Pubrel { packet_id };
                persist_outbound(&*self.store, &pubrel);
                return send_or_stop(
                    priority_tx,
                    stop_rx,
                    PacketAndToken {
                        packet: pubrel,
                        token: None,
                    },
                )
                .await;
            }
            Packet::Pubcomp { packet_id } => {
                self.store.del(&outbound_key(packet_id));
                if let Some(token) = self.registry.get_and_release(packet_id) {
                    token.complete();
                }
            }
            Packet::Pubrel { packet_id } => {
                // The PUBREL replaces the stored inbound PUBLISH until the
                // PUBCOMP is on its way; a crash in between resumes the
                // exchange from the PUBREL.
                persist_inbound(&*self.store, &Packet::Pubrel { packet_id });
                let delivered = send_or_stop(
                    priority_tx,
                    stop_rx,
                    PacketAndToken {
                        packet: Packet::Pubcomp { packet_id },
                        token: None,
                    },
                )
                .await;
                if !delivered {
                    return false;
                }
                self.store.del(&inbound_key(packet_id));
            }
            Packet::Suback(suback) => {
                self.store.del(&outbound_key(suback.packet_id));
                if let Some(token) = self.registry.get_and_release(suback.packet_id) {
                    token.set_granted_qos(suback.return_codes);
                    token.complete();
                }
            }
            Packet::Unsuback { packet_id } => {
                self.store.del(&outbound_key(packet_id));
                if let Some(token) = self.registry.get_and_release(packet_id) {
                    token.complete();
                }
            }
            Packet::Pingresp => {
                trace!("pingresp received");
                self.ping_outstanding.store(false, Ordering::SeqCst);
            }
            other => {
                warn!(packet = ?other, "unexpected inbound packet, ignoring");
            }
        }
        true
    }

    /// Serializes outbound packets to the transport, preferring the priority
    /// stream on ties. Exits once both input channels have closed, or on the
    /// first write failure.
    async fn run_writer(
        self: Arc<Self>,
        mut write_half: Box<dyn TransportWrite>,
        mut obound_rx: mpsc::Receiver<PacketAndToken>,
        mut oboundp_rx: mpsc::Receiver<PacketAndToken>,
    ) {
        let write_timeout = self.options.effective_write_timeout();
        let mut priority_open = true;
        let mut ordinary_open = true;

        while priority_open || ordinary_open {
            let next = tokio::select! {
                biased;
                msg = oboundp_rx.recv(), if priority_open => match msg {
                    Some(pt) => Some(pt),
                    None => {
                        priority_open = false;
                        None
                    }
                },
                msg = obound_rx.recv(), if ordinary_open => match msg {
                    Some(pt) => Some(pt),
                    None => {
                        ordinary_open = false;
                        None
                    }
                },
            };
            let Some(pt) = next else { continue };

            let bytes = match pt.packet.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "dropping unencodable outbound packet");
                    if let Some(packet_id) = pt.packet.packet_id() {
                        self.registry.release(packet_id);
                    }
                    if let Some(token) = &pt.token {
                        token.fail(ClientError::Protocol(e));
                    }
                    continue;
                }
            };

            let result = tokio::time::timeout(
                write_timeout,
                write_half.send(&[IoSlice::new(&bytes)]),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    trace!(len = bytes.len(), "outbound packet written");
                    if !self.options.keep_alive().is_zero() {
                        self.mark_last_sent();
                    }
                    match &pt.packet {
                        // Sole place ping-outstanding is raised.
                        Packet::Pingreq => {
                            self.ping_sent_ms.store(self.now_ms(), Ordering::SeqCst);
                            self.ping_outstanding.store(true, Ordering::SeqCst);
                        }
                        // Fire-and-forget flows complete at the wire.
                        Packet::Publish(p) if p.qos == QoS::AtMostOnce => {
                            if let Some(token) = &pt.token {
                                token.complete();
                            }
                        }
                        Packet::Disconnect => {
                            if let Some(token) = &pt.token {
                                token.complete();
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Err(e)) => {
                    let err = Arc::new(ClientError::Network(e));
                    if let Some(token) = &pt.token {
                        token.fail_shared(err.clone());
                    }
                    let core = self.clone();
                    tokio::spawn(async move { core.on_comms_error(err).await });
                    break;
                }
                Err(_elapsed) => {
                    let err = Arc::new(ClientError::Network(TransportError::Timeout));
                    if let Some(token) = &pt.token {
                        token.fail_shared(err.clone());
                    }
                    let core = self.clone();
                    tokio::spawn(async move { core.on_comms_error(err).await });
                    break;
                }
            }
        }

        write_half.shutdown(WRITE_SHUTDOWN_TIMEOUT).await;
        debug!("writer finished");
    }

    /// Enqueues a PINGREQ when the link has been idle for a keepalive
    /// interval, and reports a ping timeout when a PINGREQ goes unanswered
    /// for another interval. The writer, not this task, raises the
    /// ping-outstanding flag when the PINGREQ actually hits the wire.
    async fn run_keepalive(
        self: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
        priority_tx: mpsc::Sender<PacketAndToken>,
    ) {
        let interval_ms = self.options.keep_alive().as_millis() as u64;
        let mut ping_enqueued = false;

        loop {
            let now = self.now_ms();
            let since_sent = now.saturating_sub(self.last_sent_ms.load(Ordering::Relaxed));
            let since_received = now.saturating_sub(self.last_received_ms.load(Ordering::Relaxed));

            if since_sent < interval_ms {
                ping_enqueued = false;
            }

            if self.ping_outstanding.load(Ordering::SeqCst) {
                ping_enqueued = false;
                let since_ping = now.saturating_sub(self.ping_sent_ms.load(Ordering::SeqCst));
                if since_ping >= interval_ms {
                    error!("pingresp not received, disconnecting");
                    let core = self.clone();
                    tokio::spawn(async move {
                        core.on_comms_error(Arc::new(ClientError::PingTimeout)).await
                    });
                    return;
                }
            } else if !ping_enqueued && (since_sent >= interval_ms || since_received >= interval_ms)
            {
                debug!("keepalive sending ping request");
                let delivered = send_or_stop(
                    &priority_tx,
                    &mut stop_rx,
                    PacketAndToken {
                        packet: Packet::Pingreq,
                        token: None,
                    },
                )
                .await;
                if !delivered {
                    debug!("keepalive finished");
                    return;
                }
                ping_enqueued = true;
            }

            // Sleep until the earliest deadline that could require action,
            // with a floor so flag transitions are picked up promptly.
            let mut next_ms = interval_ms.saturating_sub(since_sent.min(since_received));
            if self.ping_outstanding.load(Ordering::SeqCst) {
                let since_ping = self
                    .now_ms()
                    .saturating_sub(self.ping_sent_ms.load(Ordering::SeqCst));
                next_ms = next_ms.min(interval_ms.saturating_sub(since_ping));
            }
            let sleep_for = Duration::from_millis(next_ms.clamp(50, interval_ms.max(50)));
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("keepalive finished");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}
