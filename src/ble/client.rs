//! Connection driver behind `GattClient`
//!
//! Owns the one `Connection`, its operation queue and the notification
//! decoder inside a single spawned task. Application commands and transport
//! events are both funnelled into that task's `select!` loop, so no two
//! state changes for the link ever run concurrently and nothing outside the
//! task touches the transport handle.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::connection::{Connection, LinkState};
use super::decoder::{InboundMessage, NotificationDecoder};
use super::gatt::{self, CCCD_UUID};
use super::queue::{GattQueue, OpOutcome, OperationKind, PendingOperation, QueuedOperation};
use super::transport::{BleTransport, LinkId, PeripheralHandle, TransportEvent, WriteKind};
use super::BleError;
use crate::config::ClientConfig;

/// What the application observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(LinkState),
    MessageReceived(InboundMessage),
    Disconnected { peripheral: Option<PeripheralHandle> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Error(BleError),
}

/// An accepted GATT operation awaiting its acknowledgement.
#[derive(Debug)]
pub struct PendingOp {
    rx: oneshot::Receiver<Result<OpOutcome, BleError>>,
}

impl PendingOp {
    pub async fn wait(self) -> Result<OpOutcome, BleError> {
        // A dropped sender means the driver went away with the op queued.
        self.rx.await.unwrap_or(Err(BleError::Cancelled))
    }

    pub async fn acked(self) -> Result<(), BleError> {
        self.wait().await.map(|_| ())
    }
}

enum Command {
    Connect {
        peripheral: PeripheralHandle,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Write {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<PendingOp, BleError>>,
    },
    Read {
        reply: oneshot::Sender<Result<PendingOp, BleError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running connection driver. Cheap to clone.
#[derive(Clone)]
pub struct GattClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<LinkState>,
}

impl GattClient {
    /// Start the driver task. Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn BleTransport>, config: ClientConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);

        // Subscribe before the task starts so no transport event is lost.
        let transport_events = transport.events();
        let driver = Driver::new(transport, config, events_tx.clone(), state_tx);
        tokio::spawn(driver.run(commands_rx, transport_events));

        Self {
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| BleError::Closed)?;
        rx.await.map_err(|_| BleError::Closed)
    }

    /// Start connecting to `peripheral`. Returns once the request is
    /// submitted; follow progress through [`GattClient::subscribe`] or
    /// [`GattClient::wait_for_state`].
    pub async fn connect(&self, peripheral: PeripheralHandle) -> Result<(), BleError> {
        self.request(|reply| Command::Connect { peripheral, reply })
            .await?
    }

    /// Queue `text` as a characteristic write.
    ///
    /// Fails immediately with `NotReady`, `Busy` or `PayloadTooLarge`;
    /// otherwise the returned [`PendingOp`] resolves on the transport's ack.
    pub async fn send_message(&self, text: &str) -> Result<PendingOp, BleError> {
        self.send_bytes(text.as_bytes().to_vec()).await
    }

    pub async fn send_bytes(&self, payload: Vec<u8>) -> Result<PendingOp, BleError> {
        self.request(|reply| Command::Write { payload, reply })
            .await?
    }

    /// Read the characteristic's current value through the operation queue.
    pub async fn read_value(&self) -> Result<Vec<u8>, BleError> {
        let pending = self.request(|reply| Command::Read { reply }).await??;
        match pending.wait().await? {
            OpOutcome::Read(value) => Ok(value),
            OpOutcome::Written => Err(BleError::InvalidState(
                "read completed as a write".to_string(),
            )),
        }
    }

    /// Explicit teardown. The client is unusable afterwards.
    pub async fn close(&self) -> Result<(), BleError> {
        match self.request(|reply| Command::Close { reply }).await {
            Ok(()) | Err(BleError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Wait until the link reaches `target`. Fails with `Closed` if the
    /// client shuts down first.
    pub async fn wait_for_state(&self, target: LinkState) -> Result<(), BleError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == target {
                return Ok(());
            }
            if current.is_terminal() {
                return Err(BleError::Closed);
            }
            state.changed().await.map_err(|_| BleError::Closed)?;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AckKind {
    Descriptor,
    Write,
    Read,
}

impl AckKind {
    fn answers(self, kind: &OperationKind) -> bool {
        matches!(
            (self, kind),
            (AckKind::Descriptor, OperationKind::DescriptorWrite { .. })
                | (AckKind::Write, OperationKind::CharacteristicWrite { .. })
                | (AckKind::Read, OperationKind::CharacteristicRead)
        )
    }
}

struct Driver {
    transport: Arc<dyn BleTransport>,
    config: ClientConfig,
    connection: Connection,
    queue: GattQueue,
    decoder: NotificationDecoder,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<LinkState>,
    /// Peripheral the reconnection policy returns to.
    target: Option<PeripheralHandle>,
    /// Timeout for the current setup phase.
    deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
}

impl Driver {
    fn new(
        transport: Arc<dyn BleTransport>,
        config: ClientConfig,
        events: broadcast::Sender<ClientEvent>,
        state: watch::Sender<LinkState>,
    ) -> Self {
        Self {
            transport,
            queue: GattQueue::new(config.queue_depth),
            config,
            connection: Connection::new(),
            decoder: NotificationDecoder::new(),
            events,
            state,
            target: None,
            deadline: None,
            reconnect_at: None,
            reconnect_attempt: 0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) {
        loop {
            let deadline = self.deadline;
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        // Every handle was dropped.
                        self.shutdown().await;
                        break;
                    }
                },
                event = transport_events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => self.on_lagged(skipped).await,
                    Err(RecvError::Closed) => {
                        log::warn!("Transport event stream closed");
                        self.shutdown().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.on_reconnect_due().await;
                }
            }
        }
        log::debug!("Connection driver stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { peripheral, reply } => {
                let result = if self.connection.state() == LinkState::Idle {
                    self.reconnect_at = None;
                    self.reconnect_attempt = 0;
                    self.target = Some(peripheral.clone());
                    self.start_connect(peripheral).await
                } else {
                    Err(BleError::InvalidState(format!(
                        "cannot connect while {:?}",
                        self.connection.state()
                    )))
                };
                let _ = reply.send(result);
            }
            Command::Write { payload, reply } => {
                let result = self.enqueue_write(payload).await;
                let _ = reply.send(result);
            }
            Command::Read { reply } => {
                let result = self.enqueue_read().await;
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_connect(&mut self, peripheral: PeripheralHandle) -> Result<(), BleError> {
        // At most one transport handle: release the previous one first.
        if let Some(stale) = self.connection.release()? {
            self.disconnect_link(stale).await;
        }

        log::info!(
            "Connecting to {} ({})",
            peripheral.address,
            peripheral.name.as_deref().unwrap_or("unnamed")
        );
        let link = self.transport.connect(&peripheral).await?;
        self.connection.begin_connect(peripheral, link)?;
        self.deadline = self.config.connect_timeout().map(|t| Instant::now() + t);
        self.publish_state();
        Ok(())
    }

    async fn enqueue_write(&mut self, payload: Vec<u8>) -> Result<PendingOp, BleError> {
        let characteristic = self.connection.ready_characteristic()?;
        let max = gatt::max_write_len(self.connection.mtu());
        if payload.len() > max {
            return Err(BleError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        let kind = if characteristic.properties.write {
            WriteKind::WithResponse
        } else if characteristic.properties.write_without_response {
            WriteKind::WithoutResponse
        } else {
            return Err(BleError::InvalidState(
                "characteristic does not accept writes".to_string(),
            ));
        };

        let op = PendingOperation::characteristic_write(characteristic.uuid, payload, kind);
        self.submit_with_reply(op).await
    }

    async fn enqueue_read(&mut self) -> Result<PendingOp, BleError> {
        let characteristic = self.connection.ready_characteristic()?;
        if !characteristic.properties.read {
            return Err(BleError::InvalidState(
                "characteristic does not allow reads".to_string(),
            ));
        }
        let op = PendingOperation::characteristic_read(characteristic.uuid);
        self.submit_with_reply(op).await
    }

    async fn submit_with_reply(&mut self, op: PendingOperation) -> Result<PendingOp, BleError> {
        let (tx, rx) = oneshot::channel();
        self.submit(QueuedOperation::new(op, Some(tx))).await?;
        Ok(PendingOp { rx })
    }

    async fn submit(&mut self, entry: QueuedOperation) -> Result<(), BleError> {
        let dispatch_now = self.queue.enqueue(entry).map_err(|(err, _rejected)| err)?;
        if dispatch_now {
            self.dispatch_in_flight().await;
        }
        Ok(())
    }

    /// Hand the in-flight operation to the transport. Operations the
    /// transport refuses outright are failed and the next one is tried.
    async fn dispatch_in_flight(&mut self) {
        while let Some(op) = self.queue.in_flight().cloned() {
            // Operations only go out on the link their characteristic was
            // discovered on.
            let checked = match self.connection.characteristic() {
                Some(handle) if handle.uuid == op.characteristic => self
                    .connection
                    .validate(handle)
                    .map(|()| handle.link()),
                _ => Err(BleError::StaleHandle),
            };
            let link = match checked {
                Ok(link) => link,
                Err(e) => {
                    log::warn!("Dropping {:?} on {}: {}", op.kind, op.characteristic, e);
                    if !self.complete_in_flight(Err(e.clone())) {
                        self.fail_link(e).await;
                        return;
                    }
                    continue;
                }
            };
            let sent = match &op.kind {
                OperationKind::DescriptorWrite { descriptor } => {
                    self.transport
                        .write_descriptor(link, op.characteristic, *descriptor, &op.payload)
                        .await
                }
                OperationKind::CharacteristicWrite { kind } => {
                    self.transport
                        .write_characteristic(link, op.characteristic, &op.payload, *kind)
                        .await
                }
                OperationKind::CharacteristicRead => {
                    self.transport
                        .read_characteristic(link, op.characteristic)
                        .await
                }
            };
            match sent {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("Transport refused {:?}: {}", op.kind, e);
                    let setup_ok = self.complete_in_flight(Err(e.clone()));
                    if !setup_ok || e.is_link_fatal() {
                        self.fail_link(e).await;
                        return;
                    }
                }
            }
        }
    }

    /// Resolve the in-flight operation and promote the next one.
    ///
    /// Returns `false` when the completion was a failed CCCD write during
    /// setup, which the caller must treat as a link failure.
    fn complete_in_flight(&mut self, result: Result<OpOutcome, BleError>) -> bool {
        let Some(entry) = self.queue.complete() else {
            return true;
        };
        let setup_write = matches!(entry.op.kind, OperationKind::DescriptorWrite { .. })
            && self.connection.state() == LinkState::EnablingNotify;
        let ok = result.is_ok();
        entry.resolve(result);
        self.queue.promote();

        if setup_write && ok {
            if let Err(e) = self.connection.on_notify_enabled() {
                log::error!("{}", e);
                return true;
            }
            log::info!("Notifications enabled, link ready");
            self.deadline = None;
            self.reconnect_attempt = 0;
            self.publish_state();
        }
        !(setup_write && !ok)
    }

    async fn shutdown(&mut self) {
        self.deadline = None;
        self.reconnect_at = None;
        self.cancel_pending();
        match self.connection.close() {
            Ok(Some(link)) => self.disconnect_link(link).await,
            Ok(None) => {}
            Err(e) => log::debug!("Close on finished connection: {}", e),
        }
        self.publish_state();
        log::info!("Connection closed");
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event.link() {
            // Scan results belong to the scanner.
            None => return,
            Some(link) if !self.connection.owns(link) => {
                log::debug!("Ignoring event for released {}: {:?}", link, event);
                return;
            }
            Some(_) => {}
        }

        match event {
            TransportEvent::DeviceDiscovered(_) => {}
            TransportEvent::Connected { mtu, .. } => self.on_connected(mtu).await,
            TransportEvent::Disconnected { .. } => self.fail_link(BleError::Disconnected).await,
            TransportEvent::MtuChanged { mtu, .. } => {
                log::debug!("MTU changed to {}", mtu);
                self.connection.set_mtu(mtu);
            }
            TransportEvent::ServicesDiscovered { result, .. } => {
                self.on_services_discovered(result).await
            }
            TransportEvent::DescriptorWritten {
                characteristic,
                result,
                ..
            } => {
                self.on_ack(
                    AckKind::Descriptor,
                    characteristic,
                    result.map(|()| OpOutcome::Written),
                )
                .await
            }
            TransportEvent::CharacteristicWritten {
                characteristic,
                result,
                ..
            } => {
                self.on_ack(
                    AckKind::Write,
                    characteristic,
                    result.map(|()| OpOutcome::Written),
                )
                .await
            }
            TransportEvent::CharacteristicRead {
                characteristic,
                result,
                ..
            } => {
                self.on_ack(AckKind::Read, characteristic, result.map(OpOutcome::Read))
                    .await
            }
            TransportEvent::Notification {
                characteristic,
                value,
                ..
            } => self.on_notification(characteristic, &value),
        }
    }

    async fn on_connected(&mut self, mtu: u16) {
        if self.connection.state() != LinkState::Connecting {
            log::debug!("Duplicate connect event in {:?}", self.connection.state());
            return;
        }
        if let Err(e) = self.connection.on_connected(mtu) {
            log::error!("{}", e);
            return;
        }
        log::info!("Connected to GATT server (MTU {})", mtu);
        self.deadline = self.config.discovery_timeout().map(|t| Instant::now() + t);
        self.publish_state();

        if let Some(link) = self.connection.link() {
            if let Err(e) = self.transport.discover_services(link).await {
                self.fail_link(e).await;
            }
        }
    }

    async fn on_services_discovered(
        &mut self,
        result: Result<Vec<gatt::GattService>, String>,
    ) {
        if self.connection.state() != LinkState::ServiceDiscovery {
            log::debug!("Unexpected discovery result in {:?}", self.connection.state());
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(reason) => {
                self.fail_link(BleError::Transport(reason)).await;
                return;
            }
        };

        let handle = match self.connection.on_services_discovered(
            &services,
            self.config.service_uuid,
            self.config.characteristic_uuid,
        ) {
            Ok(handle) => handle,
            Err(e @ BleError::TargetNotFound(_)) => {
                log::error!("{}; not retrying", e);
                self.teardown(e, false).await;
                return;
            }
            Err(e) => {
                self.fail_link(e).await;
                return;
            }
        };

        if !handle.has_cccd {
            log::debug!("{} lists no CCCD, writing it anyway", handle.uuid);
        }
        self.deadline = self.config.discovery_timeout().map(|t| Instant::now() + t);
        self.publish_state();

        // `can_subscribe` was checked during discovery.
        let value = handle.properties.cccd_enable_value().unwrap_or(gatt::ENABLE_NOTIFICATION_VALUE);
        let op = PendingOperation::descriptor_write(handle.uuid, CCCD_UUID, value.to_vec());
        if let Err(e) = self.submit(QueuedOperation::new(op, None)).await {
            self.fail_link(e).await;
        }
    }

    async fn on_ack(
        &mut self,
        acked: AckKind,
        characteristic: Uuid,
        result: Result<OpOutcome, String>,
    ) {
        let expected = self
            .queue
            .in_flight()
            .is_some_and(|op| op.characteristic == characteristic && acked.answers(&op.kind));
        if !expected {
            log::warn!("Unexpected {:?} ack for {}", acked, characteristic);
            return;
        }

        let result = result.map_err(BleError::Transport);
        if let Err(e) = &result {
            log::warn!("GATT {:?} on {} failed: {}", acked, characteristic, e);
        }
        let failure = result.as_ref().err().cloned();
        if !self.complete_in_flight(result) {
            let reason = failure.unwrap_or(BleError::Disconnected);
            self.fail_link(reason).await;
            return;
        }
        self.dispatch_in_flight().await;
    }

    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        let message = self.decoder.decode(characteristic, value);
        if message.is_decode_error() {
            log::warn!("Received undecodable message: {}", message);
        } else {
            log::info!("Received message: {}", message);
        }
        self.emit(ClientEvent::MessageReceived(message));
    }

    /// Skipped transport events may include acks or notifications for the
    /// live link, so it can no longer be trusted.
    async fn on_lagged(&mut self, skipped: u64) {
        log::warn!("Driver lagged, {} transport events skipped", skipped);
        if self.connection.link().is_some() {
            self.fail_link(BleError::Transport(format!(
                "event stream lagged, {} events lost",
                skipped
            )))
            .await;
        }
    }

    async fn on_deadline(&mut self) {
        self.deadline = None;
        let state = self.connection.state();
        if matches!(
            state,
            LinkState::Connecting | LinkState::ServiceDiscovery | LinkState::EnablingNotify
        ) {
            log::warn!("Timed out in {:?}", state);
            self.fail_link(BleError::Timeout).await;
        }
    }

    async fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.connection.state() != LinkState::Idle {
            return;
        }
        let Some(target) = self.target.clone() else {
            return;
        };
        if let Err(e) = self.start_connect(target).await {
            log::warn!("Reconnect attempt failed: {}", e);
            self.emit(ClientEvent::Error(e));
            self.schedule_reconnect();
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Disconnect-class failure: back to `Idle`, then let the policy decide.
    async fn fail_link(&mut self, reason: BleError) {
        self.teardown(reason, true).await;
    }

    async fn teardown(&mut self, reason: BleError, retry: bool) {
        self.deadline = None;
        self.cancel_pending();
        self.decoder.reset();

        let peripheral = self.connection.peripheral().cloned();
        match self.connection.release() {
            Ok(Some(link)) => self.disconnect_link(link).await,
            Ok(None) => {}
            Err(e) => log::error!("{}", e),
        }
        self.publish_state();

        log::info!("Disconnected from GATT server: {}", reason);
        self.emit(ClientEvent::Disconnected { peripheral });
        if reason != BleError::Disconnected {
            self.emit(ClientEvent::Error(reason));
        }
        if retry {
            self.schedule_reconnect();
        }
    }

    fn cancel_pending(&mut self) {
        for entry in self.queue.drain() {
            log::debug!("Cancelling {:?}", entry.op.kind);
            entry.resolve(Err(BleError::Cancelled));
        }
    }

    async fn disconnect_link(&self, link: LinkId) {
        if let Err(e) = self.transport.disconnect(link).await {
            log::warn!("Failed to disconnect {}: {}", link, e);
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.target.is_none() {
            return;
        }
        match self.config.reconnect.delay(self.reconnect_attempt) {
            None => log::info!("Reconnect policy is none, staying idle"),
            Some(delay) => {
                self.reconnect_attempt += 1;
                self.reconnect_at = Some(Instant::now() + delay);
                log::info!(
                    "Reconnect attempt {} in {:?}",
                    self.reconnect_attempt,
                    delay
                );
                self.emit(ClientEvent::ReconnectScheduled {
                    attempt: self.reconnect_attempt,
                    delay,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn publish_state(&self) {
        let state = self.connection.state();
        let previous = self.state.send_replace(state);
        if previous != state {
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{CHARACTERISTIC_UUID, ENABLE_NOTIFICATION_VALUE};
    use crate::ble::reconnect::ReconnectPolicy;
    use crate::ble::simulated::{SimPeripheral, SimTransport, TransportCall};

    async fn next_event(
        rx: &mut broadcast::Receiver<ClientEvent>,
        wanted: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let event = rx.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event never arrived")
    }

    async fn ready_client(transport: &Arc<SimTransport>, config: ClientConfig) -> GattClient {
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        let client = GattClient::spawn(transport.clone(), config);
        client.connect(esp).await.unwrap();
        client.wait_for_state(LinkState::Ready).await.unwrap();
        client
    }

    fn connect_calls(calls: &[TransportCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count()
    }

    #[tokio::test]
    async fn test_setup_walks_every_state() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());
        let mut events = client.subscribe();

        client.connect(esp).await.unwrap();
        let mut seen = Vec::new();
        while seen.last() != Some(&LinkState::Ready) {
            if let ClientEvent::StateChanged(state) =
                next_event(&mut events, |e| matches!(e, ClientEvent::StateChanged(_))).await
            {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                LinkState::Connecting,
                LinkState::ServiceDiscovery,
                LinkState::EnablingNotify,
                LinkState::Ready,
            ]
        );

        let cccd_write = transport.calls().await.into_iter().find_map(|call| match call {
            TransportCall::WriteDescriptor {
                characteristic,
                descriptor,
                value,
                ..
            } => Some((characteristic, descriptor, value)),
            _ => None,
        });
        assert_eq!(
            cccd_write,
            Some((CHARACTERISTIC_UUID, CCCD_UUID, ENABLE_NOTIFICATION_VALUE.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_send_before_ready_makes_no_transport_call() {
        let transport = SimTransport::new();
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());

        assert_eq!(client.send_message("ping").await.unwrap_err(), BleError::NotReady);
        assert_eq!(client.read_value().await.unwrap_err(), BleError::NotReady);
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_write_is_busy() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;
        transport.hold_acks(true).await;

        let first = client.send_message("ping").await.unwrap();
        assert_eq!(client.send_message("ping").await.unwrap_err(), BleError::Busy);

        transport.release_held().await;
        first.acked().await.unwrap();
        // The slot is free again.
        transport.hold_acks(false).await;
        client.send_message("ping").await.unwrap().acked().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_dispatches_in_order() {
        let transport = SimTransport::new();
        let config = ClientConfig {
            queue_depth: 1,
            ..ClientConfig::default()
        };
        let client = ready_client(&transport, config).await;
        transport.hold_acks(true).await;
        transport.clear_calls().await;

        let a = client.send_message("a").await.unwrap();
        let b = client.send_message("b").await.unwrap();
        assert_eq!(client.send_message("c").await.unwrap_err(), BleError::Busy);

        transport.hold_acks(false).await;
        transport.release_held().await;
        a.acked().await.unwrap();
        b.acked().await.unwrap();

        let written: Vec<Vec<u8>> = transport
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::WriteCharacteristic { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_payload_limited_by_mtu() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;

        let err = client.send_bytes(vec![b'x'; 21]).await.unwrap_err();
        assert_eq!(err, BleError::PayloadTooLarge { size: 21, max: 20 });
        client.send_bytes(vec![b'x'; 20]).await.unwrap().acked().await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_are_numbered() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;
        let mut events = client.subscribe();

        transport.notify(CHARACTERISTIC_UUID, &[0x68, 0x69]).await;
        transport.notify(CHARACTERISTIC_UUID, &[0xc3, 0x28]).await;

        let is_message = |e: &ClientEvent| matches!(e, ClientEvent::MessageReceived(_));
        let ClientEvent::MessageReceived(first) = next_event(&mut events, is_message).await else {
            unreachable!()
        };
        let ClientEvent::MessageReceived(second) = next_event(&mut events, is_message).await else {
            unreachable!()
        };
        assert_eq!(first.text(), Some("hi"));
        assert_eq!(first.seq, 0);
        assert!(second.is_decode_error());
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn test_read_goes_through_queue() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;

        client.send_message("abc").await.unwrap().acked().await.unwrap();
        assert_eq!(client.read_value().await.unwrap(), b"abc".to_vec());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_outstanding_write() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;
        transport.hold_acks(true).await;

        let pending = client.send_message("ping").await.unwrap();
        transport.drop_links().await;

        assert_eq!(pending.acked().await.unwrap_err(), BleError::Cancelled);
        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert_eq!(client.send_message("ping").await.unwrap_err(), BleError::NotReady);
    }

    #[tokio::test]
    async fn test_disconnect_while_enabling_notify() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.hold_acks(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());

        client.connect(esp).await.unwrap();
        client.wait_for_state(LinkState::EnablingNotify).await.unwrap();
        transport.drop_links().await;

        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert_eq!(transport.release_held().await, 0);
        assert_eq!(client.send_message("late").await.unwrap_err(), BleError::NotReady);
    }

    #[tokio::test]
    async fn test_failed_cccd_write_tears_down() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.fail_writes(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());
        let mut events = client.subscribe();

        client.connect(esp).await.unwrap();
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert!(matches!(error, ClientEvent::Error(BleError::Transport(_))));
        client.wait_for_state(LinkState::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_while_busy_is_rejected() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.hold_connect(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());

        client.connect(esp.clone()).await.unwrap();
        assert!(matches!(
            client.connect(esp).await,
            Err(BleError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_not_retried() {
        let transport = SimTransport::new();
        let bare = transport
            .add_peripheral(SimPeripheral::new("ESP32").with_services(Vec::new()))
            .await;
        let config = ClientConfig {
            reconnect: ReconnectPolicy::Immediate,
            ..ClientConfig::default()
        };
        let client = GattClient::spawn(transport.clone(), config);
        let mut events = client.subscribe();

        client.connect(bare).await.unwrap();
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert!(matches!(error, ClientEvent::Error(BleError::TargetNotFound(_))));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.state(), LinkState::Idle);
        assert_eq!(connect_calls(&transport.calls().await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.hold_connect(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());
        let mut events = client.subscribe();

        client.connect(esp).await.unwrap();
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert_eq!(error, ClientEvent::Error(BleError::Timeout));
        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert!(transport
            .calls()
            .await
            .contains(&TransportCall::Disconnect(LinkId(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow_to_max() {
        let transport = SimTransport::new();
        let gone = transport
            .add_peripheral(SimPeripheral::new("ESP32").unreachable())
            .await;
        let config = ClientConfig {
            reconnect: "backoff(100ms, 400ms, 2)".parse().unwrap(),
            ..ClientConfig::default()
        };
        let client = GattClient::spawn(transport.clone(), config);
        let mut events = client.subscribe();

        client.connect(gone).await.unwrap();
        let mut delays = Vec::new();
        while delays.len() < 4 {
            if let ClientEvent::ReconnectScheduled { delay, .. } = next_event(&mut events, |e| {
                matches!(e, ClientEvent::ReconnectScheduled { .. })
            })
            .await
            {
                delays.push(delay.as_millis());
            }
        }
        assert_eq!(delays, vec![100, 200, 400, 400]);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_immediate_reconnect_restores_ready() {
        let transport = SimTransport::new();
        let config = ClientConfig {
            reconnect: ReconnectPolicy::Immediate,
            ..ClientConfig::default()
        };
        let client = ready_client(&transport, config).await;
        let mut events = client.subscribe();

        transport.drop_links().await;
        let scheduled = next_event(&mut events, |e| {
            matches!(e, ClientEvent::ReconnectScheduled { .. })
        })
        .await;
        assert_eq!(
            scheduled,
            ClientEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::ZERO,
            }
        );
        next_event(&mut events, |e| *e == ClientEvent::StateChanged(LinkState::Ready)).await;

        assert_eq!(connect_calls(&transport.calls().await), 2);
        assert_eq!(transport.live_links().await, vec![LinkId(2)]);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;

        client.close().await.unwrap();
        assert_eq!(client.state(), LinkState::Closed);
        assert!(transport.live_links().await.is_empty());

        assert_eq!(client.send_message("x").await.unwrap_err(), BleError::Closed);
        assert_eq!(client.wait_for_state(LinkState::Ready).await, Err(BleError::Closed));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_lag_fails_link_instead_of_wedging() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;
        let mut events = client.subscribe();
        transport.hold_acks(true).await;

        let pending = client.send_message("ping").await.unwrap();
        let burst: Vec<Vec<u8>> = (0..300).map(|n| n.to_string().into_bytes()).collect();
        transport.notify_burst(CHARACTERISTIC_UUID, &burst).await;

        assert_eq!(pending.acked().await.unwrap_err(), BleError::Cancelled);
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert!(matches!(error, ClientEvent::Error(BleError::Transport(_))));
        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert_eq!(client.send_message("ping").await.unwrap_err(), BleError::NotReady);
    }

    #[tokio::test]
    async fn test_dispatch_without_live_characteristic_is_stale() {
        let transport = SimTransport::new();
        let (events_tx, _) = broadcast::channel(16);
        let (state_tx, _state_rx) = watch::channel(LinkState::Idle);
        let mut driver =
            Driver::new(transport.clone(), ClientConfig::default(), events_tx, state_tx);

        let (tx, rx) = oneshot::channel();
        let op = PendingOperation::characteristic_write(
            CHARACTERISTIC_UUID,
            b"x".to_vec(),
            WriteKind::WithResponse,
        );
        driver.submit(QueuedOperation::new(op, Some(tx))).await.unwrap();

        assert_eq!(rx.await.unwrap(), Err(BleError::StaleHandle));
        assert!(driver.queue.is_empty());
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.hold_discovery(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());
        let mut events = client.subscribe();

        client.connect(esp).await.unwrap();
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert_eq!(error, ClientEvent::Error(BleError::Timeout));
        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert!(transport.live_links().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_enable_timeout() {
        let transport = SimTransport::new();
        let esp = transport.add_peripheral(SimPeripheral::new("ESP32")).await;
        transport.hold_acks(true).await;
        let client = GattClient::spawn(transport.clone(), ClientConfig::default());
        let mut events = client.subscribe();

        client.connect(esp).await.unwrap();
        next_event(&mut events, |e| {
            *e == ClientEvent::StateChanged(LinkState::EnablingNotify)
        })
        .await;
        let error = next_event(&mut events, |e| matches!(e, ClientEvent::Error(_))).await;
        assert_eq!(error, ClientEvent::Error(BleError::Timeout));
        client.wait_for_state(LinkState::Idle).await.unwrap();
        assert_eq!(transport.held_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_stays_idle_after_drop() {
        let transport = SimTransport::new();
        let client = ready_client(&transport, ClientConfig::default()).await;
        let mut events = client.subscribe();

        transport.drop_links().await;
        next_event(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ClientEvent::ReconnectScheduled { .. }),
                "unexpected {:?}",
                event
            );
        }
        assert_eq!(client.state(), LinkState::Idle);
        assert_eq!(connect_calls(&transport.calls().await), 1);
    }
}
