//! Connection lifecycle state machine for serving a HID host.
//!
//! This module owns the L2CAP channel pair, drives the
//! NONE → WAITING → ACCEPTED / DROPPED cycle, and is the single
//! serialization point for all state transitions: every command and
//! every asynchronous socket outcome flows through one actor loop, so
//! exactly one transition is ever in flight.

use std::{str::FromStr, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      channel::{AcceptedLink, ChannelPair},
      radio::{RadioControl, RecordHandle},
   },
   config::Config,
   error::{BlueHidError, Result},
   event::{EventSender, HidEvent},
   hid::report::HidReport,
};

/// Channel buffer size for the actor inbox and loopback.
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Jitter added on top of the configured retry delay.
const RETRY_JITTER_MS: u64 = 500;

/// Connection lifecycle states. Exactly one is current at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   /// Never started.
   None,
   /// Listening sockets open, awaiting a host accept.
   Waiting,
   /// Both channels connected; reports flow.
   Accepted,
   /// Teardown in progress.
   Dropping,
   /// Cleanup complete; eligible for retry.
   Dropped,
}

/// Inputs to the state machine: local commands and socket outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
   Start,
   AcceptOk,
   AcceptTimeout,
   AcceptFailed,
   LinkFailed,
   Stop,
   TeardownDone,
}

impl ConnectionState {
   /// The transition table. Returns `None` for transitions the machine
   /// rejects; the actor treats those as no-ops.
   pub fn apply(self, event: LinkEvent) -> Option<Self> {
      use ConnectionState::*;
      use LinkEvent::*;

      match (self, event) {
         (None | Dropped, Start) => Some(Waiting),
         (Waiting, AcceptOk) => Some(Accepted),
         (Waiting, AcceptTimeout) => Some(Waiting),
         (Waiting, AcceptFailed) => Some(Dropped),
         (Waiting | Accepted, LinkFailed | Stop) => Some(Dropping),
         (Dropping, TeardownDone) => Some(Dropped),
         _ => Option::None,
      }
   }

   pub const fn is_accepted(self) -> bool {
      matches!(self, Self::Accepted)
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // User commands
   Start(Address, Option<oneshot::Sender<Result<()>>>),
   Stop(Option<oneshot::Sender<()>>),
   GetState(oneshot::Sender<ConnectionState>),
   GetTarget(oneshot::Sender<Option<Address>>),
   Send(HidReport, oneshot::Sender<Result<()>>),

   // Socket outcomes, via loopback
   Accepted(AcceptedLink),
   AcceptFailed(BlueHidError),
   LinkDown,
}

// === Public handle ===

/// Handle to the connection manager actor.
///
/// All methods are safe to call concurrently from any task; the actor
/// serializes them. `send` never blocks its caller beyond the bounded
/// interrupt-channel write.
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl ConnectionManager {
   pub fn new<R: RadioControl>(radio: R, event_tx: EventSender, config: Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ManagerActor::new(radio, event_tx, config, command_rx, loopback_tx, loopback_rx).run(),
      );
      Self { inbox: command_tx }
   }

   /// Begins serving the given host: advertises the HID service and
   /// waits for it to connect both channels.
   pub async fn start(&self, device: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Start(device, Some(tx)))
         .await
         .map_err(|_| BlueHidError::ManagerShutdown)?;
      rx.await.map_err(|_| BlueHidError::ManagerShutdown)?
   }

   /// Unconditional teardown. No-op if never started.
   pub async fn stop(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Stop(Some(tx)))
         .await
         .map_err(|_| BlueHidError::ManagerShutdown)?;
      rx.await.map_err(|_| BlueHidError::ManagerShutdown)
   }

   pub async fn state(&self) -> ConnectionState {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetState(tx))
         .await
         .is_err()
      {
         return ConnectionState::None;
      }
      rx.await.unwrap_or(ConnectionState::None)
   }

   pub async fn target(&self) -> Option<Address> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetTarget(tx))
         .await
         .ok()?;
      rx.await.ok().flatten()
   }

   /// Writes one input report to the connected host.
   ///
   /// Fails with `NotConnected` unless the current state is ACCEPTED; a
   /// write failure tears the connection down rather than retrying.
   pub async fn send(&self, report: HidReport) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Send(report, tx))
         .await
         .map_err(|_| BlueHidError::ManagerShutdown)?;
      rx.await.map_err(|_| BlueHidError::ManagerShutdown)?
   }
}

// === Actor ===

struct ManagerActor<R: RadioControl> {
   radio: R,
   event_tx: EventSender,
   config: Config,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,

   state: ConnectionState,
   target: Option<Address>,
   link: Option<AcceptedLink>,
   accept_task: Option<JoinHandle<()>>,
   monitor_task: Option<JoinHandle<()>>,
   retry_task: Option<JoinHandle<()>>,
   sdp_record: Option<RecordHandle>,
   original_class: Option<u32>,
}

impl<R: RadioControl> ManagerActor<R> {
   fn new(
      radio: R,
      event_tx: EventSender,
      config: Config,
      command_rx: mpsc::Receiver<ManagerCommand>,
      loopback_tx: mpsc::Sender<ManagerCommand>,
      loopback_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      Self {
         radio,
         event_tx,
         config,
         command_rx,
         loopback_tx,
         loopback_rx,
         state: ConnectionState::None,
         target: None,
         link: None,
         accept_task: None,
         monitor_task: None,
         retry_task: None,
         sdp_record: None,
         original_class: None,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      // Handle dropped: final teardown restores the radio.
      self.handle_stop().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Start(device, reply) => {
            let result = self.handle_start(device).await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::Stop(reply) => {
            self.handle_stop().await;
            if let Some(reply) = reply {
               let _ = reply.send(());
            }
         },
         ManagerCommand::GetState(reply) => {
            let _ = reply.send(self.state);
         },
         ManagerCommand::GetTarget(reply) => {
            let _ = reply.send(self.target);
         },
         ManagerCommand::Send(report, reply) => {
            let result = self.handle_send(report).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Accepted(link) => {
            self.handle_accepted(link);
         },
         ManagerCommand::AcceptFailed(error) => {
            self.handle_accept_failed(&error);
         },
         ManagerCommand::LinkDown => {
            self.handle_link_down().await;
         },
      }
   }

   /// Applies one event to the state machine, emitting the transition.
   fn transition(&mut self, event: LinkEvent) -> bool {
      let Some(next) = self.state.apply(event) else {
         debug!("Ignoring {event:?} in state {}", self.state);
         return false;
      };
      if next != self.state {
         info!("Connection state {} -> {next} ({event:?})", self.state);
         self.state = next;
         self.event_tx.emit(HidEvent::StateChanged(next));
      }
      true
   }

   async fn handle_start(&mut self, device: Address) -> Result<()> {
      match self.state {
         ConnectionState::Waiting | ConnectionState::Accepted | ConnectionState::Dropping => {
            // Already serving; concurrent starts are idempotent.
            debug!("start({device}) ignored in state {}", self.state);
            return Ok(());
         },
         ConnectionState::None | ConnectionState::Dropped => {},
      }

      // This start supersedes any armed retry timer.
      if let Some(task) = self.retry_task.take() {
         task.abort();
      }

      self.transition(LinkEvent::Start);

      if !self.radio.is_usable().await {
         warn!("Radio not usable; cannot serve {device}");
         self.event_tx.emit(HidEvent::RadioUnavailable);
         self.transition(LinkEvent::AcceptFailed);
         return Err(BlueHidError::RadioUnavailable);
      }

      // Radio setup is kept across failure-drops for fast re-accept;
      // only a clean stop() undoes it.
      if self.original_class.is_none() {
         match self.radio.set_device_class(self.config.device_class).await {
            Ok(previous) => self.original_class = Some(previous),
            Err(e) => {
               self.transition(LinkEvent::AcceptFailed);
               return Err(e);
            },
         }
      }
      if self.sdp_record.is_none() {
         match self.radio.register_hid_record().await {
            Ok(handle) => self.sdp_record = Some(handle),
            Err(e) => {
               self.transition(LinkEvent::AcceptFailed);
               return Err(e);
            },
         }
      }

      let local = match self.radio.local_address().await {
         Ok(addr) => addr,
         Err(e) => {
            self.transition(LinkEvent::AcceptFailed);
            return Err(e);
         },
      };

      self.target = Some(device);
      self.persist_target(device);
      self.spawn_accept_loop(local, device);
      Ok(())
   }

   fn persist_target(&mut self, device: Address) {
      let addr_str = SmolStr::new(device.to_string());
      if self.config.last_device.as_ref() != Some(&addr_str) {
         self.config.last_device = Some(addr_str);
         if let Err(e) = self.config.save() {
            warn!("Failed to persist last device: {e}");
         }
      }
   }

   /// Spawns the accept poll loop on its own task. Each iteration opens
   /// fresh listeners, so no partial-channel state survives a timeout,
   /// and aborting the task (stop) closes them to unblock the accept.
   fn spawn_accept_loop(&mut self, local: Address, device: Address) {
      let loopback = self.loopback_tx.clone();
      let timeout = Duration::from_millis(self.config.accept_timeout_ms);

      self.accept_task = Some(tokio::spawn(async move {
         loop {
            let pair = match ChannelPair::open(local).await {
               Ok(pair) => pair,
               Err(e) => {
                  let _ = loopback.send(ManagerCommand::AcceptFailed(e)).await;
                  return;
               },
            };

            match pair.accept(timeout).await {
               Ok(link) if link.peer == device => {
                  let _ = loopback.send(ManagerCommand::Accepted(link)).await;
                  return;
               },
               Ok(link) => {
                  warn!("Rejecting connection from unexpected host {}", link.peer);
               },
               Err(BlueHidError::TimedOut | BlueHidError::ProtocolViolation(_)) => {
                  // Keep waiting with a fresh pair.
               },
               Err(e) => {
                  let _ = loopback.send(ManagerCommand::AcceptFailed(e)).await;
                  return;
               },
            }
         }
      }));
   }

   fn handle_accepted(&mut self, link: AcceptedLink) {
      if self.state != ConnectionState::Waiting {
         // A stop raced the accept; the link is discarded and its
         // sockets close on drop.
         debug!("Discarding accepted link from {} in state {}", link.peer, self.state);
         return;
      }

      info!("Host {} connected both channels", link.peer);
      self.transition(LinkEvent::AcceptOk);
      self.accept_task = None;

      let loopback = self.loopback_tx.clone();
      let monitored = link.clone();
      self.monitor_task = Some(tokio::spawn(async move {
         monitored.monitor().await;
         let _ = loopback.send(ManagerCommand::LinkDown).await;
      }));

      self.event_tx.emit(HidEvent::HostConnected(link.peer));
      self.link = Some(link);
   }

   fn handle_accept_failed(&mut self, error: &BlueHidError) {
      if self.state != ConnectionState::Waiting {
         return;
      }
      warn!("Accept failed: {error}");
      if matches!(error, BlueHidError::RadioUnavailable) {
         self.event_tx.emit(HidEvent::RadioUnavailable);
      }
      self.accept_task = None;
      self.transition(LinkEvent::AcceptFailed);
   }

   async fn handle_link_down(&mut self) {
      if self.state != ConnectionState::Accepted {
         return;
      }
      self.transition(LinkEvent::LinkFailed);
      self.teardown(true).await;
   }

   async fn handle_stop(&mut self) {
      // Stop is unconditional: it also disarms a retry scheduled by an
      // earlier failure-drop and releases radio state that teardown
      // kept registered for the fast re-accept.
      if let Some(task) = self.retry_task.take() {
         task.abort();
      }
      match self.state {
         ConnectionState::None | ConnectionState::Dropped => {
            self.release_radio().await;
         },
         _ => {
            self.transition(LinkEvent::Stop);
            self.teardown(false).await;
         },
      }
   }

   async fn handle_send(&mut self, report: HidReport) -> Result<()> {
      if !self.state.is_accepted() {
         return Err(BlueHidError::NotConnected);
      }
      let Some(link) = &self.link else {
         return Err(BlueHidError::NotConnected);
      };

      let write_timeout = Duration::from_millis(self.config.write_timeout_ms);
      match link.send_input(&report, write_timeout).await {
         Ok(()) => Ok(()),
         Err(e) => {
            // A failed write is a dead link; drop immediately, never
            // replay stale input after reconnect.
            self.transition(LinkEvent::LinkFailed);
            self.teardown(true).await;
            Err(e)
         },
      }
   }

   /// Tears the channel pair down and completes DROPPING -> DROPPED.
   ///
   /// With `retry` the SDP record stays registered for fast re-accept
   /// and a delayed restart is scheduled; a clean stop withdraws the
   /// record and restores the original device class, with no retry.
   async fn teardown(&mut self, retry: bool) {
      if let Some(task) = self.accept_task.take() {
         task.abort();
      }
      if let Some(task) = self.monitor_task.take() {
         task.abort();
      }
      let had_link = self.link.take();

      if !retry {
         self.release_radio().await;
      }

      self.transition(LinkEvent::TeardownDone);

      if let Some(link) = had_link {
         self.event_tx.emit(HidEvent::HostDisconnected(link.peer));
      }

      if retry && let Some(device) = self.target {
         let delay = self.retry_delay();
         info!("Connection to {device} dropped, retrying in {delay:?}");
         let loopback = self.loopback_tx.clone();
         self.retry_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = loopback.send(ManagerCommand::Start(device, None)).await;
         }));
      }
   }

   /// Withdraws the SDP record and restores the original device class.
   async fn release_radio(&mut self) {
      if let Some(handle) = self.sdp_record.take()
         && let Err(e) = self.radio.remove_record(handle).await
      {
         warn!("Failed to remove SDP record: {e}");
      }
      if let Some(class) = self.original_class.take()
         && let Err(e) = self.radio.set_device_class(class).await
      {
         warn!("Failed to restore device class: {e}");
      }
   }

   fn retry_delay(&self) -> Duration {
      let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
      Duration::from_secs(self.config.retry_delay_sec) + Duration::from_millis(jitter)
   }
}

/// Parses a D-Bus-supplied address string.
pub fn parse_address(address: &str) -> Result<Address> {
   Address::from_str(address).map_err(|_| BlueHidError::InvalidAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
   use std::sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   };

   use parking_lot::Mutex;

   use super::*;
   use crate::event::EventBus;

   const ALL_EVENTS: [LinkEvent; 7] = [
      LinkEvent::Start,
      LinkEvent::AcceptOk,
      LinkEvent::AcceptTimeout,
      LinkEvent::AcceptFailed,
      LinkEvent::LinkFailed,
      LinkEvent::Stop,
      LinkEvent::TeardownDone,
   ];

   #[derive(Default)]
   struct CollectBus {
      events: Mutex<Vec<HidEvent>>,
   }

   impl EventBus for CollectBus {
      fn emit(&self, event: HidEvent) {
         self.events.lock().push(event);
      }
   }

   #[derive(Clone, Default)]
   struct FakeRadio {
      usable: bool,
      removed_records: Arc<AtomicU32>,
      class_sets: Arc<AtomicU32>,
   }

   impl RadioControl for FakeRadio {
      async fn is_usable(&self) -> bool {
         self.usable
      }

      async fn local_address(&self) -> Result<Address> {
         Ok(Address::any())
      }

      async fn set_device_class(&self, _class: u32) -> Result<u32> {
         self.class_sets.fetch_add(1, Ordering::SeqCst);
         Ok(0)
      }

      async fn register_hid_record(&self) -> Result<RecordHandle> {
         Ok(1)
      }

      async fn remove_record(&self, _handle: RecordHandle) -> Result<()> {
         self.removed_records.fetch_add(1, Ordering::SeqCst);
         Ok(())
      }
   }

   fn actor(radio: FakeRadio) -> (ManagerActor<FakeRadio>, Arc<CollectBus>) {
      let bus = Arc::new(CollectBus::default());
      let (_command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(
         radio,
         bus.clone(),
         Config::default(),
         command_rx,
         loopback_tx,
         loopback_rx,
      );
      (actor, bus)
   }

   fn drive(events: &[LinkEvent]) -> Vec<ConnectionState> {
      let mut state = ConnectionState::None;
      let mut path = vec![state];
      for ev in events {
         state = state.apply(*ev).expect("transition must be legal");
         path.push(state);
      }
      path
   }

   #[test]
   fn test_host_connects_within_timeout() {
      // start -> waiting -> accepted
      let path = drive(&[LinkEvent::Start, LinkEvent::AcceptOk]);
      assert_eq!(
         path,
         vec![
            ConnectionState::None,
            ConnectionState::Waiting,
            ConnectionState::Accepted
         ]
      );
   }

   #[test]
   fn test_no_host_then_stop() {
      // Accept keeps timing out; waiting persists until stop.
      let path = drive(&[
         LinkEvent::Start,
         LinkEvent::AcceptTimeout,
         LinkEvent::AcceptTimeout,
         LinkEvent::Stop,
         LinkEvent::TeardownDone,
      ]);
      assert_eq!(*path.last().unwrap(), ConnectionState::Dropped);
      assert!(path[1..4].iter().all(|s| *s == ConnectionState::Waiting));
   }

   #[test]
   fn test_write_error_drops_without_caller() {
      let path = drive(&[
         LinkEvent::Start,
         LinkEvent::AcceptOk,
         LinkEvent::LinkFailed,
         LinkEvent::TeardownDone,
      ]);
      assert_eq!(
         path[2..],
         [
            ConnectionState::Accepted,
            ConnectionState::Dropping,
            ConnectionState::Dropped
         ]
      );
   }

   #[test]
   fn test_retry_cycle_after_drop() {
      let path = drive(&[
         LinkEvent::Start,
         LinkEvent::AcceptOk,
         LinkEvent::LinkFailed,
         LinkEvent::TeardownDone,
         LinkEvent::Start,
      ]);
      assert_eq!(*path.last().unwrap(), ConnectionState::Waiting);
   }

   #[test]
   fn test_accepted_only_via_dual_channel_accept() {
      // The only edge into ACCEPTED is WAITING + AcceptOk.
      for state in [
         ConnectionState::None,
         ConnectionState::Waiting,
         ConnectionState::Accepted,
         ConnectionState::Dropping,
         ConnectionState::Dropped,
      ] {
         for ev in ALL_EVENTS {
            if state.apply(ev) == Some(ConnectionState::Accepted) {
               assert_eq!(state, ConnectionState::Waiting);
               assert_eq!(ev, LinkEvent::AcceptOk);
            }
         }
      }
   }

   #[test]
   fn test_no_direct_accepted_to_waiting() {
      for ev in ALL_EVENTS {
         assert_ne!(
            ConnectionState::Accepted.apply(ev),
            Some(ConnectionState::Waiting)
         );
      }
   }

   #[tokio::test]
   async fn test_stop_is_idempotent() {
      let radio = FakeRadio {
         usable: true,
         ..Default::default()
      };
      let (mut actor, _bus) = actor(radio.clone());

      // Simulate a waiting cycle with a registered record.
      actor.state = ConnectionState::Waiting;
      actor.sdp_record = Some(1);

      actor.handle_stop().await;
      assert_eq!(actor.state, ConnectionState::Dropped);

      actor.handle_stop().await;
      assert_eq!(actor.state, ConnectionState::Dropped);

      // Record removed exactly once despite two stops.
      assert_eq!(radio.removed_records.load(Ordering::SeqCst), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_stop_after_failure_drop_cancels_retry() {
      let radio = FakeRadio {
         usable: true,
         ..Default::default()
      };
      let (mut actor, _bus) = actor(radio.clone());

      // An established session whose radio state survives failure-drops.
      actor.state = ConnectionState::Accepted;
      actor.target = Some(Address::any());
      actor.sdp_record = Some(1);
      actor.original_class = Some(0x001f_00);

      actor.handle_link_down().await;
      assert_eq!(actor.state, ConnectionState::Dropped);
      assert!(actor.retry_task.is_some());
      // Failure-drop keeps the record registered for the fast re-accept.
      assert_eq!(radio.removed_records.load(Ordering::SeqCst), 0);

      actor.handle_stop().await;
      assert!(actor.retry_task.is_none());
      assert_eq!(radio.removed_records.load(Ordering::SeqCst), 1);
      // One class set = the restore.
      assert_eq!(radio.class_sets.load(Ordering::SeqCst), 1);

      // Well past the retry delay: no restart may come through.
      time::advance(Duration::from_secs(30)).await;
      assert!(actor.loopback_rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_start_with_unusable_radio() {
      let (mut actor, bus) = actor(FakeRadio::default());

      let result = actor.handle_start(Address::any()).await;
      assert!(matches!(result, Err(BlueHidError::RadioUnavailable)));
      assert_eq!(actor.state, ConnectionState::Dropped);

      let states: Vec<_> = bus
         .events
         .lock()
         .iter()
         .filter_map(|e| match e {
            HidEvent::StateChanged(s) => Some(*s),
            _ => None,
         })
         .collect();
      assert_eq!(
         states,
         vec![ConnectionState::Waiting, ConnectionState::Dropped]
      );
   }

   #[tokio::test]
   async fn test_send_rejected_unless_accepted() {
      let (mut actor, _bus) = actor(FakeRadio::default());

      for state in [
         ConnectionState::None,
         ConnectionState::Waiting,
         ConnectionState::Dropping,
         ConnectionState::Dropped,
      ] {
         actor.state = state;
         let result = actor
            .handle_send(crate::hid::report::KeyboardReport::released().into())
            .await;
         assert!(matches!(result, Err(BlueHidError::NotConnected)));
      }
   }
}
