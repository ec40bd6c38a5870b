//! Bluetooth HID emulation D-Bus service.
//!
//! This daemon makes the local Bluetooth radio present itself as a HID
//! keyboard/mouse peripheral, serves the L2CAP channel pair a HID host
//! expects, and exposes start/stop/input operations over D-Bus.

use std::{str::FromStr, sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{manager::ConnectionManager, radio::BluezRadio};
use dbus::{HidService, HidServiceSignals};
use event::{EventBus, HidEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod hid;

use crate::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bluehidd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   let last_device = config.last_device.clone();

   // Create event channel
   let event_bus = EventProcessor::new();

   // Bind the radio and the connection manager
   let radio = BluezRadio::new(config.adapter.as_deref()).await?;
   radio.spawn_power_monitor(event_bus.clone());
   let manager = ConnectionManager::new(radio, event_bus.clone(), config);

   // Create D-Bus service
   let service = HidService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.bluehidd")?
      .serve_at("/org/bluehidd/manager", service)?
      .build()
      .await?;

   info!("bluehidd D-Bus service started at org.bluehidd");

   // Start event processor
   let iface = event_bus.clone().spawn_dispatcher(connection).await?;

   // Resume serving the last host, like a freshly unlocked keyboard
   // would reconnect to its paired machine.
   if let Some(address) = last_device
      && let Ok(addr) = Address::from_str(&address)
   {
      info!("Restoring last host {address}");
      if let Err(e) = iface.get().await.start(addr).await {
         warn!("Could not restore connection to {address}: {e}");
      }
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down bluehidd service...");
   iface.get().await.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<HidEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<HidEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<HidService>, event: HidEvent) -> Result<()> {
      match event {
         HidEvent::StateChanged(state) => {
            iface.emit_state_changed(state.into()).await?;
         },
         HidEvent::HostConnected(address) => {
            iface.host_connected(&address.to_string()).await?;
         },
         HidEvent::HostDisconnected(address) => {
            // A session accepted after the retry must not inherit held
            // keys or buttons from the one that just died.
            iface.get().await.reset_input();
            iface.host_disconnected(&address.to_string()).await?;
         },
         HidEvent::RadioUnavailable => {
            iface.radio_unavailable().await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<InterfaceRef<HidService>> {
      let iface = connection
         .object_server()
         .interface::<_, HidService>("/org/bluehidd/manager")
         .await?;
      let dispatcher_iface = iface.clone();
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&dispatcher_iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(iface)
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: HidEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
