use bluer::Address;
use log::info;
use parking_lot::Mutex;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::manager::{ConnectionManager, parse_address},
   error::Result,
   hid::{
      input::{KeyboardTranslator, MouseButton, PointerTranslator},
      report::HidReport,
   },
};

pub struct HidService {
   manager: ConnectionManager,
   keyboard: Mutex<KeyboardTranslator>,
   pointer: Mutex<PointerTranslator>,
}

impl HidService {
   pub fn new(manager: ConnectionManager) -> Self {
      Self {
         manager,
         keyboard: Mutex::new(KeyboardTranslator::new()),
         pointer: Mutex::new(PointerTranslator::new()),
      }
   }

   /// Daemon-side start, outside the D-Bus surface.
   pub async fn start(&self, device: Address) -> Result<()> {
      self.manager.start(device).await
   }

   /// Daemon-side teardown on shutdown.
   pub async fn shutdown(&self) {
      let _ = self.manager.stop().await;
   }

   /// Drops all held keys, modifiers and buttons.
   ///
   /// Called whenever the host link goes away; a session accepted later
   /// must not inherit input state the new host never saw pressed.
   pub fn reset_input(&self) {
      self.keyboard.lock().reset();
      self.pointer.lock().reset();
   }

   async fn send_all(
      &self,
      reports: impl IntoIterator<Item = HidReport>,
   ) -> zbus::fdo::Result<u32> {
      let mut written = 0;
      for report in reports {
         self
            .manager
            .send(report)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
         written += 1;
      }
      Ok(written)
   }
}

#[interface(name = "org.bluehidd.Manager")]
impl HidService {
   /// Starts serving the given host address.
   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         parse_address(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .manager
         .start(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Serving HID host {address}");
      Ok(true)
   }

   /// Tears the connection down and withdraws the HID advertisement.
   async fn disconnect_device(&self) -> zbus::fdo::Result<bool> {
      self
         .manager
         .stop()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      self.reset_input();
      Ok(true)
   }

   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let state = self.manager.state().await;
      let target = self.manager.target().await;
      Ok(
         json!({
             "state": state.to_string(),
             "device": target.map(|a| a.to_string()),
         })
         .to_string(),
      )
   }

   /// Types a text string on the emulated keyboard. Returns the number
   /// of reports written.
   async fn send_text(&self, text: String) -> zbus::fdo::Result<u32> {
      let reports = self.keyboard.lock().type_str(&text);
      self.send_all(reports).await
   }

   /// Taps a single key by HID usage code with one-shot modifiers.
   async fn send_key(&self, usage: u8, modifiers: u8) -> zbus::fdo::Result<bool> {
      let reports = self.keyboard.lock().tap(usage, modifiers);
      self.send_all(reports.map(HidReport::from)).await?;
      Ok(true)
   }

   /// Moves the pointer by a relative delta; large deltas are split
   /// into successive reports.
   async fn pointer_move(&self, dx: i32, dy: i32) -> zbus::fdo::Result<bool> {
      let reports = self.pointer.lock().motion(dx, dy);
      self
         .send_all(reports.into_iter().map(HidReport::from))
         .await?;
      Ok(true)
   }

   /// Presses or releases a pointer button ("left"/"right"/"middle").
   async fn pointer_button(&self, button: String, pressed: bool) -> zbus::fdo::Result<bool> {
      let button: MouseButton = button
         .parse()
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown button: {button}")))?;

      let report = self.pointer.lock().button(button, pressed);
      self.send_all([report.into()]).await?;
      Ok(true)
   }

   // Signals
   #[zbus(signal, name = "StateChanged")]
   pub async fn emit_state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn host_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn host_disconnected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn radio_unavailable(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   // Property for polling-free status display
   #[zbus(property)]
   async fn state(&self) -> String {
      self.manager.state().await.to_string()
   }
}
