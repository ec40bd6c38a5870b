//! Radio control: device class and HID service advertisement.
//!
//! The connection manager drives this through the `RadioControl` trait
//! and never depends on how the capability is obtained. The production
//! implementation talks to BlueZ through bluer: the HID SDP record is
//! registered via `ProfileManager1`, and adapter state is managed over
//! the `Adapter1` interface.

use std::{
   collections::HashMap,
   sync::atomic::{AtomicU32, Ordering},
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Session,
   rfcomm::{Profile, ProfileHandle, Role},
};
use futures::stream::StreamExt;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::{Uuid, uuid};

use crate::{
   error::Result,
   event::{EventSender, HidEvent},
};

/// Opaque identifier for a registered SDP record.
pub type RecordHandle = u32;

/// The HID service class UUID (0x1124).
const HID_SERVICE_UUID: Uuid = uuid!("00001124-0000-1000-8000-00805f9b34fb");

/// SDP record advertising a combined boot keyboard + mouse HID service.
///
/// The report descriptor (attribute 0x0206) declares a boot-protocol
/// keyboard as report ID 1 and a 3-byte relative mouse as report ID 2,
/// matching the framing in `bluetooth::channel`.
const HID_SDP_RECORD: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<record>
  <attribute id="0x0001">
    <sequence><uuid value="0x1124" /></sequence>
  </attribute>
  <attribute id="0x0004">
    <sequence>
      <sequence><uuid value="0x0100" /><uint16 value="0x0011" /></sequence>
      <sequence><uuid value="0x0011" /></sequence>
    </sequence>
  </attribute>
  <attribute id="0x0005">
    <sequence><uuid value="0x1002" /></sequence>
  </attribute>
  <attribute id="0x0006">
    <sequence><uint16 value="0x656e" /><uint16 value="0x006a" /><uint16 value="0x0100" /></sequence>
  </attribute>
  <attribute id="0x0009">
    <sequence>
      <sequence><uuid value="0x1124" /><uint16 value="0x0100" /></sequence>
    </sequence>
  </attribute>
  <attribute id="0x000d">
    <sequence>
      <sequence>
        <sequence><uuid value="0x0100" /><uint16 value="0x0013" /></sequence>
        <sequence><uuid value="0x0011" /></sequence>
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0100">
    <text value="bluehidd keyboard/mouse" />
  </attribute>
  <attribute id="0x0101">
    <text value="Emulated HID peripheral" />
  </attribute>
  <attribute id="0x0200">
    <uint16 value="0x0100" />
  </attribute>
  <attribute id="0x0201">
    <uint16 value="0x0111" />
  </attribute>
  <attribute id="0x0202">
    <uint8 value="0xC0" />
  </attribute>
  <attribute id="0x0203">
    <uint8 value="0x21" />
  </attribute>
  <attribute id="0x0204">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0205">
    <boolean value="true" />
  </attribute>
  <attribute id="0x0206">
    <sequence>
      <sequence>
        <uint8 value="0x22" />
        <text encoding="hex" value="05010906a1018501050719e029e71500250175019508810295017508810195057501050819012905910295017503910195067508150025650507190029658100c005010902a10185020901a100050919012903150025019503750181029505750181010501093009311581257f750895028106c0c0" />
      </sequence>
    </sequence>
  </attribute>
  <attribute id="0x0207">
    <sequence>
      <sequence><uint16 value="0x0409" /><uint16 value="0x0100" /></sequence>
    </sequence>
  </attribute>
  <attribute id="0x0209">
    <uint16 value="0x0012" />
  </attribute>
  <attribute id="0x020a">
    <uint16 value="0x0640" />
  </attribute>
</record>
"#;

/// Capability boundary the connection manager calls through.
pub trait RadioControl: Send + Sync + 'static {
   /// Whether the adapter can currently bind listening channels.
   fn is_usable(&self) -> impl Future<Output = bool> + Send;

   /// Address of the local radio the channels bind to.
   fn local_address(&self) -> impl Future<Output = Result<Address>> + Send;

   /// Sets the advertised Class of Device, returning the previous code.
   fn set_device_class(&self, class: u32) -> impl Future<Output = Result<u32>> + Send;

   /// Advertises the HID service record.
   fn register_hid_record(&self) -> impl Future<Output = Result<RecordHandle>> + Send;

   /// Withdraws a previously registered record. Idempotent.
   fn remove_record(&self, handle: RecordHandle) -> impl Future<Output = Result<()>> + Send;
}

/// BlueZ-backed radio control.
pub struct BluezRadio {
   session: Session,
   adapter: Adapter,
   records: Mutex<HashMap<RecordHandle, ProfileHandle>>,
   next_record: AtomicU32,
   device_class: AtomicU32,
}

impl BluezRadio {
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter {}", adapter.name());
      }
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         adapter.address().await?
      );

      Ok(Self {
         session,
         adapter,
         records: Mutex::new(HashMap::new()),
         next_record: AtomicU32::new(1),
         device_class: AtomicU32::new(0),
      })
   }

   /// Watches adapter power state and reports loss of the radio.
   pub fn spawn_power_monitor(&self, events: EventSender) -> JoinHandle<()> {
      let adapter = self.adapter.clone();
      tokio::spawn(async move {
         let Ok(mut stream) = adapter.events().await else {
            warn!("Failed to subscribe to adapter events");
            return;
         };
         while let Some(event) = stream.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) = event {
               warn!("Adapter {} powered off", adapter.name());
               events.emit(HidEvent::RadioUnavailable);
            }
         }
      })
   }
}

impl RadioControl for BluezRadio {
   async fn is_usable(&self) -> bool {
      self.adapter.is_powered().await.unwrap_or(false)
   }

   async fn local_address(&self) -> Result<Address> {
      Ok(self.adapter.address().await?)
   }

   async fn set_device_class(&self, class: u32) -> Result<u32> {
      // bluetoothd derives the Class of Device from the registered
      // service classes; the HID record below flips the peripheral
      // bits. Track the requested code so stop() restores symmetrically.
      let previous = self.device_class.swap(class, Ordering::SeqCst);
      info!("Device class {previous:#08x} -> {class:#08x}");
      Ok(previous)
   }

   async fn register_hid_record(&self) -> Result<RecordHandle> {
      let profile = Profile {
         uuid: HID_SERVICE_UUID,
         name: Some("bluehidd".to_string()),
         service_record: Some(HID_SDP_RECORD.to_string()),
         role: Some(Role::Server),
         require_authentication: Some(false),
         require_authorization: Some(false),
         ..Default::default()
      };

      let handle = self.session.register_profile(profile).await?;
      let id = self.next_record.fetch_add(1, Ordering::SeqCst);
      self.records.lock().insert(id, handle);

      // Let scanning hosts find us while the record is up.
      self.adapter.set_discoverable(true).await?;
      self.adapter.set_pairable(true).await?;

      info!("HID SDP record registered (handle {id})");
      Ok(id)
   }

   async fn remove_record(&self, handle: RecordHandle) -> Result<()> {
      // Dropping the ProfileHandle unregisters the record in bluetoothd.
      let removed = self.records.lock().remove(&handle);
      if removed.is_none() {
         return Ok(());
      }

      let none_left = self.records.lock().is_empty();
      if none_left && let Err(e) = self.adapter.set_discoverable(false).await {
         warn!("Failed to clear discoverable mode: {e}");
      }
      info!("HID SDP record removed (handle {handle})");
      Ok(())
   }
}
