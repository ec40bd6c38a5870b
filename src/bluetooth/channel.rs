//! L2CAP server channel pair for HID hosts.
//!
//! A Bluetooth HID host connects two L2CAP channels to the device it
//! drives: control on PSM 0x11, then interrupt on PSM 0x13. This module
//! owns the listening sockets for one accept cycle, performs the
//! dual-channel accept, and frames input reports for the interrupt
//! channel once a host is connected.

use core::fmt;
use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::time;

use crate::{
   error::{BlueHidError, Result},
   hid::report::HidReport,
};

pub type Packet = SmallVec<[u8; 16]>;

/// PSM for the HID control channel, fixed by the HID profile.
pub const PSM_HID_CONTROL: u16 = 0x11;
/// PSM for the HID interrupt channel, fixed by the HID profile.
pub const PSM_HID_INTERRUPT: u16 = 0x13;
/// HIDP transport header for a DATA frame carrying an input report.
const HIDP_DATA_INPUT: u8 = 0xa1;
/// Receive buffer size for host traffic on either channel.
const L2CAP_MTU: usize = 672;

/// The two listening sockets for one accept cycle.
///
/// Sockets are not reusable across cycles: once a host is accepted (or
/// an accept attempt times out after a partial connect) the pair is
/// dropped and a fresh one is opened. Dropping the pair closes both
/// listeners, which also unblocks an in-flight accept.
pub struct ChannelPair {
   control: SeqPacketListener,
   interrupt: SeqPacketListener,
}

impl ChannelPair {
   /// Binds both listening sockets on the local radio.
   pub async fn open(local: Address) -> Result<Self> {
      let control = Self::bind(local, PSM_HID_CONTROL).await?;
      let interrupt = Self::bind(local, PSM_HID_INTERRUPT).await?;
      debug!("Listening on PSM {PSM_HID_CONTROL:#04x} and {PSM_HID_INTERRUPT:#04x}");
      Ok(Self { control, interrupt })
   }

   async fn bind(local: Address, psm: u16) -> Result<SeqPacketListener> {
      let addr = SocketAddr::new(local, AddressType::BrEdr, psm);
      SeqPacketListener::bind(addr).await.map_err(|e| {
         warn!("Failed to bind L2CAP PSM {psm:#04x}: {e}");
         BlueHidError::RadioUnavailable
      })
   }

   /// Waits for a host to connect both channels.
   ///
   /// The control channel must connect first; the interrupt connection
   /// must come from the same peer within the same window. A host that
   /// connects only one channel within the timeout yields `TimedOut`,
   /// and the caller discards the pair so no partial-channel state
   /// survives the call.
   pub async fn accept(&self, timeout: Duration) -> Result<AcceptedLink> {
      time::timeout(timeout, self.accept_both())
         .await
         .map_err(|_| BlueHidError::TimedOut)?
   }

   async fn accept_both(&self) -> Result<AcceptedLink> {
      let (control, control_sa) = self.control.accept().await?;
      debug!("Control channel connected from {}", control_sa.addr);

      let (interrupt, interrupt_sa) = self.interrupt.accept().await?;
      debug!("Interrupt channel connected from {}", interrupt_sa.addr);

      if control_sa.addr != interrupt_sa.addr {
         return Err(BlueHidError::ProtocolViolation(
            "interrupt channel connected from a different host",
         ));
      }

      Ok(AcceptedLink {
         peer: control_sa.addr,
         control: Arc::new(control),
         interrupt: Arc::new(interrupt),
      })
   }
}

/// Both channels of a connected host.
///
/// The connection manager is the single owner; `send_input` is the only
/// externally reachable mutator of the interrupt socket.
#[derive(Clone)]
pub struct AcceptedLink {
   pub peer: Address,
   control: Arc<SeqPacket>,
   interrupt: Arc<SeqPacket>,
}

impl fmt::Debug for AcceptedLink {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AcceptedLink").field("peer", &self.peer).finish()
   }
}

impl AcceptedLink {
   /// Writes one framed input report to the interrupt channel.
   ///
   /// The write either completes within `timeout` or the link is
   /// treated as failed; input reports are never buffered or retried.
   pub async fn send_input(&self, report: &HidReport, timeout: Duration) -> Result<()> {
      let mut frame = Packet::new();
      frame.push(HIDP_DATA_INPUT);
      frame.push(report.report_id());
      frame.extend_from_slice(&report.encode());

      debug!("→ {}: {}", self.peer, hex::encode(&frame));
      match time::timeout(timeout, self.interrupt.send(&frame)).await {
         Ok(Ok(_)) => Ok(()),
         Ok(Err(e)) => {
            warn!("Interrupt channel write to {} failed: {e}", self.peer);
            Err(BlueHidError::PeerDisconnected)
         },
         Err(_) => {
            warn!("Interrupt channel write to {} timed out", self.peer);
            Err(BlueHidError::PeerDisconnected)
         },
      }
   }

   /// Reads host traffic until either channel signals disconnect.
   ///
   /// Host-to-device traffic (control requests, output reports) is
   /// logged and discarded.
   pub async fn monitor(&self) {
      tokio::select! {
         () = Self::drain(&self.control, self.peer, "control") => {},
         () = Self::drain(&self.interrupt, self.peer, "interrupt") => {},
      }
   }

   async fn drain(sp: &SeqPacket, peer: Address, channel: &str) {
      let mut buf = [0u8; L2CAP_MTU];
      loop {
         match sp.recv(&mut buf).await {
            Ok(0) => {
               warn!("{channel} channel closed by {peer}");
               return;
            },
            Ok(n) => {
               debug!("← {peer} ({channel}): {}", hex::encode(&buf[..n]));
            },
            Err(e) => {
               warn!("{channel} channel error from {peer}: {e}");
               return;
            },
         }
      }
   }
}
