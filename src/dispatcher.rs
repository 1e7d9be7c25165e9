//! Device table, inbound-frame demultiplexing, and the tick driver.
//!
//! The dispatcher owns the device table keyed by remote MAC, the
//! controller's own MAC, and a transport handle. It is the single point
//! that serialises access to device state: every inbound frame, every
//! tick, and every caller-visible command passes through it.
//!
//! ```text
//! inbound frame -> filter (dest MAC, known source, EtherType) -> device.handle_* -> transport
//! ```
//!
//! Independently, `tick_all` drives per-device timeouts and periodic
//! emissions at roughly 1 Hz.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::device::{Device, DeviceConfig, Outbound, Report};
use crate::frame::{self, HOMEPLUG_ETHERTYPE};
use crate::mac::Mac;
use crate::transport::{FrameTransport, RawTransport, TransportError};

/// Errors raised by dispatcher operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A caller referenced a MAC not present in the device table.
    #[error("unknown device {0}")]
    UnknownDevice(Mac),
    /// Rebinding the transport to a new interface failed.
    #[error("failed to rebind transport: {0}")]
    Transport(#[from] TransportError),
}

/// A frame ready to be written by the transport: destination/source MAC
/// already prepended, payload as-is.
#[derive(Clone, Debug, PartialEq)]
struct WireFrame {
    dest: Mac,
    src: Mac,
    payload: Vec<u8>,
}

/// Snapshot of a device's user-visible status.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub alias: Option<String>,
    pub is_on: Option<bool>,
    pub power_w: Option<f64>,
}

/// Owns the device table, the transport, and drives the per-device state
/// machines.
pub struct Dispatcher {
    controller_mac: Mac,
    devices: HashMap<Mac, Device>,
    /// Insertion-ordered MAC list, used by the UI.
    device_order: Vec<Mac>,
    interface: String,
    transport: Arc<dyn FrameTransport>,
}

impl Dispatcher {
    /// Create a dispatcher with no devices configured yet, bound to
    /// `transport` on `interface`.
    pub fn new(controller_mac: Mac, interface: String, transport: impl FrameTransport + 'static) -> Self {
        Dispatcher {
            controller_mac,
            devices: HashMap::new(),
            device_order: Vec::new(),
            interface,
            transport: Arc::new(transport),
        }
    }

    /// The insertion-ordered list of configured device MACs.
    pub fn device_order(&self) -> &[Mac] {
        &self.device_order
    }

    /// The current transport handle, for the run loop's blocking receive
    /// side. Cloning the `Arc` and releasing the dispatcher lock lets the
    /// caller block on I/O without holding up `device_on`/`device_off`/
    /// `device_info` callers.
    pub fn transport(&self) -> Arc<dyn FrameTransport> {
        Arc::clone(&self.transport)
    }

    /// Reload the device table from `config`: add new devices, drop
    /// removed ones, push alias/interval/force_rewrite updates to
    /// survivors, and rebind the transport if the interface changed.
    pub fn reload(&mut self, config: &Config) -> Result<(), DispatchError> {
        let new_macs: std::collections::HashSet<Mac> = config.devices.keys().copied().collect();
        let old_macs: std::collections::HashSet<Mac> = self.device_order.iter().copied().collect();

        for mac in old_macs.difference(&new_macs) {
            log::info!("{mac}: removed from configuration");
            self.devices.remove(mac);
        }
        for mac in new_macs.difference(&old_macs) {
            log::info!("{mac}: added to configuration");
            self.devices.insert(*mac, Device::new(*mac));
        }

        for (mac, device_config) in &config.devices {
            if let Some(device) = self.devices.get_mut(mac) {
                device.update_config(DeviceConfig {
                    alias: device_config.alias.clone(),
                    interval: device_config.interval,
                    force_rewrite: device_config.force_rewrite,
                });
            }
        }

        self.device_order = config.devices.keys().copied().collect();

        if config.master.interface != self.interface {
            log::info!(
                "interface changed from {} to {}, rebinding transport",
                self.interface,
                config.master.interface
            );
            let transport = RawTransport::bind(&config.master.interface)?;
            self.transport = Arc::new(transport);
            self.interface = config.master.interface.clone();
        }

        Ok(())
    }

    /// Drive every device's tick and send whatever it emits.
    pub fn tick_all(&mut self, now: u64) {
        let controller_mac = self.controller_mac;
        let mut frames = Vec::new();
        for device in self.devices.values_mut() {
            for outbound in device.tick(now) {
                frames.push(Self::frame_for(controller_mac, device.remote_mac, outbound));
            }
        }
        self.send_all(&frames);
    }

    /// Process one inbound raw frame (full Ethernet header included),
    /// sending any outbound frames the device emits. Returns `true` if the
    /// frame was accepted (destination matched, source known), along with
    /// the power/on-off reports it produced, tagged by source MAC, for the
    /// datalog writer to log.
    pub fn handle_inbound(&mut self, now: u64, raw: &[u8]) -> (bool, Vec<(Mac, Report)>) {
        if raw.len() < 14 {
            return (false, Vec::new());
        }
        let dest = Mac::from_bytes(raw[0..6].try_into().unwrap());
        let src = Mac::from_bytes(raw[6..12].try_into().unwrap());

        if dest != self.controller_mac {
            return (false, Vec::new());
        }
        if !self.devices.contains_key(&src) {
            return (false, Vec::new());
        }

        let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
        let payload = &raw[12..];

        let controller_mac = self.controller_mac;
        let mut outbound = Vec::new();
        let mut reports = Vec::new();
        {
            let device = self.devices.get_mut(&src).expect("checked above");
            if ethertype == HOMEPLUG_ETHERTYPE {
                match frame::decode_mme(&payload[2..]) {
                    Ok(mme) => {
                        outbound.extend(
                            device.handle_homeplug_frame(now, controller_mac, mme.mmtype, mme.body),
                        );
                    }
                    Err(e) => log::debug!("{src}: dropping malformed MME frame: {e}"),
                }
            } else {
                match device.handle_vendor_frame(now, payload) {
                    Ok(device_reports) => {
                        reports.extend(device_reports.into_iter().map(|r| (src, r)));
                    }
                    Err(e) => log::debug!("{src}: dropping malformed vendor frame: {e}"),
                }
            }
        }

        // Let a transition that just happened emit its immediate follow-up.
        if let Some(device) = self.devices.get_mut(&src) {
            outbound.extend(device.tick(now));
        }

        let frames: Vec<WireFrame> = outbound
            .into_iter()
            .map(|o| Self::frame_for(controller_mac, src, o))
            .collect();
        self.send_all(&frames);
        (true, reports)
    }

    fn frame_for(controller_mac: Mac, remote_mac: Mac, outbound: Outbound) -> WireFrame {
        let payload = match outbound {
            Outbound::Vendor(bytes) => bytes,
            Outbound::HomePlug(bytes) => {
                let mut full = HOMEPLUG_ETHERTYPE.to_be_bytes().to_vec();
                full.extend(bytes);
                full
            }
        };
        WireFrame {
            dest: remote_mac,
            src: controller_mac,
            payload,
        }
    }

    fn send_all(&self, frames: &[WireFrame]) {
        for frame in frames {
            let mut raw = Vec::with_capacity(12 + frame.payload.len());
            raw.extend_from_slice(frame.dest.as_bytes());
            raw.extend_from_slice(frame.src.as_bytes());
            raw.extend_from_slice(&frame.payload);
            if let Err(e) = self.transport.send(&raw) {
                log::warn!("{}: send failed: {e}", frame.dest);
            }
        }
    }

    /// Set the on/off target for `mac`.
    pub fn device_on(&mut self, mac: Mac) -> Result<(), DispatchError> {
        self.devices
            .get_mut(&mac)
            .ok_or(DispatchError::UnknownDevice(mac))?
            .on();
        Ok(())
    }

    /// Set the on/off target for `mac`.
    pub fn device_off(&mut self, mac: Mac) -> Result<(), DispatchError> {
        self.devices
            .get_mut(&mac)
            .ok_or(DispatchError::UnknownDevice(mac))?
            .off();
        Ok(())
    }

    /// Read a device's user-visible status.
    pub fn device_info(&self, mac: Mac) -> Result<DeviceInfo, DispatchError> {
        let device = self.devices.get(&mac).ok_or(DispatchError::UnknownDevice(mac))?;
        Ok(DeviceInfo {
            alias: device.config.alias.clone(),
            is_on: device.status.is_on,
            power_w: device.status.power_w,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeviceSection, MasterSection};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameTransport for MockTransport {
        fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        fn wait_readable(&self, _timeout: Duration) -> Result<bool, TransportError> {
            Ok(false)
        }

        fn recv(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(0)
        }
    }

    fn make_dispatcher() -> Dispatcher {
        Dispatcher::new(
            "00:11:22:33:44:55".parse().unwrap(),
            "eth0".to_string(),
            MockTransport::default(),
        )
    }

    fn config_with(macs: &[&str]) -> Config {
        let mut devices = std::collections::BTreeMap::new();
        for mac in macs {
            devices.insert(mac.parse().unwrap(), DeviceSection::default());
        }
        Config {
            master: MasterSection {
                interface: "eth0".to_string(),
                mac: "00:11:22:33:44:55".parse().unwrap(),
                uid: None,
                gid: None,
                datalog: None,
            },
            devices,
        }
    }

    #[test]
    fn reload_adds_and_removes_by_set_difference() {
        let mut dispatcher = make_dispatcher();
        dispatcher.reload(&config_with(&["aa:bb:cc:dd:ee:ff"])).unwrap();
        assert_eq!(dispatcher.device_order().len(), 1);

        dispatcher.reload(&config_with(&["11:22:33:44:55:66"])).unwrap();
        assert_eq!(dispatcher.device_order().len(), 1);
        assert_eq!(
            dispatcher.device_order()[0],
            "11:22:33:44:55:66".parse().unwrap()
        );
    }

    #[test]
    fn reload_same_interface_does_not_rebind() {
        let mut dispatcher = make_dispatcher();
        let before = dispatcher.transport();
        dispatcher.reload(&config_with(&["aa:bb:cc:dd:ee:ff"])).unwrap();
        assert!(Arc::ptr_eq(&before, &dispatcher.transport()));
    }

    #[test]
    fn handle_inbound_rejects_wrong_destination() {
        let mut dispatcher = make_dispatcher();
        dispatcher.reload(&config_with(&["aa:bb:cc:dd:ee:ff"])).unwrap();

        let mut raw = vec![0xff; 14];
        raw[6..12].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let (accepted, _) = dispatcher.handle_inbound(0, &raw);
        assert!(!accepted);
    }

    #[test]
    fn handle_inbound_rejects_unknown_source() {
        let mut dispatcher = make_dispatcher();
        dispatcher.reload(&config_with(&["aa:bb:cc:dd:ee:ff"])).unwrap();

        let mut raw = vec![0x00; 14];
        raw[0..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        raw[6..12].copy_from_slice(&[0x11, 0x11, 0x11, 0x11, 0x11, 0x11]);
        let (accepted, _) = dispatcher.handle_inbound(0, &raw);
        assert!(!accepted);
    }

    #[test]
    fn handle_inbound_surfaces_reports_from_accepted_frames() {
        let mut dispatcher = make_dispatcher();
        dispatcher.reload(&config_with(&["aa:bb:cc:dd:ee:ff"])).unwrap();
        let mac: Mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        let mut msg = [0u8; 64];
        msg[0] = 9;
        msg[1] = 1;
        msg[2] = 1;
        let mut payload = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        payload.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        payload.extend_from_slice(&[0x00, 64]);
        payload.extend_from_slice(&msg);

        let (accepted, reports) = dispatcher.handle_inbound(0, &payload);
        assert!(accepted);
        assert_eq!(
            reports,
            vec![(
                mac,
                Report {
                    is_on: Some(true),
                    power_w: None
                }
            )]
        );
    }

    #[test]
    fn unknown_device_commands_fail() {
        let mut dispatcher = make_dispatcher();
        let mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert!(matches!(
            dispatcher.device_on(mac),
            Err(DispatchError::UnknownDevice(_))
        ));
        assert!(matches!(
            dispatcher.device_info(mac),
            Err(DispatchError::UnknownDevice(_))
        ));
    }
}
