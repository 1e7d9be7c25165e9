//! Per-device protocol state machine.
//!
//! A `Device` coordinates the vendor probing/on-off protocol and the
//! HomePlug-AV PIB read/modify/write sub-protocol through six states. See
//! the module-level diagram in `dispatcher.rs` for how ticks and inbound
//! frames reach here.

use crate::frame::{self, DeviceType, FrameError, VendorEvent, MMTYPE_NVM_CONF, MMTYPE_READ_CONF, MMTYPE_WRITE_CONF};
use crate::mac::Mac;
use crate::pib::Pib;

/// Delay between probes/retransmissions, in seconds.
pub const PROBE_DELAY: u64 = 10;
/// Number of ethernet-only probes sent before falling back to HomePlug probing too.
pub const MAX_PROBING_TRIES: u32 = 5;
/// PIB download/upload chunk size, in bytes.
pub const PIB_CHUNK: usize = 1024;
/// Timeout for a whole PIB phase (ReadPib/WritePib/WritePibToNvm), in seconds.
pub const PIB_ABORT_TIME: u64 = 20;
/// Timeout for the Running state without any received frame, in seconds.
pub const RUNNING_ABORT_TIME: u64 = 20;

/// Outbound frame a device wants the dispatcher to send on its behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// A vendor-framed payload (dispatcher EtherType is implicit in the bytes).
    Vendor(Vec<u8>),
    /// A HomePlug-AV MME payload (dispatcher prepends EtherType 0x88e1).
    HomePlug(Vec<u8>),
}

/// The six device states, each carrying its own timers and (for the PIB
/// states) in-flight data.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceState {
    /// Ethernet-only probing.
    Probing { last_sent: u64, num_sent: u32 },
    /// Ethernet + HomePlug probing.
    ProbingHp { last_sent: u64 },
    /// Downloading the PIB in sequential chunks.
    ReadPib {
        start_time: u64,
        last_sent: u64,
        pib: Pib,
    },
    /// Uploading the patched PIB in sequential chunks.
    WritePib {
        start_time: u64,
        last_sent: u64,
        current_offset: usize,
        pib: Pib,
    },
    /// Committing the uploaded PIB to NVM.
    WritePibToNvm { start_time: u64, last_sent: u64 },
    /// Steady-state polling and on/off reconciliation.
    Running { last_sent: u64, last_received: u64 },
}

/// Desired on/off target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WantOn {
    On,
    Off,
    None,
}

/// Per-device static configuration, refreshed on every config reload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub alias: Option<String>,
    pub interval: Option<u64>,
    /// See SPEC_FULL.md Open Question (a): rewrite the PIB master
    /// unconditionally instead of only when it differs from ours.
    pub force_rewrite: bool,
}

/// Last-observed device status, as reported over the vendor channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceStatus {
    pub device_type: Option<DeviceType>,
    pub device_version: Option<Vec<String>>,
    pub ident: Option<Vec<String>>,
    pub power_w: Option<f64>,
    pub is_on: Option<bool>,
}

/// One power/on-off observation worth logging, produced each time a vendor
/// frame resolves to an accepted status update. A single inbound frame can
/// carry several fixed-width messages, so `handle_vendor_frame` may return
/// more than one per call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Report {
    pub is_on: Option<bool>,
    pub power_w: Option<f64>,
}

/// A single configured outlet and its protocol state.
#[derive(Clone, Debug)]
pub struct Device {
    pub remote_mac: Mac,
    pub config: DeviceConfig,
    pub state: DeviceState,
    pub want_on: WantOn,
    pub status: DeviceStatus,
}

impl Device {
    /// Create a device in its initial `Probing` state.
    pub fn new(remote_mac: Mac) -> Self {
        Device {
            remote_mac,
            config: DeviceConfig::default(),
            state: DeviceState::Probing {
                last_sent: 0,
                num_sent: 0,
            },
            want_on: WantOn::None,
            status: DeviceStatus::default(),
        }
    }

    /// Return to `Probing` and clear last-observed power/on-off status.
    pub fn reset_state(&mut self) {
        self.state = DeviceState::Probing {
            last_sent: 0,
            num_sent: 0,
        };
        self.status.power_w = None;
        self.status.is_on = None;
    }

    /// Apply a config reload: absent keys clear the corresponding field.
    pub fn update_config(&mut self, config: DeviceConfig) {
        self.config = config;
    }

    pub fn on(&mut self) {
        self.want_on = WantOn::On;
    }

    pub fn off(&mut self) {
        self.want_on = WantOn::Off;
    }

    /// Advance timers and emit retransmissions/polls for the current tick.
    pub fn tick(&mut self, now: u64) -> Vec<Outbound> {
        match self.state.clone() {
            DeviceState::Probing { last_sent, num_sent } => {
                if now.saturating_sub(last_sent) >= PROBE_DELAY {
                    let out = vec![Outbound::Vendor(frame::encode_vendor_probe())];
                    self.state = if num_sent + 1 >= MAX_PROBING_TRIES {
                        DeviceState::ProbingHp { last_sent: now }
                    } else {
                        DeviceState::Probing {
                            last_sent: now,
                            num_sent: num_sent + 1,
                        }
                    };
                    out
                } else {
                    Vec::new()
                }
            }
            DeviceState::ProbingHp { last_sent } => {
                if now.saturating_sub(last_sent) >= PROBE_DELAY {
                    self.state = DeviceState::ProbingHp { last_sent: now };
                    vec![
                        Outbound::Vendor(frame::encode_vendor_probe()),
                        Outbound::HomePlug(frame::encode_read_pib_request(0, PIB_CHUNK as u16)),
                    ]
                } else {
                    Vec::new()
                }
            }
            DeviceState::ReadPib {
                start_time,
                last_sent,
                pib,
            } => {
                if now.saturating_sub(start_time) > PIB_ABORT_TIME {
                    self.reset_state();
                    return Vec::new();
                }
                if now.saturating_sub(last_sent) >= PROBE_DELAY {
                    let remaining = pib.declared_size() as usize - pib.len();
                    let length = remaining.min(PIB_CHUNK) as u16;
                    let offset = pib.len() as u32;
                    self.state = DeviceState::ReadPib {
                        start_time,
                        last_sent: now,
                        pib,
                    };
                    vec![Outbound::HomePlug(frame::encode_read_pib_request(
                        offset, length,
                    ))]
                } else {
                    Vec::new()
                }
            }
            DeviceState::WritePib {
                start_time,
                last_sent,
                current_offset,
                pib,
            } => {
                if now.saturating_sub(start_time) > PIB_ABORT_TIME {
                    self.reset_state();
                    return Vec::new();
                }
                if now.saturating_sub(last_sent) >= PROBE_DELAY {
                    let chunk = pib.chunk(current_offset, PIB_CHUNK);
                    let out = vec![Outbound::HomePlug(frame::encode_write_pib_request(
                        current_offset as u32,
                        chunk,
                    ))];
                    self.state = DeviceState::WritePib {
                        start_time,
                        last_sent: now,
                        current_offset,
                        pib,
                    };
                    out
                } else {
                    Vec::new()
                }
            }
            DeviceState::WritePibToNvm {
                start_time,
                last_sent,
            } => {
                if now.saturating_sub(start_time) > PIB_ABORT_TIME {
                    self.reset_state();
                    return Vec::new();
                }
                if now.saturating_sub(last_sent) >= PROBE_DELAY {
                    self.state = DeviceState::WritePibToNvm {
                        start_time,
                        last_sent: now,
                    };
                    vec![Outbound::HomePlug(frame::encode_nvm_commit_request())]
                } else {
                    Vec::new()
                }
            }
            DeviceState::Running {
                last_sent,
                last_received,
            } => {
                if self.want_on != WantOn::None && Some(self.want_on == WantOn::On) != self.status.is_on
                {
                    let frame = match self.want_on {
                        WantOn::On => frame::encode_vendor_on(),
                        WantOn::Off => frame::encode_vendor_off(),
                        WantOn::None => unreachable!(),
                    };
                    self.state = DeviceState::Running {
                        last_sent: now,
                        last_received,
                    };
                    return vec![Outbound::Vendor(frame)];
                }

                if let Some(interval) = self.config.interval {
                    if now.saturating_sub(last_received) > RUNNING_ABORT_TIME {
                        self.reset_state();
                        return Vec::new();
                    }
                    if now.saturating_sub(last_sent) >= interval {
                        self.state = DeviceState::Running {
                            last_sent: now,
                            last_received,
                        };
                        return vec![Outbound::Vendor(frame::encode_vendor_probe())];
                    }
                }
                Vec::new()
            }
        }
    }

    /// Handle an inbound HomePlug-AV MME frame. Returns the outbound frames
    /// (if any) the exchange should emit next.
    ///
    /// Opcodes not expected in the current state, and frames that fail
    /// validation (wrong module, non-zero status, wrong offset, bad chunk
    /// checksum), are silently dropped — the retransmission timer recovers.
    pub fn handle_homeplug_frame(
        &mut self,
        now: u64,
        controller_mac: Mac,
        mmtype: u16,
        body: &[u8],
    ) -> Vec<Outbound> {
        match self.state.clone() {
            DeviceState::ProbingHp { .. } | DeviceState::ReadPib { .. } => {
                if mmtype != MMTYPE_READ_CONF {
                    return Vec::new();
                }
                let conf = match frame::decode_read_confirmation(body) {
                    Ok(c) => c,
                    Err(e) => {
                        log::debug!("{}: dropping read confirmation: {e}", self.remote_mac);
                        return Vec::new();
                    }
                };
                self.on_read_confirmation(now, controller_mac, conf)
            }
            DeviceState::WritePib {
                start_time,
                current_offset,
                pib,
                ..
            } => {
                if mmtype != MMTYPE_WRITE_CONF {
                    return Vec::new();
                }
                if let Err(e) = frame::decode_write_confirmation(body) {
                    log::debug!("{}: dropping write confirmation: {e}", self.remote_mac);
                    return Vec::new();
                }

                if current_offset + PIB_CHUNK >= pib.len() {
                    self.state = DeviceState::WritePibToNvm {
                        start_time: now,
                        last_sent: 0,
                    };
                } else {
                    self.state = DeviceState::WritePib {
                        start_time,
                        last_sent: 0,
                        current_offset: current_offset + PIB_CHUNK,
                        pib,
                    };
                }
                Vec::new()
            }
            DeviceState::WritePibToNvm { .. } => {
                if mmtype != MMTYPE_NVM_CONF {
                    return Vec::new();
                }
                if let Err(e) = frame::decode_nvm_confirmation(body) {
                    log::debug!("{}: dropping NVM confirmation: {e}", self.remote_mac);
                    return Vec::new();
                }
                log::info!("{}: PIB committed to NVM, now ours", self.remote_mac);
                self.reset_state();
                Vec::new()
            }
            DeviceState::Probing { .. } | DeviceState::Running { .. } => Vec::new(),
        }
    }

    fn on_read_confirmation(
        &mut self,
        now: u64,
        controller_mac: Mac,
        conf: frame::ReadConfirmation,
    ) -> Vec<Outbound> {
        match self.state.clone() {
            DeviceState::ProbingHp { .. } => {
                if conf.offset != 0 {
                    return Vec::new();
                }
                let pib = match Pib::new(conf.data) {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("{}: dropping short initial PIB chunk: {e}", self.remote_mac);
                        return Vec::new();
                    }
                };
                self.state = DeviceState::ReadPib {
                    start_time: now,
                    last_sent: 0,
                    pib,
                };
                Vec::new()
            }
            DeviceState::ReadPib {
                start_time, pib, ..
            } => {
                if conf.offset as usize != pib.len() {
                    return Vec::new();
                }
                let new_pib = match pib.append(&conf.data) {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("{}: dropping PIB append: {e}", self.remote_mac);
                        return Vec::new();
                    }
                };

                if new_pib.is_complete() {
                    if !new_pib.is_valid() {
                        log::warn!(
                            "{}: downloaded PIB failed checksum, resetting",
                            self.remote_mac
                        );
                        self.reset_state();
                        return Vec::new();
                    }

                    let master = new_pib.master_get().expect("complete PIB");
                    if master == controller_mac && !self.config.force_rewrite {
                        log::debug!("{}: PIB master already ours", self.remote_mac);
                        self.reset_state();
                        return Vec::new();
                    }

                    let patched = new_pib
                        .master_replace(controller_mac)
                        .expect("complete PIB");
                    self.state = DeviceState::WritePib {
                        start_time: now,
                        last_sent: 0,
                        current_offset: 0,
                        pib: patched,
                    };
                } else {
                    self.state = DeviceState::ReadPib {
                        start_time,
                        last_sent: 0,
                        pib: new_pib,
                    };
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Handle an inbound vendor-framed payload. Returns one [`Report`] per
    /// power/on-off observation the frame carried, in frame order — the
    /// datalog writer should log exactly these, not a periodic snapshot.
    pub fn handle_vendor_frame(&mut self, now: u64, payload: &[u8]) -> Result<Vec<Report>, FrameError> {
        if !matches!(
            self.state,
            DeviceState::Probing { .. } | DeviceState::ProbingHp { .. } | DeviceState::Running { .. }
        ) {
            return Ok(Vec::new());
        }

        let events = frame::decode_vendor_frame(payload)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let last_sent = match &self.state {
            DeviceState::Running { last_sent, .. } => *last_sent,
            _ => 0,
        };

        let mut reports = Vec::new();
        for event in events {
            match event {
                VendorEvent::Power(report) => reports.extend(self.receive_power_report(report)),
                VendorEvent::OnOffReply(on) | VendorEvent::OnOffUnsolicited(on) => {
                    reports.push(self.receive_is_on(on));
                }
            }
        }

        self.state = DeviceState::Running {
            last_sent,
            last_received: now,
        };
        Ok(reports)
    }

    fn receive_power_report(&mut self, report: frame::PowerReport) -> Option<Report> {
        if let Some(existing) = self.status.device_type {
            if existing != report.device_type {
                log::warn!(
                    "{}: device type changed from {:?} to {:?}, resetting",
                    self.remote_mac,
                    existing,
                    report.device_type
                );
                self.reset_state();
                return None;
            }
        }
        if let Some(existing) = &self.status.device_version {
            if existing != &report.version {
                log::warn!(
                    "{}: device version changed from {:?} to {:?}, resetting",
                    self.remote_mac,
                    existing,
                    report.version
                );
                self.reset_state();
                return None;
            }
        }
        if let Some(existing) = &self.status.ident {
            if existing != &report.ident {
                log::warn!(
                    "{}: device identification changed from {:?} to {:?}, resetting",
                    self.remote_mac,
                    existing,
                    report.ident
                );
                self.reset_state();
                return None;
            }
        }

        self.status.device_type.get_or_insert(report.device_type);
        self.status.device_version.get_or_insert_with(|| report.version.clone());
        self.status.ident.get_or_insert_with(|| report.ident.clone());

        self.status.power_w = Some(report.power_w);
        self.status.is_on = Some(report.is_on);

        Some(Report {
            is_on: Some(report.is_on),
            power_w: Some(report.power_w),
        })
    }

    fn receive_is_on(&mut self, is_on: bool) -> Report {
        if self.want_on != WantOn::None && (self.want_on == WantOn::On) == is_on {
            self.want_on = WantOn::None;
        }
        self.status.is_on = Some(is_on);
        Report {
            is_on: Some(is_on),
            power_w: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pib::tests::synthetic_pib;

    const CONTROLLER: Mac = Mac([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const REMOTE: Mac = Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    fn read_confirmation_body(offset: u32, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8, 0, 0, 0, 0x02, 0];
        body.extend_from_slice(&(data.len() as u16).to_le_bytes());
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&crate::pib::xor_checksum(data).to_le_bytes());
        body.extend_from_slice(data);
        body
    }

    #[test]
    fn s1_cold_discovery_other_master() {
        let mut dev = Device::new(REMOTE);
        let mut now = 0u64;
        for _ in 0..5 {
            now += PROBE_DELAY;
            let out = dev.tick(now);
            assert_eq!(out, vec![Outbound::Vendor(frame::encode_vendor_probe())]);
        }
        assert!(matches!(dev.state, DeviceState::ProbingHp { .. }));

        now += PROBE_DELAY;
        let out = dev.tick(now);
        assert_eq!(
            out,
            vec![
                Outbound::Vendor(frame::encode_vendor_probe()),
                Outbound::HomePlug(frame::encode_read_pib_request(0, PIB_CHUNK as u16)),
            ]
        );
    }

    #[test]
    fn s2_pib_download_then_rewrite() {
        let mut dev = Device::new(REMOTE);
        dev.state = DeviceState::ProbingHp { last_sent: 0 };

        let other_master = Mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        let pib = synthetic_pib(other_master);
        assert_eq!(pib.len(), 12288);

        let mut offset = 0u32;
        let mut now = 0u64;
        loop {
            let remaining = pib.len() - offset as usize;
            let chunk_len = remaining.min(PIB_CHUNK);
            let chunk = pib.chunk(offset as usize, chunk_len);
            let body = read_confirmation_body(offset, chunk);
            let out = dev.handle_homeplug_frame(now, CONTROLLER, frame::MMTYPE_READ_CONF, &body);
            assert!(out.is_empty());
            offset += chunk_len as u32;
            now += 1;
            if offset as usize >= pib.len() {
                break;
            }
        }
        assert_eq!(offset as usize, 12288);

        match &dev.state {
            DeviceState::WritePib { current_offset, pib, .. } => {
                assert_eq!(*current_offset, 0);
                assert_eq!(pib.master_get().unwrap(), CONTROLLER);
            }
            other => panic!("expected WritePib, got {other:?}"),
        }

        // Drive the write phase to completion.
        loop {
            let (current_offset, pib_len) = match &dev.state {
                DeviceState::WritePib { current_offset, pib, .. } => (*current_offset, pib.len()),
                _ => break,
            };
            let write_confirm_body = vec![0u8];
            dev.handle_homeplug_frame(now, CONTROLLER, frame::MMTYPE_WRITE_CONF, &write_confirm_body);
            now += 1;
            if current_offset + PIB_CHUNK >= pib_len {
                break;
            }
        }
        assert!(matches!(dev.state, DeviceState::WritePibToNvm { .. }));

        dev.handle_homeplug_frame(now, CONTROLLER, frame::MMTYPE_NVM_CONF, &[0u8]);
        assert!(matches!(dev.state, DeviceState::Probing { .. }));
    }

    #[test]
    fn s3_pib_already_ours() {
        let mut dev = Device::new(REMOTE);
        let pib = synthetic_pib(CONTROLLER);
        dev.state = DeviceState::ProbingHp { last_sent: 0 };

        let body = read_confirmation_body(0, pib.bytes());
        dev.handle_homeplug_frame(0, CONTROLLER, frame::MMTYPE_READ_CONF, &body);
        assert!(matches!(dev.state, DeviceState::Probing { .. }));
    }

    #[test]
    fn s4_reconciliation() {
        let mut dev = Device::new(REMOTE);
        dev.state = DeviceState::Running {
            last_sent: 0,
            last_received: 0,
        };
        dev.status.is_on = Some(false);

        dev.on();
        let out = dev.tick(5);
        assert_eq!(out, vec![Outbound::Vendor(frame::encode_vendor_on())]);

        let mut msg = [0u8; 64];
        msg[0] = 9;
        msg[1] = 1;
        msg[2] = 1;
        let mut payload = vec![0x00, 64];
        payload.extend_from_slice(&msg);

        let reports = dev.handle_vendor_frame(6, &payload).unwrap();
        assert_eq!(
            reports,
            vec![Report {
                is_on: Some(true),
                power_w: None
            }]
        );
        assert_eq!(dev.want_on, WantOn::None);
        assert_eq!(dev.status.is_on, Some(true));
    }

    #[test]
    fn s5_stale_running_resets() {
        let mut dev = Device::new(REMOTE);
        dev.config.interval = Some(5);
        dev.state = DeviceState::Running {
            last_sent: 0,
            last_received: 0,
        };
        dev.status.power_w = Some(42.0);
        dev.status.is_on = Some(true);

        dev.tick(RUNNING_ABORT_TIME + 1);
        assert!(matches!(dev.state, DeviceState::Probing { .. }));
        assert_eq!(dev.status.power_w, None);
        assert_eq!(dev.status.is_on, None);
    }

    #[test]
    fn s6_corrupted_pib_resets() {
        let mut dev = Device::new(REMOTE);
        let good = synthetic_pib(Mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        let mut corrupted = good.bytes().to_vec();
        corrupted[8..12].copy_from_slice(&0u32.to_le_bytes());
        let corrupted = Pib::new(corrupted).unwrap();
        assert!(!corrupted.is_valid());

        dev.state = DeviceState::ProbingHp { last_sent: 0 };
        let body = read_confirmation_body(0, corrupted.bytes());
        dev.handle_homeplug_frame(0, CONTROLLER, frame::MMTYPE_READ_CONF, &body);

        assert!(matches!(dev.state, DeviceState::Probing { .. }));
    }

    #[test]
    fn running_with_matching_want_on_sends_nothing() {
        let mut dev = Device::new(REMOTE);
        dev.state = DeviceState::Running {
            last_sent: 0,
            last_received: 0,
        };
        dev.status.is_on = Some(true);
        dev.on();
        dev.receive_is_on(true); // simulate already reconciled
        assert_eq!(dev.want_on, WantOn::None);

        for t in 0..100 {
            let out = dev.tick(t);
            assert!(out.is_empty());
        }
    }
}
