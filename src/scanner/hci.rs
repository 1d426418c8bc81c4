//! Raw HCI socket backend for environmental-sensing scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{SCAN_CHANNEL_BUFFER_SIZE, SERVICE_DATA_16_TYPE, ScanError, ScanEvent};
use crate::advertisement::{Advertisement, NameFilter, format_address};
use crate::payload::{ENV_SENSING_UUID, ENV_SENSING_UUID16};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::debug;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Active scanning makes devices send their scan response, which usually
// carries the local name.
const LE_SCAN_ACTIVE: u8 = 0x01;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
/// 10ms in 0.625ms units
const SCAN_INTERVAL: u16 = 0x0010;

const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;

/// Max HCI event size
const HCI_EVENT_BUF_SIZE: usize = 258;

/// Upper bound on remembered scan response names.
const MAX_CACHED_NAMES: usize = 1024;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel-side filter deciding which packets reach a raw HCI socket.
#[repr(C)]
#[derive(Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn le_meta_events() -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// A raw HCI socket bound to one controller.
struct HciSocket {
    fd: OwnedFd,
}

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("Failed to create HCI socket"));
        }
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to bind HCI socket"));
        }

        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to set HCI filter"));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to send HCI command"));
        }
        Ok(())
    }

    fn enable_le_scan(&self) -> Result<(), ScanError> {
        let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
        self.send_command(
            OCF_LE_SET_SCAN_PARAMETERS,
            &[
                LE_SCAN_ACTIVE,
                interval_lo,
                interval_hi,
                interval_lo, // window equals interval
                interval_hi,
                LE_PUBLIC_ADDRESS,
                FILTER_POLICY_ACCEPT_ALL,
            ],
        )?;
        // enable, keep duplicates: every broadcast may carry a new reading
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00])
    }
}

/// One device entry of an LE advertising report.
#[derive(Debug, PartialEq)]
struct Report<'a> {
    address: [u8; 6],
    data: &'a [u8],
}

/// Split the parameters of an LE advertising report sub-event into reports.
///
/// `params` starts at the report count, right after the sub-event code.
/// Reports are laid out back to back as
/// `event_type | addr_type | addr[6] | len | data[len] | rssi`.
fn parse_reports(params: &[u8]) -> Option<Vec<Report<'_>>> {
    let (&count, mut rest) = params.split_first()?;
    let mut reports = Vec::with_capacity(usize::from(count));

    for _ in 0..count {
        if rest.len() < 9 {
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&rest[2..8]);
        address.reverse(); // HCI sends the address little-endian
        let len = usize::from(rest[8]);
        let end = 9 + len;
        // +1 for the trailing RSSI byte
        if rest.len() < end + 1 {
            return None;
        }
        reports.push(Report {
            address,
            data: &rest[9..end],
        });
        rest = &rest[end + 1..];
    }

    Some(reports)
}

/// Fields of interest found in advertising data.
#[derive(Debug, Default, PartialEq)]
struct AdFields {
    name: Option<String>,
    service_data: Vec<Vec<u8>>,
}

/// Walk the AD structures of one report, keeping the local name and any
/// environmental-sensing service data.
fn parse_ad_structures(data: &[u8]) -> AdFields {
    let mut fields = AdFields::default();
    let mut rest = data;

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);
        if len == 0 || tail.len() < len {
            break;
        }
        let (structure, next) = tail.split_at(len);
        rest = next;

        let (ad_type, value) = (structure[0], &structure[1..]);
        match ad_type {
            AD_TYPE_COMPLETE_NAME => fields.name = Some(String::from_utf8_lossy(value).into_owned()),
            AD_TYPE_SHORT_NAME if fields.name.is_none() => {
                fields.name = Some(String::from_utf8_lossy(value).into_owned())
            }
            SERVICE_DATA_16_TYPE if value.len() >= 2 => {
                let uuid = u16::from_le_bytes([value[0], value[1]]);
                if uuid == ENV_SENSING_UUID16 {
                    fields.service_data.push(value[2..].to_vec());
                }
            }
            _ => {}
        }
    }

    fields
}

/// Turns reports into advertisements, remembering names from scan responses.
///
/// Only names that pass the filter are kept, at most [`MAX_CACHED_NAMES`] of
/// them. When the cache is full it starts over; devices re-send their scan
/// response often enough to be named again.
#[derive(Debug, Default)]
struct ReportDecoder {
    names: HashMap<[u8; 6], String>,
}

impl ReportDecoder {
    fn remember_name(&mut self, address: [u8; 6], name: String, filter: &NameFilter) {
        if !filter.matches(&name) {
            self.names.remove(&address);
            return;
        }
        if self.names.len() >= MAX_CACHED_NAMES && !self.names.contains_key(&address) {
            debug!("name cache full, clearing {} entries", self.names.len());
            self.names.clear();
        }
        self.names.insert(address, name);
    }

    fn decode(&mut self, report: &Report<'_>, filter: &NameFilter) -> Option<Advertisement> {
        let fields = parse_ad_structures(report.data);
        if let Some(name) = fields.name {
            self.remember_name(report.address, name, filter);
        }
        if fields.service_data.is_empty() {
            return None;
        }

        let name = self.names.get(&report.address).cloned().unwrap_or_default();
        if !filter.matches(&name) {
            return None;
        }

        Some(Advertisement {
            name,
            address: format_address(report.address),
            service_data: fields
                .service_data
                .into_iter()
                .map(|data| (ENV_SENSING_UUID, data))
                .collect(),
        })
    }

    /// Decode a complete HCI packet as read from the socket.
    fn decode_packet(&mut self, packet: &[u8], filter: &NameFilter) -> Vec<Advertisement> {
        // packet type, event code, parameter length, sub-event
        let [HCI_EVENT_PKT, EVT_LE_META_EVENT, _, EVT_LE_ADVERTISING_REPORT, params @ ..] = packet
        else {
            return Vec::new();
        };
        let Some(reports) = parse_reports(params) else {
            debug!("ignoring malformed advertising report ({} bytes)", packet.len());
            return Vec::new();
        };
        reports
            .iter()
            .filter_map(|report| self.decode(report, filter))
            .collect()
    }
}

/// Start scanning for environmental-sensing advertisements using raw HCI sockets.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (hci0)
pub async fn start_scan(filter: NameFilter) -> Result<mpsc::Receiver<ScanEvent>, ScanError> {
    let events = HciSocket::open(0)?;
    events.set_filter(&HciFilter::le_meta_events())?;

    // Commands go through a separate socket bound to the same device
    let commands = HciSocket::open(0)?;
    commands.enable_le_scan()?;

    let async_fd = AsyncFd::new(events.fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

    let (tx, rx) = mpsc::channel(SCAN_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        let _commands = commands;
        let mut decoder = ReportDecoder::default();
        let mut buf = [0u8; HCI_EVENT_BUF_SIZE];

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    let _ = tx
                        .send(Err(ScanError::Bluetooth(format!("HCI socket failed: {e}"))))
                        .await;
                    return;
                }
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => {
                        let _ = tx
                            .send(Err(ScanError::Bluetooth("HCI socket closed".into())))
                            .await;
                        return;
                    }
                    Ok(Err(e)) => {
                        let _ = tx
                            .send(Err(ScanError::Bluetooth(format!("HCI read failed: {e}"))))
                            .await;
                        return;
                    }
                    Err(_would_block) => break,
                };

                for adv in decoder.decode_packet(&buf[..n], &filter) {
                    if tx.send(Ok(adv)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(rx)
}
