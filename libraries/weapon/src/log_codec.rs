//! The on-disk format of a stream's event log.
//!
//! ```text
//! header: b"WEAPONLG" | u32 version
//! record: u32 record_len | u64 within_device_events_index | u32 device_len | device bytes | u32 payload_len | JSON payload
//! ```
//!
//! All integers are little-endian. The JSON payload is a [`Timestamped`] envelope. Records are
//! only ever appended, in whatever order devices' events were saved, so readers must not
//! assume anything about ordering across devices.
//!
//! Parsing never fails as a whole: a damaged record is logged and skipped, and a truncated
//! tail (from a write that was interrupted) is ignored. [`read_event_log`] reports whether
//! anything was skipped, so writers can compact a damaged log instead of appending to it.

use std::collections::BTreeMap;

use crate::data_model::Timestamped;

pub const EVENTS_FILE_NAME: &str = "events.blob";
pub const EVENT_LOG_MAGIC: &[u8] = b"WEAPONLG";
pub const EVENT_LOG_VERSION: u32 = 1;
pub const EVENT_LOG_HEADER_LEN: usize = EVENT_LOG_MAGIC.len() + 4;

const U32_LEN: usize = std::mem::size_of::<u32>();
const U64_LEN: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, PartialEq)]
pub struct EventLogRecord {
    pub device_id: String,
    pub within_device_events_index: usize,
    pub event: Timestamped<serde_json::Value>,
}

pub fn event_log_header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(EVENT_LOG_HEADER_LEN);
    header.extend_from_slice(EVENT_LOG_MAGIC);
    header.extend_from_slice(&EVENT_LOG_VERSION.to_le_bytes());
    header
}

/// Encodes one record. Returns `None` (and logs) if the record cannot be represented.
pub fn encode_event_log_record(record: &EventLogRecord) -> Option<Vec<u8>> {
    let payload = match serde_json::to_vec(&record.event) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!(
                "Failed to serialize event for device {}: {e:?}",
                record.device_id
            );
            return None;
        }
    };

    let device_id_bytes = record.device_id.as_bytes();
    let Ok(device_id_len) = u32::try_from(device_id_bytes.len()) else {
        log::error!(
            "Device ID too long to encode for device {} ({} bytes)",
            record.device_id,
            device_id_bytes.len()
        );
        return None;
    };

    let Ok(payload_len) = u32::try_from(payload.len()) else {
        log::error!(
            "Event payload too large to encode for device {} ({} bytes)",
            record.device_id,
            payload.len()
        );
        return None;
    };

    let body_len = U64_LEN + U32_LEN + device_id_bytes.len() + U32_LEN + payload.len();
    let Ok(record_len) = u32::try_from(body_len) else {
        log::error!(
            "Record too large to encode for device {} ({} bytes)",
            record.device_id,
            body_len
        );
        return None;
    };

    let mut buffer = Vec::with_capacity(U32_LEN + body_len);
    buffer.extend_from_slice(&record_len.to_le_bytes());
    buffer.extend_from_slice(&(record.within_device_events_index as u64).to_le_bytes());
    buffer.extend_from_slice(&device_id_len.to_le_bytes());
    buffer.extend_from_slice(device_id_bytes);
    buffer.extend_from_slice(&payload_len.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Some(buffer)
}

/// Encodes a batch of records, prefixed by the header if the log is still empty.
pub fn encode_event_log_records(records: &[EventLogRecord], include_header: bool) -> Vec<u8> {
    let mut bytes = if include_header {
        event_log_header_bytes()
    } else {
        Vec::new()
    };
    for record in records {
        if let Some(encoded) = encode_event_log_record(record) {
            bytes.extend_from_slice(&encoded);
        }
    }
    bytes
}

/// One record, before its payload has been parsed.
struct RawRecord<'a> {
    within_device_events_index: usize,
    device_id: String,
    payload: &'a [u8],
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + U32_LEN)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset + U64_LEN)?;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

fn check_header(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }

    if bytes.len() < EVENT_LOG_HEADER_LEN {
        log::warn!("Event log header too small ({} bytes)", bytes.len());
        return false;
    }

    if !bytes.starts_with(EVENT_LOG_MAGIC) {
        log::warn!("Event log magic bytes did not match");
        return false;
    }

    match read_u32(bytes, EVENT_LOG_MAGIC.len()) {
        Some(EVENT_LOG_VERSION) => true,
        Some(version) => {
            log::warn!("Unsupported event log version {version}");
            false
        }
        None => false,
    }
}

/// The framed records of a log, and whether anything had to be skipped to read them.
fn raw_records(bytes: &[u8]) -> (Vec<RawRecord<'_>>, bool) {
    if !check_header(bytes) {
        return (Vec::new(), bytes.is_empty());
    }

    let mut offset = EVENT_LOG_HEADER_LEN;
    let mut records = Vec::new();
    let mut intact = true;

    while offset < bytes.len() {
        let Some(record_len) = read_u32(bytes, offset) else {
            log::warn!("Event log ends inside a record length");
            intact = false;
            break;
        };
        offset += U32_LEN;

        let Some(record_end) = offset
            .checked_add(record_len as usize)
            .filter(|end| *end <= bytes.len())
        else {
            log::warn!(
                "Event log record length {} exceeds remaining bytes {}",
                record_len,
                bytes.len() - offset
            );
            intact = false;
            break;
        };
        let record = &bytes[offset..record_end];
        offset = record_end;

        match parse_raw_record(record) {
            Some(raw) => records.push(raw),
            None => intact = false,
        }
    }

    (records, intact)
}

fn parse_raw_record(record: &[u8]) -> Option<RawRecord<'_>> {
    if record.len() < U64_LEN + 2 * U32_LEN {
        log::warn!("Event log record too small ({} bytes)", record.len());
        return None;
    }

    let within_device = read_u64(record, 0)?;
    let device_len = read_u32(record, U64_LEN)?;
    let device_start = U64_LEN + U32_LEN;
    let Some(device_id_bytes) = device_start
        .checked_add(device_len as usize)
        .and_then(|device_end| record.get(device_start..device_end))
    else {
        log::warn!("Device ID length {device_len} exceeds record bounds");
        return None;
    };
    let device_end = device_start + device_id_bytes.len();

    let Some(payload_len) = read_u32(record, device_end) else {
        log::warn!("Record for device ends before its payload length");
        return None;
    };
    let payload_start = device_end + U32_LEN;
    // anything after the payload is unknown trailing data, kept for forward compatibility
    let Some(payload) = payload_start
        .checked_add(payload_len as usize)
        .and_then(|payload_end| record.get(payload_start..payload_end))
    else {
        log::warn!("Payload length {payload_len} exceeds record bounds");
        return None;
    };

    let Ok(within_device_events_index) = usize::try_from(within_device) else {
        log::warn!("within_device_events_index {within_device} overflowed usize");
        return None;
    };

    let device_id = match String::from_utf8(device_id_bytes.to_vec()) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Device ID was not valid UTF-8: {e:?}");
            return None;
        }
    };

    Some(RawRecord {
        within_device_events_index,
        device_id,
        payload,
    })
}

fn parse_record(raw: RawRecord<'_>) -> Option<EventLogRecord> {
    match serde_json::from_slice::<Timestamped<serde_json::Value>>(raw.payload) {
        Ok(event) => Some(EventLogRecord {
            device_id: raw.device_id,
            within_device_events_index: raw.within_device_events_index,
            event,
        }),
        Err(e) => {
            log::warn!("Failed to deserialize event payload: {e:?}");
            None
        }
    }
}

/// Every readable record in the log, in storage order, including any after a gap.
pub fn parse_event_log_records(bytes: &[u8]) -> Vec<EventLogRecord> {
    raw_records(bytes).0.into_iter().filter_map(parse_record).collect()
}

/// A log as read back, with the damage accounted for.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogContents {
    /// Each device's events `0..n`, in storage order.
    pub records: Vec<EventLogRecord>,
    /// Whether the bytes hold exactly `records`. A damaged record, a truncated tail, a
    /// duplicate or an event after a gap all make this false, and such a log is rewritten
    /// rather than appended to.
    pub intact: bool,
}

impl EventLogContents {
    pub fn device_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.device_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

pub fn read_event_log(bytes: &[u8]) -> EventLogContents {
    let (raw, mut intact) = raw_records(bytes);
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut gapped: BTreeMap<String, usize> = BTreeMap::new();
    let mut records = Vec::with_capacity(raw.len());

    for raw in raw {
        let Some(record) = parse_record(raw) else {
            intact = false;
            continue;
        };
        if gapped.contains_key(&record.device_id) {
            continue;
        }
        let entry = counts.entry(record.device_id.clone()).or_insert(0);
        let expected = *entry;
        if record.within_device_events_index == expected {
            *entry += 1;
            records.push(record);
        } else if record.within_device_events_index > expected {
            log::error!(
                "Event log index gap for device {}: expected {expected}, found {}",
                record.device_id,
                record.within_device_events_index
            );
            intact = false;
            gapped.insert(record.device_id, expected);
        } else {
            log::warn!(
                "Event log holds event {} of device {} twice",
                record.within_device_events_index,
                record.device_id
            );
            intact = false;
        }
    }

    EventLogContents { records, intact }
}

/// How many events of each device the log holds, counting only the readable prefix `0..n`
/// of each device's indices.
pub fn parse_device_counts(bytes: &[u8]) -> BTreeMap<String, usize> {
    read_event_log(bytes).device_counts()
}
