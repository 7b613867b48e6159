//! Open Interface sensor frame decoding.
//!
//! Stream frames have the envelope `[19][len][payload][checksum]` where the
//! byte sum of the whole frame is 0 mod 256. The payload concatenates
//! `[packet id][packet bytes]` groups. One-shot group queries (opcode 142)
//! return the same packet bytes back-to-back without ids, in fixed order.
//!
//! The decoder is a pure state machine over a byte buffer: no timing, no
//! I/O. Resync discards one byte and hunts for the next header; the reader
//! treats too many consecutive resyncs as a link fault.

use types::{ChargingState, LightBumper, OiMode, SensorSnapshot};

/// Stream frame header byte.
pub const STREAM_HEADER: u8 = 19;

/// Payload byte count for a sensor packet id, if the id is known.
pub fn packet_len(id: u8) -> Option<usize> {
    match id {
        7..=18 => Some(1),
        19 | 20 => Some(2),
        21 => Some(1),
        22 | 23 => Some(2),
        24 => Some(1),
        25..=31 => Some(2),
        32 => Some(1),
        33 => Some(2),
        34..=38 => Some(1),
        39..=44 => Some(2),
        45 => Some(1),
        46..=51 => Some(2),
        52 | 53 => Some(1),
        54..=57 => Some(2),
        58 => Some(1),
        _ => None,
    }
}

/// Packet ids contained in a query group, in wire order.
pub fn group_packet_ids(group: u8) -> Option<&'static [u8]> {
    const GROUP_0: &[u8] = &[
        7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
    ];
    const GROUP_6: &[u8] = &[
        7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29,
        30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42,
    ];
    const GROUP_100: &[u8] = &[
        7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29,
        30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51,
        52, 53, 54, 55, 56, 57, 58,
    ];
    match group {
        0 => Some(GROUP_0),
        6 => Some(GROUP_6),
        100 => Some(GROUP_100),
        _ => None,
    }
}

/// Total payload byte count of a query group.
pub fn group_len(group: u8) -> Option<usize> {
    group_packet_ids(group).map(|ids| {
        ids.iter()
            .map(|&id| packet_len(id).unwrap_or(0))
            .sum::<usize>()
    })
}

fn be_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn be_i16(data: &[u8]) -> i16 {
    i16::from_be_bytes([data[0], data[1]])
}

/// Apply one sensor packet to a snapshot. Returns false for unknown ids.
/// `data` must be exactly `packet_len(id)` bytes.
pub fn apply_packet(id: u8, data: &[u8], snap: &mut SensorSnapshot) -> bool {
    match id {
        7 => {
            let bits = data[0];
            snap.bump_right = bits & 0x01 != 0;
            snap.bump_left = bits & 0x02 != 0;
            snap.wheel_drop_right = bits & 0x04 != 0;
            snap.wheel_drop_left = bits & 0x08 != 0;
            snap.wheel_drop_caster = bits & 0x10 != 0;
        }
        8 => snap.wall_seen = data[0] != 0,
        9 => snap.cliff_left = data[0] != 0,
        10 => snap.cliff_front_left = data[0] != 0,
        11 => snap.cliff_front_right = data[0] != 0,
        12 => snap.cliff_right = data[0] != 0,
        19 => {
            snap.distance_mm = be_i16(data);
            snap.total_distance_mm += snap.distance_mm as i64;
        }
        20 => {
            snap.angle_deg = be_i16(data);
            snap.total_angle_deg += snap.angle_deg as i64;
        }
        21 => snap.charging_state = ChargingState::from_code(data[0]),
        22 => snap.voltage_mv = be_u16(data),
        23 => snap.current_ma = be_i16(data),
        25 => snap.battery_charge_mah = be_u16(data),
        26 => snap.battery_capacity_mah = be_u16(data),
        34 => {
            snap.internal_charger = data[0] & 0x01 != 0;
            snap.dock_visible = data[0] & 0x02 != 0;
        }
        35 => snap.oi_mode = OiMode::from_code(data[0]),
        39 => snap.requested_velocity_mm_s = be_i16(data),
        40 => snap.requested_radius_mm = be_i16(data),
        43 => snap.encoder_left = be_u16(data),
        44 => snap.encoder_right = be_u16(data),
        45 => snap.light_bumper = LightBumper::from_bits_truncate(data[0]),
        // Known-but-unmapped packets (buttons, signal strengths, motor
        // currents): consume without updating the snapshot.
        other => {
            if packet_len(other).is_none() {
                return false;
            }
        }
    }
    true
}

/// Decode a query-group payload (no per-packet ids) onto a snapshot.
pub fn decode_group(group: u8, data: &[u8], snap: &mut SensorSnapshot) -> Result<(), String> {
    let ids = group_packet_ids(group).ok_or_else(|| format!("unknown sensor group {group}"))?;
    let expected = group_len(group).unwrap_or(0);
    if data.len() != expected {
        return Err(format!(
            "group {group} payload is {} bytes, expected {expected}",
            data.len()
        ));
    }
    let mut cursor = 0;
    for &id in ids {
        let len = packet_len(id).unwrap_or(0);
        apply_packet(id, &data[cursor..cursor + len], snap);
        cursor += len;
    }
    Ok(())
}

/// Outcome of feeding bytes to the stream decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// A checksum-valid frame was decoded into a fresh snapshot.
    Frame(SensorSnapshot),
    /// A checksum-valid frame carried an id the decoder does not know.
    Inconsistent(String),
    /// Consecutive resyncs crossed the configured limit.
    FramingExceeded,
}

/// Incremental decoder for the continuous sensor stream.
///
/// Holds the rolling snapshot so fields absent from the streamed group keep
/// their last value.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    snapshot: SensorSnapshot,
    consecutive_resyncs: u32,
    max_resyncs: u32,
    /// Total resyncs since creation, for diagnostics.
    pub resync_total: u64,
}

impl StreamDecoder {
    pub fn new(max_resyncs: u32) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            snapshot: SensorSnapshot::default(),
            consecutive_resyncs: 0,
            max_resyncs,
            resync_total: 0,
        }
    }

    /// Last committed snapshot.
    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    /// Reset framing state but keep the rolling snapshot (used across
    /// stream restarts).
    pub fn reset_framing(&mut self) {
        self.buf.clear();
        self.consecutive_resyncs = 0;
    }

    /// Feed received bytes; returns the events produced, in order.
    /// `now_ms` stamps any decoded snapshots.
    pub fn feed(&mut self, bytes: &[u8], now_ms: u64) -> Vec<DecodeEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(event) = self.advance(now_ms) {
            let fatal = matches!(event, DecodeEvent::FramingExceeded);
            events.push(event);
            if fatal {
                break;
            }
        }
        events
    }

    fn advance(&mut self, now_ms: u64) -> Option<DecodeEvent> {
        loop {
            // Hunt for the header.
            if !self.buf.is_empty() && self.buf[0] != STREAM_HEADER {
                if let Some(e) = self.resync() {
                    return Some(e);
                }
                continue;
            }
            if self.buf.len() < 2 {
                return None;
            }
            let payload_len = self.buf[1] as usize;
            let frame_len = payload_len + 3;
            if self.buf.len() < frame_len {
                return None;
            }

            let sum: u8 = self.buf[..frame_len]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if sum != 0 {
                if let Some(e) = self.resync() {
                    return Some(e);
                }
                continue;
            }

            // Checksum-valid envelope: parse `[id][data]` groups into a
            // candidate so a malformed payload leaves the snapshot intact.
            let mut candidate = self.snapshot.clone();
            let mut parse_error: Option<String> = None;
            {
                let payload = &self.buf[2..2 + payload_len];
                let mut cursor = 0;
                while cursor < payload.len() {
                    let id = payload[cursor];
                    let Some(len) = packet_len(id) else {
                        parse_error = Some(format!(
                            "unknown packet id {id} in checksum-valid frame"
                        ));
                        break;
                    };
                    if cursor + 1 + len > payload.len() {
                        parse_error =
                            Some(format!("packet {id} truncated at payload end"));
                        break;
                    }
                    apply_packet(id, &payload[cursor + 1..cursor + 1 + len], &mut candidate);
                    cursor += 1 + len;
                }
            }
            if let Some(msg) = parse_error {
                // Same discipline as a bad checksum: drop one byte, hunt
                // for the next header, count toward the resync limit.
                return Some(match self.resync() {
                    Some(event) => event,
                    None => DecodeEvent::Inconsistent(msg),
                });
            }

            candidate.timestamp_ms = now_ms;
            candidate.link_alive = true;
            self.snapshot = candidate.clone();
            self.buf.drain(..frame_len);
            self.consecutive_resyncs = 0;
            return Some(DecodeEvent::Frame(candidate));
        }
    }

    /// Discard one byte, then skip ahead to the next header candidate.
    fn resync(&mut self) -> Option<DecodeEvent> {
        self.buf.remove(0);
        while !self.buf.is_empty() && self.buf[0] != STREAM_HEADER {
            self.buf.remove(0);
        }
        self.consecutive_resyncs += 1;
        self.resync_total += 1;
        if self.consecutive_resyncs >= self.max_resyncs {
            self.consecutive_resyncs = 0;
            Some(DecodeEvent::FramingExceeded)
        } else {
            None
        }
    }
}

/// Build a checksum-valid stream frame from `[id, data..]` packet groups.
/// Shared by the reader tests and the integration scenarios.
pub fn build_stream_frame(packets: &[(u8, &[u8])]) -> Vec<u8> {
    let payload_len: usize = packets.iter().map(|(_, d)| 1 + d.len()).sum();
    let mut frame = Vec::with_capacity(payload_len + 3);
    frame.push(STREAM_HEADER);
    frame.push(payload_len as u8);
    for (id, data) in packets {
        frame.push(*id);
        frame.extend_from_slice(data);
    }
    let sum: u8 = frame.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    frame.push(sum.wrapping_neg());
    frame
}
