//! Shared types and message definitions for roombad.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Robot pose in the room frame (millimetres, degrees).
/// Origin and axes come from the loaded plan; +x at theta = 0,
/// positive theta is counter-clockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// X position in millimetres
    pub x_mm: f64,
    /// Y position in millimetres
    pub y_mm: f64,
    /// Heading in degrees, kept in (-180, 180]
    pub theta_deg: f64,
}

impl Pose {
    pub fn new(x_mm: f64, y_mm: f64, theta_deg: f64) -> Self {
        Self {
            x_mm,
            y_mm,
            theta_deg: normalize_deg(theta_deg),
        }
    }

    /// Copy of this pose with the heading normalized into (-180, 180].
    pub fn normalized(&self) -> Self {
        Self {
            theta_deg: normalize_deg(self.theta_deg),
            ..*self
        }
    }

    pub fn theta_rad(&self) -> f64 {
        self.theta_deg.to_radians()
    }
}

/// Normalize an angle in degrees into (-180, 180].
pub fn normalize_deg(angle: f64) -> f64 {
    let mut a = angle % 360.0;
    if a <= -180.0 {
        a += 360.0;
    } else if a > 180.0 {
        a -= 360.0;
    }
    a
}

/// Per-update motion of the robot centre.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDelta {
    /// Forward arc length in millimetres (negative = reverse)
    pub ds_mm: f64,
    /// Heading change in degrees (positive = counter-clockwise)
    pub dtheta_deg: f64,
}

/// Where a pose update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseSource {
    /// Integrated from wheel encoder counts
    #[default]
    Encoders,
    /// Integrated from the OI one-frame distance/angle packets
    Distance,
    /// Corrected from a fiducial observation
    Snap,
}

/// One line of the odometry history file. The last complete record in the
/// file is the authoritative pose after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub pose: Pose,
    pub step: StepDelta,
    pub source: PoseSource,
    pub timestamp_ms: u64,
}

/// Battery charging state reported by the OI (packet 21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingState {
    #[default]
    NotCharging,
    Reconditioning,
    FullCharging,
    TrickleCharging,
    Waiting,
    ChargingFault,
}

impl ChargingState {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Reconditioning,
            2 => Self::FullCharging,
            3 => Self::TrickleCharging,
            4 => Self::Waiting,
            5 => Self::ChargingFault,
            _ => Self::NotCharging,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::NotCharging => 0,
            Self::Reconditioning => 1,
            Self::FullCharging => 2,
            Self::TrickleCharging => 3,
            Self::Waiting => 4,
            Self::ChargingFault => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotCharging => "not charging",
            Self::Reconditioning => "reconditioning",
            Self::FullCharging => "charging",
            Self::TrickleCharging => "trickle charging",
            Self::Waiting => "waiting",
            Self::ChargingFault => "charging fault",
        }
    }
}

/// OI interface mode (packet 35).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OiMode {
    #[default]
    Off,
    Passive,
    Safe,
    Full,
}

impl OiMode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Passive,
            2 => Self::Safe,
            3 => Self::Full,
            _ => Self::Off,
        }
    }
}

bitflags! {
    /// Light bumper segments (packet 45).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LightBumper: u8 {
        const LEFT = 0x01;
        const FRONT_LEFT = 0x02;
        const CENTER_LEFT = 0x04;
        const CENTER_RIGHT = 0x08;
        const FRONT_RIGHT = 0x10;
        const RIGHT = 0x20;
    }
}

impl Serialize for LightBumper {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for LightBumper {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(LightBumper::from_bits_truncate(u8::deserialize(
            deserializer,
        )?))
    }
}

/// Decoded robot sensor state. Produced by the OI stream decoder at the
/// stream cadence; fields not present in the selected packet group keep
/// their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Server receive time (unix milliseconds)
    pub timestamp_ms: u64,
    /// False once the stream has missed its expected cadence
    pub link_alive: bool,

    pub bump_left: bool,
    pub bump_right: bool,
    pub wheel_drop_left: bool,
    pub wheel_drop_right: bool,
    pub wheel_drop_caster: bool,
    pub cliff_left: bool,
    pub cliff_front_left: bool,
    pub cliff_front_right: bool,
    pub cliff_right: bool,
    pub wall_seen: bool,
    pub dock_visible: bool,

    pub charging_state: ChargingState,
    /// True when the internal charger is connected (packet 34 bit 0)
    pub internal_charger: bool,
    pub voltage_mv: u16,
    pub current_ma: i16,
    pub battery_charge_mah: u16,
    pub battery_capacity_mah: u16,

    /// Distance travelled since the previous frame (packet 19)
    pub distance_mm: i16,
    /// Angle turned since the previous frame (packet 20)
    pub angle_deg: i16,
    /// Sum of one-frame distances since stream start
    pub total_distance_mm: i64,
    /// Sum of one-frame angles since stream start
    pub total_angle_deg: i64,

    /// Left wheel encoder count, rolls over at 2^16 (packet 43)
    pub encoder_left: u16,
    /// Right wheel encoder count, rolls over at 2^16 (packet 44)
    pub encoder_right: u16,

    pub oi_mode: OiMode,
    pub light_bumper: LightBumper,
    pub requested_velocity_mm_s: i16,
    pub requested_radius_mm: i16,
}

impl SensorSnapshot {
    /// Battery charge as a percentage of capacity, or 0 when capacity is
    /// unknown.
    pub fn battery_percent(&self) -> f64 {
        if self.battery_capacity_mah == 0 {
            return 0.0;
        }
        (self.battery_charge_mah as f64 / self.battery_capacity_mah as f64 * 100.0)
            .clamp(0.0, 100.0)
    }

    /// Any condition that forbids driving (wheel drop or cliff).
    pub fn drive_inhibited(&self) -> bool {
        self.wheel_drop_left
            || self.wheel_drop_right
            || self.wheel_drop_caster
            || self.cliff_left
            || self.cliff_front_left
            || self.cliff_front_right
            || self.cliff_right
    }
}

/// Health of the background sensor stream, published alongside snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamHealth {
    /// True while frames arrive within 3x the stream period
    pub alive: bool,
    /// Milliseconds since the last decoded frame
    pub last_update_age_ms: u64,
    /// Times the driver reopened the port and restarted the stream
    pub restart_count: u32,
    /// Human-readable reason for the most recent restart or failure
    pub last_error: Option<String>,
}

/// Requested OI mode from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeRequest {
    Safe,
    Full,
}

/// Operator command, decoded from a JSON object with an `action` field.
/// Unknown actions fail to decode and are reported back on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum OperatorAction {
    Ping,
    /// Connect + start + safe + ensure the sensor stream
    Init,
    Mode {
        value: ModeRequest,
    },
    Drive {
        /// mm/s, clamped to +-500 by the driver
        velocity: i32,
        /// mm; 32768 = straight, 1 = spin CCW, -1 = spin CW
        radius: i32,
    },
    Stop,
    Clean,
    Dock,
}

/// A single fiducial marker seen in a camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: u32,
    /// Image-plane corner pixels, in marker-border order
    pub corners: [[f64; 2]; 4],
    /// Image-plane centre pixel
    pub center: [f64; 2],
    /// Quadrilateral area in square pixels
    pub area_px: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub timestamp_ms: u64,
}

/// Output of one fiducial worker cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FiducialResult {
    pub enabled: bool,
    pub ok: bool,
    /// Set when `ok` is false: `idle`, `no_frame`, `decode_failed`,
    /// `unsupported_dictionary:<name>`, `detector_error:<msg>`
    pub reason: Option<String>,
    pub markers: Vec<MarkerObservation>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub timestamp_ms: u64,
}
