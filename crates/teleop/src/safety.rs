//! Backend safety arbitration.
//!
//! Operator drive intent is checked against the latest sensor state before
//! it reaches the driver, independently of anything the UI enforces.

use oi::RADIUS_STRAIGHT;
use types::SensorSnapshot;

/// Outcome of arbitrating a drive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitrated {
    /// Forward the command unchanged.
    Allow,
    /// Rewrite to a stop.
    Stop(&'static str),
}

/// Apply the bumper / wheel-drop / cliff rules to a drive request.
///
/// - any wheel drop or cliff: every drive becomes a stop;
/// - both bumpers: only reverse passes;
/// - left bumper: reverse or a right turn (r < 0) passes;
/// - right bumper: reverse or a left turn (r > 0, not straight) passes.
pub fn arbitrate_drive(velocity: i32, radius: i32, sensors: &SensorSnapshot) -> Arbitrated {
    if velocity == 0 {
        return Arbitrated::Allow;
    }
    if sensors.drive_inhibited() {
        return Arbitrated::Stop("wheel drop or cliff active");
    }

    let reverse = velocity < 0;
    let right_turn = radius < 0;
    let left_turn = radius > 0 && radius != RADIUS_STRAIGHT;

    match (sensors.bump_left, sensors.bump_right) {
        (true, true) if !reverse => Arbitrated::Stop("both bumpers pressed"),
        (true, false) if !(reverse || right_turn) => Arbitrated::Stop("left bumper pressed"),
        (false, true) if !(reverse || left_turn) => Arbitrated::Stop("right bumper pressed"),
        _ => Arbitrated::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oi::{RADIUS_SPIN_CCW, RADIUS_SPIN_CW};

    fn sensors(bump_left: bool, bump_right: bool) -> SensorSnapshot {
        SensorSnapshot {
            bump_left,
            bump_right,
            ..Default::default()
        }
    }

    #[test]
    fn test_clear_sensors_allow_everything() {
        let snap = sensors(false, false);
        assert_eq!(arbitrate_drive(200, RADIUS_STRAIGHT, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(-200, 500, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(100, RADIUS_SPIN_CW, &snap), Arbitrated::Allow);
    }

    #[test]
    fn test_both_bumpers_allow_only_reverse() {
        let snap = sensors(true, true);
        assert_eq!(arbitrate_drive(-100, RADIUS_STRAIGHT, &snap), Arbitrated::Allow);
        assert!(matches!(
            arbitrate_drive(100, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
        assert!(matches!(
            arbitrate_drive(100, -200, &snap),
            Arbitrated::Stop(_)
        ));
        assert!(matches!(
            arbitrate_drive(100, 200, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_left_bumper_allows_reverse_or_right_turn() {
        let snap = sensors(true, false);
        // Forward straight is rewritten, forward right turn passes
        assert!(matches!(
            arbitrate_drive(200, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
        assert_eq!(arbitrate_drive(200, -200, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(-200, RADIUS_STRAIGHT, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(100, RADIUS_SPIN_CW, &snap), Arbitrated::Allow);
        // Left turn into the obstacle is rewritten
        assert!(matches!(
            arbitrate_drive(200, 300, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_right_bumper_allows_reverse_or_left_turn() {
        let snap = sensors(false, true);
        assert!(matches!(
            arbitrate_drive(200, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
        assert_eq!(arbitrate_drive(200, 300, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(100, RADIUS_SPIN_CCW, &snap), Arbitrated::Allow);
        assert_eq!(arbitrate_drive(-50, -100, &snap), Arbitrated::Allow);
        assert!(matches!(
            arbitrate_drive(200, -300, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_straight_radius_is_not_a_left_turn() {
        // 32768 is positive on paper but means "no curvature"
        let snap = sensors(false, true);
        assert!(matches!(
            arbitrate_drive(200, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_wheel_drop_stops_everything() {
        let mut snap = sensors(false, false);
        snap.wheel_drop_left = true;
        assert!(matches!(
            arbitrate_drive(100, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
        assert!(matches!(
            arbitrate_drive(-100, RADIUS_STRAIGHT, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_cliff_stops_everything() {
        let mut snap = sensors(false, false);
        snap.cliff_front_left = true;
        assert!(matches!(
            arbitrate_drive(-100, 200, &snap),
            Arbitrated::Stop(_)
        ));
    }

    #[test]
    fn test_zero_velocity_always_allowed() {
        let mut snap = sensors(true, true);
        snap.wheel_drop_caster = true;
        assert_eq!(arbitrate_drive(0, RADIUS_STRAIGHT, &snap), Arbitrated::Allow);
    }
}
