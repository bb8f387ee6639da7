use crate::config::OperationMode;
use crate::error::FatalError;
use crate::Angle;

/// Time needed to rotate the crankshaft by one degree, in microseconds
pub fn one_degree_time_us(rpm: f32) -> f32 {
    1_000_000.0 * 60.0 / 360.0 / rpm
}

/// Time of one crankshaft revolution, in milliseconds
pub fn crankshaft_revolution_time_ms(rpm: f32) -> f32 {
    60_000.0 / rpm
}

/// Time of one full engine cycle, in milliseconds
pub fn engine_cycle_duration_ms(rpm: f32, mode: OperationMode) -> f32 {
    crankshaft_revolution_time_ms(rpm) * mode.revolutions_per_engine_cycle() as f32
}

/// Brings `angle` into `[0, cycle)`
pub fn wrap_angle(angle: Angle, cycle: Angle) -> Result<Angle, FatalError> {
    if !(cycle > 0.0) {
        return Err(FatalError::InvalidCycleDuration);
    }
    if angle.is_nan() {
        return Err(FatalError::InvalidAngle);
    }
    let mut wrapped = angle % cycle;
    if wrapped < 0.0 {
        wrapped += cycle;
    }
    // -tiny + cycle rounds up to cycle
    if wrapped >= cycle {
        wrapped = 0.0;
    }
    Ok(wrapped)
}

/// Phase of the TDC of the `index`-th firing cylinder, evenly spread over the engine cycle
pub fn cylinder_angle(index: u8, cylinders_count: u8, engine_cycle: Angle) -> Option<Angle> {
    if cylinders_count == 0 || index >= cylinders_count {
        return None;
    }
    Some(engine_cycle / cylinders_count as f32 * index as f32)
}

#[cfg(test)]
mod tests {
    use crate::config::OperationMode;
    use crate::error::FatalError;
    use crate::math::{cylinder_angle, engine_cycle_duration_ms, one_degree_time_us, wrap_angle};
    use rstest::rstest;

    #[rstest(angle, expected,
        case(0.0, 0.0),
        case(719.0, 719.0),
        case(720.0, 0.0),
        case(730.0, 10.0),
        case(-10.0, 710.0),
        case(-1450.0, 710.0)
    )]
    fn wrap_test(angle: f32, expected: f32) {
        let wrapped = wrap_angle(angle, 720.0).unwrap();
        assert!((wrapped - expected).abs() < 1e-3, "{} -> {}", angle, wrapped);
    }

    #[test]
    fn wrap_rejects_bad_cycle() {
        assert_eq!(Err(FatalError::InvalidCycleDuration), wrap_angle(10.0, 0.0));
        assert_eq!(Err(FatalError::InvalidCycleDuration), wrap_angle(10.0, f32::NAN));
        assert_eq!(Err(FatalError::InvalidAngle), wrap_angle(f32::NAN, 720.0));
    }

    #[rstest(index, count, expected,
        case(0, 4, Some(0.0)),
        case(1, 4, Some(180.0)),
        case(3, 4, Some(540.0)),
        case(1, 6, Some(120.0)),
        case(5, 6, Some(600.0)),
        case(6, 6, None),
        case(0, 0, None)
    )]
    fn tdc_test(index: u8, count: u8, expected: Option<f32>) {
        assert_eq!(expected, cylinder_angle(index, count, 720.0));
    }

    #[test]
    fn one_degree_at_1000_rpm() {
        assert!((one_degree_time_us(1000.0) - 166.666_67).abs() < 1e-3);
        assert!((engine_cycle_duration_ms(1000.0, OperationMode::FourStrokeCrankSensor) - 120.0).abs() < 1e-3);
        assert!(one_degree_time_us(0.0).is_infinite());
    }
}
