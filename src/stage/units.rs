use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result, Session, SlotId};

/// Mechanical description of the stage plugged into a slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    pub counts_per_unit: u32,
    pub nm_per_count: f32,
    pub min_position: u32,
    pub max_position: u32,
    pub max_speed: f64,
    pub max_acceleration: f64,
}

impl StageParams {
    fn scale(&self) -> Option<f64> {
        let scale = self.nm_per_count as f64;
        (scale.is_finite() && scale != 0.0).then_some(scale)
    }
}

/// Encoder count / nanometre conversion from cached stage parameters.
///
/// Parameters are stored once per slot and never replaced for the lifetime
/// of the session.
#[derive(Debug, Clone, Default)]
pub struct UnitConverter {
    params: [Option<StageParams>; 3],
}

impl UnitConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `params` unless the slot already has some; returns the cached value
    pub fn store(&mut self, slot: SlotId, params: StageParams) -> StageParams {
        *self.params[slot.index()].get_or_insert(params)
    }

    pub fn params(&self, slot: SlotId) -> Option<StageParams> {
        self.params[slot.index()]
    }

    pub fn encoder_to_nm(&self, slot: SlotId, count: i32) -> Result<f64> {
        let scale = self.scale(slot)?;
        Ok(count as f64 * scale)
    }

    pub fn nm_to_encoder(&self, slot: SlotId, nm: f64) -> Result<i32> {
        let scale = self.scale(slot)?;
        let counts = (nm / scale).round();
        if !counts.is_finite() || counts < i32::MIN as f64 || counts > i32::MAX as f64 {
            return Err(DeviceError::OutOfRange(format!(
                "{} nm is not reachable on slot {}",
                nm, slot
            )));
        }
        Ok(counts as i32)
    }

    fn scale(&self, slot: SlotId) -> Result<f64> {
        self.params[slot.index()]
            .as_ref()
            .and_then(StageParams::scale)
            .ok_or(DeviceError::StageParamsUnavailable(slot.number()))
    }
}

impl Session {
    /// Needs `stage_params` to have been read for the slot
    pub async fn encoder_to_nm(&self, slot: u8, count: i32) -> Result<f64> {
        let id = SlotId::try_from(slot)?;
        self.converter.read().await.encoder_to_nm(id, count)
    }

    pub async fn nm_to_encoder(&self, slot: u8, nm: f64) -> Result<i32> {
        let id = SlotId::try_from(slot)?;
        self.converter.read().await.nm_to_encoder(id, nm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(nm_per_count: f32) -> StageParams {
        StageParams {
            counts_per_unit: 2000,
            nm_per_count,
            min_position: 0,
            max_position: 50_000,
            max_speed: 10.0,
            max_acceleration: 5.0,
        }
    }

    fn slot4() -> SlotId {
        SlotId::try_from(4).unwrap()
    }

    #[test]
    fn test_conversion_both_ways() {
        let mut converter = UnitConverter::new();
        converter.store(slot4(), params(0.5));
        assert_eq!(converter.encoder_to_nm(slot4(), 1000).unwrap(), 500.0);
        assert_eq!(converter.nm_to_encoder(slot4(), 500.0).unwrap(), 1000);
        assert_eq!(converter.nm_to_encoder(slot4(), 500.3).unwrap(), 1001);
        assert_eq!(converter.nm_to_encoder(slot4(), -0.2).unwrap(), 0);
    }

    #[test]
    fn test_round_trip_within_one_count() {
        let mut converter = UnitConverter::new();
        converter.store(slot4(), params(0.0137));
        for count in [i32::MIN / 2, -123_457, -1, 0, 1, 999, 2_000_001, i32::MAX / 2] {
            let nm = converter.encoder_to_nm(slot4(), count).unwrap();
            let back = converter.nm_to_encoder(slot4(), nm).unwrap();
            assert!((back as i64 - count as i64).abs() <= 1, "{} came back as {}", count, back);
        }
    }

    #[test]
    fn test_missing_or_degenerate_params() {
        let mut converter = UnitConverter::new();
        assert!(matches!(converter.encoder_to_nm(slot4(), 1), Err(DeviceError::StageParamsUnavailable(4))));
        converter.store(slot4(), params(0.0));
        assert!(matches!(converter.nm_to_encoder(slot4(), 1.0), Err(DeviceError::StageParamsUnavailable(4))));
    }

    #[test]
    fn test_out_of_range_and_non_finite() {
        let mut converter = UnitConverter::new();
        converter.store(slot4(), params(0.001));
        assert!(matches!(converter.nm_to_encoder(slot4(), 1e12), Err(DeviceError::OutOfRange(_))));
        assert!(matches!(converter.nm_to_encoder(slot4(), f64::NAN), Err(DeviceError::OutOfRange(_))));
        assert!(matches!(converter.nm_to_encoder(slot4(), f64::INFINITY), Err(DeviceError::OutOfRange(_))));
    }

    #[test]
    fn test_params_are_immutable_once_cached() {
        let mut converter = UnitConverter::new();
        converter.store(slot4(), params(0.5));
        let kept = converter.store(slot4(), params(2.0));
        assert_eq!(kept.nm_per_count, 0.5);
    }
}
