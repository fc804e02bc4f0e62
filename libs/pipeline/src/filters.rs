//! Observation filters
//!
//! Duplicate suppression, minimum-delta damping, and period throttling.
//! Filter state lives in context cells keyed per data item, so a pipeline
//! rebuild does not re-emit values the consumer already has.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use types::{Observation, ObservedValue, Timestamp};

use crate::context::PipelineContext;
use crate::{Entity, Result, Transform};

/// Drops observations whose canonical value equals the last delivered one
/// for the same data item. Discrete items are never filtered.
pub struct DuplicateFilter;

type LastValues = Mutex<HashMap<String, ObservedValue>>;

impl Transform for DuplicateFilter {
    fn name(&self) -> &'static str {
        "DuplicateFilter"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Observations(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Observations(observations) = entity else {
            return Ok(vec![]);
        };
        let last: Arc<LastValues> = context.shared_cell("duplicate_filter");
        let mut last = last.lock().unwrap();

        let kept: Vec<Observation> = observations
            .into_iter()
            .filter(|obs| {
                let discrete = context
                    .contract
                    .find_data_item(None, &obs.data_item_id)
                    .is_some_and(|di| di.is_discrete());
                if discrete || obs.reset_triggered.is_some() {
                    last.insert(obs.data_item_id.clone(), obs.value.clone());
                    return true;
                }
                match last.get(&obs.data_item_id) {
                    Some(prev) if prev.canonically_eq(&obs.value) => false,
                    _ => {
                        last.insert(obs.data_item_id.clone(), obs.value.clone());
                        true
                    }
                }
            })
            .collect();

        Ok(if kept.is_empty() {
            vec![]
        } else {
            vec![Entity::Observations(kept)]
        })
    }
}

/// Damps SAMPLE items carrying a MINIMUM_DELTA filter: a value within the
/// delta band of the last emitted one is dropped. Vectors compare by the
/// largest axis difference.
pub struct DeltaFilter;

#[derive(Debug, Clone)]
enum LastNumeric {
    Scalar(f64),
    Vector(Vec<f64>),
}

type DeltaState = Mutex<HashMap<String, LastNumeric>>;

impl Transform for DeltaFilter {
    fn name(&self) -> &'static str {
        "DeltaFilter"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Observations(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Observations(observations) = entity else {
            return Ok(vec![]);
        };
        let state: Arc<DeltaState> = context.shared_cell("delta_filter");
        let mut state = state.lock().unwrap();

        let kept: Vec<Observation> = observations
            .into_iter()
            .filter(|obs| {
                let Some(item) = context.contract.find_data_item(None, &obs.data_item_id)
                else {
                    return true;
                };
                let Some(delta) = item.minimum_delta().filter(|_| item.is_sample()) else {
                    return true;
                };

                let current = match &obs.value {
                    ObservedValue::Scalar(s) => s.as_f64().map(LastNumeric::Scalar),
                    ObservedValue::Vector(v) => Some(LastNumeric::Vector(v.clone())),
                    _ => None,
                };
                let Some(current) = current else {
                    // UNAVAILABLE and text reset the band and pass through
                    state.remove(&obs.data_item_id);
                    return true;
                };

                let passes = match state.get(&obs.data_item_id) {
                    None => true,
                    Some(last) => exceeds_delta(last, &current, delta),
                };
                if passes {
                    state.insert(obs.data_item_id.clone(), current);
                }
                passes
            })
            .collect();

        Ok(if kept.is_empty() {
            vec![]
        } else {
            vec![Entity::Observations(kept)]
        })
    }
}

fn exceeds_delta(last: &LastNumeric, current: &LastNumeric, delta: f64) -> bool {
    match (last, current) {
        (LastNumeric::Scalar(a), LastNumeric::Scalar(b)) => (b - a).abs() >= delta,
        (LastNumeric::Vector(a), LastNumeric::Vector(b)) => {
            if a.len() != b.len() {
                return true;
            }
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| (y - x).abs())
                .fold(0.0_f64, f64::max)
                >= delta
        }
        _ => true,
    }
}

/// Throttles items carrying a PERIOD filter: observations arriving earlier
/// than `last + period` are dropped.
pub struct PeriodFilter;

type PeriodState = Mutex<HashMap<String, Timestamp>>;

impl Transform for PeriodFilter {
    fn name(&self) -> &'static str {
        "PeriodFilter"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Observations(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Observations(observations) = entity else {
            return Ok(vec![]);
        };
        let state: Arc<PeriodState> = context.shared_cell("period_filter");
        let mut state = state.lock().unwrap();

        let kept: Vec<Observation> = observations
            .into_iter()
            .filter(|obs| {
                let period = context
                    .contract
                    .find_data_item(None, &obs.data_item_id)
                    .and_then(|di| di.period());
                let Some(period) = period else {
                    return true;
                };
                let earliest = state.get(&obs.data_item_id).map(|last| {
                    *last + chrono::Duration::microseconds((period * 1e6) as i64)
                });
                match earliest {
                    Some(earliest) if obs.timestamp < earliest => false,
                    _ => {
                        state.insert(obs.data_item_id.clone(), obs.timestamp);
                        true
                    }
                }
            })
            .collect();

        Ok(if kept.is_empty() {
            vec![]
        } else {
            vec![Entity::Observations(kept)]
        })
    }
}

/// Applies the data item's native-to-reporting unit conversion. Conversions
/// are resolved once per item and cached in the context; an unknown unit
/// expression disables conversion for that item.
pub struct UnitConverter;

type ConversionCache = Mutex<HashMap<String, Option<crate::units::UnitConversion>>>;

impl Transform for UnitConverter {
    fn name(&self) -> &'static str {
        "UnitConverter"
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Observations(_))
    }

    fn apply(&self, entity: Entity, context: &PipelineContext) -> Result<Vec<Entity>> {
        let Entity::Observations(mut observations) = entity else {
            return Ok(vec![]);
        };
        let cache: Arc<ConversionCache> = context.shared_cell("unit_conversions");
        let mut cache = cache.lock().unwrap();

        for obs in &mut observations {
            let conversion = cache
                .entry(obs.data_item_id.clone())
                .or_insert_with(|| {
                    let item = context.contract.find_data_item(None, &obs.data_item_id)?;
                    match crate::units::UnitConversion::for_data_item(&item) {
                        Some(Ok(conversion)) => Some(conversion),
                        Some(Err(err)) => {
                            tracing::error!(
                                data_item = %item.id,
                                error = %err,
                                "unit conversion unavailable"
                            );
                            None
                        }
                        None => None,
                    }
                });
            if let Some(conversion) = conversion {
                conversion.convert_value(&mut obs.value);
            }
        }

        Ok(vec![Entity::Observations(observations)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContract;
    use chrono::Utc;
    use types::{
        AssetCommand, AssetEvent, DataItem, Device, FilterKind, Scalar, SequenceNumber,
    };

    struct ItemContract(Vec<Arc<DataItem>>);

    impl PipelineContract for ItemContract {
        fn find_device(&self, _: &str) -> Option<Arc<Device>> {
            None
        }
        fn find_data_item(&self, _: Option<&str>, key: &str) -> Option<Arc<DataItem>> {
            self.0.iter().find(|di| di.id == key).cloned()
        }
        fn each_data_item(&self, f: &mut dyn FnMut(&Arc<DataItem>)) {
            for item in &self.0 {
                f(item);
            }
        }
        fn deliver_observation(&self, _: Observation) -> SequenceNumber {
            0
        }
        fn deliver_asset_command(&self, _: AssetCommand) {}
        fn deliver_asset_event(&self, _: AssetEvent) {}
        fn deliver_command(&self, _: codec::ProtocolCommand, _: &str) {}
    }

    fn run_filter<T: Transform>(
        filter: &T,
        context: &PipelineContext,
        obs: Observation,
    ) -> usize {
        match filter
            .apply(Entity::Observations(vec![obs]), context)
            .unwrap()
            .pop()
        {
            Some(Entity::Observations(list)) => list.len(),
            _ => 0,
        }
    }

    fn number(id: &str, value: f64) -> Observation {
        Observation::new(id, Utc::now(), ObservedValue::Scalar(Scalar::Number(value)))
    }

    fn text(id: &str, value: &str) -> Observation {
        Observation::new(
            id,
            Utc::now(),
            ObservedValue::Scalar(Scalar::Text(value.to_string())),
        )
    }

    #[test]
    fn duplicate_events_are_dropped() {
        let context = PipelineContext::new(
            "t",
            Arc::new(ItemContract(vec![Arc::new(DataItem::event("a", "EXECUTION"))])),
        );
        let filter = DuplicateFilter;
        assert_eq!(1, run_filter(&filter, &context, text("a", "READY")));
        assert_eq!(0, run_filter(&filter, &context, text("a", "READY")));
        assert_eq!(1, run_filter(&filter, &context, text("a", "ACTIVE")));
        // Back to an earlier value is a change again
        assert_eq!(1, run_filter(&filter, &context, text("a", "READY")));
    }

    #[test]
    fn duplicate_samples_compare_numerically() {
        let context = PipelineContext::new(
            "t",
            Arc::new(ItemContract(vec![Arc::new(
                DataItem::sample("a", "POSITION").with_units("MILLIMETER"),
            )])),
        );
        let filter = DuplicateFilter;
        assert_eq!(1, run_filter(&filter, &context, number("a", 1.5)));
        assert_eq!(0, run_filter(&filter, &context, number("a", 1.5)));
        assert_eq!(1, run_filter(&filter, &context, number("a", 1.6)));
    }

    #[test]
    fn minimum_delta_band() {
        let item = DataItem::sample("a", "POSITION")
            .with_units("MILLIMETER")
            .with_filter(FilterKind::MinimumDelta, 1.0);
        let context =
            PipelineContext::new("t", Arc::new(ItemContract(vec![Arc::new(item)])));
        let filter = DeltaFilter;

        let expectations = [
            (1.5, 1),
            (1.6, 0),
            (1.8, 0),
            (2.8, 1),
            (2.0, 0),
            (1.7, 1),
        ];
        for (value, expected) in expectations {
            assert_eq!(
                expected,
                run_filter(&filter, &context, number("a", value)),
                "value {value}"
            );
        }
    }

    #[test]
    fn unavailable_resets_delta_band() {
        let item = DataItem::sample("a", "POSITION")
            .with_filter(FilterKind::MinimumDelta, 5.0);
        let context =
            PipelineContext::new("t", Arc::new(ItemContract(vec![Arc::new(item)])));
        let filter = DeltaFilter;

        assert_eq!(1, run_filter(&filter, &context, number("a", 10.0)));
        let unavailable = Observation::unavailable("a", Utc::now());
        assert_eq!(1, run_filter(&filter, &context, unavailable));
        // Band restarts after unavailability
        assert_eq!(1, run_filter(&filter, &context, number("a", 10.1)));
    }

    #[test]
    fn period_filter_throttles() {
        let item = DataItem::sample("a", "LOAD").with_filter(FilterKind::Period, 10.0);
        let context =
            PipelineContext::new("t", Arc::new(ItemContract(vec![Arc::new(item)])));
        let filter = PeriodFilter;

        let base = Utc::now();
        let at = |s: i64| {
            let mut obs = number("a", s as f64);
            obs.timestamp = base + chrono::Duration::seconds(s);
            obs
        };
        assert_eq!(1, run_filter(&filter, &context, at(0)));
        assert_eq!(0, run_filter(&filter, &context, at(5)));
        assert_eq!(1, run_filter(&filter, &context, at(10)));
        assert_eq!(0, run_filter(&filter, &context, at(19)));
    }

    #[test]
    fn unit_converter_scales_samples() {
        let item = DataItem::sample("a", "POSITION")
            .with_units("MILLIMETER")
            .with_native_units("INCH");
        let context =
            PipelineContext::new("t", Arc::new(ItemContract(vec![Arc::new(item)])));
        let converter = UnitConverter;

        let out = converter
            .apply(Entity::Observations(vec![number("a", 2.0)]), &context)
            .unwrap();
        match &out[0] {
            Entity::Observations(list) => {
                assert!((list[0].value.as_f64().unwrap() - 50.8).abs() < 1e-9);
            }
            other => panic!("expected observations, got {other:?}"),
        }
    }
}
