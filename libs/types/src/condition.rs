//! Active-condition tracking
//!
//! Condition data items carry a set of simultaneously active entries keyed
//! by native code. This module implements the state machine the Current
//! view is built from: FAULT/WARNING with a code adds or refreshes an
//! entry, NORMAL with a code retires that one entry, and NORMAL with no
//! code clears the whole set.

use std::sync::Arc;

use crate::observation::{ConditionLevel, Observation, ObservedValue};

/// Active conditions for one data item, newest first
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    active: Vec<Arc<Observation>>,
}

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one condition observation into the active set.
    ///
    /// Non-condition values are ignored. UNAVAILABLE collapses the set to
    /// the single unavailable entry, matching a device that lost contact.
    pub fn apply(&mut self, obs: &Arc<Observation>) {
        let cond = match &obs.value {
            ObservedValue::Condition(c) => c,
            _ => return,
        };

        match cond.level {
            ConditionLevel::Normal => match &cond.native_code {
                None => {
                    self.active.clear();
                    self.active.push(Arc::clone(obs));
                }
                Some(code) => {
                    self.retire(code);
                    if self.active.is_empty() {
                        self.active.push(Arc::clone(obs));
                    }
                }
            },
            ConditionLevel::Unavailable => {
                self.active.clear();
                self.active.push(Arc::clone(obs));
            }
            ConditionLevel::Warning | ConditionLevel::Fault => {
                if let Some(code) = &cond.native_code {
                    self.retire(code);
                }
                // A fresh activation displaces any lingering normal/unavailable marker.
                self.active.retain(|o| match &o.value {
                    ObservedValue::Condition(c) => {
                        !matches!(c.level, ConditionLevel::Normal | ConditionLevel::Unavailable)
                    }
                    _ => true,
                });
                self.active.insert(0, Arc::clone(obs));
            }
        }
    }

    fn retire(&mut self, code: &str) {
        self.active.retain(|o| match &o.value {
            ObservedValue::Condition(c) => c.native_code.as_deref() != Some(code),
            _ => true,
        });
    }

    /// Active entries, newest first. A lone NORMAL/UNAVAILABLE marker counts
    /// as the item's current state.
    pub fn active(&self) -> &[Arc<Observation>] {
        &self.active
    }

    /// True when no fault or warning is active
    pub fn is_clear(&self) -> bool {
        !self.active.iter().any(|o| {
            matches!(
                &o.value,
                ObservedValue::Condition(c)
                    if matches!(c.level, ConditionLevel::Warning | ConditionLevel::Fault)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Condition;
    use chrono::Utc;

    fn cond(level: ConditionLevel, code: Option<&str>) -> Arc<Observation> {
        Arc::new(Observation::new(
            "c1",
            Utc::now(),
            ObservedValue::Condition(Condition {
                level,
                native_code: code.map(str::to_string),
                native_severity: None,
                qualifier: None,
                message: None,
            }),
        ))
    }

    #[test]
    fn faults_accumulate_by_native_code() {
        let mut set = ConditionSet::new();
        set.apply(&cond(ConditionLevel::Fault, Some("A")));
        set.apply(&cond(ConditionLevel::Warning, Some("B")));
        assert_eq!(2, set.active().len());
        assert!(!set.is_clear());
    }

    #[test]
    fn normal_with_code_retires_one_entry() {
        let mut set = ConditionSet::new();
        set.apply(&cond(ConditionLevel::Fault, Some("A")));
        set.apply(&cond(ConditionLevel::Fault, Some("B")));
        set.apply(&cond(ConditionLevel::Normal, Some("A")));
        assert_eq!(1, set.active().len());
        assert!(!set.is_clear());
    }

    #[test]
    fn bare_normal_clears_everything() {
        let mut set = ConditionSet::new();
        set.apply(&cond(ConditionLevel::Fault, Some("A")));
        set.apply(&cond(ConditionLevel::Warning, Some("B")));
        set.apply(&cond(ConditionLevel::Normal, None));
        assert_eq!(1, set.active().len());
        assert!(set.is_clear());
    }

    #[test]
    fn refreshed_code_keeps_single_entry_newest_first() {
        let mut set = ConditionSet::new();
        set.apply(&cond(ConditionLevel::Warning, Some("A")));
        set.apply(&cond(ConditionLevel::Fault, Some("B")));
        set.apply(&cond(ConditionLevel::Fault, Some("A")));
        let levels: Vec<_> = set
            .active()
            .iter()
            .map(|o| match &o.value {
                ObservedValue::Condition(c) => (c.level, c.native_code.clone()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            vec![
                (ConditionLevel::Fault, Some("A".to_string())),
                (ConditionLevel::Fault, Some("B".to_string())),
            ],
            levels
        );
    }
}
