//! Per-electrode stimulation parameters and their change tracking.
//!
//! Every write goes through [`StimParam::set`], which validates the value and
//! marks the field dirty. [`StimParam::take_changes`] hands the dirty set to the
//! caller and clears it in one step, so an exported field is not sent again
//! until it is edited again. A freshly built parameter starts fully dirty.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RigError};

pub const MAX_ELECTRODE: u8 = 127;

const MAX_TRIGGER_KEY: u32 = 15;
const MAX_TRIGGER_DELAY_US: u32 = 500_000;
const MAX_NB_PULSE: u32 = 256;
const MAX_PULSE_TRAIN_PERIOD_US: u32 = 1_000_000;
const MAX_REFRACTORY_US: f64 = 1_000_000.0;
const MAX_PHASE_DURATION_US: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StimShape {
    Biphasic,
    BiphasicWithInterphaseDelay,
    Triphasic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StimPolarity {
    NegativeFirst,
    PositiveFirst,
}

impl StimShape {
    pub fn name(self) -> &'static str {
        match self {
            StimShape::Biphasic => "Biphasic",
            StimShape::BiphasicWithInterphaseDelay => "BiphasicWithInterphaseDelay",
            StimShape::Triphasic => "Triphasic",
        }
    }
}

impl StimPolarity {
    pub fn name(self) -> &'static str {
        match self {
            StimPolarity::NegativeFirst => "NegativeFirst",
            StimPolarity::PositiveFirst => "PositiveFirst",
        }
    }
}

impl FromStr for StimShape {
    type Err = RigError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Biphasic" | "biphasic" => Ok(StimShape::Biphasic),
            "BiphasicWithInterphaseDelay" | "biphasic_with_interphase_delay" => {
                Ok(StimShape::BiphasicWithInterphaseDelay)
            }
            "Triphasic" | "triphasic" => Ok(StimShape::Triphasic),
            other => Err(RigError::validation(
                "stim_shape",
                format!("unknown shape '{}'", other),
            )),
        }
    }
}

impl FromStr for StimPolarity {
    type Err = RigError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "NegativeFirst" | "negative_first" => Ok(StimPolarity::NegativeFirst),
            "PositiveFirst" | "positive_first" => Ok(StimPolarity::PositiveFirst),
            other => Err(RigError::validation(
                "polarity",
                format!("unknown polarity '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fields
// ═══════════════════════════════════════════════════════════════════════════════

/// Editable stimulation fields. The electrode index is the record key and is
/// not a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimField {
    Enable,
    TriggerKey,
    TriggerDelay,
    NbPulse,
    PulseTrainPeriod,
    PostStimRefPeriod,
    StimShape,
    Polarity,
    PhaseDuration1,
    PhaseDuration2,
    PhaseAmplitude1,
    PhaseAmplitude2,
    EnableAmpSettle,
    PreStimAmpSettle,
    PostStimAmpSettle,
    EnableChargeRecovery,
    PostChargeRecoveryOn,
    PostChargeRecoveryOff,
    InterphaseDelay,
}

impl StimField {
    pub const ALL: [StimField; 19] = [
        StimField::Enable,
        StimField::TriggerKey,
        StimField::TriggerDelay,
        StimField::NbPulse,
        StimField::PulseTrainPeriod,
        StimField::PostStimRefPeriod,
        StimField::StimShape,
        StimField::Polarity,
        StimField::PhaseDuration1,
        StimField::PhaseDuration2,
        StimField::PhaseAmplitude1,
        StimField::PhaseAmplitude2,
        StimField::EnableAmpSettle,
        StimField::PreStimAmpSettle,
        StimField::PostStimAmpSettle,
        StimField::EnableChargeRecovery,
        StimField::PostChargeRecoveryOn,
        StimField::PostChargeRecoveryOff,
        StimField::InterphaseDelay,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StimField::Enable => "enable",
            StimField::TriggerKey => "trigger_key",
            StimField::TriggerDelay => "trigger_delay",
            StimField::NbPulse => "nb_pulse",
            StimField::PulseTrainPeriod => "pulse_train_period",
            StimField::PostStimRefPeriod => "post_stim_ref_period",
            StimField::StimShape => "stim_shape",
            StimField::Polarity => "polarity",
            StimField::PhaseDuration1 => "phase_duration1",
            StimField::PhaseDuration2 => "phase_duration2",
            StimField::PhaseAmplitude1 => "phase_amplitude1",
            StimField::PhaseAmplitude2 => "phase_amplitude2",
            StimField::EnableAmpSettle => "enable_amp_settle",
            StimField::PreStimAmpSettle => "pre_stim_amp_settle",
            StimField::PostStimAmpSettle => "post_stim_amp_settle",
            StimField::EnableChargeRecovery => "enable_charge_recovery",
            StimField::PostChargeRecoveryOn => "post_charge_recovery_on",
            StimField::PostChargeRecoveryOff => "post_charge_recovery_off",
            StimField::InterphaseDelay => "interphase_delay",
        }
    }
}

impl fmt::Display for StimField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StimField {
    type Err = RigError;

    fn from_str(value: &str) -> Result<Self> {
        StimField::ALL
            .into_iter()
            .find(|field| field.name() == value)
            .ok_or_else(|| {
                RigError::validation("field", format!("unknown stimulation field '{}'", value))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(u32),
    Float(f64),
    Shape(StimShape),
    Polarity(StimPolarity),
}

impl FieldValue {
    /// Parses operator input for `field` (e.g. `nb_pulse=3`, `polarity=PositiveFirst`).
    pub fn parse(field: StimField, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = |reason: &str| RigError::validation(field.name(), reason.to_string());
        match field {
            StimField::Enable | StimField::EnableAmpSettle | StimField::EnableChargeRecovery => {
                match raw {
                    "1" | "true" | "on" => Ok(FieldValue::Bool(true)),
                    "0" | "false" | "off" => Ok(FieldValue::Bool(false)),
                    _ => Err(invalid("expected true/false")),
                }
            }
            StimField::TriggerKey
            | StimField::TriggerDelay
            | StimField::NbPulse
            | StimField::PulseTrainPeriod => raw
                .parse::<u32>()
                .map(FieldValue::Int)
                .map_err(|_| invalid("expected a non-negative integer")),
            StimField::StimShape => raw.parse().map(FieldValue::Shape),
            StimField::Polarity => raw.parse().map(FieldValue::Polarity),
            _ => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|_| invalid("expected a number")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change set
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeSet<StimField>);

impl ChangeSet {
    pub fn all() -> Self {
        Self(StimField::ALL.into_iter().collect())
    }

    pub fn contains(&self, field: StimField) -> bool {
        self.0.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = StimField> + '_ {
        self.0.iter().copied()
    }

    fn insert(&mut self, field: StimField) {
        self.0.insert(field);
    }

    fn extend(&mut self, other: ChangeSet) {
        self.0.extend(other.0);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StimParam
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct StimParam {
    pub(crate) index: u8,
    pub(crate) enable: bool,
    pub(crate) trigger_key: u32,
    pub(crate) trigger_delay: u32,
    pub(crate) nb_pulse: u32,
    pub(crate) pulse_train_period: u32,
    pub(crate) post_stim_ref_period: f64,
    pub(crate) stim_shape: StimShape,
    pub(crate) polarity: StimPolarity,
    pub(crate) phase_duration1: f64,
    pub(crate) phase_duration2: f64,
    pub(crate) phase_amplitude1: f64,
    pub(crate) phase_amplitude2: f64,
    pub(crate) enable_amp_settle: bool,
    pub(crate) pre_stim_amp_settle: f64,
    pub(crate) post_stim_amp_settle: f64,
    pub(crate) enable_charge_recovery: bool,
    pub(crate) post_charge_recovery_on: f64,
    pub(crate) post_charge_recovery_off: f64,
    pub(crate) interphase_delay: f64,
    changes: ChangeSet,
}

impl StimParam {
    /// Default parameter for `index`, with every field pending export.
    pub fn new(index: u8) -> Result<Self> {
        check_electrode(index)?;
        Ok(Self {
            index,
            enable: true,
            trigger_key: 0,
            trigger_delay: 0,
            nb_pulse: 0,
            pulse_train_period: 10_000,
            post_stim_ref_period: 1_000.0,
            stim_shape: StimShape::Biphasic,
            polarity: StimPolarity::NegativeFirst,
            phase_duration1: 100.0,
            phase_duration2: 100.0,
            phase_amplitude1: 1.0,
            phase_amplitude2: 1.0,
            enable_amp_settle: true,
            pre_stim_amp_settle: 0.0,
            post_stim_amp_settle: 1_000.0,
            enable_charge_recovery: true,
            post_charge_recovery_on: 0.0,
            post_charge_recovery_off: 100.0,
            interphase_delay: 0.0,
            changes: ChangeSet::all(),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Returns the pending change set and leaves it empty.
    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    /// Puts fields back into the pending set, e.g. after a failed push.
    pub fn mark_dirty(&mut self, fields: ChangeSet) {
        self.changes.extend(fields);
    }

    pub fn get(&self, field: StimField) -> FieldValue {
        match field {
            StimField::Enable => FieldValue::Bool(self.enable),
            StimField::TriggerKey => FieldValue::Int(self.trigger_key),
            StimField::TriggerDelay => FieldValue::Int(self.trigger_delay),
            StimField::NbPulse => FieldValue::Int(self.nb_pulse),
            StimField::PulseTrainPeriod => FieldValue::Int(self.pulse_train_period),
            StimField::PostStimRefPeriod => FieldValue::Float(self.post_stim_ref_period),
            StimField::StimShape => FieldValue::Shape(self.stim_shape),
            StimField::Polarity => FieldValue::Polarity(self.polarity),
            StimField::PhaseDuration1 => FieldValue::Float(self.phase_duration1),
            StimField::PhaseDuration2 => FieldValue::Float(self.phase_duration2),
            StimField::PhaseAmplitude1 => FieldValue::Float(self.phase_amplitude1),
            StimField::PhaseAmplitude2 => FieldValue::Float(self.phase_amplitude2),
            StimField::EnableAmpSettle => FieldValue::Bool(self.enable_amp_settle),
            StimField::PreStimAmpSettle => FieldValue::Float(self.pre_stim_amp_settle),
            StimField::PostStimAmpSettle => FieldValue::Float(self.post_stim_amp_settle),
            StimField::EnableChargeRecovery => FieldValue::Bool(self.enable_charge_recovery),
            StimField::PostChargeRecoveryOn => FieldValue::Float(self.post_charge_recovery_on),
            StimField::PostChargeRecoveryOff => FieldValue::Float(self.post_charge_recovery_off),
            StimField::InterphaseDelay => FieldValue::Float(self.interphase_delay),
        }
    }

    /// Snapshot of every value plus the fields still waiting to be pushed.
    pub fn to_staged(&self) -> StagedStim {
        StagedStim {
            electrode: self.index,
            values: StimField::ALL
                .into_iter()
                .map(|field| (field, self.get(field)))
                .collect(),
            pending: self.changes.0.clone(),
        }
    }

    /// Rebuilds a parameter from a snapshot. Values are validated again; fields
    /// missing from the snapshot keep their defaults.
    pub fn from_staged(staged: &StagedStim) -> Result<Self> {
        let mut param = Self::new(staged.electrode)?;
        for (field, value) in &staged.values {
            param.set(*field, *value)?;
        }
        param.changes = ChangeSet(staged.pending.clone());
        Ok(param)
    }

    /// Validates and stores `value`, marking `field` dirty. On error nothing changes.
    pub fn set(&mut self, field: StimField, value: FieldValue) -> Result<()> {
        match field {
            StimField::Enable => self.enable = expect_bool(field, value)?,
            StimField::EnableAmpSettle => self.enable_amp_settle = expect_bool(field, value)?,
            StimField::EnableChargeRecovery => {
                self.enable_charge_recovery = expect_bool(field, value)?
            }
            StimField::TriggerKey => self.trigger_key = expect_int(field, value, MAX_TRIGGER_KEY)?,
            StimField::TriggerDelay => {
                self.trigger_delay = expect_int(field, value, MAX_TRIGGER_DELAY_US)?
            }
            StimField::NbPulse => self.nb_pulse = expect_int(field, value, MAX_NB_PULSE)?,
            StimField::PulseTrainPeriod => {
                self.pulse_train_period = expect_int(field, value, MAX_PULSE_TRAIN_PERIOD_US)?
            }
            StimField::PostStimRefPeriod => {
                self.post_stim_ref_period = expect_float(field, value, Some(MAX_REFRACTORY_US))?
            }
            StimField::PhaseDuration1 => {
                self.phase_duration1 = expect_float(field, value, Some(MAX_PHASE_DURATION_US))?
            }
            StimField::PhaseDuration2 => {
                self.phase_duration2 = expect_float(field, value, Some(MAX_PHASE_DURATION_US))?
            }
            StimField::PhaseAmplitude1 => self.phase_amplitude1 = expect_float(field, value, None)?,
            StimField::PhaseAmplitude2 => self.phase_amplitude2 = expect_float(field, value, None)?,
            StimField::PreStimAmpSettle => {
                self.pre_stim_amp_settle = expect_float(field, value, None)?
            }
            StimField::PostStimAmpSettle => {
                self.post_stim_amp_settle = expect_float(field, value, None)?
            }
            StimField::PostChargeRecoveryOn => {
                self.post_charge_recovery_on = expect_float(field, value, None)?
            }
            StimField::PostChargeRecoveryOff => {
                self.post_charge_recovery_off = expect_float(field, value, None)?
            }
            StimField::InterphaseDelay => self.interphase_delay = expect_float(field, value, None)?,
            StimField::StimShape => match value {
                FieldValue::Shape(shape) => self.stim_shape = shape,
                other => return Err(type_mismatch(field, other)),
            },
            StimField::Polarity => match value {
                FieldValue::Polarity(polarity) => self.polarity = polarity,
                other => return Err(type_mismatch(field, other)),
            },
        }
        self.changes.insert(field);
        Ok(())
    }
}

/// Staged state of one electrode, persisted between operator invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedStim {
    pub electrode: u8,
    pub values: BTreeMap<StimField, FieldValue>,
    pub pending: BTreeSet<StimField>,
}

pub fn check_electrode(index: u8) -> Result<()> {
    if index > MAX_ELECTRODE {
        return Err(RigError::validation(
            "electrode",
            format!("{} is outside 0..={}", index, MAX_ELECTRODE),
        ));
    }
    Ok(())
}

fn expect_bool(field: StimField, value: FieldValue) -> Result<bool> {
    match value {
        FieldValue::Bool(flag) => Ok(flag),
        other => Err(type_mismatch(field, other)),
    }
}

fn expect_int(field: StimField, value: FieldValue, max: u32) -> Result<u32> {
    match value {
        FieldValue::Int(number) if number <= max => Ok(number),
        FieldValue::Int(number) => Err(RigError::validation(
            field.name(),
            format!("{} is outside 0..={}", number, max),
        )),
        other => Err(type_mismatch(field, other)),
    }
}

fn expect_float(field: StimField, value: FieldValue, max: Option<f64>) -> Result<f64> {
    let number = match value {
        FieldValue::Float(number) => number,
        FieldValue::Int(number) => f64::from(number),
        other => return Err(type_mismatch(field, other)),
    };
    if !number.is_finite() || number < 0.0 {
        return Err(RigError::validation(
            field.name(),
            format!("{} must be a finite value >= 0", number),
        ));
    }
    if let Some(max) = max {
        if number > max {
            return Err(RigError::validation(
                field.name(),
                format!("{} exceeds {}", number, max),
            ));
        }
    }
    Ok(number)
}

fn type_mismatch(field: StimField, value: FieldValue) -> RigError {
    RigError::validation(field.name(), format!("unexpected value {:?}", value))
}
