//! Mapping between domain stimulation fields and the device wire format.
//!
//! The two shape and polarity vocabularies are kept apart on purpose and
//! related only through the lookup tables below.

use neurorig_protocol::{PulseMode, StimWireMessage, WirePolarity, WireShape};

use crate::stim::{ChangeSet, StimField, StimParam, StimPolarity, StimShape};

const SHAPE_TABLE: [(StimShape, WireShape); 3] = [
    (StimShape::Biphasic, WireShape::Biphasic),
    (
        StimShape::BiphasicWithInterphaseDelay,
        WireShape::BiphasicWithInterphaseDelay,
    ),
    (StimShape::Triphasic, WireShape::Triphasic),
];

const POLARITY_TABLE: [(StimPolarity, WirePolarity); 2] = [
    (StimPolarity::NegativeFirst, WirePolarity::NegativeFirst),
    (StimPolarity::PositiveFirst, WirePolarity::PositiveFirst),
];

pub fn shape_to_wire(shape: StimShape) -> WireShape {
    SHAPE_TABLE
        .iter()
        .find(|(domain, _)| *domain == shape)
        .map(|(_, wire)| *wire)
        .unwrap_or(WireShape::Biphasic)
}

pub fn shape_from_wire(shape: WireShape) -> StimShape {
    SHAPE_TABLE
        .iter()
        .find(|(_, wire)| *wire == shape)
        .map(|(domain, _)| *domain)
        .unwrap_or(StimShape::Biphasic)
}

pub fn polarity_to_wire(polarity: StimPolarity) -> WirePolarity {
    POLARITY_TABLE
        .iter()
        .find(|(domain, _)| *domain == polarity)
        .map(|(_, wire)| *wire)
        .unwrap_or(WirePolarity::NegativeFirst)
}

pub fn polarity_from_wire(polarity: WirePolarity) -> StimPolarity {
    POLARITY_TABLE
        .iter()
        .find(|(_, wire)| *wire == polarity)
        .map(|(domain, _)| *domain)
        .unwrap_or(StimPolarity::NegativeFirst)
}

/// Wire field name(s) a domain field is written to.
pub fn wire_names(field: StimField) -> &'static [&'static str] {
    match field {
        StimField::Enable => &["stimenabled"],
        StimField::TriggerKey => &["source"],
        StimField::TriggerDelay => &["posttriggerdelaymicroseconds"],
        StimField::NbPulse => &["pulse", "numberofstimpulses"],
        StimField::PulseTrainPeriod => &["pulsetrainperiodmicroseconds"],
        StimField::PostStimRefPeriod => &["refractoryperiodmicroseconds"],
        StimField::StimShape => &["shape"],
        StimField::Polarity => &["polarity"],
        StimField::PhaseDuration1 => &["firstphasedurationmicroseconds"],
        StimField::PhaseDuration2 => &["secondphasedurationmicroseconds"],
        StimField::PhaseAmplitude1 => &["firstphaseamplitudemicroamps"],
        StimField::PhaseAmplitude2 => &["secondphaseamplitudemicroamps"],
        StimField::EnableAmpSettle => &["enableampsettle"],
        StimField::PreStimAmpSettle => &["prestimampsettlemicroseconds"],
        StimField::PostStimAmpSettle => &["poststimampsettlemicroseconds"],
        StimField::EnableChargeRecovery => &["enablechargerecovery"],
        StimField::PostChargeRecoveryOn => &["poststimchargerecovonmicroseconds"],
        StimField::PostChargeRecoveryOff => &["poststimchargerecovoffmicroseconds"],
        StimField::InterphaseDelay => &["interphasedelaymicroseconds"],
    }
}

/// Builds the wire message for `param` containing only the fields in `changes`.
pub fn encode(param: &StimParam, changes: &ChangeSet) -> StimWireMessage {
    let mut message = StimWireMessage::for_channel(u32::from(param.index));

    for field in changes.iter() {
        match field {
            StimField::Enable => message.stimenabled = Some(param.enable),
            StimField::TriggerKey => message.source = Some(param.trigger_key),
            StimField::TriggerDelay => {
                message.posttriggerdelaymicroseconds = Some(param.trigger_delay)
            }
            StimField::NbPulse => {
                if param.nb_pulse > 1 {
                    message.pulse = Some(PulseMode::PulseTrain);
                    message.numberofstimpulses = Some(param.nb_pulse);
                } else {
                    message.pulse = Some(PulseMode::SinglePulse);
                }
            }
            StimField::PulseTrainPeriod => {
                message.pulsetrainperiodmicroseconds = Some(param.pulse_train_period)
            }
            StimField::PostStimRefPeriod => {
                message.refractoryperiodmicroseconds = Some(param.post_stim_ref_period)
            }
            StimField::StimShape => message.shape = Some(shape_to_wire(param.stim_shape)),
            StimField::Polarity => message.polarity = Some(polarity_to_wire(param.polarity)),
            StimField::PhaseDuration1 => {
                message.firstphasedurationmicroseconds = Some(param.phase_duration1)
            }
            StimField::PhaseDuration2 => {
                message.secondphasedurationmicroseconds = Some(param.phase_duration2)
            }
            StimField::PhaseAmplitude1 => {
                message.firstphaseamplitudemicroamps = Some(param.phase_amplitude1)
            }
            StimField::PhaseAmplitude2 => {
                message.secondphaseamplitudemicroamps = Some(param.phase_amplitude2)
            }
            StimField::EnableAmpSettle => message.enableampsettle = Some(param.enable_amp_settle),
            StimField::PreStimAmpSettle => {
                message.prestimampsettlemicroseconds = Some(param.pre_stim_amp_settle)
            }
            StimField::PostStimAmpSettle => {
                message.poststimampsettlemicroseconds = Some(param.post_stim_amp_settle)
            }
            StimField::EnableChargeRecovery => {
                message.enablechargerecovery = Some(param.enable_charge_recovery)
            }
            StimField::PostChargeRecoveryOn => {
                message.poststimchargerecovonmicroseconds = Some(param.post_charge_recovery_on)
            }
            StimField::PostChargeRecoveryOff => {
                message.poststimchargerecovoffmicroseconds = Some(param.post_charge_recovery_off)
            }
            StimField::InterphaseDelay => {
                message.interphasedelaymicroseconds = Some(param.interphase_delay)
            }
        }
    }

    message
}
