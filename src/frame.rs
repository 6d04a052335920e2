//! Frame encoding for the StringArt rig.
//!
//! The panel holds four motor slots, each with three text fields: revolutions
//! (or absolute steps), speed (rpm) and direction (`0`/`1`). Every field may
//! carry a `/`-separated sequence, one value per step of the motor's program.
//!
//! # Wire format
//!
//! ```text
//! M1;M2;M3;M4\n        Mi    = step|step|...
//!                      step  = magnitude,rate,direction
//! START\n              control frames, no motor payload
//! PAUSE\n
//! ```
//!
//! Values are unsigned decimal integers. Anything else (signs, decimal
//! points, the `;` `|` `,` delimiters, line breaks) is rejected, so a value
//! can never shift the motor segments. The firmware is the authority on
//! ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RigError};

/// Number of motor slots on the rig.
pub const MOTOR_COUNT: usize = 4;

/// Placeholder value used for empty fields and empty motor slots.
const ZERO: &str = "0";

/// Length of command excerpts shown in status messages.
const SUMMARY_LEN: usize = 20;

// ============================================================================
// Panel input
// ============================================================================

/// Raw text of one motor slot, exactly as entered in the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorFields {
    /// Revolutions (or absolute steps), e.g. `100/40/30`.
    pub magnitude: String,
    /// Speed in rpm, e.g. `20/25/40`.
    pub rate: String,
    /// Direction bits, e.g. `1/1/0`.
    pub direction: String,
}

impl MotorFields {
    pub fn new(
        magnitude: impl Into<String>,
        rate: impl Into<String>,
        direction: impl Into<String>,
    ) -> Self {
        Self {
            magnitude: magnitude.into(),
            rate: rate.into(),
            direction: direction.into(),
        }
    }

    /// True when all three fields are blank.
    pub fn is_empty(&self) -> bool {
        self.magnitude.trim().is_empty()
            && self.rate.trim().is_empty()
            && self.direction.trim().is_empty()
    }
}

/// The four motor slots of the control panel.
///
/// This is the only UI state the encoder reads. It is rebuilt or edited
/// before each Send and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorPanel {
    motors: [MotorFields; MOTOR_COUNT],
}

impl MotorPanel {
    pub fn new(motors: [MotorFields; MOTOR_COUNT]) -> Self {
        Self { motors }
    }

    /// Replace the fields of motor `motor` (1-based, as labelled M1..M4).
    pub fn set(&mut self, motor: usize, fields: MotorFields) -> anyhow::Result<()> {
        let slot = Self::slot_index(motor)?;
        self.motors[slot] = fields;
        Ok(())
    }

    /// Fields of motor `motor` (1-based).
    pub fn get(&self, motor: usize) -> anyhow::Result<&MotorFields> {
        let slot = Self::slot_index(motor)?;
        Ok(&self.motors[slot])
    }

    /// Blank all twelve fields (the panel's Clear action).
    pub fn clear(&mut self) {
        self.motors = Default::default();
    }

    pub fn motors(&self) -> &[MotorFields; MOTOR_COUNT] {
        &self.motors
    }

    /// Encode the current panel contents into a data frame.
    pub fn encode(&self, policy: MismatchPolicy) -> Result<Frame> {
        encode(&self.motors, policy)
    }

    fn slot_index(motor: usize) -> anyhow::Result<usize> {
        match motor {
            1..=MOTOR_COUNT => Ok(motor - 1),
            _ => anyhow::bail!("Invalid motor {motor}. Supported: 1-{MOTOR_COUNT}."),
        }
    }
}

// ============================================================================
// Motor programs
// ============================================================================

/// One step of a motor program. Values are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub magnitude: String,
    pub rate: String,
    pub direction: String,
}

impl Step {
    pub fn new(
        magnitude: impl Into<String>,
        rate: impl Into<String>,
        direction: impl Into<String>,
    ) -> Self {
        Self {
            magnitude: magnitude.into(),
            rate: rate.into(),
            direction: direction.into(),
        }
    }

    /// The `0,0,0` step sent for an empty motor slot.
    pub fn zero() -> Self {
        Self::new(ZERO, ZERO, ZERO)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.magnitude, self.rate, self.direction)
    }
}

/// The ordered step sequence of one motor slot. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorSpec {
    pub steps: Vec<Step>,
}

impl MotorSpec {
    /// Program of an empty slot: a single `0,0,0` step.
    pub fn placeholder() -> Self {
        Self {
            steps: vec![Step::zero()],
        }
    }

    /// Build the program of slot `motor` (1-based, used in error messages).
    pub fn from_fields(
        motor: usize,
        fields: &MotorFields,
        policy: MismatchPolicy,
    ) -> Result<Self> {
        if fields.is_empty() {
            return Ok(Self::placeholder());
        }

        let mut magnitudes = split_field(motor, &fields.magnitude)?;
        let mut rates = split_field(motor, &fields.rate)?;
        let mut directions = split_field(motor, &fields.direction)?;

        let len = magnitudes.len().max(rates.len()).max(directions.len());
        let uniform = magnitudes.len() == len && rates.len() == len && directions.len() == len;
        if !uniform {
            match policy {
                MismatchPolicy::Reject => {
                    return Err(RigError::Validation {
                        motor,
                        reason: "mismatched step counts".into(),
                    })
                }
                MismatchPolicy::PadWithFirst => {
                    for values in [&mut magnitudes, &mut rates, &mut directions] {
                        let first = values[0].clone();
                        values.resize(len, first);
                    }
                }
            }
        }

        let steps = magnitudes
            .into_iter()
            .zip(rates)
            .zip(directions)
            .map(|((magnitude, rate), direction)| Step {
                magnitude,
                rate,
                direction,
            })
            .collect();
        Ok(Self { steps })
    }
}

impl fmt::Display for MotorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

/// What to do when the three fields of a slot hold different step counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MismatchPolicy {
    /// Refuse to build the frame. Nothing is sent.
    #[default]
    Reject,
    /// Pad the shorter lists by repeating their first value.
    PadWithFirst,
}

/// Split one text field of slot `motor` into per-step values.
///
/// A blank field counts as a single `0`; blank entries inside a sequence
/// (`10//20`) also become `0`. Surrounding whitespace is trimmed, every other
/// non-digit is an error.
fn split_field(motor: usize, text: &str) -> Result<Vec<String>> {
    let text = text.trim();
    let text = if text.is_empty() { ZERO } else { text };
    text.split('/')
        .map(|value| {
            let value = value.trim();
            if value.is_empty() {
                return Ok(ZERO.to_string());
            }
            if !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(RigError::Validation {
                    motor,
                    reason: format!("{value:?} is not a whole number"),
                });
            }
            Ok(value.to_string())
        })
        .collect()
}

// ============================================================================
// Frames
// ============================================================================

/// What a frame asks the rig to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Load new motor programs.
    Data,
    /// Run the loaded programs.
    Start,
    /// Pause the running programs.
    Pause,
}

impl FrameKind {
    /// Acknowledgement the firmware sends back for this kind of frame.
    pub fn ack_token(self) -> &'static str {
        match self {
            FrameKind::Data => "ACK:DATA",
            FrameKind::Start => "ACK:START",
            FrameKind::Pause => "ACK:PAUSE",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameKind::Data => "data",
            FrameKind::Start => "start",
            FrameKind::Pause => "pause",
        }
    }
}

/// One newline-terminated command, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: String,
    kind: FrameKind,
}

impl Frame {
    fn new(body: &str, kind: FrameKind) -> Self {
        let mut payload = String::with_capacity(body.len() + 1);
        payload.push_str(body);
        payload.push('\n');
        Self { payload, kind }
    }

    /// Data frame built from four motor programs.
    pub fn data(specs: &[MotorSpec; MOTOR_COUNT]) -> Self {
        let body = specs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";");
        Self::new(&body, FrameKind::Data)
    }

    pub fn start() -> Self {
        Self::new("START", FrameKind::Start)
    }

    pub fn pause() -> Self {
        Self::new("PAUSE", FrameKind::Pause)
    }

    /// Full payload including the trailing newline.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Payload without the terminator, shortened for status messages.
    pub fn summary(&self) -> String {
        let body = self.payload.trim_end_matches('\n');
        if body.chars().count() > SUMMARY_LEN {
            let head: String = body.chars().take(SUMMARY_LEN).collect();
            format!("{head}...")
        } else {
            body.to_string()
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload.trim_end_matches('\n'))
    }
}

/// Encode four motor slots into a data frame.
///
/// Fails with [`RigError::Validation`] (1-based motor number) before anything
/// is built when a value is not a whole number, or when a slot's step counts
/// disagree under [`MismatchPolicy::Reject`].
pub fn encode(motors: &[MotorFields; MOTOR_COUNT], policy: MismatchPolicy) -> Result<Frame> {
    let specs = encode_motors(motors, policy)?;
    Ok(Frame::data(&specs))
}

/// Parse four motor slots into their step programs.
pub fn encode_motors(
    motors: &[MotorFields; MOTOR_COUNT],
    policy: MismatchPolicy,
) -> Result<[MotorSpec; MOTOR_COUNT]> {
    let [m1, m2, m3, m4] = motors;
    Ok([
        MotorSpec::from_fields(1, m1, policy)?,
        MotorSpec::from_fields(2, m2, policy)?,
        MotorSpec::from_fields(3, m3, policy)?,
        MotorSpec::from_fields(4, m4, policy)?,
    ])
}

/// Parse a data payload the way the firmware does: motors on `;`, steps on
/// `|`, values on `,`.
pub fn decode_payload(payload: &str) -> anyhow::Result<[MotorSpec; MOTOR_COUNT]> {
    let body = payload.strip_suffix('\n').unwrap_or(payload);
    let segments: Vec<&str> = body.split(';').collect();
    if segments.len() != MOTOR_COUNT {
        anyhow::bail!(
            "Expected {MOTOR_COUNT} motor segments, found {}",
            segments.len()
        );
    }

    let mut specs = Vec::with_capacity(MOTOR_COUNT);
    for (i, segment) in segments.iter().enumerate() {
        let mut steps = Vec::new();
        for step in segment.split('|') {
            let values: Vec<&str> = step.split(',').collect();
            let [magnitude, rate, direction] = values.as_slice() else {
                anyhow::bail!("Motor {}: malformed step {step:?}", i + 1);
            };
            steps.push(Step::new(*magnitude, *rate, *direction));
        }
        specs.push(MotorSpec { steps });
    }

    specs
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected {MOTOR_COUNT} motor segments"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(m: &str, r: &str, d: &str) -> MotorFields {
        MotorFields::new(m, r, d)
    }

    fn single(fields: MotorFields) -> [MotorFields; MOTOR_COUNT] {
        [
            fields,
            MotorFields::default(),
            MotorFields::default(),
            MotorFields::default(),
        ]
    }

    #[test]
    fn single_motor_with_empty_slots() {
        let frame = encode(&single(slot("100", "60", "1")), MismatchPolicy::Reject).unwrap();
        assert_eq!(frame.payload(), "100,60,1;0,0,0;0,0,0;0,0,0\n");
        assert_eq!(frame.kind(), FrameKind::Data);
    }

    #[test]
    fn multi_step_sequences_join_with_pipes() {
        let motors = [
            slot("100/40/30", "20/25/40", "1/1/0"),
            slot("5", "10", "0"),
            MotorFields::default(),
            slot("1/2", "3/4", "0/1"),
        ];
        let frame = encode(&motors, MismatchPolicy::Reject).unwrap();
        assert_eq!(
            frame.payload(),
            "100,20,1|40,25,1|30,40,0;5,10,0;0,0,0;1,3,0|2,4,1\n"
        );
    }

    #[test]
    fn empty_field_defaults_to_zero() {
        let frame = encode(&single(slot("250", "", "")), MismatchPolicy::Reject).unwrap();
        assert_eq!(frame.payload(), "250,0,0;0,0,0;0,0,0;0,0,0\n");
    }

    #[test]
    fn values_are_trimmed_and_blank_entries_become_zero() {
        let frame = encode(
            &single(slot(" 10 / /30 ", "1/2/3", "1/0/1")),
            MismatchPolicy::Reject,
        )
        .unwrap();
        assert_eq!(frame.payload(), "10,1,1|0,2,0|30,3,1;0,0,0;0,0,0;0,0,0\n");
    }

    #[test]
    fn numeric_text_is_not_reformatted() {
        let frame = encode(&single(slot("0150", "007", "1")), MismatchPolicy::Reject).unwrap();
        assert!(frame.payload().starts_with("0150,007,1;"));
    }

    #[test]
    fn delimiters_in_values_are_rejected() {
        for (motor, fields) in [
            (1, slot("1;2", "3", "1")),
            (1, slot("5", "6,7", "0")),
            (1, slot("5", "6", "0|1")),
            (1, slot("1.5", "3", "1")),
            (1, slot("-5", "3", "1")),
        ] {
            let err = encode(&single(fields), MismatchPolicy::PadWithFirst).unwrap_err();
            assert!(
                matches!(err, RigError::Validation { motor: m, .. } if m == motor),
                "{err}"
            );
        }

        let motors = [
            MotorFields::default(),
            MotorFields::default(),
            MotorFields::default(),
            slot("10", "20;0,0,0", "1"),
        ];
        let err = encode(&motors, MismatchPolicy::Reject).unwrap_err();
        assert_eq!(err.to_string(), "motor 4: \"20;0,0,0\" is not a whole number");
    }

    #[test]
    fn accepted_panels_decode_back_to_four_motors() {
        let motors = [
            slot(" 1 / 2 ", "3/4", "1/0"),
            slot("5", " 6 ", "0"),
            MotorFields::default(),
            slot("", "8", ""),
        ];
        let specs = encode_motors(&motors, MismatchPolicy::Reject).unwrap();
        let frame = Frame::data(&specs);
        assert_eq!(frame.payload(), "1,3,1|2,4,0;5,6,0;0,0,0;0,8,0\n");
        assert_eq!(decode_payload(frame.payload()).unwrap(), specs);
    }

    #[test]
    fn mismatched_step_counts_are_rejected() {
        let motors = [
            MotorFields::default(),
            slot("10/20", "5", "1"),
            MotorFields::default(),
            MotorFields::default(),
        ];
        let err = encode(&motors, MismatchPolicy::Reject).unwrap_err();
        assert!(matches!(err, RigError::Validation { motor: 2, .. }));
        assert_eq!(err.to_string(), "motor 2: mismatched step counts");
    }

    #[test]
    fn pad_policy_repeats_first_value() {
        let frame = encode(
            &single(slot("10/20/30", "5", "1/0")),
            MismatchPolicy::PadWithFirst,
        )
        .unwrap();
        assert_eq!(frame.payload(), "10,5,1|20,5,0|30,5,1;0,0,0;0,0,0;0,0,0\n");
    }

    #[test]
    fn line_breaks_never_reach_the_payload() {
        let err = encode(&single(slot("1\r\n2", "3", "1")), MismatchPolicy::Reject).unwrap_err();
        assert!(matches!(err, RigError::Validation { motor: 1, .. }));

        // Trailing line breaks are plain whitespace and get trimmed.
        let frame = encode(&single(slot("12\r\n", "3", "1")), MismatchPolicy::Reject).unwrap();
        assert_eq!(frame.payload(), "12,3,1;0,0,0;0,0,0;0,0,0\n");
    }

    #[test]
    fn control_frames_are_fixed_literals() {
        assert_eq!(Frame::start().payload(), "START\n");
        assert_eq!(Frame::pause().payload(), "PAUSE\n");
        assert_eq!(Frame::start().kind(), FrameKind::Start);
        assert_eq!(Frame::pause().kind(), FrameKind::Pause);
    }

    #[test]
    fn decoding_reproduces_defaulted_values() {
        let motors = [
            slot("100/40", "20/", "1/0"),
            slot("", "15", ""),
            MotorFields::default(),
            slot("3", "4", "1"),
        ];
        let specs = encode_motors(&motors, MismatchPolicy::Reject).unwrap();
        let frame = Frame::data(&specs);
        let decoded = decode_payload(frame.payload()).unwrap();
        assert_eq!(decoded, specs);
        assert_eq!(decoded[0].steps[1], Step::new("40", "0", "0"));
        assert_eq!(decoded[1].steps, vec![Step::new("0", "15", "0")]);
        assert_eq!(decoded[2], MotorSpec::placeholder());
    }

    #[test]
    fn decode_rejects_wrong_segment_count() {
        assert!(decode_payload("1,2,3;0,0,0\n").is_err());
        assert!(decode_payload("1,2;0,0,0;0,0,0;0,0,0\n").is_err());
    }

    #[test]
    fn summary_shortens_long_commands() {
        let frame = encode(
            &single(slot("100/40/30", "20/25/40", "1/1/0")),
            MismatchPolicy::Reject,
        )
        .unwrap();
        assert_eq!(frame.summary(), "100,20,1|40,25,1|30,...");
        assert_eq!(Frame::start().summary(), "START");
    }

    #[test]
    fn panel_set_get_and_clear() {
        let mut panel = MotorPanel::default();
        panel.set(3, slot("7", "8", "1")).unwrap();
        assert_eq!(panel.get(3).unwrap(), &slot("7", "8", "1"));
        assert!(panel.set(0, MotorFields::default()).is_err());
        assert!(panel.get(5).is_err());
        assert_eq!(
            panel.encode(MismatchPolicy::Reject).unwrap().payload(),
            "0,0,0;0,0,0;7,8,1;0,0,0\n"
        );

        panel.clear();
        assert!(panel.motors().iter().all(MotorFields::is_empty));
    }
}
