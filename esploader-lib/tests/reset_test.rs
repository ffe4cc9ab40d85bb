mod common;

use common::{FakeEsp, Signal};
use esploader_lib::reset::{
    self, DEFAULT_RESET_SEQUENCE, ESP32R0_RESET_SEQUENCE, ResetSequencer, ResetStep,
    parse_reset_sequence, validate_custom_reset_sequence,
};
use esploader_lib::Error;

#[test]
fn test_parse_default_sequence() {
    let steps = parse_reset_sequence(DEFAULT_RESET_SEQUENCE).unwrap();
    assert_eq!(
        steps,
        vec![
            ResetStep::Dtr(false),
            ResetStep::Rts(true),
            ResetStep::Wait(100),
            ResetStep::Dtr(true),
            ResetStep::Rts(false),
            ResetStep::Wait(50),
            ResetStep::Dtr(false),
        ]
    );
    assert_eq!(reset::default_reset_sequence(50), DEFAULT_RESET_SEQUENCE);
    assert_eq!(reset::esp32r0_reset_sequence(50), ESP32R0_RESET_SEQUENCE);
}

#[test]
fn test_invalid_sequences() {
    for sequence in ["D2", "R", "W-5", "Xo", "W0", "D1|", "", "W1x", "d1"] {
        assert!(
            !validate_custom_reset_sequence(sequence),
            "{} should be rejected",
            sequence
        );
    }
    assert!(validate_custom_reset_sequence("D0|R1|W1|R0"));
}

#[test]
fn test_custom_reset_drives_lines_in_order() {
    let mut link = FakeEsp::esp32();
    ResetSequencer::custom_reset(&mut link, "D1|R0|W1|R1|D0").unwrap();
    assert_eq!(
        link.signals,
        vec![
            Signal::Dtr(true),
            Signal::Rts(false),
            Signal::Rts(true),
            Signal::Dtr(false),
        ]
    );
}

#[test]
fn test_invalid_custom_reset_touches_nothing() {
    let mut link = FakeEsp::esp32();
    let err = ResetSequencer::custom_reset(&mut link, "D0|R1|W-5").unwrap_err();
    assert!(matches!(err, Error::InvalidResetSequence(_)));
    assert!(link.signals.is_empty());
}

#[test]
fn test_classic_reset() {
    let mut link = FakeEsp::esp32();
    ResetSequencer::classic_reset(&mut link, 1).unwrap();
    assert_eq!(
        link.signals,
        vec![
            Signal::Dtr(false),
            Signal::Rts(true),
            Signal::Dtr(true),
            Signal::Rts(false),
            Signal::Dtr(false),
        ]
    );
}

#[test]
fn test_hard_reset_releases_rts() {
    let mut link = FakeEsp::esp32();
    ResetSequencer::hard_reset(&mut link, false).unwrap();
    assert_eq!(link.signals, vec![Signal::Rts(false)]);
}
