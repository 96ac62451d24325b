use dispatch_error::ValidationError;
use sms_dispatch::{CarrierClassifier, MessageType, Operator, QueueMessage};

#[test]
fn test_prefix_routing() {
    let classifier = CarrierClassifier::new();

    assert_eq!(classifier.classify("01812345678"), Ok(Operator::Robi));
    assert_eq!(classifier.classify("01712345678"), Ok(Operator::Gp));
    assert_eq!(classifier.classify("01612345678"), Ok(Operator::Airtel));
}

#[test]
fn test_unknown_prefix() {
    let classifier = CarrierClassifier::new();
    assert_eq!(
        classifier.classify("01912345678"),
        Err(ValidationError::UnknownPrefix("019".to_string()))
    );
}

#[test]
fn test_invalid_numbers() {
    let classifier = CarrierClassifier::new();

    for msisdn in ["", "0181234567", "018123456789", "0181234567a", "+8801812345"] {
        assert_eq!(
            classifier.classify(msisdn),
            Err(ValidationError::InvalidMsisdn),
            "{:?} should be rejected",
            msisdn
        );
    }
}

#[test]
fn test_resolve_prefers_explicit_operator() {
    let classifier = CarrierClassifier::new();

    // Explicit operator wins even when the prefix says otherwise
    let msg = QueueMessage::new("01712345678", "hi", Operator::Airtel, MessageType::Otp);
    assert_eq!(classifier.resolve(&msg), Ok(Operator::Airtel));

    let mut unrouted = msg.clone();
    unrouted.mno = String::new();
    assert_eq!(classifier.resolve(&unrouted), Ok(Operator::Gp));

    let mut bogus = msg;
    bogus.mno = "Teletalk".to_string();
    assert!(matches!(
        classifier.resolve(&bogus),
        Err(ValidationError::UnknownOperator(_))
    ));
}

#[test]
fn test_resolve_rejects_bad_number_even_when_operator_given() {
    let classifier = CarrierClassifier::new();

    for msisdn in ["123", "0171234567", "017123456789", ""] {
        let msg = QueueMessage::new(msisdn, "hi", Operator::Gp, MessageType::Otp);
        assert_eq!(
            classifier.resolve(&msg),
            Err(ValidationError::InvalidMsisdn),
            "{:?} should be rejected",
            msisdn
        );
    }
}
