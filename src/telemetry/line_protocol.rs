//! InfluxDB line protocol encoding for [`DeliveryRecord`]s.
//!
//! `measurement,instance=..,mno=..,msg_id=..,status=.. field=1i[,..] <epoch ms>`

use std::fmt::Write;

use super::DeliveryRecord;

pub fn encode(record: &DeliveryRecord) -> String {
    let mut line = String::with_capacity(128);
    line.push_str(&escape_measurement(record.measurement.as_str()));

    // Sorted tag keys; empty values are not valid in line protocol
    let tags = [
        ("instance", record.instance_id.as_str()),
        ("mno", record.mno.as_str()),
        ("msg_id", record.msg_id.as_str()),
        ("status", record.status.as_str()),
    ];
    for (key, value) in tags {
        if !value.is_empty() {
            let _ = write!(line, ",{}={}", key, escape_tag(value));
        }
    }

    let _ = write!(line, " processing_time_ms={}i", record.processing_time_ms);
    if let Some(queue_time) = record.queue_time_ms {
        let _ = write!(line, ",queue_time={}i", queue_time);
    }
    if let Some(retry_count) = record.retry_count {
        let _ = write!(line, ",retry_count={}i", retry_count);
    }

    let _ = write!(line, " {}", record.timestamp_ms);
    line
}

/// Newline-separated batch body.
pub fn encode_batch(records: &[DeliveryRecord]) -> String {
    records.iter().map(encode).collect::<Vec<_>>().join("\n")
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{DeliveryStatus, Measurement};
    use std::time::Duration;

    fn record() -> DeliveryRecord {
        DeliveryRecord {
            measurement: Measurement::SmsEvents,
            msg_id: "m-1".into(),
            mno: "Robi".into(),
            instance_id: "worker 1".into(),
            status: DeliveryStatus::Delivered,
            processing_time_ms: 0,
            retry_count: None,
            queue_time_ms: None,
            timestamp_ms: 1_700_000_000_123,
        }
        .with_processing_time(Duration::from_millis(87))
    }

    #[test]
    fn test_encode_event() {
        assert_eq!(
            encode(&record()),
            "sms_events,instance=worker\\ 1,mno=Robi,msg_id=m-1,status=delivered processing_time_ms=87i 1700000000123"
        );
    }

    #[test]
    fn test_encode_skips_empty_tags_and_adds_optional_fields() {
        let mut r = record();
        r.mno.clear();
        r.retry_count = Some(0);
        r.queue_time_ms = Some(1_700_000_000_000);
        let line = encode(&r);

        assert!(!line.contains("mno="));
        assert!(line.contains("processing_time_ms=87i,queue_time=1700000000000i,retry_count=0i"));
    }

    #[test]
    fn test_escape_tag_values() {
        assert_eq!(escape_tag("a,b=c d"), "a\\,b\\=c\\ d");
    }

    #[test]
    fn test_encode_batch_joins_lines() {
        let body = encode_batch(&[record(), record()]);
        assert_eq!(body.lines().count(), 2);
    }
}
