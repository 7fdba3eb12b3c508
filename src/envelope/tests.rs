use super::*;
use crate::utils::error::Error;
use serde_json::json;

#[test]
fn test_decode_reference_envelope() {
    let wire = br#"{"Headers":{},"ContentType":"application/json","ContentEncoding":"utf-8","Body":"aGVsbG8="}"#;

    let envelope = decode(wire).expect("decode");

    assert_eq!(envelope.body, b"hello");
    assert!(envelope.headers.is_empty());
    assert_eq!(envelope.content_type, CONTENT_TYPE_JSON);
    assert_eq!(envelope.content_encoding, CONTENT_ENCODING_UTF8);
}

#[test]
fn test_encode_produces_wire_shape() {
    let wire = encode(b"hello", Headers::new()).expect("encode");
    let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();

    assert_eq!(
        value,
        json!({
            "Headers": {},
            "ContentType": "application/json",
            "ContentEncoding": "utf-8",
            "Body": "aGVsbG8="
        })
    );
}

#[test]
fn test_round_trip_keeps_payload_and_headers() {
    let payload: Vec<u8> = (0u8..=255).collect();
    let mut headers = Headers::new();
    headers.insert(header::SOURCE.into(), json!("interceptor"));
    headers.insert(header::CORRELATION_ID.into(), json!("abc-123"));
    headers.insert("attempt".into(), json!(3));
    headers.insert("meta".into(), json!({"nested": [1, 2]}));

    let envelope = decode(&encode(&payload, headers.clone()).unwrap()).unwrap();

    assert_eq!(envelope.body, payload);
    for (key, value) in &headers {
        assert_eq!(envelope.headers.get(key), Some(value));
    }
    assert_eq!(envelope.correlation_id(), Some("abc-123"));
}

#[test]
fn test_empty_payload_round_trip() {
    let envelope = decode(&encode(b"", Headers::new()).unwrap()).unwrap();
    assert!(envelope.body.is_empty());
}

#[test]
fn test_missing_headers_decode_to_empty_map() {
    let envelope = decode(br#"{"Body":"aGk="}"#).unwrap();
    assert!(envelope.headers.is_empty());
    assert_eq!(envelope.body, b"hi");

    let envelope = decode(br#"{"Headers":null,"Body":"aGk="}"#).unwrap();
    assert!(envelope.headers.is_empty());
}

#[test]
fn test_null_fields_decode_like_missing_ones() {
    let wire = br#"{"Headers":{},"ContentType":null,"ContentEncoding":null,"Body":"aGk="}"#;
    let envelope = decode(wire).unwrap();
    assert_eq!(envelope.body, b"hi");
    assert_eq!(envelope.content_type, "");
    assert_eq!(envelope.content_encoding, "");

    let envelope = decode(br#"{"Headers":{},"Body":null}"#).unwrap();
    assert!(envelope.body.is_empty());
}

#[test]
fn test_malformed_json_is_rejected() {
    let err = decode(b"{not json").unwrap_err();
    assert!(matches!(err, Error::MalformedEnvelope(_)));

    let err = decode(br#"{"Body": 42}"#).unwrap_err();
    assert!(matches!(err, Error::MalformedEnvelope(_)));
}

#[test]
fn test_non_base64_body_is_rejected() {
    let err = decode(br#"{"Headers":{},"Body":"not base64!!"}"#).unwrap_err();
    assert!(matches!(err, Error::InvalidEncoding(_)));
}

#[test]
fn test_decoded_message_prefers_envelope_headers() {
    let envelope = Envelope::new("hi").with_header(header::SOURCE, "relay");
    let mut broker_headers = Headers::new();
    broker_headers.insert(header::SOURCE.into(), json!("broker"));
    broker_headers.insert("x-delivery".into(), json!(1));

    let decoded = DecodedMessage::new(envelope, broker_headers, "default_exchange", "interceptor.reply");

    assert_eq!(decoded.headers.get(header::SOURCE), Some(&json!("relay")));
    assert_eq!(decoded.headers.get("x-delivery"), Some(&json!(1)));
    assert_eq!(decoded.body, "hi");
    assert_eq!(decoded.payload, b"hi");

    let value = serde_json::to_value(&decoded).unwrap();
    assert_eq!(value["routingKey"], "interceptor.reply");
    assert_eq!(value["contentType"], "application/json");
    assert!(value.get("payload").is_none());
}
