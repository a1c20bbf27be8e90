use proptest::prelude::*;
use roomdrop_protocol::{AnnouncementRecord, RoomdropError};

fn arb_record() -> impl Strategy<Value = AnnouncementRecord> {
    (
        any::<u64>(),
        "[0-9a-f]{48}",
        "\\PC{1,64}",
        "[a-z]{1,12}/[a-z0-9.+-]{1,24}",
        0.0f64..100_000.0,
        "[A-Za-z0-9-]{1,80}",
        any::<bool>(),
        "\\PC{0,40}",
    )
        .prop_map(
            |(timestamp, sender, file_name, file_type, file_size, file_id, is_encrypted, condition)| {
                AnnouncementRecord {
                    timestamp,
                    sender,
                    file_name,
                    file_type,
                    file_size,
                    file_id,
                    is_encrypted,
                    access_condition: if is_encrypted { condition } else { String::new() },
                }
            },
        )
}

proptest! {
    /// decode(encode(r)) == r for every valid record.
    #[test]
    fn roundtrip_any_record(record in arb_record()) {
        let bytes = record.encode().expect("encode");
        let decoded = AnnouncementRecord::decode(&bytes).expect("decode");
        prop_assert_eq!(decoded, record);
    }

    /// Any strict prefix of an encoding is rejected as malformed, never a panic.
    #[test]
    fn truncation_is_malformed(record in arb_record(), cut in any::<prop::sample::Index>()) {
        let bytes = record.encode().expect("encode");
        let cut = cut.index(bytes.len());
        let result = AnnouncementRecord::decode(&bytes[..cut]);
        prop_assert!(
            matches!(result, Err(RoomdropError::MalformedRecord { .. })),
            "cut {} of {}", cut, bytes.len()
        );
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn arbitrary_bytes_do_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = AnnouncementRecord::decode(&bytes);
    }
}
