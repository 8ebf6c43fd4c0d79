use bytes::Bytes;
use proptest::prelude::ProptestConfig;
use rstest::rstest;
use test_strategy::proptest;

use super::{BlockCodec, Key, TransformHeader, DEFAULT_SALT};
use crate::fixtures::{BLOCK_A, BLOCK_B, BLOCK_C, EMPTY_BLOCK, OTHER_KEY, TEST_KEY};
use crate::Error;

fn codec(encrypted: bool, compress: bool, pad_to: Option<u32>) -> BlockCodec {
    BlockCodec::new(encrypted.then(|| TEST_KEY.clone()))
        .with_compression(compress)
        .with_padding(pad_to)
}

#[rstest]
#[case::plain(false, false, None)]
#[case::compressed(false, true, None)]
#[case::padded(false, false, Some(4096))]
#[case::encrypted(true, false, None)]
#[case::everything(true, true, Some(1000))]
fn roundtrip(
    #[case] encrypted: bool,
    #[case] compress: bool,
    #[case] pad_to: Option<u32>,
    #[values(&*EMPTY_BLOCK, &*BLOCK_A, &*BLOCK_B, &*BLOCK_C)] plaintext: &Bytes,
) {
    let codec = codec(encrypted, compress, pad_to);
    let encoded = codec.encode(plaintext).expect("must encode");
    assert_eq!(codec.id_for(plaintext), encoded.id);
    assert_eq!(
        encrypted,
        encoded.header.contains(TransformHeader::ENCRYPTED)
    );

    let decoded = codec
        .decode(&encoded.id, &encoded.to_bytes())
        .expect("must decode");
    assert_eq!(plaintext, &decoded);
}

#[test]
fn compression_only_kept_when_smaller() {
    let codec = BlockCodec::new(None);

    let encoded = codec.encode(&BLOCK_B).unwrap();
    assert!(encoded.header.contains(TransformHeader::COMPRESSED));
    assert!(encoded.payload.len() < BLOCK_B.len());

    // three bytes never get smaller
    let encoded = codec.encode(&BLOCK_A).unwrap();
    assert!(!encoded.header.contains(TransformHeader::COMPRESSED));
    assert_eq!(&BLOCK_A[..], &encoded.payload[..]);
}

#[test]
fn padding_rounds_up() {
    let codec = BlockCodec::new(None)
        .with_compression(false)
        .with_padding(Some(1024));
    let encoded = codec.encode(&BLOCK_A).unwrap();
    assert_eq!(TransformHeader::PADDED, encoded.header);
    assert_eq!(1024, encoded.payload.len());
    assert_eq!(3u32.to_be_bytes().as_slice(), &encoded.extra[..]);
}

#[test]
fn layout() {
    let codec = BlockCodec::new(Some(TEST_KEY.clone())).with_compression(false);
    let encoded = codec.encode(&BLOCK_A).unwrap();
    let bytes = encoded.to_bytes();

    assert_eq!(&[0, 0, 0, 2], &bytes[..4]);
    // nonce, then ciphertext with a 16 byte tag
    assert_eq!(12, encoded.extra.len());
    assert_eq!(4 + 12 + BLOCK_A.len() + 16, bytes.len());
}

#[test]
fn ids_are_key_dependent() {
    let plain = BlockCodec::new(None);
    let a = BlockCodec::new(Some(TEST_KEY.clone()));
    let b = BlockCodec::new(Some(OTHER_KEY.clone()));

    assert_ne!(plain.id_for(&BLOCK_A), a.id_for(&BLOCK_A));
    assert_ne!(a.id_for(&BLOCK_A), b.id_for(&BLOCK_A));

    // nonces differ, names do not
    let first = a.encode(&BLOCK_A).unwrap();
    let second = a.encode(&BLOCK_A).unwrap();
    assert_eq!(first.id, second.id);
    assert_ne!(first.extra, second.extra);
}

#[test]
fn key_derivation_is_deterministic() {
    assert_eq!(
        Key::derive(b"pass", DEFAULT_SALT, 10),
        Key::derive(b"pass", DEFAULT_SALT, 10)
    );
    assert_ne!(
        Key::derive(b"pass", DEFAULT_SALT, 10),
        Key::derive(b"pass", DEFAULT_SALT, 11)
    );
    assert_ne!(
        Key::derive(b"pass", DEFAULT_SALT, 10),
        Key::derive(b"pass", b"other salt", 10)
    );
}

/// Flipping any byte after the header must never yield plaintext.
#[rstest]
#[case::plain(false, false, None)]
#[case::compressed(false, true, None)]
#[case::encrypted(true, true, Some(64))]
fn tamper_detected(
    #[case] encrypted: bool,
    #[case] compress: bool,
    #[case] pad_to: Option<u32>,
) {
    let codec = codec(encrypted, compress, pad_to);
    let plaintext: Bytes = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab"
        .as_slice()
        .into();
    let encoded = codec.encode(&plaintext).unwrap();
    let stored = encoded.to_bytes();

    for i in 4..stored.len() {
        let mut tampered = stored.to_vec();
        tampered[i] ^= 0x40;
        match codec.decode(&encoded.id, &tampered) {
            Err(Error::Integrity(_)) => {}
            other => panic!("byte {} flipped, got {:?}", i, other),
        }
    }
}

#[test]
fn tamper_header_bit_detected() {
    let codec = codec(true, false, None);
    let encoded = codec.encode(&BLOCK_C).unwrap();
    let mut stored = encoded.to_bytes().to_vec();
    // claim the payload is compressed
    stored[3] |= 1;

    assert!(matches!(
        codec.decode(&encoded.id, &stored),
        Err(Error::Integrity(_)) | Err(Error::Format(_))
    ));
}

#[test]
fn unknown_header_is_format_error() {
    let codec = BlockCodec::new(None);
    let encoded = codec.encode(&BLOCK_A).unwrap();
    let mut stored = encoded.to_bytes().to_vec();
    stored[0] = 0x80;

    assert!(matches!(
        codec.decode(&encoded.id, &stored),
        Err(Error::Format(_))
    ));
}

#[test]
fn truncated_is_format_error() {
    let codec = codec(true, false, None);
    let encoded = codec.encode(&BLOCK_A).unwrap();
    let stored = encoded.to_bytes();

    assert!(matches!(
        codec.decode(&encoded.id, &stored[..2]),
        Err(Error::Format(_))
    ));
    assert!(matches!(
        codec.decode(&encoded.id, &stored[..10]),
        Err(Error::Format(_))
    ));
}

#[test]
fn wrong_key() {
    let encoded = BlockCodec::new(Some(TEST_KEY.clone()))
        .encode(&BLOCK_A)
        .unwrap();

    assert!(matches!(
        BlockCodec::new(Some(OTHER_KEY.clone())).decode(&encoded.id, &encoded.to_bytes()),
        Err(Error::Integrity(_))
    ));
    assert!(matches!(
        BlockCodec::new(None).decode(&encoded.id, &encoded.to_bytes()),
        Err(Error::InvalidRequest(_))
    ));
}

#[proptest(ProptestConfig { cases: 64, ..Default::default() })]
fn roundtrip_any(
    plaintext: Vec<u8>,
    encrypted: bool,
    compress: bool,
    #[strategy(proptest::option::of(1u32..300))] pad_to: Option<u32>,
) {
    let codec = codec(encrypted, compress, pad_to);
    let encoded = codec.encode(&plaintext).unwrap();
    let decoded = codec.decode(&encoded.id, &encoded.to_bytes()).unwrap();
    assert_eq!(plaintext, decoded.to_vec());
}
