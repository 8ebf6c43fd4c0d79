use bytes::Bytes;
use lazy_static::lazy_static;

use crate::transform::{BlockCodec, Key, DEFAULT_SALT};
use crate::BlockId;

lazy_static! {
    // A single PBKDF2 round keeps the tests fast; the derivation itself is
    // exercised in the transform tests.
    pub static ref TEST_KEY: Key = Key::derive(b"correct horse battery staple", DEFAULT_SALT, 1);
    pub static ref OTHER_KEY: Key = Key::derive(b"hunter2", DEFAULT_SALT, 1);

    pub static ref PLAIN_CODEC: BlockCodec = BlockCodec::new(None);
    pub static ref ENCRYPTED_CODEC: BlockCodec = BlockCodec::new(Some(TEST_KEY.clone()));

    pub static ref EMPTY_BLOCK: Bytes = Bytes::new();
    pub static ref EMPTY_BLOCK_ID: BlockId = PLAIN_CODEC.id_for(&EMPTY_BLOCK);

    pub static ref BLOCK_A: Bytes = vec![0x00, 0x01, 0x02].into();
    pub static ref BLOCK_A_ID: BlockId = PLAIN_CODEC.id_for(&BLOCK_A);

    /// Highly compressible, one full data block.
    pub static ref BLOCK_B: Bytes = vec![0x01; 128_000].into();
    pub static ref BLOCK_B_ID: BlockId = PLAIN_CODEC.id_for(&BLOCK_B);

    /// Pseudo-random bytes (xorshift32).
    pub static ref BLOCK_C: Bytes = (0..4096)
        .scan(0x9e37_79b9u32, |state, _| {
            *state ^= *state << 13;
            *state ^= *state >> 17;
            *state ^= *state << 5;
            Some(*state as u8)
        })
        .collect::<Vec<u8>>()
        .into();
    pub static ref BLOCK_C_ID: BlockId = PLAIN_CODEC.id_for(&BLOCK_C);
}
