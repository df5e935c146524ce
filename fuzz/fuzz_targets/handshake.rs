//! Fuzz target for the secure channel handshake messages
//!
//! Feeds attacker-controlled bytes to both roles; malformed messages must
//! be rejected without panicking.

#![no_main]

use arbitrary::Arbitrary;
use ferry_crypto::handshake::{Initiator, Responder};
use ferry_crypto::signatures::SigningKey;
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Arbitrary)]
struct Input {
    seed: [u8; 32],
    message_1: Vec<u8>,
    message_2: Vec<u8>,
    message_3: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut rng = StdRng::from_seed(input.seed);
    let key = SigningKey::from_bytes(&input.seed);

    // Responder receiving a forged first message, then a forged confirmation
    if let Ok((_msg2, awaiting)) = Responder::new(&key).read_message_1(&input.message_1, &mut rng) {
        assert!(awaiting.read_message_3(&input.message_3).is_err());
    }

    // Initiator receiving a forged reply
    let initiator = Initiator::new(&key, &mut rng);
    let _ = initiator.write_message_1();
    assert!(initiator.read_message_2(&input.message_2).is_err());
});
