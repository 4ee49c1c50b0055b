use cirrus_common::{decode, encode, Envelope, PeerKind, PlayerId};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_decode_envelope_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..512);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = decode(&data, PeerKind::Player);
        let _ = decode(&data, PeerKind::Streamer);
    }
}

#[test]
fn random_mutation_of_valid_offer_is_handled() {
    let mut rng = thread_rng();
    let offer = Envelope::Offer {
        player_id: Some(PlayerId::new(1)),
        sdp: "v=0\r\ns=-\r\nt=0 0\r\n".into(),
        broadcast: false,
    };
    let packet = encode(&offer).unwrap().into_bytes();

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = decode(&mutated, PeerKind::Streamer);
    }
}
