use hush_crypto::{
    decrypt_all, derive_transmission_keys, encrypt_all, generate_transfer_nonce, KeyPair, Role,
    StreamOptions,
};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let key = [0xABu8; 32];
    let data = make_data(size);
    let options = StreamOptions::default();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt_all(divan::black_box(&key), divan::black_box(&data), options).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let key = [0xABu8; 32];
    let data = make_data(size);
    let chunks = encrypt_all(&key, &data, StreamOptions::default()).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decrypt_all(divan::black_box(&key), divan::black_box(&chunks)).unwrap());
}

#[divan::bench]
fn bench_derive_transmission_keys(bencher: divan::Bencher) {
    let local = KeyPair::generate();
    let remote = KeyPair::generate().public_bytes();
    let nonce = generate_transfer_nonce();
    bencher.bench(|| {
        derive_transmission_keys(
            divan::black_box(&local),
            divan::black_box(&remote),
            &nonce,
            Role::Sender,
        )
        .unwrap()
    });
}

fn main() {
    divan::main();
}
