use secrecy::SecretString;
use vaultkey_crypto::{decrypt_to_bytes, derive_key, encrypt, generate_key, stretch_key, KdfConfig};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [64, 4096, 1048576])]
fn bench_encrypt(bencher: divan::Bencher, size: usize) {
    let key = generate_key(64).unwrap();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data), divan::black_box(&key)).unwrap());
}

#[divan::bench(args = [64, 4096, 1048576])]
fn bench_decrypt(bencher: divan::Bencher, size: usize) {
    let key = generate_key(64).unwrap();
    let data = make_data(size);
    let enc = encrypt(&data, &key).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decrypt_to_bytes(divan::black_box(&enc), divan::black_box(&key)).unwrap());
}

#[divan::bench(args = [5_000, 100_000])]
fn bench_pbkdf2(bencher: divan::Bencher, iterations: u32) {
    let secret = SecretString::from("correct horse battery staple");
    let config = KdfConfig::Pbkdf2 { iterations };
    bencher.bench(|| derive_key(&secret, divan::black_box("user@example.com"), &config).unwrap());
}

#[divan::bench(sample_count = 10)]
fn bench_argon2id_minimum(bencher: divan::Bencher) {
    let secret = SecretString::from("correct horse battery staple");
    let config = KdfConfig::Argon2id {
        iterations: 2,
        memory_mib: 16,
        parallelism: 1,
    };
    bencher.bench(|| derive_key(&secret, divan::black_box("user@example.com"), &config).unwrap());
}

#[divan::bench]
fn bench_stretch(bencher: divan::Bencher) {
    let key = generate_key(32).unwrap();
    bencher.bench(|| stretch_key(divan::black_box(&key)).unwrap());
}

fn main() {
    divan::main();
}
