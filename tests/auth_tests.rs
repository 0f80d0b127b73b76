use base64::{engine::general_purpose, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign};
use sha1::Sha1;
use tcpadb::AdbKeyPair;

#[test]
fn test_public_key_blob_layout() {
    let key = AdbKeyPair::generate().unwrap();
    let blob = key.public_key_blob();

    // len-words | n0inv | modulus | rr | exponent
    assert_eq!(blob.len(), 4 + 4 + 256 + 256 + 4);
    assert_eq!(u32::from_le_bytes(blob[0..4].try_into().unwrap()), 64);

    let n = key.public_key().n();
    let mut modulus = n.to_bytes_le();
    modulus.resize(256, 0);
    assert_eq!(&blob[8..264], modulus.as_slice());

    // n[0] * n0inv == -1 mod 2^32
    let n0 = u32::from_le_bytes(blob[8..12].try_into().unwrap());
    let n0inv = u32::from_le_bytes(blob[4..8].try_into().unwrap());
    assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);

    // rr == 2^4096 mod n, computed independently
    let rr = BigUint::from_bytes_le(&blob[264..520]);
    assert_eq!(rr, (BigUint::from(1u32) << 4096usize) % n);

    assert_eq!(u32::from_le_bytes(blob[520..524].try_into().unwrap()), 65537);
}

#[test]
fn test_encoded_public_wire_form() {
    let key = AdbKeyPair::generate().unwrap();
    let encoded = key.encoded_public("tester@host");

    assert_eq!(*encoded.last().unwrap(), 0);
    let text = std::str::from_utf8(&encoded[..encoded.len() - 1]).unwrap();
    let (b64, label) = text.split_once(' ').unwrap();
    assert_eq!(label, "tester@host");

    let blob = general_purpose::STANDARD.decode(b64).unwrap();
    assert_eq!(blob, key.public_key_blob());
}

#[test]
fn test_token_signature_verifies_as_prehashed_sha1() {
    let key = AdbKeyPair::generate().unwrap();
    let token = [0xabu8; 20];

    let signature = key.sign_token(&token).unwrap();
    assert_eq!(signature.len(), 256);

    key.public_key()
        .verify(Pkcs1v15Sign::new::<Sha1>(), &token, &signature)
        .unwrap();

    let other_token = [0xcdu8; 20];
    assert!(key
        .public_key()
        .verify(Pkcs1v15Sign::new::<Sha1>(), &other_token, &signature)
        .is_err());
}

#[test]
fn test_pem_roundtrip_preserves_identity() {
    let key = AdbKeyPair::generate().unwrap();
    let pem = key.private_key_pem().unwrap();

    let restored = AdbKeyPair::from_pem(&pem).unwrap();
    assert_eq!(restored.public_key_blob(), key.public_key_blob());

    let token = [0x11u8; 20];
    let signature = restored.sign_token(&token).unwrap();
    key.public_key()
        .verify(Pkcs1v15Sign::new::<Sha1>(), &token, &signature)
        .unwrap();
}
