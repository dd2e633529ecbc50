use rand::{distributions::Alphanumeric, Rng};
use ring::{digest, hkdf};

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn sha256(bts: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, bts).as_ref().to_vec()
}

pub fn sha384(bts: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA384, bts).as_ref().to_vec()
}

struct HkdfLen(usize);
impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF from RFC 5869.
pub fn hkdf(input_key_material: &[u8], salt: &[u8], info: &str, len: usize) -> Result<Vec<u8>, ()> {
    let mut bts = vec![0u8; len];
    hkdf::Salt::new(hkdf::HKDF_SHA256, salt)
        .extract(input_key_material)
        .expand(&[info.as_bytes()], HkdfLen(len))
        .map_err(|_| ())?
        .fill(&mut bts)
        .map_err(|_| ())?;
    Ok(bts)
}
