//! secp256k1 encoding helpers shared by commitments, stealth addresses and
//! key derivation. All scalars are big-endian 32 bytes; points travel as SEC1.

use k256::{
    elliptic_curve::{ops::Reduce, sec1::ToEncodedPoint, Field, PrimeField},
    FieldBytes, ProjectivePoint, PublicKey, Scalar,
};

use crate::error::CryptoError;

/// SEC1 compressed point: 0x02/0x03 prefix followed by x.
pub type CompressedPoint = [u8; 33];

/// SEC1 uncompressed point: 0x04 prefix followed by x and y.
pub type UncompressedPoint = [u8; 65];

/// Decode a compressed or uncompressed SEC1 point. Infinity is rejected.
pub fn parse_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| CryptoError::InvalidPoint)
}

pub fn encode_compressed(point: &ProjectivePoint) -> Result<CompressedPoint, CryptoError> {
    let encoded = point.to_affine().to_encoded_point(true);
    encoded
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidPoint)
}

pub fn encode_uncompressed(point: &ProjectivePoint) -> Result<UncompressedPoint, CryptoError> {
    let encoded = point.to_affine().to_encoded_point(false);
    encoded
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidPoint)
}

/// Parse a canonical scalar (strictly below n).
pub fn parse_scalar(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or(CryptoError::InvalidScalar)
}

/// Parse a canonical, non-zero scalar. Private keys must satisfy this.
pub fn parse_secret_scalar(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    let scalar = parse_scalar(bytes)?;
    if bool::from(scalar.is_zero()) {
        return Err(CryptoError::ZeroScalar);
    }
    Ok(scalar)
}

/// Interpret 32 big-endian bytes as an integer and reduce it mod n.
pub fn reduce_scalar(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<k256::U256>>::reduce_bytes(&FieldBytes::clone_from_slice(bytes))
}

pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

/// `scalar * G`, compressed.
pub fn public_key_from_scalar(scalar: &Scalar) -> Result<CompressedPoint, CryptoError> {
    encode_compressed(&(ProjectivePoint::GENERATOR * scalar))
}

/// Raw ECDH: the compressed encoding of `private * public`.
pub fn shared_secret(private: &Scalar, public: &ProjectivePoint) -> Result<CompressedPoint, CryptoError> {
    encode_compressed(&(*public * private))
}

/// Sample a uniformly random non-zero scalar from the OS RNG.
pub fn random_secret_scalar() -> Scalar {
    let mut rng = rand::rngs::OsRng;
    loop {
        let candidate = Scalar::random(&mut rng);
        if !bool::from(candidate.is_zero()) {
            return candidate;
        }
    }
}
