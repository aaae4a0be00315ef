//! Keyshare contributions to Schnorr-style proofs of the user secret.
//!
//! The server holds one half `m` of a user's master secret. During a proof
//! session it contributes a commitment pair per issuer key and, after the
//! client supplies the challenge `c`, the response `w + c*m`. All arithmetic
//! is over the issuer's RSA-group modulus except the response, which is plain
//! integer arithmetic.

use num_bigint::{BigUint, RandBigInt};
use serde::{Deserialize, Serialize};

/// Bit length of the keyshare secret.
pub const L_M: u64 = 256;
/// Maximum bit length of a proof challenge.
pub const L_H: u64 = 256;
/// Statistical hiding margin for the commit randomness.
pub const L_STAT_ZK: u64 = 80;

/// Issuer public key material consumed by the keyshare math: the group
/// modulus and the bases. Only the first base is used for the user secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerPublicKey {
    #[serde(with = "dec")]
    pub n: BigUint,
    #[serde(with = "dec_vec")]
    pub r: Vec<BigUint>,
}

impl IssuerPublicKey {
    fn base(&self) -> &BigUint {
        &self.r[0]
    }
}

/// One commitment contribution: `P = R0^m mod N` and `Pcommit = R0^w mod N`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPCommitment {
    #[serde(rename = "P", with = "dec")]
    pub p: BigUint,
    #[serde(rename = "Pcommit", with = "dec")]
    pub p_commit: BigUint,
}

/// The completed keyshare response, delivered to the client inside a signed
/// token for consumption by the relying verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofP {
    #[serde(rename = "P", with = "dec")]
    pub p: BigUint,
    #[serde(rename = "c", with = "dec")]
    pub c: BigUint,
    #[serde(rename = "s_response", with = "dec")]
    pub s_response: BigUint,
}

/// Generate a fresh keyshare secret.
pub fn new_keyshare_secret() -> BigUint {
    rand::thread_rng().gen_biguint(L_M - 1)
}

/// Produce the commit randomness and one commitment pair per issuer key.
pub fn new_keyshare_commitments(
    secret: &BigUint,
    keys: &[&IssuerPublicKey],
) -> (BigUint, Vec<ProofPCommitment>) {
    let w = rand::thread_rng().gen_biguint(L_M + L_H + L_STAT_ZK);
    let commitments = keys
        .iter()
        .map(|key| ProofPCommitment {
            p: key.base().modpow(secret, &key.n),
            p_commit: key.base().modpow(&w, &key.n),
        })
        .collect();
    (w, commitments)
}

/// Complete the proof for a previously committed `w`.
pub fn keyshare_response(
    secret: &BigUint,
    commit: &BigUint,
    challenge: &BigUint,
    key: &IssuerPublicKey,
) -> ProofP {
    ProofP {
        p: key.base().modpow(secret, &key.n),
        c: challenge.clone(),
        s_response: commit + challenge * secret,
    }
}

/// Challenges above `L_H` bits are out of bounds.
pub fn challenge_in_bounds(challenge: &BigUint) -> bool {
    challenge.bits() <= L_H
}

/// Serde helpers mapping big integers to decimal strings on the wire.
pub(crate) mod dec {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

pub(crate) mod dec_vec {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[BigUint], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(v.iter().map(|n| n.to_str_radix(10)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<BigUint>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| s.parse().map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> IssuerPublicKey {
        // Small fixed modulus; the algebra does not depend on its size.
        IssuerPublicKey {
            n: "340282366920938463463374607431768211507".parse().unwrap(),
            r: vec!["2".parse().unwrap(), "3".parse().unwrap()],
        }
    }

    #[test]
    fn secret_fits_parameter_bounds() {
        for _ in 0..8 {
            assert!(new_keyshare_secret().bits() <= L_M - 1);
        }
    }

    #[test]
    fn response_verifies_against_commitment() {
        let key = test_key();
        let secret = new_keyshare_secret();
        let (w, commitments) = new_keyshare_commitments(&secret, &[&key]);
        let challenge: BigUint = "123456789123456789".parse().unwrap();
        let proof = keyshare_response(&secret, &w, &challenge, &key);

        // R0^s == Pcommit * P^c (mod N)
        let lhs = key.r[0].modpow(&proof.s_response, &key.n);
        let rhs = (&commitments[0].p_commit * commitments[0].p.modpow(&challenge, &key.n))
            % &key.n;
        assert_eq!(lhs, rhs);
        assert_eq!(proof.c, challenge);
    }

    #[test]
    fn one_commitment_per_requested_key() {
        let key = test_key();
        let secret = new_keyshare_secret();
        let (_, commitments) = new_keyshare_commitments(&secret, &[&key, &key, &key]);
        assert_eq!(commitments.len(), 3);
    }

    #[test]
    fn challenge_bounds() {
        use num_traits::{One, Zero};

        assert!(challenge_in_bounds(&BigUint::zero()));
        let max = (BigUint::one() << (L_H as usize)) - BigUint::one();
        assert!(challenge_in_bounds(&max));
        let over = BigUint::one() << (L_H as usize);
        assert!(!challenge_in_bounds(&over));
    }

    #[test]
    fn wire_format_uses_decimal_strings() {
        let proof = ProofP {
            p: "12".parse().unwrap(),
            c: "34".parse().unwrap(),
            s_response: "56".parse().unwrap(),
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["P"], "12");
        assert_eq!(json["c"], "34");
        assert_eq!(json["s_response"], "56");
    }
}
