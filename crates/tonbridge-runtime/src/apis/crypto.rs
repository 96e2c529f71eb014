//! Crypto primitives exposed to guest code: PBKDF2 key derivation and
//! OS-sourced random bytes.

use std::rc::Rc;
use std::str::FromStr;

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tonbridge_core::{GuestError, GuestValue, ScriptContext};

use crate::error::{HostError, HostResult};

/// Largest random draw honored in one call, matching the platform limit.
const MAX_RANDOM_BYTES: usize = 65_536;

/// Hash functions usable inside PBKDF2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl FromStr for HashAlgorithm {
    type Err = HostError;

    /// Names are matched case-insensitively with hyphens ignored, so
    /// `SHA-256`, `sha256` and `Sha-256` all name the same function.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(HostError::Crypto(format!("unsupported hash '{s}'"))),
        }
    }
}

/// Derive a key with PBKDF2-HMAC.
pub fn pbkdf2_derive(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    key_len: usize,
    hash: HashAlgorithm,
) -> HostResult<Vec<u8>> {
    if iterations == 0 {
        return Err(HostError::Crypto("iteration count must be positive".into()));
    }
    if key_len == 0 {
        return Err(HostError::Crypto("key length must be positive".into()));
    }
    let mut key = vec![0u8; key_len];
    match hash {
        HashAlgorithm::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut key),
        HashAlgorithm::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key),
        HashAlgorithm::Sha384 => pbkdf2_hmac::<Sha384>(password, salt, iterations, &mut key),
        HashAlgorithm::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut key),
    }
    Ok(key)
}

/// Fill a fresh buffer from the OS entropy source.
pub fn secure_random_bytes(len: usize) -> HostResult<Vec<u8>> {
    if len > MAX_RANDOM_BYTES {
        return Err(HostError::Crypto(format!(
            "requested {len} random bytes, limit is {MAX_RANDOM_BYTES}"
        )));
    }
    let mut buf = vec![0u8; len];
    getrandom::fill(&mut buf).map_err(|e| HostError::Crypto(e.to_string()))?;
    Ok(buf)
}

fn byte_arg(value: Option<&GuestValue>, what: &str) -> Result<Vec<u8>, GuestError> {
    match value {
        Some(GuestValue::Bytes(bytes)) => Ok(bytes.clone()),
        Some(GuestValue::String(s)) => Ok(s.as_bytes().to_vec()),
        Some(GuestValue::Array(items)) => items
            .iter()
            .map(|item| match item.as_f64() {
                Some(n) if (0.0..=255.0).contains(&n) && n.fract() == 0.0 => Ok(n as u8),
                _ => Err(GuestError::type_error(format!("{what} must contain bytes"))),
            })
            .collect(),
        other => Err(GuestError::type_error(format!(
            "{what} is {}, expected bytes or a string",
            other.map(GuestValue::type_name).unwrap_or("missing")
        ))),
    }
}

/// Install `pbkdf2Derive` and `secureRandomBytes` on the context.
pub fn install(ctx: &Rc<dyn ScriptContext>) {
    let global = ctx.global();

    let derive = ctx.create_function(
        "pbkdf2Derive",
        Rc::new(|args| {
            let password = byte_arg(args.first(), "password")?;
            let salt = byte_arg(args.get(1), "salt")?;
            let iterations = args
                .get(2)
                .and_then(GuestValue::as_f64)
                .filter(|n| *n >= 1.0 && n.fract() == 0.0)
                .ok_or_else(|| GuestError::type_error("iterations must be a positive integer"))?
                as u32;
            let key_len = args
                .get(3)
                .and_then(GuestValue::as_f64)
                .filter(|n| *n >= 1.0 && n.fract() == 0.0)
                .ok_or_else(|| GuestError::type_error("key length must be a positive integer"))?
                as usize;
            let hash = args
                .get(4)
                .and_then(GuestValue::as_str)
                .unwrap_or("sha256")
                .parse::<HashAlgorithm>()
                .map_err(|e| GuestError::range_error(e.to_string()))?;

            let key = pbkdf2_derive(&password, &salt, iterations, key_len, hash)
                .map_err(|e| GuestError::range_error(e.to_string()))?;
            Ok(GuestValue::Bytes(key))
        }),
    );
    global.set_member("pbkdf2Derive", GuestValue::Function(derive));

    let random = ctx.create_function(
        "secureRandomBytes",
        Rc::new(|args| {
            let len = args
                .first()
                .and_then(GuestValue::as_f64)
                .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                .ok_or_else(|| GuestError::type_error("length must be a non-negative integer"))?
                as usize;
            let bytes = secure_random_bytes(len).map_err(|e| GuestError::range_error(e.to_string()))?;
            Ok(GuestValue::Bytes(bytes))
        }),
    );
    global.set_member("secureRandomBytes", GuestValue::Function(random));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonbridge_core::mock::MockContext;

    #[test]
    fn hash_names_ignore_case_and_hyphens() {
        assert_eq!("sha1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert_eq!(
            "SHA-1".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha1
        );
        assert_eq!(
            "Sha-256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert_eq!(
            "sha384".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha384
        );
        assert_eq!(
            "SHA512".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha512
        );
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    // RFC 6070 test vectors for PBKDF2-HMAC-SHA1.
    #[test]
    fn pbkdf2_sha1_known_answers() {
        let cases: &[(u32, &str)] = &[
            (1, "0c60c80f961f0e71f3a9b524af6012062fe037a6"),
            (2, "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"),
            (4096, "4b007901b765489abead49d926f721d065a429c1"),
        ];
        for (iterations, expected) in cases {
            let key = pbkdf2_derive(b"password", b"salt", *iterations, 20, HashAlgorithm::Sha1)
                .unwrap();
            assert_eq!(hex::encode(key), *expected, "c={iterations}");
        }
    }

    #[test]
    fn pbkdf2_sha256_known_answer() {
        let key = pbkdf2_derive(b"password", b"salt", 1, 32, HashAlgorithm::Sha256).unwrap();
        assert_eq!(
            hex::encode(key),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn pbkdf2_rejects_degenerate_parameters() {
        assert!(pbkdf2_derive(b"p", b"s", 0, 20, HashAlgorithm::Sha1).is_err());
        assert!(pbkdf2_derive(b"p", b"s", 1, 0, HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn random_bytes_have_the_requested_length() {
        let a = secure_random_bytes(32).unwrap();
        let b = secure_random_bytes(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(secure_random_bytes(0).unwrap().is_empty());
        assert!(secure_random_bytes(MAX_RANDOM_BYTES + 1).is_err());
    }

    #[test]
    fn guest_surface_derives_and_draws() {
        let ctx: Rc<dyn ScriptContext> = MockContext::new();
        install(&ctx);
        let global = ctx.global();

        let derive = global
            .get_member("pbkdf2Derive")
            .and_then(|v| v.as_function().cloned())
            .unwrap();
        let key = derive
            .call(
                GuestValue::Undefined,
                &[
                    GuestValue::String("password".into()),
                    GuestValue::String("salt".into()),
                    GuestValue::Number(1.0),
                    GuestValue::Number(20.0),
                    GuestValue::String("SHA-1".into()),
                ],
            )
            .unwrap();
        match key {
            GuestValue::Bytes(bytes) => assert_eq!(
                hex::encode(bytes),
                "0c60c80f961f0e71f3a9b524af6012062fe037a6"
            ),
            other => panic!("expected bytes, got {other:?}"),
        }

        let random = global
            .get_member("secureRandomBytes")
            .and_then(|v| v.as_function().cloned())
            .unwrap();
        let drawn = random
            .call(GuestValue::Undefined, &[GuestValue::Number(16.0)])
            .unwrap();
        match drawn {
            GuestValue::Bytes(bytes) => assert_eq!(bytes.len(), 16),
            other => panic!("expected bytes, got {other:?}"),
        }

        let err = derive
            .call(GuestValue::Undefined, &[GuestValue::Number(1.0)])
            .unwrap_err();
        assert!(err.message.contains("password"));
    }
}
