use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::*;

/// Content-addressed identifier of a manifest or manifest list
///
/// Digest is defined in the [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as `algorithm ":" encoded`. This struct checks that restriction at
/// creation; it is the identity used for change detection, so it must never
/// hold a value the registry would not round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

static ALGORITHM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").expect("to create a regex from pattern"));
static ENCODED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9=_-]+$").expect("to create a regex from pattern"));

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let mut iter = input.split(':');
        match (iter.next(), iter.next(), iter.next()) {
            (Some(algorithm), Some(encoded), None)
                if ALGORITHM_RE.is_match(algorithm) && ENCODED_RE.is_match(encoded) =>
            {
                Ok(Digest {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }
}
