use rand::{distributions::Distribution, rngs::StdRng, Rng, SeedableRng};

/// Rand distribution over the characters used for connection ids
struct ConnIdPart;

impl Distribution<char> for ConnIdPart {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> char {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let idx = rng.gen_range(0..CHARSET.len());
        CHARSET[idx] as char
    }
}

/// Creates a random lowercase alphanumeric string of the provided length
///
/// `length` The length of the random string
pub fn random_string(length: usize) -> String {
    let rng = StdRng::from_entropy();
    rng.sample_iter(&ConnIdPart).take(length).collect()
}

/// Generator for transport-level connection ids
///
/// Ids are opaque strings; the prefix only aids log reading
#[derive(Default)]
pub struct ConnIdGenerator;

impl ConnIdGenerator {
    const ID_LENGTH: usize = 16;

    pub fn next_id(&self) -> String {
        format!("conn-{}", random_string(Self::ID_LENGTH))
    }
}

#[cfg(test)]
mod test {
    use super::random_string;

    #[test]
    fn test_random_string_length() {
        for length in [0, 1, 16, 64] {
            assert_eq!(random_string(length).len(), length);
        }
    }
}
