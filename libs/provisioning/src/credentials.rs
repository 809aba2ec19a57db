//! temporary credentials handed to a lease owner
use std::fmt;

use rand::{Rng, seq::SliceRandom};

pub const PASSWORD_LEN: usize = 20;
/// dashes break the password up so it can be read back over chat
pub const DASH_POSITIONS: [usize; 3] = [5, 11, 17];

// ambiguous characters (l, O, 0, 1) are left out
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// the username is the lease name
    pub fn for_lease(lease_name: &str) -> Self {
        Self {
            username: lease_name.to_owned(),
            password: generate_password(&mut rand::thread_rng()),
        }
    }

    /// name the owner logs in with
    pub fn login(&self, account_domain: &str) -> String {
        format!("{}@{}", self.username, account_domain)
    }
}

/// 20 characters with at least one lowercase, uppercase and digit, and `-` at
/// [`DASH_POSITIONS`]
pub fn generate_password<R: Rng + ?Sized>(rng: &mut R) -> String {
    let body_len = PASSWORD_LEN - DASH_POSITIONS.len();
    let all = [LOWER, UPPER, DIGITS].concat();

    let mut body = Vec::with_capacity(body_len);
    for set in [LOWER, UPPER, DIGITS] {
        body.push(pick(set, rng));
    }
    while body.len() < body_len {
        body.push(pick(&all, rng));
    }
    body.shuffle(rng);

    let mut chars = body.into_iter();
    (0..PASSWORD_LEN)
        .map(|i| {
            if DASH_POSITIONS.contains(&i) {
                '-'
            } else {
                chars.next().map(char::from).unwrap_or('-')
            }
        })
        .collect()
}

fn pick<R: Rng + ?Sized>(set: &[u8], rng: &mut R) -> u8 {
    set[rng.gen_range(0..set.len())]
}
