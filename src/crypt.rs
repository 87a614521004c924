//! MD5-based crypt(3) (`$1$salt$hash`) for stored Basic-auth passwords.

use md5::{Digest, Md5};

pub const MD5_MAGIC: &str = "$1$";
const MAX_SALT_LEN: usize = 8;
const ITOA64: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Hash `password` with the salt found in `setting` (`$1$salt[$...]` or a bare salt).
pub fn md5_crypt(password: &[u8], setting: &str) -> String {
    let salt = setting.strip_prefix(MD5_MAGIC).unwrap_or(setting);
    let salt = salt.split('$').next().unwrap_or("");
    let salt = &salt.as_bytes()[..salt.len().min(MAX_SALT_LEN)];

    let alternate = Md5::new()
        .chain_update(password)
        .chain_update(salt)
        .chain_update(password)
        .finalize();

    let mut ctx = Md5::new()
        .chain_update(password)
        .chain_update(MD5_MAGIC.as_bytes())
        .chain_update(salt);
    let mut remaining = password.len();
    while remaining > 0 {
        let n = remaining.min(16);
        ctx.update(&alternate[..n]);
        remaining -= n;
    }
    let mut i = password.len();
    while i != 0 {
        if i & 1 != 0 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        i >>= 1;
    }
    let mut digest = ctx.finalize();

    // Key stretching.
    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 != 0 {
            ctx.update(password);
        } else {
            ctx.update(digest);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(password);
        }
        if round & 1 != 0 {
            ctx.update(digest);
        } else {
            ctx.update(password);
        }
        digest = ctx.finalize();
    }

    let mut out = String::with_capacity(MD5_MAGIC.len() + salt.len() + 23);
    out.push_str(MD5_MAGIC);
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');
    for &(a, b, c) in &[(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let value = (digest[a] as u32) << 16 | (digest[b] as u32) << 8 | digest[c] as u32;
        push_base64(&mut out, value, 4);
    }
    push_base64(&mut out, digest[11] as u32, 2);
    out
}

fn push_base64(out: &mut String, mut value: u32, count: usize) {
    for _ in 0..count {
        out.push(ITOA64[(value & 0x3f) as usize] as char);
        value >>= 6;
    }
}

/// Does `stored` look like an MD5-crypt hash rather than a plaintext password?
pub fn is_md5_hash(stored: &str) -> bool {
    stored.len() > MD5_MAGIC.len() && stored.starts_with(MD5_MAGIC)
}

/// Check `password` against an MD5-crypt `hash`.
pub fn verify(password: &str, hash: &str) -> bool {
    is_md5_hash(hash) && md5_crypt(password.as_bytes(), hash) == hash
}

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt: String = (0..MAX_SALT_LEN)
        .map(|_| ITOA64[fastrand::usize(..ITOA64.len())] as char)
        .collect();
    md5_crypt(password.as_bytes(), &salt)
}
