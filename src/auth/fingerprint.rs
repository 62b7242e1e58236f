use sha2::{Digest, Sha256};

/// 指纹时间桶宽度：24 小时
const BUCKET_SECONDS: i64 = 24 * 60 * 60;

/// 按账号派生当日机器指纹
///
/// `H(credential_id ∥ floor(now / 24h))`, truncated to 128 bits, lowercase
/// hex. Stable across restarts within a day, rotates when the bucket rolls
/// over. Must be recomputed on every outbound request — never cache it across
/// bucket boundaries.
pub fn machine_fingerprint(credential_id: &str, now: i64) -> String {
    let bucket = now.div_euclid(BUCKET_SECONDS);

    let mut hasher = Sha256::new();
    hasher.update(credential_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();

    crate::models::credential::hex_lower(&digest[..16])
}
