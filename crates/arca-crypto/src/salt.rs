/// Swap each adjacent byte pair of an IV before it is written.
///
/// A trailing odd byte stays in place. The permutation is its own inverse,
/// so the same function unmarshals. It is a wire detail, not a security
/// control, and must stay bit-for-bit stable.
pub fn marshal_salt(salt: &[u8]) -> Vec<u8> {
    let mut out = salt.to_vec();
    for pair in out.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    out
}
