//! Stable string hashes used on the wire.
//!
//! Both hashes walk the UTF-16 code units of the input so that identifiers
//! agree with peers that hash .NET-style strings.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the low byte of every UTF-16 code unit.
pub fn stable_hash32(text: &str) -> u32 {
    text.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ (unit as u8) as u32).wrapping_mul(FNV_PRIME)
    })
}

/// 16-bit type identifier: the 32-bit FNV-1a hash xor-folded in half.
pub fn type_id(name: &str) -> u16 {
    let hash = stable_hash32(name);
    ((hash >> 16) ^ hash) as u16
}

/// Endpoint hash: polynomial, base 31, seed 17, wrapping on overflow.
pub fn endpoint_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(17i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(stable_hash32(""), 0x811c_9dc5);
        assert_eq!(stable_hash32("a"), 0xe40c_292c);
        assert_eq!(stable_hash32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_type_id_folds_high_half() {
        let full = stable_hash32("foobar");
        assert_eq!(type_id("foobar"), ((full >> 16) as u16) ^ (full as u16));
        assert_eq!(type_id(""), 0x811c ^ 0x9dc5);
    }

    #[test]
    fn test_type_id_is_deterministic() {
        assert_eq!(type_id("CommandMsg"), type_id("CommandMsg"));
        assert_ne!(type_id("CommandMsg"), type_id("ResponseMsg"));
    }

    #[test]
    fn test_endpoint_hash() {
        assert_eq!(endpoint_hash(""), 17);
        assert_eq!(endpoint_hash("a"), 17 * 31 + 97);
        assert_eq!(endpoint_hash("ab"), (17 * 31 + 97) * 31 + 98);
    }

    #[test]
    fn test_endpoint_hash_wraps() {
        // Long names overflow i32 and must wrap instead of panicking.
        let name = "x".repeat(64);
        let expected = name
            .bytes()
            .fold(17i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32));
        assert_eq!(endpoint_hash(&name), expected);
    }

    #[test]
    fn test_endpoint_hash_collision_pair() {
        // "Aa" and "BB" collide under base-31 polynomial hashing.
        assert_eq!(endpoint_hash("Aa"), endpoint_hash("BB"));
    }
}
