use std::hash::{Hash, Hasher};

/// Case-insensitive view of an ASCII name, for keyed lookups of hook names.
#[derive(Clone, Copy, Debug, Default)]
#[repr(transparent)]
pub struct Ascii<S: ?Sized>(S);

impl Ascii<str> {
    pub fn new_str(value: &str) -> &Ascii<str> {
        // SAFETY: `Ascii<str>` is `repr(transparent)` over `str`.
        unsafe { &*(value as *const str as *const Ascii<str>) }
    }
}

impl<S: AsRef<str> + ?Sized> AsRef<str> for Ascii<S> {
    #[inline]
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl<S: AsRef<str> + ?Sized> Ascii<S> {
    pub fn starts_with(&self, prefix: &str) -> bool {
        let s = self.0.as_ref().as_bytes();
        s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }
}

impl<S: AsRef<str> + ?Sized> Hash for Ascii<S> {
    #[inline]
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        for &b in self.0.as_ref().as_bytes() {
            hasher.write_u8(b.to_ascii_uppercase());
        }
        hasher.write_u8(0xff);
    }
}

impl<S: AsRef<str> + ?Sized> PartialEq for Ascii<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref().eq_ignore_ascii_case(other.0.as_ref())
    }
}
impl<S: AsRef<str> + ?Sized> Eq for Ascii<S> {}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(value: &impl Hash) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn caseless_eq_and_hash() {
        let a = Ascii::new_str("EventTrain_Long");
        let b = Ascii::new_str("EVENTTRAIN_LONG");
        assert!(a == b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert!(a.starts_with("eventtrain"));
        assert!(!a.starts_with("eventtrain_longer"));
    }
}
