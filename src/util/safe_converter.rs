/// For narrowing casts where protocol logic ensures that the value is in the narrower type's
///  range, e.g. chunk lengths bounded by the frame payload budget.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}

impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: protocol logic should have ensured the value range")
    }
}
