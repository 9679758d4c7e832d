pub mod random;
pub mod safe_converter;
