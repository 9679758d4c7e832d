use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for peer scores and tracing ids, abstracted to make scoring testable
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u64() -> u64;
    fn gen_f64_range(range: Range<f64>) -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u64() -> u64 {
        rand::thread_rng().next_u64()
    }

    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::thread_rng().gen_range(range)
    }
}
