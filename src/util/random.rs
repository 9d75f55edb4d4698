use std::time::Duration;

use rand::Rng;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// uniformly distributed in `[0, max)`, or zero for a zero `max`
    fn gen_duration_below(max: Duration) -> Duration;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_duration_below(max: Duration) -> Duration {
        if max.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..max)
    }
}
