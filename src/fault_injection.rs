//! Simulated packet loss for testing an application's behaviour on a lossy network

use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::config::ReliabilityConfig;

#[cfg_attr(test, automock)]
pub trait Random: Send + Sync {
    /// a uniformly distributed number in `0..100`
    fn gen_percentage(&self) -> u8;
}

pub struct RngRandom;
impl Random for RngRandom {
    fn gen_percentage(&self) -> u8 {
        rand::thread_rng().gen_range(0..100)
    }
}

pub struct FaultInjector {
    loss_percentage: u8,
    drop_next: AtomicBool,
    random: Box<dyn Random>,
}

impl FaultInjector {
    pub fn new(config: &ReliabilityConfig, random: Box<dyn Random>) -> FaultInjector {
        FaultInjector {
            loss_percentage: config.packet_loss_percentage,
            drop_next: AtomicBool::new(false),
            random,
        }
    }

    /// Drops the next outgoing datagram, regardless of the configured loss percentage
    pub fn drop_next(&self) {
        self.drop_next.store(true, Ordering::Release);
    }

    pub fn should_drop(&self) -> bool {
        if self.drop_next.swap(false, Ordering::AcqRel) {
            trace!("dropping datagram on request");
            return true;
        }
        if self.loss_percentage == 0 {
            return false;
        }
        self.random.gen_percentage() < self.loss_percentage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn injector(loss_percentage: u8, random_value: Option<u8>) -> FaultInjector {
        let mut random = MockRandom::new();
        match random_value {
            Some(value) => { random.expect_gen_percentage().return_const(value); }
            None => { random.expect_gen_percentage().never(); }
        }
        FaultInjector::new(&ReliabilityConfig {
            packet_loss_percentage: loss_percentage,
            ..ReliabilityConfig::new()
        }, Box::new(random))
    }

    #[rstest]
    #[case::no_loss(0, None, false)]
    #[case::below(30, Some(29), true)]
    #[case::at(30, Some(30), false)]
    #[case::total_loss(100, Some(99), true)]
    fn test_should_drop(#[case] loss_percentage: u8, #[case] random_value: Option<u8>, #[case] expected: bool) {
        assert_eq!(injector(loss_percentage, random_value).should_drop(), expected);
    }

    #[test]
    fn test_drop_next_drops_once() {
        let injector = injector(0, None);
        injector.drop_next();
        assert!(injector.should_drop());
        assert!(!injector.should_drop());
    }

    #[test]
    fn test_rng_random_range() {
        for _ in 0..1000 {
            assert!(RngRandom.gen_percentage() < 100);
        }
    }
}
