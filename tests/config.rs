//! Environment overrides.  Kept in its own test binary since it mutates the process environment.

use buffers_and_fences::config::ConfigError;
use buffers_and_fences::{Config, DebugLevel, PublishStrategy};
use std::time::Duration;

#[test]
fn environment_overrides_defaults() {
    unsafe {
        std::env::set_var("BAF_DEBUG_LEVEL", "validation");
        std::env::set_var("BAF_PUBLISH_STRATEGY", "compute");
        std::env::set_var("BAF_FRAMES_IN_FLIGHT", "4");
        std::env::set_var("BAF_REAPER_WAIT_MS", "5");
        std::env::set_var("BAF_SUBMISSION_THREAD", "1");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.debug_level, DebugLevel::Validation);
    assert_eq!(config.publish_strategy, PublishStrategy::ComputeScatter);
    assert_eq!(config.frames_in_flight, 4);
    assert_eq!(config.reaper_wait, Duration::from_millis(5));
    assert!(config.submission_thread);
    assert_eq!(config.buffering_depth, Config::default().buffering_depth);

    unsafe {
        std::env::set_var("BAF_BUFFERING_DEPTH", "three");
    }
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::InvalidValue {
            name: "BAF_BUFFERING_DEPTH",
            ..
        })
    ));

    unsafe {
        std::env::set_var("BAF_BUFFERING_DEPTH", "0");
    }
    assert!(matches!(Config::from_env(), Err(ConfigError::BufferingDepth)));
}
