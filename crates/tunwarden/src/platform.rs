use std::sync::Arc;
use tunwarden_core::ProcessDriver;

/// Platform-independent factory that selects the appropriate driver at
/// compile time
pub struct PlatformDriverFactory;

#[cfg(unix)]
impl PlatformDriverFactory {
    pub fn create_driver() -> Arc<dyn ProcessDriver> {
        Arc::new(tunwarden_unix::UnixDriverFactory::create_driver())
    }

    pub fn platform_name() -> &'static str {
        tunwarden_unix::UnixDriverFactory::platform_name()
    }
}

#[cfg(not(unix))]
compile_error!("tunwarden currently requires a Unix platform driver");
