mod unix_driver;

pub use unix_driver::UnixProcessDriver;

pub struct UnixDriverFactory;

impl UnixDriverFactory {
    pub fn create_driver() -> UnixProcessDriver {
        UnixProcessDriver::new()
    }

    pub fn platform_name() -> &'static str {
        "unix"
    }
}
