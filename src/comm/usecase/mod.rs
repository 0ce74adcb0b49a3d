pub mod driver;
pub mod poller;
pub mod registry;
