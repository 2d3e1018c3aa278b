pub mod disk;
pub mod logging;
pub mod validation;
