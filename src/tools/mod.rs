pub mod duration;
pub mod fs;
pub mod logging;
