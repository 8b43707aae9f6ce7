pub mod admission;
pub mod file_stager;
pub mod stager;
pub mod transfer;
pub mod watchdog;
