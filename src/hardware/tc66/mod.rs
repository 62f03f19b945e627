pub mod frame;
pub mod history;

#[cfg(feature = "serial")]
mod monitor;

#[cfg(feature = "serial")]
pub use monitor::Tc66PowerMonitor;
