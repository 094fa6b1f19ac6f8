//! Small terminal UIs for picking a serial port and watching a session.

mod device_selector;
mod error;
mod fold_until_stop;

pub use device_selector::device_selector;
pub use error::RangerGuiError;
pub use fold_until_stop::fold_until_stop;
