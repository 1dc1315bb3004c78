mod linear;
mod rms_norm;
mod rotary;

pub use linear::{HiddenAct, Linear};
pub use rms_norm::RMSNorm;
pub use rotary::{apply_rotary, get_cos_sin, get_inv_freqs};
