mod types;
pub use types::*;
mod codec;
pub(crate) use codec::*;
mod crc;
pub(crate) use crc::*;
mod meta;
pub(crate) use meta::*;
mod ring;
pub(crate) use ring::*;
mod iter;
pub use iter::*;

mod hal;
pub use hal::*;

// hosted mode emulation structures
#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(not(target_os = "none"))]
pub use hosted::*;
