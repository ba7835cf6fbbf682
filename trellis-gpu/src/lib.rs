//! Device-facing contracts shared by Trellis and its GPU backends: the
//! [`Device`] capability trait, the POD types that cross the host-device
//! boundary, and (behind the `mock` feature) a fake device for tests.

mod device;
mod error;
mod flags;
#[cfg(feature = "mock")]
mod mock;
mod types;

pub use self::device::*;
pub use self::error::*;
pub use self::flags::*;
#[cfg(feature = "mock")]
pub use self::mock::*;
pub use self::types::*;
