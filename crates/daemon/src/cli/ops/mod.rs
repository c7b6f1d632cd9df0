pub mod check;
#[cfg(feature = "fuse")]
pub mod mount;

pub use check::Check;
#[cfg(feature = "fuse")]
pub use mount::Mount;
